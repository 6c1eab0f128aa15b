//! Filesystem-backed transport.
//!
//! Provides [`FileTransport`], a [`MailTransport`](crate::MailTransport)
//! that drops one `.eml` file per recipient under a base directory, the
//! way a pickup directory or a local outbox would.

use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, error, info};

use crate::{
    transport::{DeliveryReport, MailTransport, TransportFuture},
    EmailMessage, TransportError,
};

/// Transport that writes each message into per-recipient directories.
///
/// Layout: `<base>/<recipient>/<message_id>.eml`, recipient and id
/// percent-encoded so that distinct addresses never share a directory.
#[derive(Debug, Clone)]
pub struct FileTransport {
    base_path: PathBuf,
}

impl FileTransport {
    /// Creates a new [`FileTransport`] rooted at `base_path`.
    pub fn new(base_path: PathBuf) -> Self {
        info!(path = %base_path.display(), "File transport initialized");
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Returns where the message for `recipient` is written.
    pub fn message_path(&self, recipient: &str, message_id: &str) -> PathBuf {
        self.base_path
            .join(safe_name(recipient))
            .join(format!("{}.eml", safe_name(message_id)))
    }

    async fn deliver(&self, recipient: &str, message: &EmailMessage) -> io::Result<PathBuf> {
        let path = self.message_path(recipient, &message.message_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(&path).await?;
        file.write_all(message.raw().as_bytes()).await?;
        file.flush().await?;
        Ok(path)
    }
}

impl Default for FileTransport {
    fn default() -> Self {
        Self::new(PathBuf::from("outbox"))
    }
}

impl MailTransport for FileTransport {
    fn send<'a>(&'a self, message: &'a EmailMessage) -> TransportFuture<'a> {
        Box::pin(async move {
            // an unusable base directory fails the whole send
            if let Err(e) = fs::create_dir_all(&self.base_path).await {
                error!(path = %self.base_path.display(), error = %e, "Outbox is not usable");
                return Err(TransportError::Io(e));
            }
            let mut report = DeliveryReport::default();
            for recipient in &message.recipients {
                match self.deliver(recipient, message).await {
                    Ok(path) => {
                        debug!(
                            message_id = %message.message_id,
                            to = %recipient,
                            path = %path.display(),
                            "Wrote email to filesystem"
                        );
                        report.accepted += 1;
                    }
                    Err(e) => {
                        error!(
                            message_id = %message.message_id,
                            to = %recipient,
                            error = %e,
                            "Failed to write email to filesystem"
                        );
                        report.failed.push(recipient.clone());
                    }
                }
            }
            info!(
                message_id = %message.message_id,
                from = %message.from,
                accepted = report.accepted,
                failed = report.failed.len(),
                "Delivered email to filesystem"
            );
            Ok(report)
        })
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Percent-encodes a path segment. Encoded output never holds `%2E` or a
/// lone `%`, which leaves them free for the `.`, `..` and empty segments.
fn safe_name(value: &str) -> String {
    let encoded = urlencoding::encode(value);
    if encoded.is_empty() {
        "%".to_string()
    } else if encoded.chars().all(|c| c == '.') {
        encoded.replace('.', "%2E")
    } else {
        encoded.into_owned()
    }
}

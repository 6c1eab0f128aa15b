use std::{
    collections::HashSet,
    sync::{PoisonError, RwLock},
};

use tracing::{debug, info};

use crate::{
    transport::{DeliveryReport, MailTransport, TransportFuture},
    EmailMessage,
};

/// In-memory transport that keeps every dispatched message.
///
/// Recipients registered through [`MemoryTransport::rejecting`] are
/// reported as failed, which makes partial delivery easy to reproduce.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: RwLock<Vec<EmailMessage>>,
    rejected: HashSet<String>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport that refuses the given recipients.
    pub fn rejecting<I, S>(recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            sent: RwLock::default(),
            rejected: recipients
                .into_iter()
                .map(|recipient| recipient.as_ref().to_lowercase())
                .collect(),
        }
    }

    /// Returns a snapshot of every message handed to this transport.
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<EmailMessage> {
        self.sent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clear(&self) {
        self.sent
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl MailTransport for MemoryTransport {
    fn send<'a>(&'a self, message: &'a EmailMessage) -> TransportFuture<'a> {
        Box::pin(async move {
            let mut report = DeliveryReport::default();
            for recipient in &message.recipients {
                if self.rejected.contains(&recipient.to_lowercase()) {
                    debug!(to = %recipient, "Recipient rejected by memory transport");
                    report.failed.push(recipient.clone());
                } else {
                    report.accepted += 1;
                }
            }
            self.sent
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(message.clone());
            info!(
                message_id = %message.message_id,
                accepted = report.accepted,
                failed = report.failed.len(),
                "Stored email in memory"
            );
            Ok(report)
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

use std::{fmt, future::Future, pin::Pin, str::FromStr};

use serde::Deserialize;

use crate::{EmailMessage, TransportResult};

/// Boxed future type for transport operations, enabling object safety.
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = TransportResult<DeliveryReport>> + Send + 'a>>;

/// Outcome of handing a message to a transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Number of recipients the transport accepted the message for.
    pub accepted: usize,
    /// Recipients the transport could not deliver to.
    pub failed: Vec<String>,
}

impl DeliveryReport {
    /// Report where every listed recipient was accepted.
    pub fn all_accepted(recipients: &[String]) -> Self {
        Self {
            accepted: recipients.len(),
            failed: Vec::new(),
        }
    }

    /// Report where every listed recipient failed.
    pub fn all_failed(recipients: &[String]) -> Self {
        Self {
            accepted: 0,
            failed: recipients.to_vec(),
        }
    }

    /// Whether at least one recipient was accepted.
    pub fn is_success(&self) -> bool {
        self.accepted > 0
    }
}

/// Connection security used when talking to an SMTP relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Plain connection, no TLS at all.
    None,
    /// Plain connection upgraded with `STARTTLS`.
    #[default]
    Starttls,
    /// Implicit TLS from the first byte.
    Tls,
}

impl fmt::Display for SmtpSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpSecurity::None => write!(f, "none"),
            SmtpSecurity::Starttls => write!(f, "starttls"),
            SmtpSecurity::Tls => write!(f, "tls"),
        }
    }
}

impl FromStr for SmtpSecurity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Ok(SmtpSecurity::None),
            "starttls" => Ok(SmtpSecurity::Starttls),
            "tls" => Ok(SmtpSecurity::Tls),
            other => Err(format!("unknown SMTP security mode: {other}")),
        }
    }
}

/// Trait for transports that deliver the final, possibly sealed, message.
///
/// This is the only point where the pipeline suspends; implementations
/// own any timeout, retry or connection handling.
pub trait MailTransport: Send + Sync {
    /// Sends the message to its envelope recipients.
    fn send<'a>(&'a self, message: &'a EmailMessage) -> TransportFuture<'a>;

    /// Returns the name of this transport.
    fn name(&self) -> &str;
}

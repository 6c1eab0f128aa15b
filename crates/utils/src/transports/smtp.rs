//! SMTP submission through `lettre`.
//!
//! The sealed message is already a complete RFC 5322 document, so it is
//! handed to the relay as raw bytes with an envelope built from the
//! message sender and recipients. Nothing is re-encoded on the way.

use lettre::{
    address::Envelope,
    transport::smtp::{authentication::Credentials, Error as SmtpError},
    Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
};
use tracing::{error, info, warn};

use crate::{
    transport::{DeliveryReport, MailTransport, SmtpSecurity, TransportFuture},
    EmailMessage, TransportError, TransportResult,
};

/// Transport that relays messages to an SMTP server.
pub struct SmtpTransport {
    host: String,
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    /// Creates a new [`SmtpTransport`] for `host`.
    ///
    /// `port` overrides the default port of the chosen security mode,
    /// `credentials` is a username and password pair for `AUTH`.
    pub fn new(
        host: &str,
        port: Option<u16>,
        security: SmtpSecurity,
        credentials: Option<(String, String)>,
    ) -> TransportResult<Self> {
        let mut builder = match security {
            SmtpSecurity::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
            SmtpSecurity::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host).map_err(smtp_error)?
            }
            SmtpSecurity::Tls => {
                AsyncSmtpTransport::<Tokio1Executor>::relay(host).map_err(smtp_error)?
            }
        };
        if let Some(port) = port {
            builder = builder.port(port);
        }
        if let Some((username, password)) = credentials {
            builder = builder.credentials(Credentials::new(username, password));
        }
        info!(host = %host, port = ?port, security = %security, "SMTP transport initialized");
        Ok(Self {
            host: host.to_string(),
            inner: builder.build(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl MailTransport for SmtpTransport {
    fn send<'a>(&'a self, message: &'a EmailMessage) -> TransportFuture<'a> {
        Box::pin(async move {
            if message.recipients.is_empty() {
                warn!(message_id = %message.message_id, "No recipients, nothing to relay");
                return Ok(DeliveryReport::default());
            }
            let envelope = build_envelope(message)?;
            match self
                .inner
                .send_raw(&envelope, message.raw().as_bytes())
                .await
            {
                Ok(response) => {
                    info!(
                        message_id = %message.message_id,
                        host = %self.host,
                        code = %response.code(),
                        recipients = message.recipients.len(),
                        "Relayed email"
                    );
                    Ok(DeliveryReport::all_accepted(&message.recipients))
                }
                Err(e) if e.is_permanent() => {
                    error!(
                        message_id = %message.message_id,
                        host = %self.host,
                        error = %e,
                        "Relay permanently rejected email"
                    );
                    Ok(DeliveryReport::all_failed(&message.recipients))
                }
                Err(e) => Err(smtp_error(e)),
            }
        })
    }

    fn name(&self) -> &str {
        "smtp"
    }
}

fn build_envelope(message: &EmailMessage) -> TransportResult<Envelope> {
    let from = if message.from.is_empty() {
        None
    } else {
        Some(parse_address(&message.from)?)
    };
    let to = message
        .recipients
        .iter()
        .map(|recipient| parse_address(recipient))
        .collect::<TransportResult<Vec<_>>>()?;
    Envelope::new(from, to).map_err(|e| TransportError::Address(e.to_string()))
}

fn parse_address(value: &str) -> TransportResult<Address> {
    value
        .parse::<Address>()
        .map_err(|e| TransportError::Address(format!("{value}: {e}")))
}

fn smtp_error(error: SmtpError) -> TransportError {
    TransportError::Smtp(error.to_string())
}

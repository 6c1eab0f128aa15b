//! Error types for the S/MIME pipeline.
//!
//! Cryptographic failures abort a send before the transport is reached,
//! transport failures are carried through without interpretation.

use std::io;

use openssl::error::ErrorStack;
use thiserror::Error;

/// Result type for pipeline operations.
pub type SmimeResult<T> = Result<T, SmimeError>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised while signing, encrypting or dispatching a message.
#[derive(Debug, Error)]
pub enum SmimeError {
    /// The signing key could not be read or decrypted with its passphrase.
    #[error("Signing key error: {0}")]
    SigningKey(String),

    /// The signing certificate is unusable or the signature primitive failed.
    #[error("Signing error: {0}")]
    Signing(String),

    /// A recipient certificate is missing, unreadable or malformed.
    #[error("Encryption certificate error: {0}")]
    EncryptionCertificate(String),

    /// The enveloping primitive failed.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// The transport failed, opaque to the pipeline.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SmimeError {
    /// Returns whether this error was raised before any dispatch happened.
    pub fn is_cryptographic(&self) -> bool {
        !matches!(self, SmimeError::Transport(_))
    }
}

/// Errors reported by a [`MailTransport`](crate::MailTransport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// An I/O error occurred.
    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// The SMTP conversation failed.
    #[error("SMTP error: {0}")]
    Smtp(String),

    /// An envelope address could not be used by the transport.
    #[error("Invalid address: {0}")]
    Address(String),
}

/// Flattens an OpenSSL error stack into a single line.
pub(crate) fn describe(stack: &ErrorStack) -> String {
    let reasons = stack
        .errors()
        .iter()
        .filter_map(|e| e.reason())
        .collect::<Vec<_>>();
    if reasons.is_empty() {
        stack.to_string()
    } else {
        reasons.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smime_error_display() {
        assert_eq!(
            SmimeError::SigningKey("error retrieving private key".to_string()).to_string(),
            "Signing key error: error retrieving private key"
        );
        assert_eq!(
            SmimeError::EncryptionCertificate("bad".to_string()).to_string(),
            "Encryption certificate error: bad"
        );
        assert_eq!(
            SmimeError::Transport(TransportError::Smtp("timeout".to_string())).to_string(),
            "SMTP error: timeout"
        );
    }

    #[test]
    fn test_is_cryptographic() {
        assert!(SmimeError::Signing("x".to_string()).is_cryptographic());
        assert!(SmimeError::Encryption("x".to_string()).is_cryptographic());
        assert!(
            !SmimeError::Transport(TransportError::Io(io::Error::other("x"))).is_cryptographic()
        );
    }
}

//! S/MIME encryption of outbound messages.
//!
//! The whole content entity, including a signature applied earlier in the
//! chain, is enveloped for the recipient certificates. Only the envelope
//! headers (`From`, `To`, `Subject`, ...) stay readable afterwards.

use openssl::{pkcs7::Pkcs7, pkcs7::Pkcs7Flags, stack::Stack, x509::X509};
use tracing::{error, info};

use crate::{
    credentials::load_certificates, error::describe, Credentials, EmailMessage,
    EncryptionCertificates, EncryptionCipher, MessageTransformer, SmimeError, SmimeResult,
};

/// Transformer that encrypts messages for one or more recipient certificates.
#[derive(Debug, Clone)]
pub struct SmimeEncryptor {
    certificates: EncryptionCertificates,
    cipher: EncryptionCipher,
}

impl SmimeEncryptor {
    /// Creates a new [`SmimeEncryptor`].
    pub fn new(certificates: EncryptionCertificates, cipher: EncryptionCipher) -> Self {
        Self {
            certificates,
            cipher,
        }
    }

    /// Creates an encryptor from the credentials, `None` unless
    /// encryption certificates are configured.
    pub fn from_credentials(credentials: &Credentials) -> Option<Self> {
        credentials
            .encryption_certificates()
            .map(|certificates| Self::new(certificates.clone(), credentials.cipher()))
    }

    /// Encrypts the message in place; on failure the message is unchanged.
    pub fn encrypt(&self, message: &mut EmailMessage) -> SmimeResult<()> {
        let stack = self.load_stack(&message.recipients).inspect_err(|e| {
            error!(
                message_id = %message.message_id,
                error = %e,
                "Failed to load encryption certificates"
            );
        })?;

        // binary mode keeps an inner signature byte-exact
        let flags = Pkcs7Flags::BINARY;
        let entity = message.content_entity();

        let pkcs7 = Pkcs7::encrypt(&stack, entity.as_bytes(), self.cipher.cipher(), flags)
            .map_err(|e| SmimeError::Encryption(describe(&e)))?;
        let smime = pkcs7
            .to_smime(
                &[],
                flags | Pkcs7Flags::CRLFEOL | Pkcs7Flags::NOOLDMIMETYPE,
            )
            .map_err(|e| SmimeError::Encryption(describe(&e)))?;
        let smime = String::from_utf8(smime)
            .map_err(|e| SmimeError::Encryption(format!("non UTF-8 S/MIME output: {e}")))?;

        message.replace_content(&smime);
        info!(
            message_id = %message.message_id,
            certificates = stack.len(),
            cipher = self.cipher.name(),
            size = message.raw().len(),
            "Encrypted message"
        );
        Ok(())
    }

    fn load_stack(&self, recipients: &[String]) -> SmimeResult<Stack<X509>> {
        let mut stack =
            Stack::new().map_err(|e| SmimeError::EncryptionCertificate(describe(&e)))?;
        for source in self.certificates.resolve(recipients)? {
            for certificate in
                load_certificates(source).map_err(SmimeError::EncryptionCertificate)?
            {
                stack
                    .push(certificate)
                    .map_err(|e| SmimeError::EncryptionCertificate(describe(&e)))?;
            }
        }
        Ok(stack)
    }
}

impl MessageTransformer for SmimeEncryptor {
    fn transform(&self, message: &mut EmailMessage) -> SmimeResult<()> {
        self.encrypt(message)
    }

    fn name(&self) -> &str {
        "smime_encryptor"
    }
}

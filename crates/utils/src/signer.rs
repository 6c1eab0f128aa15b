//! S/MIME signing of outbound messages.
//!
//! The content entity of the message (content headers and body) is signed
//! with PKCS7 and replaced by the S/MIME serialization. With the default
//! `detached` option the result is a `multipart/signed` entity whose first
//! part is the original content, readable without any key.

use openssl::{pkcs7::Pkcs7, pkcs7::Pkcs7Flags, stack::Stack, x509::X509};
use tracing::{debug, error, info};

use crate::{
    credentials::load_certificates, error::describe, Credentials, EmailMessage,
    MessageTransformer, PemSource, SignerOptions, SigningKey, SmimeError, SmimeResult,
};

/// Transformer that signs messages with a sender certificate and key.
#[derive(Debug, Clone)]
pub struct SmimeSigner {
    certificate: PemSource,
    key: Option<SigningKey>,
    chain: Vec<PemSource>,
    options: SignerOptions,
}

impl SmimeSigner {
    /// Creates a new [`SmimeSigner`].
    ///
    /// Nothing is loaded here, a missing key surfaces as a
    /// [`SmimeError::SigningKey`] on the first [`sign`](Self::sign).
    pub fn new(
        certificate: PemSource,
        key: Option<SigningKey>,
        chain: Vec<PemSource>,
        options: SignerOptions,
    ) -> Self {
        Self {
            certificate,
            key,
            chain,
            options,
        }
    }

    /// Creates a signer from the credentials, `None` unless a signing
    /// certificate is configured.
    pub fn from_credentials(credentials: &Credentials) -> Option<Self> {
        let certificate = credentials.signing_certificate()?;
        Some(Self::new(
            certificate.clone(),
            credentials.signing_key().cloned(),
            credentials.signing_chain().to_vec(),
            credentials.signer_options().clone(),
        ))
    }

    /// Signs the message in place; on failure the message is unchanged.
    pub fn sign(&self, message: &mut EmailMessage) -> SmimeResult<()> {
        let mut certificates = load_certificates(&self.certificate).map_err(|e| {
            error!(message_id = %message.message_id, error = %e, "Failed to load signing certificate");
            SmimeError::Signing(e)
        })?;
        let certificate = certificates.remove(0);

        let key = self
            .key
            .as_ref()
            .ok_or_else(|| {
                SmimeError::SigningKey(
                    "error retrieving private key (no signing key configured)".to_string(),
                )
            })?
            .load()
            .inspect_err(|e| {
                error!(message_id = %message.message_id, error = %e, "Failed to load signing key");
            })?;

        let public_key = certificate
            .public_key()
            .map_err(|e| SmimeError::Signing(describe(&e)))?;
        if !public_key.public_eq(&key) {
            return Err(SmimeError::SigningKey(
                "error retrieving private key (key does not match signing certificate)"
                    .to_string(),
            ));
        }

        let chain = self.build_chain(certificates)?;
        let flags = self.options.flags();
        let entity = message.content_entity();

        let pkcs7 = Pkcs7::sign(&certificate, &key, &chain, entity.as_bytes(), flags)
            .map_err(|e| SmimeError::Signing(describe(&e)))?;
        // RFC 5751 content types, not the legacy `application/x-pkcs7-*`
        let smime = pkcs7
            .to_smime(
                entity.as_bytes(),
                flags | Pkcs7Flags::CRLFEOL | Pkcs7Flags::NOOLDMIMETYPE,
            )
            .map_err(|e| SmimeError::Signing(describe(&e)))?;
        let smime = String::from_utf8(smime)
            .map_err(|e| SmimeError::Signing(format!("non UTF-8 S/MIME output: {e}")))?;

        message.replace_content(&smime);
        info!(
            message_id = %message.message_id,
            detached = flags.contains(Pkcs7Flags::DETACHED),
            chain = chain.len(),
            size = message.raw().len(),
            "Signed message"
        );
        Ok(())
    }

    fn build_chain(&self, bundled: Vec<X509>) -> SmimeResult<Stack<X509>> {
        let mut chain = Stack::new().map_err(|e| SmimeError::Signing(describe(&e)))?;
        for source in &self.chain {
            for certificate in load_certificates(source).map_err(SmimeError::Signing)? {
                chain
                    .push(certificate)
                    .map_err(|e| SmimeError::Signing(describe(&e)))?;
            }
        }
        for certificate in bundled {
            chain
                .push(certificate)
                .map_err(|e| SmimeError::Signing(describe(&e)))?;
        }
        debug!(size = chain.len(), "Built signing chain");
        Ok(chain)
    }
}

impl MessageTransformer for SmimeSigner {
    fn transform(&self, message: &mut EmailMessage) -> SmimeResult<()> {
        self.sign(message)
    }

    fn name(&self) -> &str {
        "smime_signer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{generate_identity, verify_signed, PASSPHRASE};

    fn signed_message(body: &str) -> EmailMessage {
        EmailMessage::compose(
            "sender@example.com",
            &["recipient@example.com"],
            "Email smime signed by sender",
            body,
        )
    }

    #[test]
    fn test_sign_detached() {
        let sender = generate_identity("Sender", "sender@example.com");
        let signer = SmimeSigner::new(
            PemSource::pem(sender.cert_pem.clone()),
            Some(SigningKey::new(
                PemSource::pem(sender.key_pem.clone()),
                Some(PASSPHRASE),
            )),
            vec![],
            SignerOptions::default(),
        );
        let mut message = signed_message("<h1>This is not a confidential email.</h1>");

        signer.sign(&mut message).unwrap();

        let raw = message.raw();
        assert!(raw.contains("multipart/signed"));
        assert!(raw.contains("This is an S/MIME signed message"));
        assert!(raw.contains("application/pkcs7-signature; name=\"smime.p7s\""));
        assert!(!raw.contains("x-pkcs7"));
        assert!(message
            .header("Content-Type")
            .unwrap()
            .starts_with("multipart/signed; protocol=\"application/pkcs7-signature\""));
        assert!(raw.contains("<h1>This is not a confidential email.</h1>"));
        assert_eq!(message.subject(), "Email smime signed by sender");

        let content = verify_signed(raw.as_bytes());
        let content = String::from_utf8(content).unwrap();
        assert!(content.contains("Content-Type: text/html; charset=utf-8"));
        assert!(content.contains("<h1>This is not a confidential email.</h1>"));
    }

    #[test]
    fn test_sign_opaque() {
        let sender = generate_identity("Sender", "sender@example.com");
        let signer = SmimeSigner::new(
            PemSource::pem(sender.cert_pem.clone()),
            Some(SigningKey::new(
                PemSource::pem(sender.plain_key_pem.clone()),
                None,
            )),
            vec![],
            SignerOptions::new().with("nocerts", false),
        );
        let mut message = signed_message("Opaque body");

        signer.sign(&mut message).unwrap();

        let raw = message.raw();
        assert!(message
            .header("Content-Type")
            .unwrap()
            .starts_with("application/pkcs7-mime; smime-type=signed-data"));
        assert!(!raw.contains("Opaque body"));
        let content = String::from_utf8(verify_signed(raw.as_bytes())).unwrap();
        assert!(content.ends_with("Opaque body"));
    }

    #[test]
    fn test_sign_with_chain() {
        let sender = generate_identity("Sender", "sender@example.com");
        let intermediate = generate_identity("Intermediate", "ca@example.com");
        let signer = SmimeSigner::new(
            PemSource::pem(sender.cert_pem.clone()),
            Some(SigningKey::new(
                PemSource::pem(sender.key_pem.clone()),
                Some(PASSPHRASE),
            )),
            vec![PemSource::pem(intermediate.cert_pem.clone())],
            SignerOptions::default(),
        );
        let mut message = signed_message("Chained");

        signer.sign(&mut message).unwrap();

        let (pkcs7, _) = Pkcs7::from_smime(message.raw().as_bytes()).unwrap();
        let certificates = pkcs7.signed().unwrap().certificates().unwrap();
        assert_eq!(certificates.len(), 2);
    }

    #[test]
    fn test_sign_wrong_passphrase_leaves_message() {
        let sender = generate_identity("Sender", "sender@example.com");
        let signer = SmimeSigner::new(
            PemSource::pem(sender.cert_pem.clone()),
            Some(SigningKey::new(
                PemSource::pem(sender.key_pem.clone()),
                Some("IncorrectPassword!"),
            )),
            vec![],
            SignerOptions::default(),
        );
        let mut message = signed_message("Untouched");
        let original = message.raw().to_string();

        let error = signer.sign(&mut message).unwrap_err();

        assert!(matches!(error, SmimeError::SigningKey(_)));
        assert!(error.to_string().contains("error retrieving private key"));
        assert_eq!(message.raw(), original);
    }

    #[test]
    fn test_sign_without_key() {
        let sender = generate_identity("Sender", "sender@example.com");
        let signer = SmimeSigner::new(
            PemSource::pem(sender.cert_pem.clone()),
            None,
            vec![],
            SignerOptions::default(),
        );
        let mut message = signed_message("No key");

        assert!(matches!(
            signer.sign(&mut message),
            Err(SmimeError::SigningKey(_))
        ));
    }

    #[test]
    fn test_sign_mismatched_key() {
        let sender = generate_identity("Sender", "sender@example.com");
        let other = generate_identity("Other", "other@example.com");
        let signer = SmimeSigner::new(
            PemSource::pem(sender.cert_pem.clone()),
            Some(SigningKey::new(
                PemSource::pem(other.plain_key_pem.clone()),
                None,
            )),
            vec![],
            SignerOptions::default(),
        );
        let mut message = signed_message("Mismatch");

        assert!(matches!(
            signer.sign(&mut message),
            Err(SmimeError::SigningKey(_))
        ));
    }

    #[test]
    fn test_sign_missing_certificate() {
        let signer = SmimeSigner::new(
            PemSource::path("/nonexistent/sender.crt"),
            None,
            vec![],
            SignerOptions::default(),
        );
        let mut message = signed_message("Missing");

        assert!(matches!(
            signer.sign(&mut message),
            Err(SmimeError::Signing(_))
        ));
    }

    #[test]
    fn test_from_credentials_requires_certificate() {
        let credentials = Credentials::builder()
            .signing_key(PemSource::path("sender.key"), Some(PASSPHRASE))
            .build();
        assert!(SmimeSigner::from_credentials(&credentials).is_none());

        let credentials = Credentials::builder()
            .signing_certificate(PemSource::path("sender.crt"))
            .build();
        let signer = SmimeSigner::from_credentials(&credentials).unwrap();
        assert_eq!(signer.name(), "smime_signer");
    }
}

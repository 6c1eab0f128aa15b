//! Outbound S/MIME pipeline orchestration.
//!
//! [`SmimeMailer`] moves a message through a fixed sequence of states:
//!
//! ```text
//! Plain -> [Signed] -> [Encrypted] -> Dispatched
//! ```
//!
//! Signing happens only with a signing certificate, encryption only with
//! encryption certificates, and the order is always sign then encrypt so
//! the signature ends up inside the envelope. Any cryptographic failure
//! aborts the send before the transport is called.

use std::{fmt, sync::Arc};

use tracing::{debug, error, info};

use crate::{
    Credentials, CredentialsBuilder, EmailMessage, EncryptionCertificates, EncryptionCipher,
    MailTransport, MessageTransformer, PemSource, SignerOptions, SmimeEncryptor, SmimeResult,
    SmimeSigner,
};

/// States a message goes through inside [`SmimeMailer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Plain,
    Signed,
    Encrypted,
    Dispatched,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Plain => write!(f, "plain"),
            PipelineState::Signed => write!(f, "signed"),
            PipelineState::Encrypted => write!(f, "encrypted"),
            PipelineState::Dispatched => write!(f, "dispatched"),
        }
    }
}

/// A transformer together with the state it moves the message into.
struct Stage {
    target: PipelineState,
    transformer: Box<dyn MessageTransformer>,
}

/// Mailer that signs and/or encrypts messages before handing them to a
/// [`MailTransport`].
///
/// Credentials are fixed at construction, so one mailer can serve any
/// number of concurrent [`send`](Self::send) calls.
pub struct SmimeMailer {
    credentials: Credentials,
    transport: Arc<dyn MailTransport>,
    stages: Vec<Stage>,
}

impl SmimeMailer {
    /// Creates a new [`SmimeMailer`] over the given transport.
    pub fn new(credentials: Credentials, transport: Arc<dyn MailTransport>) -> Self {
        let mut stages = Vec::new();
        if let Some(signer) = SmimeSigner::from_credentials(&credentials) {
            stages.push(Stage {
                target: PipelineState::Signed,
                transformer: Box::new(signer),
            });
        }
        if let Some(encryptor) = SmimeEncryptor::from_credentials(&credentials) {
            stages.push(Stage {
                target: PipelineState::Encrypted,
                transformer: Box::new(encryptor),
            });
        }
        info!(
            transport = transport.name(),
            signing = credentials.is_signing(),
            encrypting = credentials.is_encrypting(),
            "S/MIME mailer initialized"
        );
        Self {
            credentials,
            transport,
            stages,
        }
    }

    /// Returns a builder where every credential is optional.
    pub fn builder() -> SmimeMailerBuilder {
        SmimeMailerBuilder::default()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn transport(&self) -> &Arc<dyn MailTransport> {
        &self.transport
    }

    /// Returns the signed and/or encrypted copy of `message` that
    /// [`send`](Self::send) would dispatch, without dispatching it.
    pub fn seal(&self, message: &EmailMessage) -> SmimeResult<EmailMessage> {
        let mut sealed = message.clone();
        let mut state = PipelineState::Plain;
        debug!(message_id = %sealed.message_id, state = %state, "Message entered pipeline");

        for stage in &self.stages {
            stage.transformer.transform(&mut sealed).inspect_err(|e| {
                error!(
                    message_id = %sealed.message_id,
                    transformer = stage.transformer.name(),
                    state = %state,
                    error = %e,
                    "Pipeline aborted"
                );
            })?;
            debug!(
                message_id = %sealed.message_id,
                transformer = stage.transformer.name(),
                from = %state,
                to = %stage.target,
                "Pipeline state transition"
            );
            state = stage.target;
        }
        Ok(sealed)
    }

    /// Seals and dispatches the message.
    ///
    /// Returns whether at least one recipient was accepted. The recipients
    /// the transport reported as failed are recorded on `message`, whose
    /// content is otherwise left as it was.
    pub async fn send(&self, message: &mut EmailMessage) -> SmimeResult<bool> {
        let sealed = self.seal(message)?;

        let report = self.transport.send(&sealed).await.inspect_err(|e| {
            error!(
                message_id = %sealed.message_id,
                transport = self.transport.name(),
                error = %e,
                "Transport failed"
            );
        })?;

        info!(
            message_id = %sealed.message_id,
            state = %PipelineState::Dispatched,
            transport = self.transport.name(),
            accepted = report.accepted,
            failed = report.failed.len(),
            "Dispatched message"
        );
        let success = report.is_success();
        message.set_failed_recipients(report.failed);
        Ok(success)
    }
}

impl fmt::Debug for SmimeMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmimeMailer")
            .field("credentials", &self.credentials)
            .field("transport", &self.transport.name())
            .field(
                "stages",
                &self
                    .stages
                    .iter()
                    .map(|s| s.transformer.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builder for [`SmimeMailer`], mirroring the credential setters.
///
/// Leaving out both the signing certificate and the encryption
/// certificates builds a pass-through mailer.
#[derive(Debug, Default)]
pub struct SmimeMailerBuilder {
    credentials: CredentialsBuilder,
}

impl SmimeMailerBuilder {
    pub fn encryption_certificates(mut self, certificates: EncryptionCertificates) -> Self {
        self.credentials = self.credentials.encryption_certificates(certificates);
        self
    }

    pub fn signing_certificate(mut self, certificate: PemSource) -> Self {
        self.credentials = self.credentials.signing_certificate(certificate);
        self
    }

    pub fn signing_key(mut self, key: PemSource, passphrase: Option<&str>) -> Self {
        self.credentials = self.credentials.signing_key(key, passphrase);
        self
    }

    pub fn signing_chain(mut self, chain: Vec<PemSource>) -> Self {
        self.credentials = self.credentials.signing_chain(chain);
        self
    }

    pub fn signer_options(mut self, options: SignerOptions) -> Self {
        self.credentials = self.credentials.signer_options(options);
        self
    }

    pub fn default_signer_options(mut self, options: SignerOptions) -> Self {
        self.credentials = self.credentials.default_signer_options(options);
        self
    }

    pub fn cipher(mut self, cipher: EncryptionCipher) -> Self {
        self.credentials = self.credentials.cipher(cipher);
        self
    }

    /// Builds the mailer over `transport`.
    pub fn build(self, transport: Arc<dyn MailTransport>) -> SmimeMailer {
        SmimeMailer::new(self.credentials.build(), transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{decrypt_enveloped, generate_identity, verify_signed, TestIdentity, PASSPHRASE},
        transport::TransportFuture,
        MemoryTransport, SmimeError, TransportError,
    };

    const BODY: &str = "This is a confidential email.";

    fn message() -> EmailMessage {
        EmailMessage::compose(
            "sender@example.com",
            &["recipient@example.com", "other@example.com"],
            "Email with encryption",
            BODY,
        )
    }

    fn signing(builder: SmimeMailerBuilder, sender: &TestIdentity) -> SmimeMailerBuilder {
        builder
            .signing_certificate(PemSource::pem(sender.cert_pem.clone()))
            .signing_key(PemSource::pem(sender.key_pem.clone()), Some(PASSPHRASE))
    }

    struct BrokenTransport;

    impl MailTransport for BrokenTransport {
        fn send<'a>(&'a self, _message: &'a EmailMessage) -> TransportFuture<'a> {
            Box::pin(async { Err(TransportError::Smtp("connection refused".to_string())) })
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_send_pass_through() {
        let transport = Arc::new(MemoryTransport::new());
        let mailer = SmimeMailer::builder().build(transport.clone());
        let mut message = message();

        assert!(mailer.credentials().is_pass_through());
        assert!(mailer.send(&mut message).await.unwrap());

        assert_eq!(transport.last().unwrap().raw(), message.raw());
        assert!(message.failed_recipients().is_empty());
    }

    #[tokio::test]
    async fn test_send_signed() {
        let sender = generate_identity("Sender", "sender@example.com");
        let transport = Arc::new(MemoryTransport::new());
        let mailer = signing(SmimeMailer::builder(), &sender).build(transport.clone());
        let mut message = message();
        let original = message.raw().to_string();

        assert!(mailer.send(&mut message).await.unwrap());

        let dispatched = transport.last().unwrap();
        assert!(dispatched.raw().contains("pkcs7-signature"));
        assert!(dispatched.raw().contains(BODY));
        assert_eq!(message.raw(), original);
        let content = String::from_utf8(verify_signed(dispatched.raw().as_bytes())).unwrap();
        assert!(content.contains(BODY));
    }

    #[tokio::test]
    async fn test_send_signed_and_encrypted() {
        let sender = generate_identity("Sender", "sender@example.com");
        let recipient = generate_identity("Recipient", "recipient@example.com");
        let transport = Arc::new(MemoryTransport::new());
        let mailer = signing(SmimeMailer::builder(), &sender)
            .encryption_certificates(EncryptionCertificates::Single(PemSource::pem(
                recipient.cert_pem.clone(),
            )))
            .build(transport.clone());
        let mut message = message();

        assert!(mailer.send(&mut message).await.unwrap());

        let dispatched = transport.last().unwrap();
        assert!(dispatched.raw().contains("smime-type=enveloped-data"));
        assert!(!dispatched.raw().contains(BODY));
        assert!(!dispatched.raw().contains("pkcs7-signature"));
        assert!(!dispatched.raw().contains("This is an S/MIME signed message"));

        let decrypted = decrypt_enveloped(dispatched.raw().as_bytes(), &recipient);
        let content = String::from_utf8(verify_signed(&decrypted)).unwrap();
        assert!(content.contains(BODY));
    }

    #[tokio::test]
    async fn test_send_wrong_passphrase_never_dispatches() {
        let sender = generate_identity("Sender", "sender@example.com");
        let transport = Arc::new(MemoryTransport::new());
        let mailer = SmimeMailer::builder()
            .signing_certificate(PemSource::pem(sender.cert_pem.clone()))
            .signing_key(PemSource::pem(sender.key_pem.clone()), Some("IncorrectPassword!"))
            .build(transport.clone());
        let mut message = message();
        message.set_failed_recipients(vec!["previous@example.com".to_string()]);

        let error = mailer.send(&mut message).await.unwrap_err();

        assert!(matches!(error, SmimeError::SigningKey(_)));
        assert!(error.is_cryptographic());
        assert_eq!(transport.sent_count(), 0);
        assert_eq!(message.failed_recipients(), ["previous@example.com"]);
    }

    #[tokio::test]
    async fn test_send_partial_failure() {
        let transport = Arc::new(MemoryTransport::rejecting(["other@example.com"]));
        let mailer = SmimeMailer::builder().build(transport.clone());
        let mut message = message();

        assert!(mailer.send(&mut message).await.unwrap());
        assert_eq!(message.failed_recipients(), ["other@example.com"]);
    }

    #[tokio::test]
    async fn test_send_all_rejected() {
        let transport = Arc::new(MemoryTransport::rejecting([
            "recipient@example.com",
            "other@example.com",
        ]));
        let mailer = SmimeMailer::builder().build(transport);
        let mut message = message();

        assert!(!mailer.send(&mut message).await.unwrap());
        assert_eq!(message.failed_recipients().len(), 2);
    }

    #[tokio::test]
    async fn test_send_transport_error() {
        let mailer = SmimeMailer::builder().build(Arc::new(BrokenTransport));
        let mut message = message();

        let error = mailer.send(&mut message).await.unwrap_err();

        assert!(matches!(error, SmimeError::Transport(TransportError::Smtp(_))));
        assert!(!error.is_cryptographic());
    }

    #[tokio::test]
    async fn test_send_concurrently() {
        let sender = generate_identity("Sender", "sender@example.com");
        let transport = Arc::new(MemoryTransport::new());
        let mailer = Arc::new(signing(SmimeMailer::builder(), &sender).build(transport.clone()));

        let handles = (0..4)
            .map(|_| {
                let mailer = mailer.clone();
                tokio::spawn(async move {
                    let mut message = message();
                    mailer.send(&mut message).await
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }

        assert_eq!(transport.sent_count(), 4);
    }

    #[test]
    fn test_seal_does_not_dispatch() {
        let recipient = generate_identity("Recipient", "recipient@example.com");
        let transport = Arc::new(MemoryTransport::new());
        let mailer = SmimeMailer::builder()
            .encryption_certificates(EncryptionCertificates::Single(PemSource::pem(
                recipient.cert_pem.clone(),
            )))
            .build(transport.clone());

        let sealed = mailer.seal(&message()).unwrap();

        assert!(sealed.raw().contains("pkcs7-mime"));
        assert_eq!(transport.sent_count(), 0);
        assert!(format!("{mailer:?}").contains("smime_encryptor"));
    }

    #[test]
    fn test_pipeline_state_display() {
        assert_eq!(PipelineState::Plain.to_string(), "plain");
        assert_eq!(PipelineState::Dispatched.to_string(), "dispatched");
    }
}

use std::{collections::BTreeMap, env, fs, io, path::Path, path::PathBuf, sync::Arc};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[cfg(feature = "smtp")]
use crate::SmtpTransport;
use crate::{
    transport::SmtpSecurity, Credentials, EncryptionCertificates, EncryptionCipher, FileTransport,
    MailTransport, MemoryTransport, PemSource, SignerOptions, TransportError,
};

/// Top-level configuration for the sealpost mailer.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub smime: SmimeConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

/// Signing and encryption material, every entry is optional.
#[derive(Debug, Default, Deserialize)]
pub struct SmimeConfig {
    /// Signing certificate, enables signing when present.
    pub sign_cert: Option<PathBuf>,

    /// Private key matching the signing certificate.
    pub sign_key: Option<PathBuf>,

    pub sign_key_passphrase: Option<String>,

    /// Name of an environment variable holding the key passphrase.
    pub sign_key_passphrase_env: Option<String>,

    /// Intermediate certificates shipped with the signature.
    #[serde(default)]
    pub sign_chain: Vec<PathBuf>,

    /// Recipient certificates applied to every recipient.
    #[serde(default)]
    pub encrypt_certs: Vec<PathBuf>,

    /// Recipient certificates keyed by address, domain or `*.domain`,
    /// takes precedence over `encrypt_certs`.
    #[serde(default)]
    pub recipients: BTreeMap<String, PathBuf>,

    /// Symmetric cipher name, `aes-256-cbc` when absent.
    pub cipher: Option<String>,

    pub signer_options: Option<SignerOptions>,

    pub default_signer_options: Option<SignerOptions>,
}

impl SmimeConfig {
    /// Converts the configuration into [`Credentials`].
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let mut builder = Credentials::builder();

        if let Some(cert) = &self.sign_cert {
            builder = builder.signing_certificate(PemSource::path(cert));
        }
        if let Some(key) = &self.sign_key {
            if self.sign_cert.is_none() {
                warn!(key = %key.display(), "Signing key configured without a certificate, ignoring");
            }
            let passphrase = self.passphrase()?;
            builder = builder.signing_key(PemSource::path(key), passphrase.as_deref());
        }
        if !self.sign_chain.is_empty() {
            builder = builder.signing_chain(self.sign_chain.iter().map(PemSource::path).collect());
        }

        if !self.recipients.is_empty() {
            if !self.encrypt_certs.is_empty() {
                warn!("Both recipients and encrypt_certs configured, using recipients");
            }
            builder = builder.encryption_certificates(EncryptionCertificates::per_recipient(
                self.recipients
                    .iter()
                    .map(|(pattern, path)| (pattern, PemSource::path(path))),
            ));
        } else if !self.encrypt_certs.is_empty() {
            let mut certs = self.encrypt_certs.iter().map(PemSource::path).collect::<Vec<_>>();
            let certificates = if certs.len() == 1 {
                EncryptionCertificates::Single(certs.remove(0))
            } else {
                EncryptionCertificates::List(certs)
            };
            builder = builder.encryption_certificates(certificates);
        }

        if let Some(cipher) = &self.cipher {
            builder = builder.cipher(
                cipher
                    .parse::<EncryptionCipher>()
                    .map_err(ConfigError::Invalid)?,
            );
        }
        if let Some(options) = &self.signer_options {
            builder = builder.signer_options(options.clone());
        }
        if let Some(options) = &self.default_signer_options {
            builder = builder.default_signer_options(options.clone());
        }

        Ok(builder.build())
    }

    fn passphrase(&self) -> Result<Option<String>, ConfigError> {
        match (&self.sign_key_passphrase, &self.sign_key_passphrase_env) {
            (Some(_), Some(_)) => Err(ConfigError::Invalid(
                "sign_key_passphrase and sign_key_passphrase_env are mutually exclusive"
                    .to_string(),
            )),
            (Some(passphrase), None) => Ok(Some(passphrase.clone())),
            (None, Some(name)) => env::var(name).map(Some).map_err(|_| {
                ConfigError::Invalid(format!("environment variable {name} is not set"))
            }),
            (None, None) => Ok(None),
        }
    }
}

/// Transport the sealed messages are handed to.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// One `.eml` file per recipient under `path`.
    File {
        #[serde(default = "default_outbox_path")]
        path: PathBuf,
    },

    /// Relay through an SMTP server.
    Smtp {
        host: String,
        port: Option<u16>,
        #[serde(default)]
        security: SmtpSecurity,
        username: Option<String>,
        password: Option<String>,
        password_env: Option<String>,
    },

    /// Keep messages in memory, rejecting the listed addresses.
    Memory {
        #[serde(default)]
        reject: Vec<String>,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::File {
            path: default_outbox_path(),
        }
    }
}

impl TransportConfig {
    /// Constructs the configured transport.
    pub fn build(&self) -> Result<Arc<dyn MailTransport>, ConfigError> {
        match self {
            TransportConfig::File { path } => Ok(Arc::new(FileTransport::new(path.clone()))),
            TransportConfig::Memory { reject } => Ok(Arc::new(MemoryTransport::rejecting(reject))),
            #[cfg(feature = "smtp")]
            TransportConfig::Smtp {
                host,
                port,
                security,
                username,
                password,
                password_env,
            } => {
                let credentials = match username {
                    Some(username) => {
                        let password = match (password, password_env) {
                            (Some(password), _) => password.clone(),
                            (None, Some(name)) => env::var(name).map_err(|_| {
                                ConfigError::Invalid(format!(
                                    "environment variable {name} is not set"
                                ))
                            })?,
                            (None, None) => {
                                return Err(ConfigError::Invalid(
                                    "SMTP username configured without a password".to_string(),
                                ))
                            }
                        };
                        Some((username.clone(), password))
                    }
                    None => None,
                };
                Ok(Arc::new(SmtpTransport::new(
                    host,
                    *port,
                    *security,
                    credentials,
                )?))
            }
            #[cfg(not(feature = "smtp"))]
            TransportConfig::Smtp { .. } => Err(ConfigError::Invalid(
                "SMTP transport requires the smtp feature".to_string(),
            )),
        }
    }
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An I/O error occurred reading the file.
    #[error("Config I/O error: {0}")]
    Io(#[from] io::Error),

    /// A parse error occurred deserializing TOML.
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but cannot be used.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// The transport could not be constructed.
    #[error("Config transport error: {0}")]
    Transport(#[from] TransportError),
}

fn default_outbox_path() -> PathBuf {
    PathBuf::from("outbox")
}

//! Certificate and key material for the S/MIME pipeline.
//!
//! [`Credentials`] is assembled once through [`CredentialsBuilder`] and is
//! read-only afterwards, so a single instance can back any number of
//! concurrent sends. Nothing is read from disk or validated at build time,
//! missing or malformed material surfaces when a message is signed or
//! encrypted.

use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt::{self, Display},
    fs, io,
    path::PathBuf,
    str::FromStr,
};

use openssl::{
    pkcs7::Pkcs7Flags,
    pkey::{PKey, Private},
    symm::Cipher,
    x509::X509,
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{error::describe, SmimeError, SmimeResult};

/// Location of PEM encoded material, either a file or the bytes themselves.
#[derive(Clone, PartialEq, Eq)]
pub enum PemSource {
    Path(PathBuf),
    Pem(Vec<u8>),
}

impl PemSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        PemSource::Path(path.into())
    }

    pub fn pem(bytes: impl Into<Vec<u8>>) -> Self {
        PemSource::Pem(bytes.into())
    }

    /// Reads the PEM bytes, touching the filesystem only for [`PemSource::Path`].
    pub fn read(&self) -> io::Result<Cow<'_, [u8]>> {
        match self {
            PemSource::Path(path) => fs::read(path).map(Cow::Owned),
            PemSource::Pem(bytes) => Ok(Cow::Borrowed(bytes)),
        }
    }
}

impl Display for PemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PemSource::Path(path) => write!(f, "{}", path.display()),
            PemSource::Pem(bytes) => write!(f, "<inline PEM, {} bytes>", bytes.len()),
        }
    }
}

impl fmt::Debug for PemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PemSource({self})")
    }
}

impl From<PathBuf> for PemSource {
    fn from(path: PathBuf) -> Self {
        PemSource::Path(path)
    }
}

/// Loads every certificate contained in `source`.
pub(crate) fn load_certificates(source: &PemSource) -> Result<Vec<X509>, String> {
    let bytes = source
        .read()
        .map_err(|e| format!("unable to read certificate {source}: {e}"))?;
    let certificates = X509::stack_from_pem(&bytes)
        .map_err(|e| format!("unable to parse certificate {source}: {}", describe(&e)))?;
    if certificates.is_empty() {
        return Err(format!("no certificate found in {source}"));
    }
    Ok(certificates)
}

/// A private key together with the passphrase that unlocks it.
///
/// The two are only ever stored as a pair; the passphrase is never
/// printed by [`Debug`](fmt::Debug).
#[derive(Clone)]
pub struct SigningKey {
    key: PemSource,
    passphrase: String,
}

impl SigningKey {
    /// Creates a signing key, a missing passphrase becomes the empty string.
    pub fn new(key: PemSource, passphrase: Option<&str>) -> Self {
        Self {
            key,
            passphrase: passphrase.unwrap_or_default().to_string(),
        }
    }

    pub fn source(&self) -> &PemSource {
        &self.key
    }

    pub fn has_passphrase(&self) -> bool {
        !self.passphrase.is_empty()
    }

    /// Reads and decrypts the private key.
    pub(crate) fn load(&self) -> SmimeResult<PKey<Private>> {
        let bytes = self.key.read().map_err(|e| {
            SmimeError::SigningKey(format!("error retrieving private key ({}: {e})", self.key))
        })?;
        if self.passphrase.contains('\0') {
            return Err(SmimeError::SigningKey(
                "error retrieving private key (passphrase contains NUL)".to_string(),
            ));
        }
        PKey::private_key_from_pem_passphrase(&bytes, self.passphrase.as_bytes()).map_err(|e| {
            SmimeError::SigningKey(format!("error retrieving private key ({})", describe(&e)))
        })
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key", &self.key)
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// Symmetric cipher used for the enveloped content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum EncryptionCipher {
    #[serde(rename = "aes-128-cbc")]
    Aes128Cbc,
    #[serde(rename = "aes-192-cbc")]
    Aes192Cbc,
    #[default]
    #[serde(rename = "aes-256-cbc")]
    Aes256Cbc,
}

impl EncryptionCipher {
    pub fn cipher(&self) -> Cipher {
        match self {
            EncryptionCipher::Aes128Cbc => Cipher::aes_128_cbc(),
            EncryptionCipher::Aes192Cbc => Cipher::aes_192_cbc(),
            EncryptionCipher::Aes256Cbc => Cipher::aes_256_cbc(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EncryptionCipher::Aes128Cbc => "aes-128-cbc",
            EncryptionCipher::Aes192Cbc => "aes-192-cbc",
            EncryptionCipher::Aes256Cbc => "aes-256-cbc",
        }
    }
}

impl FromStr for EncryptionCipher {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-cbc" | "aes128" => Ok(EncryptionCipher::Aes128Cbc),
            "aes-192-cbc" | "aes192" => Ok(EncryptionCipher::Aes192Cbc),
            "aes-256-cbc" | "aes256" => Ok(EncryptionCipher::Aes256Cbc),
            other => Err(format!("unsupported cipher: {other}")),
        }
    }
}

/// Named flags handed to the PKCS7 sign primitive.
///
/// Names are case-insensitive and may carry the `PKCS7_` prefix, so both
/// `detached` and `PKCS7_DETACHED` select the same flag.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SignerOptions(BTreeMap<String, bool>);

impl SignerOptions {
    /// Creates an empty option set.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Option set producing `multipart/signed` output with a detached signature.
    pub fn detached() -> Self {
        Self::new().with("detached", true)
    }

    pub fn with(mut self, name: &str, enabled: bool) -> Self {
        self.set(name, enabled);
        self
    }

    pub fn set(&mut self, name: &str, enabled: bool) {
        self.0.insert(normalize_option(name), enabled);
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.0.get(&normalize_option(name)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the names that do not correspond to a PKCS7 flag.
    pub fn unrecognized(&self) -> Vec<&str> {
        self.0
            .keys()
            .filter(|name| flag_for(name).is_none())
            .map(String::as_str)
            .collect()
    }

    /// Converts the enabled options into PKCS7 flags.
    pub fn flags(&self) -> Pkcs7Flags {
        let mut flags = Pkcs7Flags::empty();
        for (name, enabled) in &self.0 {
            match flag_for(name) {
                Some(flag) if *enabled => flags |= flag,
                Some(_) => {}
                None => warn!(option = %name, "Ignoring unknown signer option"),
            }
        }
        flags
    }
}

impl Default for SignerOptions {
    fn default() -> Self {
        Self::detached()
    }
}

impl<'a> FromIterator<(&'a str, bool)> for SignerOptions {
    fn from_iter<I: IntoIterator<Item = (&'a str, bool)>>(iter: I) -> Self {
        let mut options = Self::new();
        for (name, enabled) in iter {
            options.set(name, enabled);
        }
        options
    }
}

fn normalize_option(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    match name.strip_prefix("pkcs7_") {
        Some(stripped) => stripped.to_string(),
        None => name,
    }
}

fn flag_for(name: &str) -> Option<Pkcs7Flags> {
    let flag = match name {
        "text" => Pkcs7Flags::TEXT,
        "nocerts" => Pkcs7Flags::NOCERTS,
        "nosigs" => Pkcs7Flags::NOSIGS,
        "nochain" => Pkcs7Flags::NOCHAIN,
        "nointern" => Pkcs7Flags::NOINTERN,
        "noverify" => Pkcs7Flags::NOVERIFY,
        "detached" => Pkcs7Flags::DETACHED,
        "binary" => Pkcs7Flags::BINARY,
        "noattr" => Pkcs7Flags::NOATTR,
        "nosmimecap" => Pkcs7Flags::NOSMIMECAP,
        "nooldmimetype" => Pkcs7Flags::NOOLDMIMETYPE,
        "crlfeol" => Pkcs7Flags::CRLFEOL,
        "stream" => Pkcs7Flags::STREAM,
        "nocrl" => Pkcs7Flags::NOCRL,
        "partial" => Pkcs7Flags::PARTIAL,
        "reuse_digest" => Pkcs7Flags::REUSE_DIGEST,
        _ => return None,
    };
    Some(flag)
}

/// How a recipient pattern is compared against an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchType {
    /// Matches an exact email address (e.g. "alice@example.com").
    ExactAddress,
    /// Matches all users at a domain (e.g. "example.com").
    Domain,
    /// Matches a domain and all its subdomains (e.g. "*.example.com").
    WildcardDomain,
}

/// Determines the match type of a recipient pattern.
///
/// Patterns holding an `@` are addresses, patterns starting with `*.`
/// are wildcard domains, anything else is a plain domain.
pub fn determine_match_type(pattern: &str) -> MatchType {
    if pattern.contains('@') {
        MatchType::ExactAddress
    } else if pattern.starts_with("*.") {
        MatchType::WildcardDomain
    } else {
        MatchType::Domain
    }
}

/// A certificate bound to the recipients matching a pattern.
#[derive(Debug, Clone)]
pub struct RecipientCertificate {
    pub match_type: MatchType,
    pub pattern: String,
    pub certificate: PemSource,
}

impl RecipientCertificate {
    pub fn new(pattern: &str, certificate: PemSource) -> Self {
        let pattern = pattern.trim();
        Self {
            match_type: determine_match_type(pattern),
            pattern: pattern.to_string(),
            certificate,
        }
    }

    /// Tests if this entry applies to the given recipient address.
    pub fn matches(&self, address: &str) -> bool {
        let domain = address.rsplit_once('@').map(|(_, d)| d);
        match self.match_type {
            MatchType::ExactAddress => address.eq_ignore_ascii_case(&self.pattern),
            MatchType::Domain => domain.is_some_and(|d| d.eq_ignore_ascii_case(&self.pattern)),
            MatchType::WildcardDomain => {
                let wildcard = self.pattern.strip_prefix("*.").unwrap_or(&self.pattern);
                domain.is_some_and(|d| {
                    d.eq_ignore_ascii_case(wildcard)
                        || d.to_ascii_lowercase()
                            .ends_with(&format!(".{}", wildcard.to_ascii_lowercase()))
                })
            }
        }
    }
}

/// The certificates a message is encrypted for.
#[derive(Debug, Clone)]
pub enum EncryptionCertificates {
    /// One certificate applied to every recipient.
    Single(PemSource),
    /// Several certificates, all applied to every recipient.
    List(Vec<PemSource>),
    /// Certificates selected per recipient, sorted by specificity.
    PerRecipient(Vec<RecipientCertificate>),
}

impl EncryptionCertificates {
    /// Builds a per-recipient mapping from `(pattern, certificate)` pairs.
    ///
    /// Entries are sorted by specificity: exact address > domain > wildcard.
    pub fn per_recipient<I, K>(mapping: I) -> Self
    where
        I: IntoIterator<Item = (K, PemSource)>,
        K: AsRef<str>,
    {
        let mut entries = mapping
            .into_iter()
            .map(|(pattern, certificate)| RecipientCertificate::new(pattern.as_ref(), certificate))
            .collect::<Vec<_>>();
        entries.sort_by_key(|e| e.match_type);
        EncryptionCertificates::PerRecipient(entries)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            EncryptionCertificates::Single(_) => false,
            EncryptionCertificates::List(list) => list.is_empty(),
            EncryptionCertificates::PerRecipient(entries) => entries.is_empty(),
        }
    }

    /// Resolves the certificates to encrypt for the given recipients.
    ///
    /// A per-recipient mapping must cover every recipient, a message is
    /// never encrypted for only part of its audience.
    pub fn resolve(&self, recipients: &[String]) -> SmimeResult<Vec<&PemSource>> {
        let resolved = match self {
            EncryptionCertificates::Single(source) => vec![source],
            EncryptionCertificates::List(list) => list.iter().collect(),
            EncryptionCertificates::PerRecipient(entries) => {
                let mut resolved: Vec<&PemSource> = Vec::with_capacity(recipients.len());
                for recipient in recipients {
                    let entry = entries
                        .iter()
                        .find(|e| e.matches(recipient))
                        .ok_or_else(|| {
                            SmimeError::EncryptionCertificate(format!(
                                "no encryption certificate for recipient {recipient}"
                            ))
                        })?;
                    debug!(
                        recipient = %recipient,
                        pattern = %entry.pattern,
                        "Resolved recipient certificate"
                    );
                    if !resolved.iter().any(|r| std::ptr::eq(*r, &entry.certificate)) {
                        resolved.push(&entry.certificate);
                    }
                }
                resolved
            }
        };
        if resolved.is_empty() {
            return Err(SmimeError::EncryptionCertificate(
                "no encryption certificate applies to this message".to_string(),
            ));
        }
        Ok(resolved)
    }
}

/// Immutable S/MIME material for one mailer instance.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    signing_certificate: Option<PemSource>,
    signing_key: Option<SigningKey>,
    signing_chain: Vec<PemSource>,
    encryption_certificates: Option<EncryptionCertificates>,
    signer_options: SignerOptions,
    cipher: EncryptionCipher,
}

impl Credentials {
    pub fn builder() -> CredentialsBuilder {
        CredentialsBuilder::default()
    }

    pub fn signing_certificate(&self) -> Option<&PemSource> {
        self.signing_certificate.as_ref()
    }

    pub fn signing_key(&self) -> Option<&SigningKey> {
        self.signing_key.as_ref()
    }

    pub fn signing_chain(&self) -> &[PemSource] {
        &self.signing_chain
    }

    pub fn encryption_certificates(&self) -> Option<&EncryptionCertificates> {
        self.encryption_certificates.as_ref()
    }

    pub fn signer_options(&self) -> &SignerOptions {
        &self.signer_options
    }

    pub fn cipher(&self) -> EncryptionCipher {
        self.cipher
    }

    /// Whether messages get signed, gated on the signing certificate.
    pub fn is_signing(&self) -> bool {
        self.signing_certificate.is_some()
    }

    pub fn is_encrypting(&self) -> bool {
        self.encryption_certificates.is_some()
    }

    /// Whether messages are forwarded without any transformation.
    pub fn is_pass_through(&self) -> bool {
        !self.is_signing() && !self.is_encrypting()
    }
}

/// Builder for [`Credentials`], every field is optional.
#[derive(Debug, Default)]
pub struct CredentialsBuilder {
    signing_certificate: Option<PemSource>,
    signing_key: Option<SigningKey>,
    signing_chain: Vec<PemSource>,
    encryption_certificates: Option<EncryptionCertificates>,
    signer_options: Option<SignerOptions>,
    default_signer_options: Option<SignerOptions>,
    cipher: EncryptionCipher,
}

impl CredentialsBuilder {
    /// Sets the recipient certificates, an empty set disables encryption.
    pub fn encryption_certificates(mut self, certificates: EncryptionCertificates) -> Self {
        self.encryption_certificates = (!certificates.is_empty()).then_some(certificates);
        self
    }

    pub fn signing_certificate(mut self, certificate: PemSource) -> Self {
        self.signing_certificate = Some(certificate);
        self
    }

    /// Sets the private key and its passphrase (empty when `None`).
    pub fn signing_key(mut self, key: PemSource, passphrase: Option<&str>) -> Self {
        self.signing_key = Some(SigningKey::new(key, passphrase));
        self
    }

    /// Adds intermediate certificates shipped along with the signature.
    pub fn signing_chain(mut self, chain: Vec<PemSource>) -> Self {
        self.signing_chain = chain;
        self
    }

    /// Sets the signer options; an empty set falls back to the defaults.
    pub fn signer_options(mut self, options: SignerOptions) -> Self {
        self.signer_options = Some(options);
        self
    }

    /// Sets the options used when no (or an empty) option set is given.
    pub fn default_signer_options(mut self, options: SignerOptions) -> Self {
        self.default_signer_options = Some(options);
        self
    }

    pub fn cipher(mut self, cipher: EncryptionCipher) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn build(self) -> Credentials {
        let signer_options = match self.signer_options {
            Some(options) if !options.is_empty() => options,
            _ => self.default_signer_options.unwrap_or_default(),
        };
        let credentials = Credentials {
            signing_certificate: self.signing_certificate,
            signing_key: self.signing_key,
            signing_chain: self.signing_chain,
            encryption_certificates: self.encryption_certificates,
            signer_options,
            cipher: self.cipher,
        };
        debug!(
            signing = credentials.is_signing(),
            encrypting = credentials.is_encrypting(),
            cipher = credentials.cipher.name(),
            "Credentials built"
        );
        credentials
    }
}

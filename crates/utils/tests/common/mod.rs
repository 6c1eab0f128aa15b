//! Throwaway S/MIME identities shared by the unit and integration tests.
//!
//! Unit tests mostly feed the PEM bytes inline, integration tests write
//! them to disk so credentials go through the same file loading path as
//! a deployed mailer.

#![allow(dead_code)]

use std::{
    fs,
    ops::Deref,
    path::{Path, PathBuf},
};

use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    nid::Nid,
    pkcs7::{Pkcs7, Pkcs7Flags},
    pkey::{PKey, Private},
    rsa::Rsa,
    stack::Stack,
    symm::Cipher,
    x509::{store::X509StoreBuilder, X509Builder, X509NameBuilder, X509},
};

/// Passphrase protecting every generated key.
pub const PASSPHRASE: &str = "Test123!";

pub struct TestIdentity {
    pub cert: X509,
    pub key: PKey<Private>,
    pub cert_pem: Vec<u8>,
    /// PKCS#8 key encrypted with [`PASSPHRASE`].
    pub key_pem: Vec<u8>,
    /// The same key without encryption.
    pub plain_key_pem: Vec<u8>,
}

/// A [`TestIdentity`] written to `<name>.crt` and `<name>.key`.
pub struct StoredIdentity {
    pub identity: TestIdentity,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Deref for StoredIdentity {
    type Target = TestIdentity;

    fn deref(&self) -> &TestIdentity {
        &self.identity
    }
}

/// Generates a self-signed RSA certificate for `email`.
pub fn generate_identity(common_name: &str, email: &str) -> TestIdentity {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)
        .unwrap();
    name.append_entry_by_nid(Nid::PKCS9_EMAILADDRESS, email)
        .unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    TestIdentity {
        cert_pem: cert.to_pem().unwrap(),
        key_pem: key
            .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), PASSPHRASE.as_bytes())
            .unwrap(),
        plain_key_pem: key.private_key_to_pem_pkcs8().unwrap(),
        cert,
        key,
    }
}

/// Generates an identity and stores it in `dir`, the key encrypted
/// with [`PASSPHRASE`].
pub fn identity(dir: &Path, name: &str, email: &str) -> StoredIdentity {
    let identity = generate_identity(name, email);
    let cert_path = dir.join(format!("{name}.crt"));
    let key_path = dir.join(format!("{name}.key"));
    fs::write(&cert_path, &identity.cert_pem).unwrap();
    fs::write(&key_path, &identity.key_pem).unwrap();
    StoredIdentity {
        identity,
        cert_path,
        key_path,
    }
}

/// Verifies an S/MIME signed message (without chain validation) and
/// returns the signed content.
pub fn verify_signed(raw: &[u8]) -> Vec<u8> {
    let (pkcs7, content) = Pkcs7::from_smime(raw).unwrap();
    let store = X509StoreBuilder::new().unwrap().build();
    let certs = Stack::<X509>::new().unwrap();
    let mut out = Vec::new();
    pkcs7
        .verify(
            &certs,
            &store,
            content.as_deref(),
            Some(&mut out),
            Pkcs7Flags::NOVERIFY,
        )
        .unwrap();
    out
}

/// Decrypts an S/MIME enveloped message with the identity's key.
pub fn decrypt_enveloped(raw: &[u8], identity: &TestIdentity) -> Vec<u8> {
    let (pkcs7, _) = Pkcs7::from_smime(raw).unwrap();
    pkcs7
        .decrypt(&identity.key, &identity.cert, Pkcs7Flags::empty())
        .unwrap()
}

//! Service-account credential parsing
//!
//! Only the two fields needed to mint an identity token are read from the
//! Google key file; everything else in the blob is ignored.

use crate::error::AuthError;
use rustls_pemfile::Item;
use serde::Deserialize;
use std::fmt;

#[derive(Clone, Deserialize)]
pub struct ServiceAccountCredential {
    pub client_email: String,
    /// PKCS#8 private key, PEM armored
    pub private_key: String,
}

impl fmt::Debug for ServiceAccountCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountCredential")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl ServiceAccountCredential {
    /// Parse a service-account JSON blob
    pub fn from_json(json: &str) -> Result<Self, AuthError> {
        Ok(serde_json::from_str(json)?)
    }

    /// DER bytes of the private key
    pub fn private_key_der(&self) -> Result<Vec<u8>, AuthError> {
        pem_to_der(&self.private_key)
    }
}

/// Decode the first PEM block of `pem`, which must be a `PRIVATE KEY`.
///
/// Other recognised blocks (e.g. PKCS#1 `RSA PRIVATE KEY`) are rejected:
/// the signer only imports PKCS#8.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>, AuthError> {
    // Armor lines must start in the first column
    let mut normalized = pem.lines().map(str::trim).collect::<Vec<_>>().join("\n");
    normalized.push('\n');
    let mut reader = normalized.as_bytes();

    match rustls_pemfile::read_one(&mut reader).map_err(|e| AuthError::PemDecode(e.to_string()))? {
        Some(Item::Pkcs8Key(key)) => Ok(key.secret_pkcs8_der().to_vec()),
        Some(other) => Err(AuthError::UnsupportedPem(item_label(&other).to_string())),
        None => Err(AuthError::MissingPrivateKey),
    }
}

fn item_label(item: &Item) -> &'static str {
    match item {
        Item::X509Certificate(_) => "CERTIFICATE",
        Item::SubjectPublicKeyInfo(_) => "PUBLIC KEY",
        Item::Pkcs1Key(_) => "RSA PRIVATE KEY",
        Item::Pkcs8Key(_) => "PRIVATE KEY",
        Item::Sec1Key(_) => "EC PRIVATE KEY",
        Item::Crl(_) => "X509 CRL",
        Item::Csr(_) => "CERTIFICATE REQUEST",
        _ => "unknown",
    }
}

//! Signed JWT-bearer assertions (RS256)
//!
//! The assertion is assembled by hand rather than through a JWT library so
//! that every byte of it is pinned by tests:
//!
//! 1. header `{"alg":"RS256","typ":"JWT"}` and the claims object are
//!    serialized as compact JSON, in declaration order;
//! 2. both are base64url-encoded without padding and joined with `.`;
//! 3. the joined string is signed with RSASSA-PKCS1-v1_5 / SHA-256;
//! 4. the signature is base64url-encoded and appended after another `.`.
//!
//! Key import ([`SigningKey::from_pkcs8_der`]) and signing
//! ([`SigningKey::sign`]) are separate steps.

use crate::credential::ServiceAccountCredential;
use crate::error::AuthError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use serde::Serialize;

/// Lifetime of an assertion in seconds
pub const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Base64url without padding
pub fn base64url_encode(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn base64url_decode(data: &str) -> Result<Vec<u8>, AuthError> {
    Ok(URL_SAFE_NO_PAD.decode(data)?)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssertionHeader {
    pub alg: &'static str,
    pub typ: &'static str,
}

impl Default for AssertionHeader {
    fn default() -> Self {
        Self {
            alg: "RS256",
            typ: "JWT",
        }
    }
}

/// Claims of an identity-token request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssertionClaims {
    pub iss: String,
    pub sub: String,
    /// Token endpoint the assertion is presented to
    pub aud: String,
    /// Audience of the identity token being requested
    pub target_audience: String,
    pub iat: i64,
    pub exp: i64,
}

impl AssertionClaims {
    pub fn new(client_email: &str, token_url: &str, target_audience: &str, iat: i64) -> Self {
        Self {
            iss: client_email.to_string(),
            sub: client_email.to_string(),
            aud: token_url.to_string(),
            target_audience: target_audience.to_string(),
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        }
    }
}

/// An imported RSA private key
pub struct SigningKey {
    key_pair: RsaKeyPair,
    rng: SystemRandom,
}

impl SigningKey {
    /// Import a PKCS#8 DER-encoded RSA private key
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, AuthError> {
        let key_pair =
            RsaKeyPair::from_pkcs8(der).map_err(|e| AuthError::KeyRejected(e.to_string()))?;
        Ok(Self {
            key_pair,
            rng: SystemRandom::new(),
        })
    }

    /// Import the private key of a service-account credential
    pub fn from_credential(credential: &ServiceAccountCredential) -> Result<Self, AuthError> {
        Self::from_pkcs8_der(&credential.private_key_der()?)
    }

    /// RSASSA-PKCS1-v1_5 SHA-256 signature over `message`
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(&RSA_PKCS1_SHA256, &self.rng, message, &mut signature)
            .map_err(|_| AuthError::Signing)?;
        Ok(signature)
    }

    /// DER `RSAPublicKey` of this key
    pub fn public_key_der(&self) -> &[u8] {
        self.key_pair.public().as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct SignedAssertion {
    pub header: AssertionHeader,
    pub claims: AssertionClaims,
    pub signature: Vec<u8>,
}

impl SignedAssertion {
    /// Sign `claims` with `key`
    pub fn sign(claims: AssertionClaims, key: &SigningKey) -> Result<Self, AuthError> {
        let header = AssertionHeader::default();
        let input = signing_input(&header, &claims)?;
        let signature = key.sign(input.as_bytes())?;
        Ok(Self {
            header,
            claims,
            signature,
        })
    }

    /// `<header>.<claims>` as signed
    pub fn signing_input(&self) -> Result<String, AuthError> {
        signing_input(&self.header, &self.claims)
    }

    /// `<header>.<claims>.<signature>`
    pub fn to_compact(&self) -> Result<String, AuthError> {
        Ok(format!(
            "{}.{}",
            self.signing_input()?,
            base64url_encode(&self.signature)
        ))
    }
}

fn signing_input(header: &AssertionHeader, claims: &AssertionClaims) -> Result<String, AuthError> {
    let header = serde_json::to_vec(header).map_err(|e| AuthError::Encode(e.to_string()))?;
    let claims = serde_json::to_vec(claims).map_err(|e| AuthError::Encode(e.to_string()))?;
    Ok(format!(
        "{}.{}",
        base64url_encode(header),
        base64url_encode(claims)
    ))
}

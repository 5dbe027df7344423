//! Identity-token issuance via the OAuth 2.0 JWT-bearer grant

use crate::assertion::{AssertionClaims, SignedAssertion, SigningKey};
use crate::credential::ServiceAccountCredential;
use crate::error::AuthError;
use serde::Deserialize;
use std::fmt;
use tracing::{debug, error};

/// Google OAuth2 token endpoint that mints identity tokens
pub const DEFAULT_TOKEN_URL: &str = "https://www.googleapis.com/oauth2/v4/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Opaque bearer credential proving the caller's identity to the backend
#[derive(Clone, PartialEq)]
pub struct IdentityToken(String);

impl IdentityToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value for an `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentityToken(<redacted>)")
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
}

/// Exchanges signed assertions for identity tokens
#[derive(Clone)]
pub struct TokenIssuer {
    http: reqwest::Client,
    token_url: String,
}

impl TokenIssuer {
    pub fn new(http: reqwest::Client, token_url: impl Into<String>) -> Self {
        Self {
            http,
            token_url: token_url.into(),
        }
    }

    /// Build a fresh assertion for `audience`, issued at `iat`
    pub fn build_assertion(
        &self,
        credential: &ServiceAccountCredential,
        audience: &str,
        iat: i64,
    ) -> Result<String, AuthError> {
        let claims = AssertionClaims::new(&credential.client_email, &self.token_url, audience, iat);
        let key = SigningKey::from_credential(credential)?;
        SignedAssertion::sign(claims, &key)?.to_compact()
    }

    /// Sign an assertion and exchange it for an identity token scoped to `audience`
    pub async fn issue(
        &self,
        credential: &ServiceAccountCredential,
        audience: &str,
    ) -> Result<IdentityToken, AuthError> {
        let iat = chrono::Utc::now().timestamp();
        let assertion = self.build_assertion(credential, audience, iat)?;

        let params = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];
        let response = self.http.post(&self.token_url).form(&params).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Exchange {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json().await?;
        match token.id_token {
            Some(id_token) if !id_token.is_empty() => {
                debug!(audience, "Identity token issued");
                Ok(IdentityToken(id_token))
            }
            _ => Err(AuthError::MissingIdToken),
        }
    }

    /// Like [`issue`](Self::issue), but parses the credential blob first and
    /// logs any failure instead of returning it.
    pub async fn fetch_identity_token(
        &self,
        credential_json: &str,
        audience: &str,
    ) -> Option<IdentityToken> {
        let result = match ServiceAccountCredential::from_json(credential_json) {
            Ok(credential) => self.issue(&credential, audience).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(token) => Some(token),
            Err(AuthError::Exchange { status, body }) => {
                error!(target: "wakegate::auth", status, body = %body, "Token exchange failed");
                None
            }
            Err(e) => {
                error!(target: "wakegate::auth", error = %e, "Error generating identity token");
                None
            }
        }
    }
}

//! Error types and synthetic HTTP responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Errors raised while turning a service-account credential into an identity token
#[derive(Debug, Error)]
pub enum AuthError {
    /// The credential blob is not valid JSON or lacks required fields
    #[error("invalid service account credential: {0}")]
    InvalidCredential(#[from] serde_json::Error),

    /// The private key is not a `PRIVATE KEY` PEM block
    #[error("unsupported PEM block: {0}")]
    UnsupportedPem(String),

    /// The PEM block is malformed (bad armor or bad base64 body)
    #[error("invalid PEM encoding: {0}")]
    PemDecode(String),

    /// The PEM text holds no recognised private key block
    #[error("no PKCS#8 private key found")]
    MissingPrivateKey,

    /// Base64url payload could not be decoded
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The DER bytes were rejected as an RSA PKCS#8 key
    #[error("private key rejected: {0}")]
    KeyRejected(String),

    /// RSA signing failed
    #[error("failed to sign assertion")]
    Signing,

    /// Could not serialize header or claims
    #[error("failed to encode assertion: {0}")]
    Encode(String),

    /// Transport error talking to the token endpoint
    #[error("token endpoint request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The token endpoint answered with a non-success status
    #[error("token exchange failed with status {status}: {body}")]
    Exchange { status: u16, body: String },

    /// The token endpoint answered 2xx without an `id_token`
    #[error("token response did not contain an id_token")]
    MissingIdToken,
}

/// Error codes for proxy-generated responses
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Transport error while contacting the origin
    OriginUnreachable,
    /// The origin did not answer within the request timeout
    OriginTimeout,
    /// The inbound request could not be re-targeted at the origin
    InvalidOriginRequest,
}

impl ProxyErrorCode {
    /// Status code reported for this error.
    ///
    /// Transport failures use Cloudflare's 530 so that the classifier treats
    /// them exactly like an unreachable tunnel.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::OriginUnreachable | ProxyErrorCode::OriginTimeout => {
                StatusCode::from_u16(530).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyErrorCode::InvalidOriginRequest => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::OriginUnreachable => "ORIGIN_UNREACHABLE",
            ProxyErrorCode::OriginTimeout => "ORIGIN_TIMEOUT",
            ProxyErrorCode::InvalidOriginRequest => "INVALID_ORIGIN_REQUEST",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Message carried by every synthetic transport failure
pub const UNREACHABLE_MESSAGE: &str = "Tunnel/Network Unreachable";

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

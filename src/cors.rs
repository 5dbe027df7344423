//! CORS preflight handling

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ORIGIN,
};
use hyper::{Response, StatusCode};

const ALLOWED_METHODS: &str = "GET, HEAD, POST, OPTIONS";
const ALLOWED_HEADERS: &str = "Content-Type";

/// Preflight policy derived from the optional allowed domain
#[derive(Debug, Clone, Default)]
pub struct CorsPolicy {
    /// Exact origin allowed to make cross-origin calls; `None` allows any
    allowed_origin: Option<String>,
}

impl CorsPolicy {
    /// `domain` may be a bare host (`app.example.com`, implying https) or a
    /// full origin (`http://localhost:8080`).
    pub fn new(domain: Option<&str>) -> Self {
        let allowed_origin = domain
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(|d| {
                let d = d.trim_end_matches('/');
                if d.contains("://") {
                    d.to_string()
                } else {
                    format!("https://{}", d)
                }
            });
        Self { allowed_origin }
    }

    pub fn allowed_origin(&self) -> Option<&str> {
        self.allowed_origin.as_deref()
    }

    /// Value for `Access-Control-Allow-Origin`, or `None` to omit the header
    pub fn allow_origin_for<'a>(&'a self, request_origin: Option<&str>) -> Option<&'a str> {
        match &self.allowed_origin {
            None => Some("*"),
            Some(allowed) if request_origin == Some(allowed.as_str()) => Some(allowed.as_str()),
            Some(_) => None,
        }
    }

    /// Answer a preflight request without contacting the origin
    pub fn preflight_response(
        &self,
        request_headers: &HeaderMap,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let request_origin = request_headers.get(ORIGIN).and_then(|v| v.to_str().ok());

        let mut builder = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(ACCESS_CONTROL_ALLOW_METHODS, ALLOWED_METHODS)
            .header(ACCESS_CONTROL_ALLOW_HEADERS, ALLOWED_HEADERS);

        if let Some(origin) = self
            .allow_origin_for(request_origin)
            .and_then(|o| HeaderValue::from_str(o).ok())
        {
            builder = builder.header(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }

        builder
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response with static headers")
    }
}

//! Cold-start classification of origin responses
//!
//! Everything here is a pure function of the origin status, the request
//! headers and the query string.

use hyper::header::ACCEPT;
use hyper::{HeaderMap, StatusCode};
use std::collections::HashSet;

/// Status codes that default to "origin unavailable"
pub const DEFAULT_OFFLINE_STATUS_CODES: [u16; 6] = [502, 503, 521, 522, 523, 530];

/// Default name of the bypass query parameter
pub const DEFAULT_BYPASS_PARAM: &str = "now";

/// Immutable set of statuses treated as "origin is down or cold"
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineStatusSet {
    codes: HashSet<StatusCode>,
}

impl OfflineStatusSet {
    /// Build from raw codes; values outside 100..=999 are skipped
    pub fn new(codes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            codes: codes
                .into_iter()
                .filter_map(|c| StatusCode::from_u16(c).ok())
                .collect(),
        }
    }

    pub fn contains(&self, status: StatusCode) -> bool {
        self.codes.contains(&status)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

impl Default for OfflineStatusSet {
    fn default() -> Self {
        Self::new(DEFAULT_OFFLINE_STATUS_CODES)
    }
}

/// Outcome of classifying one proxied request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProxyDecision {
    pub origin_status: StatusCode,
    pub is_offline_signal: bool,
    pub is_browser_caller: bool,
    pub bypass_requested: bool,
}

impl ProxyDecision {
    /// Serve the waiting page (and wake the backend) instead of the origin response.
    /// Bypass always wins.
    pub fn should_serve_waiting_page(&self) -> bool {
        self.is_offline_signal && self.is_browser_caller && !self.bypass_requested
    }
}

/// Classifies origin responses against a fixed offline set and bypass parameter
#[derive(Debug, Clone)]
pub struct Classifier {
    offline: OfflineStatusSet,
    bypass_param: String,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(OfflineStatusSet::default(), DEFAULT_BYPASS_PARAM)
    }
}

impl Classifier {
    pub fn new(offline: OfflineStatusSet, bypass_param: impl Into<String>) -> Self {
        Self {
            offline,
            bypass_param: bypass_param.into(),
        }
    }

    pub fn offline_statuses(&self) -> &OfflineStatusSet {
        &self.offline
    }

    pub fn bypass_param(&self) -> &str {
        &self.bypass_param
    }

    pub fn classify(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> ProxyDecision {
        ProxyDecision {
            origin_status: status,
            is_offline_signal: self.offline.contains(status),
            is_browser_caller: is_browser_caller(headers),
            bypass_requested: has_query_param(query, &self.bypass_param),
        }
    }
}

/// True iff the `Accept` header mentions `text/html`.
///
/// A heuristic, not content negotiation: API clients are assumed not to
/// advertise HTML. A missing or non-UTF-8 header means "not a browser".
pub fn is_browser_caller(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/html"))
}

/// True iff `name` appears as a key in the query string, with or without a value
pub fn has_query_param(query: Option<&str>, name: &str) -> bool {
    let Some(query) = query else {
        return false;
    };

    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').map_or(pair, |(key, _)| key))
        .any(|key| {
            let key = key.replace('+', " ");
            urlencoding::decode(&key)
                .map(|decoded| decoded == name)
                .unwrap_or(false)
        })
}

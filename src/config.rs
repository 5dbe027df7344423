use crate::classifier::{Classifier, OfflineStatusSet, DEFAULT_BYPASS_PARAM, DEFAULT_OFFLINE_STATUS_CODES};
use crate::cors::CorsPolicy;
use crate::token::DEFAULT_TOKEN_URL;
use crate::waiting_page::WaitingPage;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Environment variables overlaid on the file configuration
pub const ENV_DOMAIN: &str = "DOMAIN";
pub const ENV_WAKE_URL: &str = "CLOUD_RUN_URL";
pub const ENV_SA_KEY: &str = "GCP_SA_KEY";
pub const ENV_SA_KEY_FILE: &str = "GCP_SA_KEY_FILE";
pub const ENV_ORIGIN_URL: &str = "ORIGIN_URL";

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Origin forwarding and classification
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Backend wake-up settings
    #[serde(default)]
    pub wake: WakeConfig,

    #[serde(default)]
    pub waiting_page: WaitingPageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle connections to the origin (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle origin connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Base URL requests are forwarded to, e.g. the local tunnel endpoint.
    /// Path and query of the inbound request are appended verbatim.
    #[serde(default = "default_origin_url")]
    pub origin_url: String,

    /// Max time to wait for the origin to answer (default: 10s)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Path answered locally with 200 OK (default: /healthz)
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Domain allowed for CORS preflight. Unset allows any origin.
    pub allowed_domain: Option<String>,

    /// Origin statuses treated as "offline / cold starting"
    #[serde(default = "default_offline_status_codes")]
    pub offline_status_codes: Vec<u16>,

    /// Query parameter that suppresses the waiting page (default: now)
    #[serde(default = "default_bypass_param")]
    pub bypass_param: String,
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::new(
            OfflineStatusSet::new(self.offline_status_codes.iter().copied()),
            self.bypass_param.clone(),
        )
    }

    pub fn cors_policy(&self) -> CorsPolicy {
        CorsPolicy::new(self.allowed_domain.as_deref())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            origin_url: default_origin_url(),
            request_timeout_secs: default_request_timeout(),
            health_path: default_health_path(),
            allowed_domain: None,
            offline_status_codes: default_offline_status_codes(),
            bypass_param: default_bypass_param(),
        }
    }
}

/// What to do when an identity token cannot be obtained
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AuthFailurePolicy {
    /// Send the wake ping without an Authorization header (default)
    #[default]
    Unauthenticated,
    /// Do not send the wake ping
    Skip,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WakeConfig {
    /// URL pinged to wake the backend. Unset disables wake pings.
    pub url: Option<String>,

    /// Service-account key JSON used to sign the wake ping
    pub service_account_json: Option<String>,

    /// Path to a service-account key file (read at startup)
    pub service_account_file: Option<String>,

    /// OAuth token endpoint (default: Google's v4 token endpoint)
    #[serde(default = "default_token_url")]
    pub token_url: String,

    /// Timeout for the token exchange and the ping, each (default: 30s)
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    #[serde(default)]
    pub on_auth_failure: AuthFailurePolicy,

    /// Suppress further pings for this many seconds after one is sent.
    /// 0 disables suppression (default).
    #[serde(default)]
    pub dedup_window_secs: u64,

    /// Max time to wait for in-flight pings at shutdown (default: 15s)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl WakeConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn dedup_window(&self) -> Option<Duration> {
        (self.dedup_window_secs > 0).then(|| Duration::from_secs(self.dedup_window_secs))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            url: None,
            service_account_json: None,
            service_account_file: None,
            token_url: default_token_url(),
            ping_timeout_secs: default_ping_timeout(),
            on_auth_failure: AuthFailurePolicy::default(),
            dedup_window_secs: 0,
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WaitingPageConfig {
    /// Meta-refresh interval in seconds (default: 3)
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,

    #[serde(default = "default_page_title")]
    pub title: String,

    #[serde(default = "default_page_message")]
    pub message: String,

    /// Show the origin status code on the page (default: true)
    #[serde(default = "default_true")]
    pub show_status: bool,
}

impl WaitingPageConfig {
    pub fn page(&self) -> WaitingPage {
        WaitingPage::new(self.refresh_secs, self.title.clone(), self.message.clone())
    }
}

impl Default for WaitingPageConfig {
    fn default() -> Self {
        Self {
            refresh_secs: default_refresh_secs(),
            title: default_page_title(),
            message: default_page_message(),
            show_status: true,
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_origin_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

fn default_offline_status_codes() -> Vec<u16> {
    DEFAULT_OFFLINE_STATUS_CODES.to_vec()
}

fn default_bypass_param() -> String {
    DEFAULT_BYPASS_PARAM.to_string()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_ping_timeout() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    15
}

fn default_refresh_secs() -> u64 {
    3
}

fn default_page_title() -> String {
    "Waking up...".to_string()
}

fn default_page_message() -> String {
    "Please wait, this usually takes 10-20 seconds.".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load from a TOML file, overlay the environment, and validate.
    /// A missing file yields the defaults so env-only deploys work.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    fn load_with_env<P, F>(path: P, lookup: F) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();
        let mut config: Config = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Config::default()
            }
            Err(e) => {
                return Err(anyhow::anyhow!("Failed to read {}: {}", path.display(), e));
            }
        };
        config.apply_env(lookup);
        config.resolve_service_account_file()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay deploy-time settings. Non-empty variables win over the file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(domain) = get(ENV_DOMAIN) {
            self.proxy.allowed_domain = Some(domain);
        }
        if let Some(url) = get(ENV_WAKE_URL) {
            self.wake.url = Some(url);
        }
        if let Some(json) = get(ENV_SA_KEY) {
            self.wake.service_account_json = Some(json);
        }
        if let Some(path) = get(ENV_SA_KEY_FILE) {
            self.wake.service_account_file = Some(path);
        }
        if let Some(origin) = get(ENV_ORIGIN_URL) {
            self.proxy.origin_url = origin;
        }
    }

    /// Inline the service-account file unless JSON was given directly
    pub fn resolve_service_account_file(&mut self) -> anyhow::Result<()> {
        if self.wake.service_account_json.is_some() {
            return Ok(());
        }
        if let Some(path) = &self.wake.service_account_file {
            let json = std::fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("Failed to read service account file {}: {}", path, e)
            })?;
            self.wake.service_account_json = Some(json);
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        match self.proxy.origin_url.parse::<hyper::Uri>() {
            Ok(uri) if uri.scheme_str() == Some("http") && uri.host().is_some() => {
                if uri.query().is_some() {
                    errors.push("proxy.origin_url must not contain a query string".to_string());
                }
            }
            Ok(_) => errors.push(format!(
                "proxy.origin_url must be an absolute http:// URL, got '{}'",
                self.proxy.origin_url
            )),
            Err(e) => errors.push(format!("proxy.origin_url is invalid: {}", e)),
        }

        if self.proxy.request_timeout_secs == 0 {
            errors.push("proxy.request_timeout_secs must be greater than 0".to_string());
        }

        if !self.proxy.health_path.starts_with('/') {
            errors.push(format!(
                "proxy.health_path must start with '/', got '{}'",
                self.proxy.health_path
            ));
        }

        if self.proxy.bypass_param.is_empty() {
            errors.push("proxy.bypass_param must not be empty".to_string());
        }

        for code in &self.proxy.offline_status_codes {
            if !(100..=999).contains(code) {
                errors.push(format!("proxy.offline_status_codes: {} is not a status code", code));
            }
        }

        if let Some(url) = &self.wake.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!("wake.url must be an http(s) URL, got '{}'", url));
            }
        }

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server.tls_cert and server.tls_key must be set together".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9090
bind = "127.0.0.1"

[proxy]
origin_url = "http://127.0.0.1:3000"
request_timeout_secs = 5
allowed_domain = "mesh.example.com"
offline_status_codes = [502, 503, 521, 523, 530, 404]

[wake]
url = "https://backend-abc.a.run.app"
on_auth_failure = "skip"
dedup_window_secs = 20

[waiting_page]
refresh_secs = 5
title = "Waking up MeshCentral..."
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.proxy.origin_url, "http://127.0.0.1:3000");
        assert_eq!(config.proxy.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.proxy.offline_status_codes.len(), 6);
        assert_eq!(config.wake.url.as_deref(), Some("https://backend-abc.a.run.app"));
        assert_eq!(config.wake.on_auth_failure, AuthFailurePolicy::Skip);
        assert_eq!(config.wake.dedup_window(), Some(Duration::from_secs(20)));
        assert_eq!(config.waiting_page.refresh_secs, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert!(!config.server.tls_enabled());
        assert_eq!(config.proxy.request_timeout_secs, 10);
        assert_eq!(config.proxy.health_path, "/healthz");
        assert_eq!(config.proxy.bypass_param, "now");
        assert_eq!(
            config.proxy.offline_status_codes,
            vec![502, 503, 521, 522, 523, 530]
        );
        assert!(config.proxy.allowed_domain.is_none());
        assert!(config.wake.url.is_none());
        assert_eq!(config.wake.token_url, "https://www.googleapis.com/oauth2/v4/token");
        assert_eq!(config.wake.on_auth_failure, AuthFailurePolicy::Unauthenticated);
        assert_eq!(config.wake.dedup_window(), None);
        assert_eq!(config.wake.drain_timeout(), Duration::from_secs(15));
        assert_eq!(config.waiting_page.refresh_secs, 3);
        assert!(config.waiting_page.show_status);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_apply_env_overrides_file() {
        let mut config: Config = toml::from_str(
            r#"
[proxy]
allowed_domain = "old.example"
"#,
        )
        .unwrap();

        let env: HashMap<&str, &str> = [
            ("DOMAIN", "new.example"),
            ("CLOUD_RUN_URL", "https://backend.run.app"),
            ("GCP_SA_KEY", "{}"),
            ("ORIGIN_URL", "http://10.0.0.2:80"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.proxy.allowed_domain.as_deref(), Some("new.example"));
        assert_eq!(config.wake.url.as_deref(), Some("https://backend.run.app"));
        assert_eq!(config.wake.service_account_json.as_deref(), Some("{}"));
        assert_eq!(config.proxy.origin_url, "http://10.0.0.2:80");
    }

    #[test]
    fn test_apply_env_ignores_empty_values() {
        let mut config = Config::default();
        config.wake.url = Some("https://keep.run.app".to_string());
        config.apply_env(|k| (k == ENV_WAKE_URL).then(|| "  ".to_string()));
        assert_eq!(config.wake.url.as_deref(), Some("https://keep.run.app"));
    }

    #[test]
    fn test_service_account_file_is_inlined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sa.json");
        std::fs::write(&path, r#"{"client_email":"a@b.c","private_key":"k"}"#).unwrap();

        let mut config = Config::default();
        config.wake.service_account_file = Some(path.to_string_lossy().to_string());
        config.resolve_service_account_file().unwrap();
        assert!(config
            .wake
            .service_account_json
            .as_deref()
            .unwrap()
            .contains("a@b.c"));
    }

    #[test]
    fn test_inline_json_wins_over_file() {
        let mut config = Config::default();
        config.wake.service_account_json = Some("inline".to_string());
        config.wake.service_account_file = Some("/does/not/exist.json".to_string());
        assert!(config.resolve_service_account_file().is_ok());
        assert_eq!(config.wake.service_account_json.as_deref(), Some("inline"));
    }

    #[test]
    fn test_missing_service_account_file_is_error() {
        let mut config = Config::default();
        config.wake.service_account_file = Some("/does/not/exist.json".to_string());
        let err = config.resolve_service_account_file().unwrap_err().to_string();
        assert!(err.contains("/does/not/exist.json"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[proxy]
origin_url = "http://127.0.0.1:4000"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.proxy.request_timeout_secs, 10);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::load_with_env(&path, |key| match key {
            ENV_ORIGIN_URL => Some("http://127.0.0.1:4100".to_string()),
            ENV_WAKE_URL => Some("https://backend.example/".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.proxy.origin_url, "http://127.0.0.1:4100");
        assert_eq!(config.wake.url.as_deref(), Some("https://backend.example/"));
        assert_eq!(config.proxy.request_timeout_secs, 10);
    }

    #[test]
    fn test_unreadable_path_is_still_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_with_env(dir.path(), |_| None).unwrap_err().to_string();
        assert!(err.contains("Failed to read"));
    }

    #[test]
    fn test_validate_rejects_https_origin() {
        let mut config = Config::default();
        config.proxy.origin_url = "https://origin.example".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("absolute http:// URL"));
    }

    #[test]
    fn test_validate_collects_multiple_errors() {
        let mut config = Config::default();
        config.proxy.origin_url = "not a url".to_string();
        config.proxy.health_path = "healthz".to_string();
        config.proxy.offline_status_codes = vec![502, 1200];
        config.wake.url = Some("ftp://backend".to_string());
        config.server.tls_cert = Some("cert.pem".to_string());

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("proxy.origin_url"));
        assert!(err.contains("proxy.health_path"));
        assert!(err.contains("1200"));
        assert!(err.contains("wake.url"));
        assert!(err.contains("tls_key"));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config: Config = toml::from_str(include_str!("../config.example.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.wake.on_auth_failure, AuthFailurePolicy::Unauthenticated);
        assert_eq!(config.waiting_page.refresh_secs, 3);
    }

    #[test]
    fn test_classifier_from_config() {
        let config: Config = toml::from_str(
            r#"
[proxy]
offline_status_codes = [404]
bypass_param = "skip"
"#,
        )
        .unwrap();
        let classifier = config.proxy.classifier();
        assert!(classifier
            .offline_statuses()
            .contains(hyper::StatusCode::NOT_FOUND));
        assert_eq!(classifier.bypass_param(), "skip");
    }
}

//! Best-effort backend wake-up pings
//!
//! A wake is one GET to the configured URL, optionally carrying an identity
//! token. Failures are logged and swallowed; there are no retries.

use crate::config::{AuthFailurePolicy, WakeConfig};
use crate::supervisor::TaskSupervisor;
use crate::token::{IdentityToken, TokenIssuer};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Characters of a failed ping's body kept in the log
const ERROR_BODY_LOG_LIMIT: usize = 200;

/// Result of [`WakeDispatcher::dispatch`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Dispatch {
    /// No wake URL configured
    Disabled,
    /// Another ping was sent within the dedup window
    Suppressed,
    /// Ping chain handed to the supervisor
    Spawned,
}

/// Result of one wake attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WakeOutcome {
    /// No ping was sent (disabled, or auth failed under the `skip` policy)
    Skipped,
    /// The backend answered; `status` may still be an error
    Sent { status: u16, authenticated: bool },
    /// The ping did not get an answer
    Failed { authenticated: bool },
}

/// Suppresses pings for a fixed window after one is sent
#[derive(Debug)]
pub struct WakeGuard {
    window: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl WakeGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent: Mutex::new(None),
        }
    }

    /// Claim the right to ping now. Returns false while a previous claim is
    /// younger than the window.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> bool {
        let mut last = self.last_sent.lock();
        match *last {
            Some(at) if now.saturating_duration_since(at) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

pub struct WakeDispatcher {
    url: Option<String>,
    credential_json: Option<Arc<str>>,
    issuer: TokenIssuer,
    http: reqwest::Client,
    on_auth_failure: AuthFailurePolicy,
    guard: Option<WakeGuard>,
}

impl WakeDispatcher {
    pub fn from_config(config: &WakeConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.ping_timeout())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            url: config.url.clone(),
            credential_json: config.service_account_json.as_deref().map(Arc::from),
            issuer: TokenIssuer::new(http.clone(), config.token_url.clone()),
            http,
            on_auth_failure: config.on_auth_failure,
            guard: config.dedup_window().map(WakeGuard::new),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.credential_json.is_some()
    }

    /// Start a wake in the background unless disabled or suppressed
    pub fn dispatch(self: &Arc<Self>, supervisor: &TaskSupervisor) -> Dispatch {
        let Some(url) = self.url.as_deref() else {
            return Dispatch::Disabled;
        };

        if let Some(guard) = &self.guard {
            if !guard.try_acquire() {
                info!(target: "wakegate::wake", url, "Wake sent within dedup window, suppressing duplicate");
                return Dispatch::Suppressed;
            }
        }

        info!(target: "wakegate::wake", url, "Pinging backend");
        let dispatcher = Arc::clone(self);
        supervisor.spawn("wake", async move {
            dispatcher.wake().await;
        });
        Dispatch::Spawned
    }

    /// Obtain a token (if configured) and ping the backend once
    pub async fn wake(&self) -> WakeOutcome {
        let Some(url) = self.url.as_deref() else {
            return WakeOutcome::Skipped;
        };

        let token = self.identity_token(url).await;
        if token.is_none()
            && self.credential_json.is_some()
            && self.on_auth_failure == AuthFailurePolicy::Skip
        {
            warn!(target: "wakegate::wake", url, "No identity token, skipping wake ping");
            return WakeOutcome::Skipped;
        }

        self.ping(url, token.as_ref()).await
    }

    async fn identity_token(&self, audience: &str) -> Option<IdentityToken> {
        match &self.credential_json {
            Some(json) => self.issuer.fetch_identity_token(json, audience).await,
            None => {
                warn!(
                    target: "wakegate::auth",
                    "Service account credential is missing, pinging unauthenticated"
                );
                None
            }
        }
    }

    async fn ping(&self, url: &str, token: Option<&IdentityToken>) -> WakeOutcome {
        let authenticated = token.is_some();
        let mut request = self.http.get(url);
        if let Some(token) = token {
            request = request.header(reqwest::header::AUTHORIZATION, token.bearer());
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                info!(
                    target: "wakegate::wake",
                    status = status.as_u16(),
                    authenticated,
                    "Backend responded to wake ping"
                );
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    let body: String = body.chars().take(ERROR_BODY_LOG_LIMIT).collect();
                    error!(target: "wakegate::wake", status = status.as_u16(), body = %body, "Wake ping rejected");
                }
                WakeOutcome::Sent {
                    status: status.as_u16(),
                    authenticated,
                }
            }
            Err(e) => {
                error!(target: "wakegate::wake", url, error = %e, "Wake ping failed");
                WakeOutcome::Failed { authenticated }
            }
        }
    }
}

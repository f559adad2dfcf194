//! Session lifecycle for the upstream channel.
//!
//! One `SessionManager` instance owns authentication state for the whole
//! process. Callers go through [`SessionManager::request`] and never see
//! credentials; login is single-flight behind the session lock; a keepalive
//! loop probes the channel after each successful login, and a recovery loop
//! with exponential backoff takes over while the channel is unhealthy.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use reqwest::header::{COOKIE, RETRY_AFTER, SET_COOKIE};
use reqwest::Method;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowbridge_core::{Credential, StoredSession};
use flowbridge_storage::SessionStore;

use crate::error::UpstreamError;
use crate::health::{ConnectionHealth, HealthSnapshot};
use crate::limit::{Backoff, RateLimiter, RequestExecutor};

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upstream base URL, no trailing slash.
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// When set, wins over username/password login.
    pub api_key: Option<String>,
    /// Key the persisted session is stored under.
    pub service_name: String,
    /// Upstream session lifetime as advertised by the platform.
    pub session_lifetime: Duration,
    /// Safety margin: the session is refreshed this long before it would
    /// actually expire upstream.
    pub refresh_margin: Duration,
    pub keepalive_interval: Duration,
    pub recovery_initial_backoff: Duration,
    pub recovery_max_backoff: Duration,
    /// Per-call transport timeout, independent of retry/backoff.
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3370".to_string(),
            username: None,
            password: None,
            api_key: None,
            service_name: "upstream".to_string(),
            session_lifetime: Duration::from_secs(24 * 3600),
            refresh_margin: Duration::from_secs(2 * 3600),
            keepalive_interval: Duration::from_secs(600),
            recovery_initial_backoff: Duration::from_secs(1),
            recovery_max_backoff: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Owns the authenticated channel to the upstream platform.
pub struct SessionManager {
    config: SessionConfig,
    http: reqwest::Client,
    executor: RequestExecutor,
    store: Arc<dyn SessionStore>,
    /// Credential + expiry; the lock doubles as the single-flight login lock.
    session: Mutex<Option<StoredSession>>,
    health: ConnectionHealth,
    keepalive: StdMutex<Option<JoinHandle<()>>>,
    recovery: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, store: Arc<dyn SessionStore>) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            config,
            http,
            executor: RequestExecutor::new(
                RateLimiter::upstream_default(),
                Backoff::new(3, Duration::from_secs(2), Duration::from_secs(60)),
            ),
            store,
            session: Mutex::new(None),
            health: ConnectionHealth::new(),
            keepalive: StdMutex::new(None),
            recovery: StdMutex::new(None),
        })
    }

    /// Adopt a persisted session at startup, when one is still valid.
    pub async fn preload(self: &Arc<Self>) {
        match self.store.load(&self.config.service_name).await {
            Ok(Some(stored)) if stored.is_valid(Utc::now()) => {
                info!(
                    service = %self.config.service_name,
                    expires_at = %stored.expires_at,
                    "adopted persisted session"
                );
                *self.session.lock().await = Some(stored);
                self.spawn_keepalive();
            }
            Ok(_) => debug!("no usable persisted session"),
            Err(e) => warn!(error = %e, "failed to load persisted session"),
        }
    }

    /// Perform a fresh login and start the keepalive loop.
    pub async fn authenticate(self: &Arc<Self>) -> Result<Credential, UpstreamError> {
        let mut guard = self.session.lock().await;
        let credential = self.login_locked(&mut guard).await?;
        drop(guard);
        self.spawn_keepalive();
        Ok(credential)
    }

    /// Current credential, logging in first when missing or expired.
    /// Single-flight: concurrent callers perform at most one login.
    pub async fn ensure_authenticated(self: &Arc<Self>) -> Result<Credential, UpstreamError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.is_valid(Utc::now()) {
                return Ok(session.credential.clone());
            }
            debug!("session expired, re-authenticating");
        }
        let credential = self.login_locked(&mut guard).await?;
        drop(guard);
        self.spawn_keepalive();
        Ok(credential)
    }

    /// The single entry point for authenticated upstream calls.
    ///
    /// Attaches the current credential and executes through the rate-limited
    /// retrying executor. A failure that smells like a dead session (401/403,
    /// transport error, persistent 5xx) clears the session and retries the
    /// call exactly once on a fresh login before surfacing the error.
    pub async fn request(
        self: &Arc<Self>,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, UpstreamError> {
        let credential = self.ensure_authenticated().await?;

        match self.send(method.clone(), path, body, &credential).await {
            Ok(value) => {
                self.health.record_success();
                Ok(value)
            }
            Err(e) if e.is_session_suspect() => {
                self.health.record_failure();
                warn!(path, error = %e, "request failed, retrying once on a fresh session");
                self.clear_session().await;

                let credential = self.ensure_authenticated().await?;
                match self.send(method, path, body, &credential).await {
                    Ok(value) => {
                        self.health.record_success();
                        Ok(value)
                    }
                    Err(e2) => {
                        self.health.record_failure();
                        self.spawn_recovery_if_unhealthy();
                        Err(e2)
                    }
                }
            }
            Err(e) => {
                self.health.record_failure();
                self.spawn_recovery_if_unhealthy();
                Err(e)
            }
        }
    }

    /// Lightweight authenticated probe used by the keepalive and recovery
    /// loops: the first page of the flow listing.
    pub async fn probe(self: &Arc<Self>) -> Result<(), UpstreamError> {
        self.health.record_health_check();
        let credential = self.ensure_authenticated().await?;
        match self.send(Method::GET, "/flow", None, &credential).await {
            Ok(_) => {
                self.health.record_success();
                Ok(())
            }
            Err(e) => {
                self.health.record_failure();
                Err(e)
            }
        }
    }

    /// Drop all session state and log in again immediately.
    pub async fn force_reconnect(self: &Arc<Self>) -> Result<(), UpstreamError> {
        info!("forcing upstream reconnect");
        self.clear_session().await;
        self.health.reset();
        self.authenticate().await.map(|_| ())
    }

    /// Snapshot of counters and session state for observability.
    pub async fn connection_health(&self) -> HealthSnapshot {
        let guard = self.session.lock().await;
        let now = Utc::now();
        let valid = guard.as_ref().is_some_and(|s| s.is_valid(now));
        let remaining = guard
            .as_ref()
            .map(|s| (s.expires_at - now).num_seconds());
        self.health.snapshot(valid, remaining)
    }

    /// Stop the background loops. Called on process shutdown.
    pub fn shutdown(&self) {
        if let Some(handle) = self.keepalive.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.recovery.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn clear_session(&self) {
        *self.session.lock().await = None;
        if let Err(e) = self.store.clear(&self.config.service_name).await {
            warn!(error = %e, "failed to clear persisted session");
        }
    }

    /// Log in while holding the session lock (the single-flight section).
    async fn login_locked(
        &self,
        guard: &mut MutexGuard<'_, Option<StoredSession>>,
    ) -> Result<Credential, UpstreamError> {
        let credential = if let Some(key) = &self.config.api_key {
            // An API key needs no login round-trip; it just gets an expiry
            // so the keepalive cadence still applies.
            Credential::ApiKey(key.clone())
        } else {
            self.login_with_password().await.inspect_err(|_| {
                self.health.record_failure();
            })?
        };

        let lifetime = self
            .config
            .session_lifetime
            .saturating_sub(self.config.refresh_margin);
        let expires_at = Utc::now()
            + ChronoDuration::from_std(lifetime).unwrap_or_else(|_| ChronoDuration::hours(22));
        let stored = StoredSession::new(credential.clone(), expires_at);

        if let Err(e) = self.store.save(&self.config.service_name, &stored).await {
            warn!(error = %e, "failed to persist session");
        }

        **guard = Some(stored);
        self.health.record_success();
        info!(expires_at = %expires_at, "authenticated against upstream");
        Ok(credential)
    }

    async fn login_with_password(&self) -> Result<Credential, UpstreamError> {
        let (Some(username), Some(password)) = (&self.config.username, &self.config.password)
        else {
            return Err(UpstreamError::Auth(
                "no API key and no username/password configured".to_string(),
            ));
        };

        let payload = serde_json::json!({ "name": username, "password": password });

        // The login endpoint moved once; try the current path, then the old.
        for path in ["/login", "/api/login"] {
            match self.try_login(path, &payload).await {
                Ok(credential) => return Ok(credential),
                Err(UpstreamError::Status { status: 404, .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(UpstreamError::Auth("no login endpoint answered".to_string()))
    }

    async fn try_login(&self, path: &str, payload: &Value) -> Result<Credential, UpstreamError> {
        let url = format!("{}{}", self.config.base_url, path);
        let http = self.http.clone();
        let response = self
            .executor
            .execute(|| {
                let http = http.clone();
                let url = url.clone();
                let payload = payload.clone();
                async move {
                    let resp = http
                        .post(&url)
                        .json(&payload)
                        .send()
                        .await
                        .map_err(|e| UpstreamError::Transport(e.to_string()))?;

                    let status = resp.status();
                    if status.is_success() {
                        let cookies: Vec<String> = resp
                            .headers()
                            .get_all(SET_COOKIE)
                            .iter()
                            .filter_map(|v| v.to_str().ok())
                            .filter_map(|v| v.split(';').next())
                            .map(str::to_string)
                            .collect();
                        Ok(cookies)
                    } else if status.as_u16() == 401 || status.as_u16() == 403 {
                        Err(UpstreamError::Auth(format!(
                            "login rejected with {}",
                            status
                        )))
                    } else {
                        let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                        let body = resp.text().await.unwrap_or_default();
                        Err(UpstreamError::Status {
                            status: status.as_u16(),
                            body,
                            retry_after,
                        })
                    }
                }
            })
            .await?;

        if response.is_empty() {
            return Err(UpstreamError::Auth(
                "login succeeded but returned no session cookie".to_string(),
            ));
        }
        Ok(Credential::Cookies(response))
    }

    /// One rate-limited, retried call with the given credential attached.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        credential: &Credential,
    ) -> Result<Value, UpstreamError> {
        let url = format!("{}{}", self.config.base_url, path);
        let http = self.http.clone();
        let body = body.cloned();
        let credential = credential.clone();

        self.executor
            .execute(move || {
                let http = http.clone();
                let method = method.clone();
                let url = url.clone();
                let body = body.clone();
                let credential = credential.clone();
                async move {
                    let mut req = http.request(method, &url);
                    match &credential {
                        Credential::ApiKey(key) => {
                            req = req.bearer_auth(key);
                        }
                        Credential::Cookies(_) => {
                            if let Some(header) = credential.cookie_header() {
                                req = req.header(COOKIE, header);
                            }
                        }
                    }
                    if let Some(json) = &body {
                        req = req.json(json);
                    }

                    let resp = req
                        .send()
                        .await
                        .map_err(|e| UpstreamError::Transport(e.to_string()))?;

                    let status = resp.status();
                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(UpstreamError::Auth(format!(
                            "upstream rejected credential with {}",
                            status
                        )));
                    }
                    if !status.is_success() {
                        let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                        let body = resp.text().await.unwrap_or_default();
                        return Err(UpstreamError::Status {
                            status: status.as_u16(),
                            body,
                            retry_after,
                        });
                    }

                    let text = resp
                        .text()
                        .await
                        .map_err(|e| UpstreamError::Transport(e.to_string()))?;
                    if text.is_empty() {
                        return Ok(Value::Null);
                    }
                    serde_json::from_str(&text).map_err(|e| {
                        UpstreamError::UnexpectedResponse(format!("invalid JSON body: {}", e))
                    })
                }
            })
            .await
    }

    /// Start the keepalive loop unless one is already running.
    fn spawn_keepalive(self: &Arc<Self>) {
        let mut slot = self.keepalive.lock().unwrap();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let manager = Arc::downgrade(self);
        let interval = self.config.keepalive_interval;
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                // Opportunistic: a failed probe is logged, never raised, so
                // silent session invalidation shows up before real traffic.
                if let Err(e) = manager.probe().await {
                    warn!(error = %e, "keepalive probe failed");
                    manager.spawn_recovery_if_unhealthy();
                } else {
                    debug!("keepalive probe ok");
                }
            }
        }));
    }

    /// Start the recovery loop when the channel is unhealthy and no loop is
    /// already running. The loop probes with exponential backoff and stops
    /// once the channel is healthy again.
    fn spawn_recovery_if_unhealthy(self: &Arc<Self>) {
        if self.health.is_healthy() {
            return;
        }
        let mut slot = self.recovery.lock().unwrap();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        warn!(
            consecutive_failures = self.health.consecutive_failures(),
            "upstream unhealthy, starting recovery loop"
        );
        let manager = Arc::downgrade(self);
        let initial = self.config.recovery_initial_backoff;
        let cap = self.config.recovery_max_backoff;
        *slot = Some(tokio::spawn(async move {
            let mut backoff = initial;
            loop {
                tokio::time::sleep(backoff).await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                match manager.recover_once().await {
                    Ok(()) => {
                        info!("upstream channel recovered");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, backoff_secs = backoff.as_secs(), "recovery attempt failed");
                        backoff = (backoff * 2).min(cap);
                    }
                }
            }
        }));
    }

    async fn recover_once(self: &Arc<Self>) -> Result<(), UpstreamError> {
        self.clear_session().await;
        self.ensure_authenticated().await?;
        self.probe().await?;
        self.health.reset();
        self.health.record_success();
        Ok(())
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }
}

fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    value.and_then(|v| v.to_str().ok()).and_then(|v| v.parse().ok())
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

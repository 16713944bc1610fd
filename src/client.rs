//! Rate-limited HTTP caller for read-only upstream APIs.
//!
//! [`RateLimitedClient`] issues one request at a time against a fixed base
//! URL, attaches the static credential to every call and enforces a minimum
//! interval between calls through a [`RateLimiter`]. Cloning the limiter
//! shares it, so any number of clients or workers pointed at the same API
//! stay inside one aggregate budget.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::traits::{ApiCaller, ApiRequest, HttpError};

// ============================================================================
// Rate Limiter
// ============================================================================

/// Global minimum-interval gate shared by every caller of one upstream.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    last_start: Arc<Mutex<Option<Instant>>>,
}

/// Exclusive right to issue one call. Dropping it releases the gate.
pub struct RatePermit<'a> {
    _guard: MutexGuard<'a, Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_start: Arc::new(Mutex::new(None)),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until no other call is in flight and at least `min_interval`
    /// has elapsed since the previous call started.
    pub async fn acquire(&self) -> RatePermit<'_> {
        let mut guard = self.last_start.lock().await;
        if let Some(previous) = *guard {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *guard = Some(Instant::now());
        RatePermit {
            _guard: guard,
            min_interval: self.min_interval,
        }
    }
}

impl RatePermit<'_> {
    /// Holds the gate for one full interval after a successful response.
    pub async fn cool_down(self) {
        if !self.min_interval.is_zero() {
            tokio::time::sleep(self.min_interval).await;
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Static credential attached as a query parameter to every request.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub param: String,
    pub value: String,
}

impl Credential {
    pub fn query(param: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            value: value.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("param", &self.param)
            .field("value", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub credential: Option<Credential>,
    pub request_timeout: Duration,
    pub min_interval: Duration,
    pub default_headers: Vec<(String, String)>,
}

impl ClientSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            credential: None,
            request_timeout: Duration::from_secs(30),
            min_interval: Duration::from_millis(1100),
            default_headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitedClient {
    client: reqwest::Client,
    settings: ClientSettings,
    limiter: RateLimiter,
}

impl RateLimitedClient {
    /// Builds a client with its own limiter.
    pub fn new(settings: ClientSettings) -> Result<Self, HttpError> {
        let limiter = RateLimiter::new(settings.min_interval);
        Self::with_limiter(settings, limiter)
    }

    /// Builds a client that shares `limiter` with other callers of the
    /// same upstream.
    pub fn with_limiter(settings: ClientSettings, limiter: RateLimiter) -> Result<Self, HttpError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &settings.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| HttpError::Transport(format!("invalid header name: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| HttpError::Transport(format!("invalid header value: {err}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| HttpError::Transport(err.to_string()))?;

        Ok(Self {
            client,
            settings,
            limiter,
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn build_url(&self, request: &ApiRequest) -> Result<reqwest::Url, HttpError> {
        let joined = format!(
            "{}{}",
            self.settings.base_url.trim_end_matches('/'),
            request.path
        );
        let mut url =
            reqwest::Url::parse(&joined).map_err(|err| HttpError::InvalidUrl(err.to_string()))?;

        if self.settings.credential.is_some() || !request.params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            if let Some(credential) = &self.settings.credential {
                pairs.append_pair(&credential.param, &credential.value);
            }
            for (name, value) in &request.params {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ApiCaller for RateLimitedClient {
    async fn call(&self, request: ApiRequest) -> Result<Value, HttpError> {
        let url = self.build_url(&request)?;
        let permit = self.limiter.acquire().await;
        debug!(method = %request.method, path = %request.path, "Calling upstream");

        let mut builder = self.client.request(request.method.clone(), url);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await.map_err(map_reqwest_error)?;
        let payload = match serde_json::from_str::<Value>(&text) {
            Ok(value) => value,
            Err(err) => {
                debug!(path = %request.path, error = %err, "Body is not JSON, keeping raw text");
                json!({ "raw_text": text })
            }
        };

        permit.cool_down().await;
        Ok(payload)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        return HttpError::Timeout;
    }
    HttpError::Transport(err.to_string())
}

//! REST request executor
//!
//! Every call goes through the shared `RateLimiter` before it is sent, and
//! every response teaches the limiter which bucket the route belongs to.
//! Only 429 is retried.

use crate::error::HttpError;
use crate::http::form::{prepare_form, File};
use crate::http::route::Route;
use crate::metrics::GatewayMetrics;
use crate::ratelimit::RateLimiter;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_API_BASE: &str = "https://discord.com/api";
pub const DEFAULT_MAX_RETRIES: u32 = 5;

const HEADER_BUCKET: &str = "x-ratelimit-bucket";
const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
const HEADER_SCOPE: &str = "x-ratelimit-scope";
const HEADER_RETRY_AFTER: &str = "retry-after";
const HEADER_AUDIT_REASON: &str = "x-audit-log-reason";

/// Wait used when a 429 carries no usable reset information
const FALLBACK_RESET: Duration = Duration::from_secs(1);

/// REST client settings
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub token: String,
    /// Base URL without the version segment
    pub api_base: String,
    pub version: u8,
    pub max_retries: u32,
    pub user_agent: String,
    pub timeout: Duration,
}

impl HttpConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            version: 10,
            max_retries: DEFAULT_MAX_RETRIES,
            user_agent: concat!("DiscordBot (", env!("CARGO_PKG_NAME"), ", ", env!("CARGO_PKG_VERSION"), ")")
                .to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// `{api_base}/v{version}`
    pub fn base_url(&self) -> String {
        format!("{}/v{}", self.api_base.trim_end_matches('/'), self.version)
    }
}

/// Rate-limit metadata from one response
#[derive(Debug, Clone, Default, PartialEq)]
struct RateLimitInfo {
    bucket: Option<String>,
    reset_after: Option<Duration>,
    global: bool,
}

impl RateLimitInfo {
    fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let seconds = |name: &str| {
            text(name)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(Duration::from_secs_f64)
        };

        Self {
            bucket: text(HEADER_BUCKET).map(str::to_string),
            reset_after: seconds(HEADER_RESET_AFTER).or_else(|| seconds(HEADER_RETRY_AFTER)),
            global: text(HEADER_SCOPE) == Some("global"),
        }
    }
}

/// Issues REST calls through the shared rate limiter
#[derive(Clone)]
pub struct RequestExecutor {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
    limiter: RateLimiter,
    max_retries: u32,
    metrics: Arc<GatewayMetrics>,
}

impl RequestExecutor {
    pub fn new(
        config: &HttpConfig,
        limiter: RateLimiter,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self, HttpError> {
        let mut auth = HeaderValue::from_str(&format!("Bot {}", config.token))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(USER_AGENT, HeaderValue::from_str(&config.user_agent)?);

        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            headers,
            limiter,
            max_retries: config.max_retries.max(1),
            metrics,
        })
    }

    /// Limiter shared with this executor
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Issue `method` on `route`.
    ///
    /// `files` turns the body into a multipart form with `body` as
    /// `payload_json`; they are dropped when the call returns, on every path.
    /// Returns the decoded body: JSON, text, or `None` when empty.
    pub async fn request(
        &self,
        method: Method,
        route: &Route,
        body: Option<&Value>,
        files: Vec<File>,
        reason: Option<&str>,
    ) -> Result<Option<Value>, HttpError> {
        let key = route.discriminator();
        let url = route.url(&self.base_url);
        let reason = reason.map(HeaderValue::from_str).transpose()?;
        let json_body = match body {
            Some(body) if files.is_empty() => Some(serde_json::to_vec(body)?),
            _ => None,
        };

        let mut bucket = self
            .limiter
            .bucket_for(&key)
            .unwrap_or_else(|| format!("unknown:{}", key.affinity_key()));

        for attempt in 0..self.max_retries {
            self.limiter.acquire(&key).await;

            let mut request = self
                .client
                .request(method.clone(), &url)
                .headers(self.headers.clone());
            if let Some(reason) = &reason {
                request = request.header(HEADER_AUDIT_REASON, reason.clone());
            }
            if !files.is_empty() {
                // rebuilt each attempt so every retry uploads from the start
                request = request.multipart(prepare_form(&files, body)?);
            } else if let Some(bytes) = &json_body {
                request = request
                    .header(CONTENT_TYPE, "application/json")
                    .body(bytes.clone());
            }

            debug!(%method, path = route.path(), attempt, "Sending request");
            let response = request.send().await?;
            let status = response.status().as_u16();
            self.metrics.record_http(method.as_str(), status);

            let limits = RateLimitInfo::from_headers(response.headers());
            if let Some(found) = &limits.bucket {
                self.limiter.learn(&key, found);
                bucket.clone_from(found);
            }

            if status == 429 {
                let reset_after = match limits.reset_after {
                    Some(reset_after) => reset_after,
                    None => retry_after_from_body(response).await,
                };
                self.metrics.record_rate_limited(&bucket, limits.global);
                warn!(
                    %bucket,
                    ?reset_after,
                    global = limits.global,
                    attempt,
                    path = route.path(),
                    "Rate limited, retrying after cooldown"
                );
                self.limiter
                    .report_limited(&key, &bucket, reset_after, limits.global)
                    .await;
                continue;
            }

            if status >= 400 {
                let text = response.text().await?;
                debug!(status, path = route.path(), "Request failed");
                return Err(HttpError::from_status(status, text));
            }

            return decode_body(response).await;
        }

        Err(HttpError::RateLimited {
            bucket,
            retries: self.max_retries,
        })
    }

    /// The bot's own user
    pub async fn get_me(&self) -> Result<Option<Value>, HttpError> {
        self.request(Method::GET, &Route::new("/users/@me"), None, Vec::new(), None)
            .await
    }

    /// Modify the bot's own user
    pub async fn edit_me(&self, changes: &Value) -> Result<Option<Value>, HttpError> {
        self.request(Method::PATCH, &Route::new("/users/@me"), Some(changes), Vec::new(), None)
            .await
    }

    /// Download a CDN asset. Not rate limited and unauthenticated.
    pub async fn get_asset(&self, url: &str) -> Result<Vec<u8>, HttpError> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        if status >= 400 {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpError::from_status(status, text));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// `retry_after` from a 429 JSON body, for responses without headers
async fn retry_after_from_body(response: Response) -> Duration {
    let seconds = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body.get("retry_after").and_then(Value::as_f64))
        .filter(|s| s.is_finite() && *s >= 0.0);
    seconds.map_or(FALLBACK_RESET, Duration::from_secs_f64)
}

async fn decode_body(response: Response) -> Result<Option<Value>, HttpError> {
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));

    let text = response.text().await?;
    if text.is_empty() {
        return Ok(None);
    }
    if is_json {
        Ok(Some(serde_json::from_str(&text)?))
    } else {
        Ok(Some(Value::String(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn test_rate_limit_headers_parsed() {
        let info = RateLimitInfo::from_headers(&headers(&[
            ("x-ratelimit-bucket", "abcd1234"),
            ("x-ratelimit-reset-after", "1.5"),
            ("x-ratelimit-scope", "global"),
        ]));
        assert_eq!(info.bucket.as_deref(), Some("abcd1234"));
        assert_eq!(info.reset_after, Some(Duration::from_millis(1500)));
        assert!(info.global);
    }

    #[test]
    fn test_retry_after_is_fallback() {
        let info = RateLimitInfo::from_headers(&headers(&[("retry-after", "2")]));
        assert_eq!(info.reset_after, Some(Duration::from_secs(2)));
        assert!(info.bucket.is_none());
        assert!(!info.global);

        let info = RateLimitInfo::from_headers(&headers(&[("x-ratelimit-reset-after", "-1")]));
        assert_eq!(info.reset_after, None);
    }

    #[test]
    fn test_shared_scope_is_not_global() {
        let info = RateLimitInfo::from_headers(&headers(&[("x-ratelimit-scope", "shared")]));
        assert!(!info.global);
    }

    #[test]
    fn test_base_url_includes_version() {
        let mut config = HttpConfig::new("token");
        assert_eq!(config.base_url(), "https://discord.com/api/v10");
        config.api_base = "http://127.0.0.1:8080/api/".to_string();
        config.version = 9;
        assert_eq!(config.base_url(), "http://127.0.0.1:8080/api/v9");
    }

    #[test]
    fn test_invalid_token_rejected() {
        let config = HttpConfig::new("bad\ntoken");
        let err = RequestExecutor::new(&config, RateLimiter::new(), Arc::new(GatewayMetrics::noop()))
            .err()
            .unwrap();
        assert!(matches!(err, HttpError::InvalidHeader(_)));
    }
}

//! Rate-limited HTTP client for the plain-HTML source tier
//!
//! Wraps reqwest with a per-second quota and a realistic browser-like header
//! set. Every fetch is cancellation-aware and time-bounded by the client
//! timeout; callers classify failures for the retry layer.

use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::{Context, Result};
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::errors::AcquireError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub accept_language: String,
    pub extra_headers: Vec<(String, String)>,
    pub timeout_seconds: u64,
    pub max_requests_per_second: u32,
    pub follow_redirects: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                .to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            extra_headers: Vec::new(),
            timeout_seconds: 30,
            max_requests_per_second: 4,
            follow_redirects: true,
        }
    }
}

/// HTTP client with request pacing for respectful fetching.
pub struct HttpClient {
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    config: HttpClientConfig,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("invalid user agent")?,
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&config.accept_language).context("invalid accept-language")?,
        );
        for (name, value) in &config.extra_headers {
            headers.insert(
                name.parse::<HeaderName>()
                    .with_context(|| format!("invalid header name: {name}"))?,
                HeaderValue::from_str(value)
                    .with_context(|| format!("invalid header value for {name}"))?,
            );
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .default_headers(headers)
            .cookie_store(true)
            .redirect(if config.follow_redirects {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            })
            .build()
            .context("failed to create HTTP client")?;

        let quota = Quota::per_second(
            NonZeroU32::new(config.max_requests_per_second.max(1))
                .context("rate limit must be greater than 0")?,
        );

        Ok(Self {
            client,
            rate_limiter: RateLimiter::direct(quota),
            config,
        })
    }

    /// Fetch a URL body as text, classifying failures for the retry layer.
    pub async fn get_text(&self, url: &str, token: &CancellationToken) -> Result<String, AcquireError> {
        if token.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }
        url::Url::parse(url).map_err(|e| AcquireError::config(format!("invalid url {url}: {e}")))?;
        tokio::select! {
            _ = self.rate_limiter.until_ready() => {}
            _ = token.cancelled() => return Err(AcquireError::Cancelled),
        }

        debug!(url, "fetching page");
        let response = tokio::select! {
            result = self.client.get(url).send() => result.map_err(classify_reqwest_error)?,
            _ = token.cancelled() => return Err(AcquireError::Cancelled),
        };

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AcquireError::blocked("http 429 rate limited"));
        }
        if status.as_u16() == 403 {
            return Err(AcquireError::blocked("http 403 forbidden"));
        }
        if !status.is_success() {
            return Err(AcquireError::network(format!("http status {status} for {url}")));
        }

        let text = tokio::select! {
            result = response.text() => {
                result.map_err(|e| AcquireError::network(format!("failed to read body: {e}")))?
            }
            _ = token.cancelled() => return Err(AcquireError::Cancelled),
        };

        debug!(url, bytes = text.len(), "fetched page");
        Ok(text)
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }
}

/// Map transport-level reqwest failures onto the pipeline taxonomy.
pub fn classify_reqwest_error(error: reqwest::Error) -> AcquireError {
    if error.is_timeout() {
        AcquireError::network(format!("timeout: {error}"))
    } else if error.is_connect() {
        AcquireError::network(format!("connection failed: {error}"))
    } else if error.is_builder() {
        AcquireError::config(format!("invalid request: {error}"))
    } else {
        AcquireError::network(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_defaults() {
        let client = HttpClient::new(HttpClientConfig::default());
        assert!(client.is_ok());
    }

    #[test]
    fn zero_rate_limit_is_clamped() {
        let client = HttpClient::new(HttpClientConfig {
            max_requests_per_second: 0,
            ..Default::default()
        });
        assert!(client.is_ok());
    }

    #[test]
    fn rejects_invalid_extra_header() {
        let client = HttpClient::new(HttpClientConfig {
            extra_headers: vec![("bad header name".into(), "x".into())],
            ..Default::default()
        });
        assert!(client.is_err());
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_fetch() {
        let client = HttpClient::new(HttpClientConfig::default()).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = client
            .get_text("http://127.0.0.1:9/unreachable", &token)
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Cancelled));
    }
}

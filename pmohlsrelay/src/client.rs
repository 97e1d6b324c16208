//! HTTP client for the origin server
//!
//! Thin wrapper around `reqwest::Client` that knows about the relay's
//! timeouts and retry budget. Every origin request goes through here:
//! handshakes, playlist fetches and segment bodies.
//!
//! Status classification happens at this layer so callers only ever see
//! [`Error`] values: 404 becomes [`Error::SegmentNotFound`], any other
//! non-success status becomes [`Error::UpstreamStatus`].

use crate::error::{Error, Result};
use crate::models::ByteRange;
use bytes::Bytes;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, RANGE, SET_COOKIE};
use reqwest::{Client, Response, StatusCode};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Default User-Agent (the origin rejects obviously non-browser agents)
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";

/// Default timeout for connecting and receiving response headers (10 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default maximum silence between two body chunks (10 seconds)
pub const DEFAULT_READ_IDLE_TIMEOUT_SECS: u64 = 10;

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay of the exponential backoff
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 250;

/// Bounded exponential backoff for transient origin failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `max_retries + 1`)
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`
    /// plus up to half a base delay of jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let jitter = if base > 1 {
            rand::rng().random_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(exp + jitter)
    }
}

/// A playlist (or any text) fetched from the origin
#[derive(Debug, Clone)]
pub struct FetchedText {
    pub body: String,
    /// Final URL after redirects, base for relative URIs in `body`
    pub url: Url,
    /// Raw `Set-Cookie` header values of the response
    pub set_cookies: Vec<String>,
}

/// HTTP client for the origin server
#[derive(Debug, Clone)]
pub struct OriginClient {
    client: Client,
    request_timeout: Duration,
    read_idle_timeout: Duration,
    retry: RetryPolicy,
}

impl OriginClient {
    /// Create a client with default settings
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Create a builder for configuring the client
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn read_idle_timeout(&self) -> Duration {
        self.read_idle_timeout
    }

    /// Issue one GET, classifying the status
    ///
    /// `request_timeout` bounds the time to response headers only; the body is
    /// read chunk by chunk under the idle timeout (see [`Self::next_chunk`]).
    pub async fn send(
        &self,
        url: &Url,
        headers: &HeaderMap,
        range: Option<ByteRange>,
    ) -> Result<Response> {
        let mut request = self.client.get(url.clone()).headers(headers.clone());
        if let Some(range) = range {
            let value = HeaderValue::from_str(&range.to_header())
                .map_err(|e| Error::upstream(format!("invalid range header: {}", e)))?;
            request = request.header(RANGE, value);
        }

        debug!(url = %url, range = ?range, "GET origin");

        let response = tokio::time::timeout(self.request_timeout, request.send())
            .await
            .map_err(|_| Error::upstream(format!("timeout waiting for {}", url)))??;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::not_found(url.to_string()));
        }
        if !status.is_success() {
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    /// Fetch a text resource once, without retrying
    pub async fn get_text_once(&self, url: &Url, headers: &HeaderMap) -> Result<FetchedText> {
        let response = self.send(url, headers, None).await?;
        let final_url = response.url().clone();
        let set_cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();

        let body = tokio::time::timeout(self.request_timeout, response.text())
            .await
            .map_err(|_| Error::upstream(format!("timeout reading {}", url)))??;

        Ok(FetchedText {
            body,
            url: final_url,
            set_cookies,
        })
    }

    /// Fetch a text resource, retrying transient failures
    pub async fn get_text(&self, url: &Url, headers: &HeaderMap) -> Result<FetchedText> {
        self.with_retry(url.as_str(), || self.get_text_once(url, headers))
            .await
    }

    /// Read the next body chunk, failing when the origin stays silent longer
    /// than the read-idle timeout
    pub async fn next_chunk(&self, response: &mut Response) -> Result<Option<Bytes>> {
        let next = tokio::time::timeout(self.read_idle_timeout, response.chunk()).await;
        match next {
            Ok(chunk) => Ok(chunk?),
            Err(_) => Err(Error::upstream(format!(
                "no data from {} for {:?}",
                response.url(),
                self.read_idle_timeout
            ))),
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the retry budget is spent
    ///
    /// A transient failure that survives every attempt is reported as
    /// [`Error::UpstreamUnavailable`].
    pub async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(request = what, attempt = attempt + 1, error = %e, ?delay, "Transient origin failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(Error::upstream(format!(
                        "{} failed after {} attempts: {}",
                        what,
                        attempt + 1,
                        e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Builder for [`OriginClient`]
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    user_agent: String,
    request_timeout: Duration,
    read_idle_timeout: Duration,
    retry: RetryPolicy,
    client: Option<Client>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            read_idle_timeout: Duration::from_secs(DEFAULT_READ_IDLE_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            client: None,
        }
    }
}

impl ClientBuilder {
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn read_idle_timeout(mut self, timeout: Duration) -> Self {
        self.read_idle_timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Use a preconfigured reqwest client (the user agent setting is then ignored)
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<OriginClient> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .user_agent(&self.user_agent)
                .connect_timeout(self.request_timeout)
                .build()?,
        };

        Ok(OriginClient {
            client,
            request_timeout: self.request_timeout,
            read_idle_timeout: self.read_idle_timeout,
            retry: self.retry,
        })
    }
}

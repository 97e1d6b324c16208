//! Upstream session management
//!
//! The origin hands out a session on the first request to the stream URL:
//! cookies through `Set-Cookie`, and a variant URI carrying session query
//! parameters when the stream URL is a master playlist. Every later playlist
//! and segment request must replay that context or the origin restarts the
//! listener from scratch.
//!
//! [`UpstreamSession`] owns this context. The lock around it is held for the
//! whole handshake, so concurrent callers that find the session expired wait
//! for the single in-flight refresh and then share its result.

use crate::client::OriginClient;
use crate::error::{Error, Result};
use crate::hls;
use crate::models::Playlist;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

/// Default session lifetime before a refresh (1 hour)
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;

/// Default time a stale session may still be used while refreshes fail (5 minutes)
pub const DEFAULT_SESSION_GRACE_SECS: u64 = 300;

/// An established origin session
#[derive(Debug, Clone)]
pub struct Session {
    /// Cookies captured from the handshake, as `(name, value)`
    pub cookies: Vec<(String, String)>,
    /// Headers to send with every origin request (includes `Cookie`)
    pub headers: HeaderMap,
    /// Media playlist URL bound to this session
    pub media_url: Url,
    /// Bandwidth of the selected variant, when the stream URL was a master
    pub bandwidth: Option<u64>,
    /// Raw `Set-Cookie` values of the handshake response
    pub set_cookies: Vec<String>,
    pub established_at: Instant,
}

impl Session {
    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }

    /// Value of the `Cookie` header replayed to the origin
    pub fn cookie_header(&self) -> Option<String> {
        cookie_header(&self.cookies)
    }
}

fn cookie_header(cookies: &[(String, String)]) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    Some(
        cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// Owner of the origin session, refreshed in place on expiry
#[derive(Debug)]
pub struct UpstreamSession {
    client: OriginClient,
    stream_url: Url,
    base_headers: HeaderMap,
    ttl: Duration,
    grace: Duration,
    state: Mutex<Option<Arc<Session>>>,
    handshakes: AtomicU64,
}

impl UpstreamSession {
    pub fn new(client: OriginClient, stream_url: Url) -> Self {
        Self {
            client,
            stream_url,
            base_headers: HeaderMap::new(),
            ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            grace: Duration::from_secs(DEFAULT_SESSION_GRACE_SECS),
            state: Mutex::new(None),
            handshakes: AtomicU64::new(0),
        }
    }

    /// Set session lifetime and stale-use grace period
    pub fn with_ttl(mut self, ttl: Duration, grace: Duration) -> Self {
        self.ttl = ttl;
        self.grace = grace;
        self
    }

    /// Extra headers sent with the handshake and every session request
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.base_headers = headers;
        self
    }

    pub fn client(&self) -> &OriginClient {
        &self.client
    }

    pub fn stream_url(&self) -> &Url {
        &self.stream_url
    }

    /// Number of handshakes performed so far
    pub fn handshake_count(&self) -> u64 {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Current session, refreshed first when expired or never established
    ///
    /// A failed refresh is not retried here; the next call tries again. While
    /// refreshes fail, the previous session keeps being served until it is
    /// older than TTL + grace, after which [`Error::UpstreamUnavailable`] is
    /// returned.
    pub async fn acquire(&self) -> Result<Arc<Session>> {
        let mut state = self.state.lock().await;

        if let Some(session) = state.as_ref() {
            if session.age() < self.ttl {
                return Ok(session.clone());
            }
            debug!(age = ?session.age(), "Session expired, refreshing");
        }

        match self.handshake().await {
            Ok(session) => {
                let session = Arc::new(session);
                info!(
                    media_url = %session.media_url,
                    cookies = session.cookies.len(),
                    "Upstream session established"
                );
                *state = Some(session.clone());
                Ok(session)
            }
            Err(e) => {
                if let Some(stale) = state.as_ref() {
                    if stale.age() < self.ttl + self.grace {
                        warn!(error = %e, age = ?stale.age(), "Session refresh failed, reusing stale session");
                        return Ok(stale.clone());
                    }
                }
                *state = None;
                Err(Error::upstream(format!("session handshake failed: {}", e)))
            }
        }
    }

    /// Drops `seen` if it is still the current session, forcing the next
    /// [`Self::acquire`] to handshake again
    ///
    /// Passing the session the caller observed avoids discarding a fresh one
    /// another caller has just established.
    pub async fn invalidate(&self, seen: &Arc<Session>) {
        let mut state = self.state.lock().await;
        if state.as_ref().is_some_and(|s| Arc::ptr_eq(s, seen)) {
            info!("Upstream session invalidated");
            *state = None;
        }
    }

    async fn handshake(&self) -> Result<Session> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        debug!(url = %self.stream_url, "Session handshake");

        let fetched = self
            .client
            .get_text_once(&self.stream_url, &self.base_headers)
            .await?;

        let cookies: Vec<(String, String)> = fetched
            .set_cookies
            .iter()
            .filter_map(|c| parse_set_cookie(c))
            .collect();

        let (media_url, bandwidth) = match hls::parse_playlist(&fetched.body, &fetched.url)? {
            Playlist::Master(master) => {
                // The first variant carries the origin's session parameters
                let first = master
                    .variants
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::parse("master playlist without variants"))?;
                (first.uri, Some(first.bandwidth))
            }
            Playlist::Media(_) => (fetched.url.clone(), None),
        };

        let mut headers = self.base_headers.clone();
        if let Some(cookie) = cookie_header(&cookies) {
            let value = HeaderValue::from_str(&cookie)
                .map_err(|e| Error::upstream(format!("unusable session cookie: {}", e)))?;
            headers.insert(COOKIE, value);
        }

        Ok(Session {
            cookies,
            headers,
            media_url,
            bandwidth,
            set_cookies: fetched.set_cookies,
            established_at: Instant::now(),
        })
    }
}

/// Extracts `(name, value)` from a `Set-Cookie` header value
pub fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

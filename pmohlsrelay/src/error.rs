//! Error types for the HLS relay

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while relaying the origin stream
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Origin unreachable, answering 5xx, or timing out once the retry budget is spent
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Origin answered with an unexpected HTTP status
    #[error("Upstream returned HTTP {status} for {url}")]
    UpstreamStatus { status: u16, url: String },

    /// Malformed playlist (never partially served)
    #[error("Playlist parse error: {0}")]
    PlaylistParse(String),

    /// Origin 404 or a local reference that does not resolve
    #[error("Segment not found: {0}")]
    SegmentNotFound(String),

    /// Now-playing poll failed (recovered locally by the tracker)
    #[error("Metadata fetch failed: {0}")]
    MetadataFetch(String),

    /// The output sink was closed by the client
    #[error("Client disconnected")]
    ClientDisconnected,

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON parsing failed
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error (from pmoconfig/anyhow)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

impl Error {
    /// Create an upstream-unavailable error
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(msg.into())
    }

    /// Create a playlist parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::PlaylistParse(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::SegmentNotFound(msg.into())
    }

    /// Whether a retry of the same origin request may succeed
    ///
    /// Server errors, throttling, timeouts and broken connections are
    /// transient. Not-found, other client errors, parse errors and a closed
    /// sink are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::UpstreamUnavailable(_) => true,
            Self::UpstreamStatus { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_body() || e.is_request(),
            _ => false,
        }
    }

    /// HTTP status the routing layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            Self::SegmentNotFound(_) => 404,
            Self::UpstreamUnavailable(_)
            | Self::UpstreamStatus { .. }
            | Self::PlaylistParse(_)
            | Self::Http(_) => 502,
            _ => 500,
        }
    }
}

//! Core operations of the relay
//!
//! [`HlsRelay`] wires the components together (one shared session, one
//! now-playing tracker) and exposes the operations a transport layer maps
//! requests to. Nothing here knows about HTTP routing; see
//! [`crate::api_rest`] for the axum binding.

use crate::client::{
    OriginClient, RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_READ_IDLE_TIMEOUT_SECS,
    DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_USER_AGENT,
};
use crate::error::{Error, Result};
use crate::hls::{LocalRef, RefKind};
use crate::icy::{
    IcyHeaders, IcyMultiplexer, StationTitle, DEFAULT_LIVE_EDGE_SEGMENTS, DEFAULT_METAINT,
};
use crate::models::ByteRange;
use crate::nowplaying::{
    JsonMetadataSource, MetadataSource, NowPlayingState, NowPlayingTracker,
    PlaylistMetadataSource, TrackerHandle, DEFAULT_POLL_INTERVAL_SECS,
};
use crate::playlist::{PlaylistRewriter, RewrittenPlaylist};
use crate::relay::{OpenedSegment, SegmentRelay};
use crate::session::{UpstreamSession, DEFAULT_SESSION_GRACE_SECS, DEFAULT_SESSION_TTL_SECS};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};
use url::Url;

/// Default origin stream
pub const DEFAULT_STREAM_URL: &str =
    "https://sa46.scastream.com.au/live/3fox_128.stream/playlist.m3u8";

pub const DEFAULT_STATION_NAME: &str = "101.9 Fox FM Melbourne";

pub const DEFAULT_STATION_GENRE: &str = "Pop";

/// Capacity (in chunks) of a client's ICY output buffer
pub const ICY_CHANNEL_CAPACITY: usize = 32;

/// Plain settings the relay is built from
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub stream_url: Url,
    pub station_name: String,
    pub station_genre: String,
    pub user_agent: String,
    pub session_ttl: Duration,
    pub session_grace: Duration,
    pub request_timeout: Duration,
    pub read_idle_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub icy_metaint: usize,
    pub live_edge_segments: usize,
    pub poll_interval: Duration,
    /// External JSON now-playing source; `None` reads the playlist instead
    pub metadata_url: Option<Url>,
}

impl RelaySettings {
    /// Defaults for everything but the origin stream
    pub fn new(stream_url: Url) -> Self {
        Self {
            stream_url,
            station_name: DEFAULT_STATION_NAME.to_string(),
            station_genre: DEFAULT_STATION_GENRE.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            session_grace: Duration::from_secs(DEFAULT_SESSION_GRACE_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            read_idle_timeout: Duration::from_secs(DEFAULT_READ_IDLE_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            icy_metaint: DEFAULT_METAINT,
            live_edge_segments: DEFAULT_LIVE_EDGE_SEGMENTS,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            metadata_url: None,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
        }
    }
}

/// Current track as returned by [`HlsRelay::get_now_playing`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NowPlaying {
    pub station: String,
    pub artist: String,
    pub title: String,
    pub artwork: Option<String>,
    /// `None` until the first successful poll
    pub fetched_at: Option<DateTime<Utc>>,
}

/// A continuous stream ready to be served
#[derive(Debug)]
pub struct IcyStream {
    pub headers: IcyHeaders,
    pub body: mpsc::Receiver<Bytes>,
}

/// Health report
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub station: String,
}

/// The relay: shared session, tracker and the core operations
#[derive(Debug)]
pub struct HlsRelay {
    settings: RelaySettings,
    session: Arc<UpstreamSession>,
    rewriter: PlaylistRewriter,
    relay: SegmentRelay,
    tracker: Arc<NowPlayingTracker>,
}

impl HlsRelay {
    pub fn new(settings: RelaySettings) -> Result<Self> {
        let client = OriginClient::builder()
            .user_agent(settings.user_agent.clone())
            .request_timeout(settings.request_timeout)
            .read_idle_timeout(settings.read_idle_timeout)
            .retry_policy(settings.retry_policy())
            .build()?;

        let session = Arc::new(
            UpstreamSession::new(client, settings.stream_url.clone())
                .with_ttl(settings.session_ttl, settings.session_grace),
        );
        let rewriter = PlaylistRewriter::new(session.clone());
        let relay = SegmentRelay::new(session.clone());

        let source: Arc<dyn MetadataSource> = match &settings.metadata_url {
            Some(url) => Arc::new(JsonMetadataSource::new(
                reqwest::Client::builder()
                    .user_agent(settings.user_agent.clone())
                    .build()?,
                url.clone(),
                settings.request_timeout,
            )),
            None => Arc::new(PlaylistMetadataSource::new(rewriter.clone())),
        };
        let tracker = Arc::new(NowPlayingTracker::new(source, settings.poll_interval));

        info!(
            stream_url = %settings.stream_url,
            station = %settings.station_name,
            "HLS relay ready"
        );

        Ok(Self {
            settings,
            session,
            rewriter,
            relay,
            tracker,
        })
    }

    /// Builds the relay from the `relay` and `nowplaying` configuration sections
    #[cfg(feature = "pmoconfig")]
    pub fn from_config(config: &pmoconfig::Config) -> Result<Self> {
        let settings = RelaySettings::from_config(config)?;
        Self::new(settings)
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn session(&self) -> &Arc<UpstreamSession> {
        &self.session
    }

    pub fn tracker(&self) -> &Arc<NowPlayingTracker> {
        &self.tracker
    }

    /// Starts the background now-playing poll
    pub fn start_tracker(&self) -> TrackerHandle {
        self.tracker.start()
    }

    // ========================================================================
    // Playlists
    // ========================================================================

    /// Rewritten top-level playlist (the configured stream URL)
    pub async fn get_master_playlist(&self, prefix: &str) -> Result<RewrittenPlaylist> {
        self.rewriter.fetch_master(prefix).await
    }

    /// Rewritten media playlist behind a `media/` reference
    pub async fn get_media_playlist(&self, variant_ref: &str, prefix: &str) -> Result<RewrittenPlaylist> {
        let local = LocalRef::decode(RefKind::Media, variant_ref)?;
        self.rewriter.fetch_media(&local, prefix).await
    }

    /// Rewritten media playlist of the current session
    pub async fn get_live_playlist(&self, prefix: &str) -> Result<RewrittenPlaylist> {
        self.rewriter.fetch_session_media(prefix).await
    }

    // ========================================================================
    // Segments
    // ========================================================================

    /// Opens the segment behind a `seg/` reference
    pub async fn get_segment(&self, local_ref: &str, range: Option<ByteRange>) -> Result<OpenedSegment> {
        let local = LocalRef::decode(RefKind::Segment, local_ref)?;
        self.relay.open(&local, range).await
    }

    // ========================================================================
    // ICY
    // ========================================================================

    /// Starts a continuous stream for one client
    ///
    /// The live playlist is fetched before returning so that an unreachable
    /// origin is reported to this client as an error rather than an empty
    /// body. The stream then runs in its own task and stops when the
    /// receiver is dropped.
    pub async fn get_icy_stream(&self, icy_metadata: bool) -> Result<IcyStream> {
        let initial = self.rewriter.media_playlist().await?;

        let metaint = icy_metadata.then_some(self.settings.icy_metaint);
        let mux = IcyMultiplexer::new(
            self.rewriter.clone(),
            self.relay.clone(),
            StationTitle::new(self.tracker.clone(), self.settings.station_name.clone()),
            metaint,
        )
        .with_live_edge(self.settings.live_edge_segments);

        let bitrate = match self.session.acquire().await {
            Ok(session) => session.bandwidth.map(|b| b / 1000),
            Err(_) => None,
        };
        let headers = IcyHeaders {
            content_type: IcyMultiplexer::content_type(&initial).to_string(),
            name: self.settings.station_name.clone(),
            genre: self.settings.station_genre.clone(),
            bitrate,
            metaint,
        };

        let (tx, rx) = mpsc::channel(ICY_CHANNEL_CAPACITY);
        info!(icy_metadata, "ICY client connected");
        tokio::spawn(async move {
            let mut tx = tx;
            match mux.stream_from(Some(initial), &mut tx).await {
                Ok(bytes) => info!(bytes, "ICY stream finished"),
                Err(Error::ClientDisconnected) => info!("ICY client disconnected"),
                Err(e) => error!(error = %e, "ICY stream aborted"),
            }
        });

        Ok(IcyStream { headers, body: rx })
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Current metadata snapshot, never blocking on the origin
    pub fn get_now_playing(&self) -> NowPlaying {
        let state: Arc<NowPlayingState> = self.tracker.current();
        NowPlaying {
            station: self.settings.station_name.clone(),
            artist: state
                .artist
                .clone()
                .unwrap_or_else(|| self.settings.station_name.clone()),
            title: state.title.clone().unwrap_or_else(|| "Live Stream".to_string()),
            artwork: state.artwork.clone(),
            fetched_at: state.fetched_at,
        }
    }

    /// One-entry M3U pointing players at the HLS playlist
    pub fn station_m3u(&self, public_base: &str) -> String {
        let now = self
            .tracker
            .current()
            .display()
            .unwrap_or_else(|| "Live Stream".to_string());
        format!(
            "#EXTM3U\n#EXTINF:-1 tvg-logo=\"\" radio=\"true\",{} - {}\n{}/playlist.m3u8\n",
            self.settings.station_name,
            now,
            public_base.trim_end_matches('/')
        )
    }

    /// One-entry M3U pointing players at the continuous stream
    pub fn icecast_m3u(&self, public_base: &str) -> String {
        format!(
            "#EXTM3U\n#EXTINF:-1,{}\n{}/icecast\n",
            self.settings.station_name,
            public_base.trim_end_matches('/')
        )
    }

    pub fn health(&self) -> Health {
        Health {
            status: "ok",
            station: self.settings.station_name.clone(),
        }
    }
}

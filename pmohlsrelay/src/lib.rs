//! HLS live-audio relay for PMORelay
//!
//! This crate sits between players and a session-bound HLS radio origin. It
//! establishes one upstream session (cookies, headers, chosen variant),
//! rewrites the origin playlists so every URI points back at the relay, proxies
//! segment bytes on demand, polls the current track and re-streams the
//! segments as one continuous Icecast/SHOUTcast-style stream with in-band
//! `StreamTitle` metadata.
//!
//! # Features
//!
//! - **Shared session**: single-flight handshake, TTL refresh and a grace
//!   period on refresh failures
//! - **Playlist rewriting**: line-for-line, reversible local references
//!   (`seg/<token>.aac`, `media/<token>.m3u8`), no lookup table
//! - **Segment relay**: streamed, range-aware, with retry/backoff and resume
//!   after a broken origin connection
//! - **Now playing**: background poll, last-known-good snapshot
//! - **ICY re-streaming**: metadata blocks every `metaint` audio bytes
//! - **Configuration Extension**: `relay.*` and `nowplaying.*` settings in
//!   `pmoconfig`
//!
//! # Example
//!
//! ```no_run
//! use pmohlsrelay::{HlsRelay, RelaySettings};
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let url = Url::parse("https://origin.example/live/playlist.m3u8")?;
//!     let relay = HlsRelay::new(RelaySettings::new(url))?;
//!     let tracker = relay.start_tracker();
//!
//!     let playlist = relay.get_live_playlist("http://localhost:8000/").await?;
//!     println!("{}", playlist.body);
//!
//!     let now = relay.get_now_playing();
//!     println!("Now: {} - {}", now.artist, now.title);
//!
//!     tracker.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Server
//!
//! With the `server` feature, [`api_rest::create_router`] exposes the
//! operations as an axum router (`/playlist.m3u8`, `/seg/{ref}`,
//! `/icecast`, `/nowplaying`, ...).

pub mod client;
pub mod error;
pub mod hls;
pub mod icy;
pub mod models;
pub mod nowplaying;
pub mod playlist;
pub mod relay;
pub mod service;
pub mod session;

#[cfg(feature = "pmoconfig")]
pub mod config_ext;

#[cfg(feature = "server")]
pub mod api_rest;

// Re-exports
pub use client::{ClientBuilder, OriginClient, RetryPolicy};
pub use error::{Error, Result};
pub use hls::{LocalRef, RefKind, PLAYLIST_CONTENT_TYPE};
pub use icy::{IcyFramer, IcyHeaders, IcyMultiplexer, MetadataFrame, StationTitle};
pub use models::{
    ByteRange, MasterPlaylist, MediaPlaylist, Playlist, Segment, TrackInfo, Variant,
};
pub use nowplaying::{
    JsonMetadataSource, MetadataSource, NowPlayingState, NowPlayingTracker,
    PlaylistMetadataSource, TrackerHandle,
};
pub use playlist::{PlaylistRewriter, RewrittenPlaylist};
pub use relay::{ByteSink, OpenedSegment, SegmentRelay};
pub use service::{Health, HlsRelay, IcyStream, NowPlaying, RelaySettings};
pub use session::{Session, UpstreamSession};

#[cfg(feature = "pmoconfig")]
pub use config_ext::HlsRelayConfigExt;

#[cfg(feature = "server")]
pub use api_rest::{create_router, RelayState};

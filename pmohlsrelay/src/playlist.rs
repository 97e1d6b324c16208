//! Playlist fetching and rewriting against the upstream session
//!
//! Playlists are fetched fresh on every call; only the session is shared.
//! Origin URIs are replaced by local references (see [`crate::hls`]) so that
//! clients fetch every segment and sub-playlist through the relay.

use crate::client::FetchedText;
use crate::error::{Error, Result};
use crate::hls::{self, LocalRef, RefKind, PLAYLIST_CONTENT_TYPE};
use crate::models::{MediaPlaylist, Playlist};
use crate::session::{Session, UpstreamSession};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

static COOKIE_DOMAIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i);\s*Domain=[^;]*").expect("valid regex"));
static COOKIE_SECURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i);\s*Secure\b").expect("valid regex"));

/// A rewritten playlist, ready to be served
#[derive(Debug, Clone)]
pub struct RewrittenPlaylist {
    pub body: String,
    pub content_type: &'static str,
    /// Origin `Set-Cookie` values, with `Domain` and `Secure` stripped
    pub set_cookies: Vec<String>,
    /// Parsed form of the origin playlist
    pub playlist: Playlist,
}

impl RewrittenPlaylist {
    fn new(body: String, playlist: Playlist, fetched: &FetchedText) -> Self {
        Self {
            body,
            content_type: PLAYLIST_CONTENT_TYPE,
            set_cookies: fetched
                .set_cookies
                .iter()
                .map(|c| sanitize_set_cookie(c))
                .collect(),
            playlist,
        }
    }
}

/// Rewrites a `Set-Cookie` value so the browser accepts it from the relay
pub fn sanitize_set_cookie(value: &str) -> String {
    let value = COOKIE_DOMAIN.replace_all(value, "");
    COOKIE_SECURE.replace_all(&value, "").into_owned()
}

/// Fetches origin playlists through the session and rewrites their URIs
#[derive(Debug, Clone)]
pub struct PlaylistRewriter {
    session: Arc<UpstreamSession>,
}

impl PlaylistRewriter {
    pub fn new(session: Arc<UpstreamSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<UpstreamSession> {
        &self.session
    }

    /// Fetches the configured stream URL and rewrites it
    ///
    /// `prefix` is prepended to every local reference (`/` for
    /// root-relative URIs, or an absolute public base ending in `/`).
    pub async fn fetch_master(&self, prefix: &str) -> Result<RewrittenPlaylist> {
        let session = self.session.acquire().await?;
        let url = self.session.stream_url().clone();
        let fetched = self.fetch_with_session(&url, &session).await?;

        let (body, playlist) = hls::rewrite_playlist(&fetched.body, &fetched.url, prefix)?;
        debug!(url = %url, master = playlist.is_master(), "Rewrote top-level playlist");
        Ok(RewrittenPlaylist::new(body, playlist, &fetched))
    }

    /// Fetches the media playlist a `media/` reference points at and rewrites it
    ///
    /// A reference that turns out to be another master playlist is followed
    /// once, through its first variant.
    pub async fn fetch_media(&self, variant: &LocalRef, prefix: &str) -> Result<RewrittenPlaylist> {
        if variant.kind != RefKind::Media {
            return Err(Error::not_found(format!(
                "not a media playlist reference: {}",
                variant.encode()
            )));
        }

        let session = self.session.acquire().await?;
        let mut fetched = self.fetch_with_session(&variant.origin, &session).await?;
        let mut playlist = hls::parse_playlist(&fetched.body, &fetched.url)?;

        let nested = match &playlist {
            Playlist::Master(master) => master.variants.first().map(|v| v.uri.clone()),
            Playlist::Media(_) => None,
        };
        if let Some(nested) = nested {
            debug!(url = %nested, "Following nested master playlist");
            fetched = self.fetch_with_session(&nested, &session).await?;
            playlist = hls::parse_playlist(&fetched.body, &fetched.url)?;
            if playlist.is_master() {
                return Err(Error::parse("master playlist nested more than once"));
            }
        }

        let body = hls::rewrite_lines(&fetched.body, &fetched.url, prefix, RefKind::Segment)?;
        Ok(RewrittenPlaylist::new(body, playlist, &fetched))
    }

    /// Fetches and rewrites the media playlist bound to the current session
    pub async fn fetch_session_media(&self, prefix: &str) -> Result<RewrittenPlaylist> {
        let (fetched, media) = self.session_media().await?;
        let body = hls::rewrite_lines(&fetched.body, &fetched.url, prefix, RefKind::Segment)?;
        Ok(RewrittenPlaylist::new(body, Playlist::Media(media), &fetched))
    }

    /// Parsed media playlist bound to the current session (no rewriting)
    pub async fn media_playlist(&self) -> Result<MediaPlaylist> {
        self.session_media().await.map(|(_, media)| media)
    }

    /// Session media playlist fetch, with one re-handshake when the origin
    /// rejects the session or answers with a variant list instead of segments
    async fn session_media(&self) -> Result<(FetchedText, MediaPlaylist)> {
        let mut refreshed = false;
        loop {
            let session = self.session.acquire().await?;
            let url = session.media_url.clone();

            let fetched = match self.fetch_with_session(&url, &session).await {
                Ok(fetched) => fetched,
                Err(e) if is_session_rejection(&e) && !refreshed => {
                    warn!(url = %url, error = %e, "Session rejected by origin, refreshing");
                    self.session.invalidate(&session).await;
                    refreshed = true;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match hls::parse_playlist(&fetched.body, &fetched.url)? {
                Playlist::Media(media) => return Ok((fetched, media)),
                Playlist::Master(_) if !refreshed => {
                    warn!(url = %url, "Got variant playlist instead of media playlist, refreshing session");
                    self.session.invalidate(&session).await;
                    refreshed = true;
                }
                Playlist::Master(_) => {
                    return Err(Error::parse(format!(
                        "expected a media playlist at {}",
                        url
                    )));
                }
            }
        }
    }

    async fn fetch_with_session(&self, url: &Url, session: &Session) -> Result<FetchedText> {
        self.session
            .client()
            .get_text(url, &session.headers)
            .await
    }
}

fn is_session_rejection(e: &Error) -> bool {
    matches!(e, Error::UpstreamStatus { status: 403 | 410, .. })
}

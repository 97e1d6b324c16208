//! HTTP endpoints of the relay
//!
//! Maps requests onto the [`HlsRelay`] operations. Streamed bodies (segments,
//! ICY) are fed from the bounded channels the core returns; when the client
//! goes away axum drops the body, the channel closes and the producing task
//! stops on its next write.

use crate::error::Error;
use crate::models::ByteRange;
use crate::playlist::RewrittenPlaylist;
use crate::service::HlsRelay;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Shared state of the router
#[derive(Clone)]
pub struct RelayState {
    pub relay: Arc<HlsRelay>,
}

impl RelayState {
    pub fn new(relay: Arc<HlsRelay>) -> Self {
        Self { relay }
    }
}

// ============ Gestion des erreurs ============

struct AppError(Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = Json(serde_json::json!({
            "error": self.0.to_string()
        }));

        let mut response = (status, body).into_response();
        allow_any_origin(response.headers_mut());
        response
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// Crée le router du relais
pub fn create_router(state: RelayState) -> Router {
    Router::new()
        .route("/playlist.m3u8", get(get_live_playlist))
        .route("/master.m3u8", get(get_master_playlist))
        .route("/media/{ref}", get(get_media_playlist))
        .route("/seg/{ref}", get(get_segment))
        .route("/icecast", get(get_icecast))
        .route("/nowplaying", get(get_now_playing))
        .route("/stream.m3u", get(get_station_m3u))
        .route("/stream-icecast.m3u", get(get_icecast_m3u))
        .route("/health", get(get_health))
        .with_state(state)
}

// ============================================================================
// Helpers
// ============================================================================

/// Public base URL of this server as seen by the client
///
/// Honors `X-Forwarded-Proto` / `X-Forwarded-Host` so that rewritten URIs
/// stay valid behind a reverse proxy.
fn public_base(headers: &HeaderMap) -> Option<String> {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let scheme = value("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = value("x-forwarded-host").or_else(|| value("host"))?;
    Some(format!("{}://{}", scheme, host))
}

fn rewrite_prefix(headers: &HeaderMap) -> String {
    match public_base(headers) {
        Some(base) => format!("{}/", base),
        None => "/".to_string(),
    }
}

fn allow_any_origin(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
}

fn insert_text(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(_) => debug!(header = %name, "Dropping header value that is not valid HTTP"),
    }
}

fn channel_body(rx: mpsc::Receiver<Bytes>) -> Body {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<Bytes, std::io::Error>(chunk), rx))
    });
    Body::from_stream(stream)
}

fn playlist_response(state: &RelayState, playlist: RewrittenPlaylist) -> Response {
    let mut headers = HeaderMap::new();
    insert_text(&mut headers, header::CONTENT_TYPE, playlist.content_type);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    allow_any_origin(&mut headers);

    for cookie in &playlist.set_cookies {
        if let Ok(v) = HeaderValue::from_str(cookie) {
            headers.append(header::SET_COOKIE, v);
        }
    }

    // Some directory apps read the current track from these on playlists too
    if let Some(now) = state.relay.tracker().current().display() {
        let settings = state.relay.settings();
        insert_text(&mut headers, HeaderName::from_static("icy-name"), &settings.station_name);
        insert_text(&mut headers, HeaderName::from_static("icy-description"), &now);
        insert_text(&mut headers, HeaderName::from_static("icy-genre"), &settings.station_genre);
    }

    (headers, playlist.body).into_response()
}

// ============================================================================
// Route Handlers
// ============================================================================

/// GET /playlist.m3u8
/// Media playlist of the current upstream session, rewritten
async fn get_live_playlist(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let playlist = state
        .relay
        .get_live_playlist(&rewrite_prefix(&headers))
        .await?;
    Ok(playlist_response(&state, playlist))
}

/// GET /master.m3u8
/// Top-level playlist, rewritten
async fn get_master_playlist(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let playlist = state
        .relay
        .get_master_playlist(&rewrite_prefix(&headers))
        .await?;
    Ok(playlist_response(&state, playlist))
}

/// GET /media/{ref}
async fn get_media_playlist(
    State(state): State<RelayState>,
    Path(variant_ref): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let playlist = state
        .relay
        .get_media_playlist(&variant_ref, &rewrite_prefix(&headers))
        .await?;
    Ok(playlist_response(&state, playlist))
}

/// GET /seg/{ref}
/// Proxied segment bytes, range-aware
async fn get_segment(
    State(state): State<RelayState>,
    Path(local_ref): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ByteRange::parse_header);

    let segment = state.relay.get_segment(&local_ref, range).await?;

    let mut out = HeaderMap::new();
    insert_text(&mut out, header::CONTENT_TYPE, &segment.content_type);
    if let Some(len) = segment.content_length {
        out.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    if let Some(content_range) = &segment.content_range {
        insert_text(&mut out, header::CONTENT_RANGE, content_range);
    }
    out.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    allow_any_origin(&mut out);

    let status = StatusCode::from_u16(segment.status).unwrap_or(StatusCode::OK);
    Ok((status, out, channel_body(segment.body)).into_response())
}

/// GET /icecast
/// Continuous stream, with ICY metadata when the client sends `Icy-MetaData: 1`
async fn get_icecast(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let icy_metadata = headers
        .get("icy-metadata")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "1");

    let stream = state.relay.get_icy_stream(icy_metadata).await?;

    let mut out = HeaderMap::new();
    for (name, value) in stream.headers.to_pairs() {
        insert_text(&mut out, HeaderName::from_static(name), &value);
    }
    if let Some(base) = public_base(&headers) {
        insert_text(&mut out, HeaderName::from_static("icy-url"), &base);
    }
    allow_any_origin(&mut out);

    Ok((out, channel_body(stream.body)).into_response())
}

/// GET /nowplaying
async fn get_now_playing(State(state): State<RelayState>) -> impl IntoResponse {
    let now = state.relay.get_now_playing();
    let mut headers = HeaderMap::new();
    allow_any_origin(&mut headers);
    (
        headers,
        Json(serde_json::json!({
            "status": "ok",
            "station": now.station,
            "title": now.title,
            "artist": now.artist,
            "artwork": now.artwork,
            "album": now.station,
            "fetched_at": now.fetched_at,
        })),
    )
}

/// GET /stream.m3u
async fn get_station_m3u(State(state): State<RelayState>, headers: HeaderMap) -> impl IntoResponse {
    let base = public_base(&headers).unwrap_or_default();
    m3u_response(state.relay.station_m3u(&base))
}

/// GET /stream-icecast.m3u
async fn get_icecast_m3u(State(state): State<RelayState>, headers: HeaderMap) -> impl IntoResponse {
    let base = public_base(&headers).unwrap_or_default();
    m3u_response(state.relay.icecast_m3u(&base))
}

fn m3u_response(body: String) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("audio/x-mpegurl"));
    allow_any_origin(&mut headers);
    (headers, body).into_response()
}

/// GET /health
async fn get_health(State(state): State<RelayState>) -> impl IntoResponse {
    Json(state.relay.health())
}

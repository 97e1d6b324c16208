//! Suivi du morceau en cours de diffusion
//!
//! Le [`NowPlayingTracker`] garde le dernier instantané connu dans un canal
//! `watch` : les lecteurs ne bloquent jamais et voient toujours un état
//! complet. Une tâche de fond interroge la source de métadonnées à
//! intervalle fixe.
//!
//! # Dégradation
//!
//! Un échec de la source est journalisé puis ignoré : l'instantané précédent
//! reste en place. Aucune erreur ne remonte aux lecteurs.

use crate::error::{Error, Result};
use crate::models::{Segment, TrackInfo};
use crate::playlist::PlaylistRewriter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Intervalle de rafraîchissement par défaut (15 secondes)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

/// Intervalle minimal : `tokio::time::interval` refuse une durée nulle
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

static EXTINF_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"title="([^"]+)""#).expect("valid regex"));
static EXTINF_ARTIST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"artist="([^"]+)""#).expect("valid regex"));
static EXTINF_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"url="([^"]+)""#).expect("valid regex"));

/// Instantané des métadonnées courantes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NowPlayingState {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub artwork: Option<String>,
    /// Date du dernier rafraîchissement réussi (`None` tant qu'aucun n'a abouti)
    pub fetched_at: Option<DateTime<Utc>>,
}

impl NowPlayingState {
    pub fn from_track(track: TrackInfo) -> Self {
        Self {
            artist: Some(track.artist),
            title: Some(track.title),
            artwork: track.artwork,
            fetched_at: Some(Utc::now()),
        }
    }

    /// `"Artist - Title"`, ou `None` si le morceau est inconnu
    pub fn display(&self) -> Option<String> {
        match (self.artist.as_deref(), self.title.as_deref()) {
            (Some(a), Some(t)) if !a.is_empty() && !t.is_empty() => Some(format!("{} - {}", a, t)),
            (Some(a), _) if !a.is_empty() => Some(a.to_string()),
            (_, Some(t)) if !t.is_empty() => Some(t.to_string()),
            _ => None,
        }
    }

    pub fn is_known(&self) -> bool {
        self.display().is_some()
    }
}

/// Source de métadonnées interrogée périodiquement
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// `Ok(None)` : la source a répondu mais sans morceau exploitable
    async fn poll(&self) -> Result<Option<TrackInfo>>;
}

/// Extrait le morceau courant des attributs `#EXTINF` de la playlist média
///
/// Format attendu : `#EXTINF:10,title="Song",artist="Artist",url="https://…"`.
/// Les entrées dont le titre ou l'artiste contient `Asset` (publicités,
/// jingles) sont ignorées.
pub fn track_from_extinf(title_field: &str) -> Option<TrackInfo> {
    let title = EXTINF_TITLE.captures(title_field)?.get(1)?.as_str();
    let artist = EXTINF_ARTIST.captures(title_field)?.get(1)?.as_str();
    if title.contains("Asset") || artist.contains("Asset") {
        return None;
    }
    let artwork = EXTINF_URL
        .captures(title_field)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    Some(TrackInfo {
        artist: artist.to_string(),
        title: title.to_string(),
        artwork,
    })
}

/// Premier morceau exploitable d'une liste de segments
pub fn track_from_segments(segments: &[Segment]) -> Option<TrackInfo> {
    segments.iter().find_map(|s| track_from_extinf(&s.title))
}

/// Source par défaut : la playlist média de la session
#[derive(Debug, Clone)]
pub struct PlaylistMetadataSource {
    rewriter: PlaylistRewriter,
}

impl PlaylistMetadataSource {
    pub fn new(rewriter: PlaylistRewriter) -> Self {
        Self { rewriter }
    }
}

#[async_trait]
impl MetadataSource for PlaylistMetadataSource {
    async fn poll(&self) -> Result<Option<TrackInfo>> {
        let media = self
            .rewriter
            .media_playlist()
            .await
            .map_err(|e| Error::MetadataFetch(e.to_string()))?;
        Ok(track_from_segments(&media.segments))
    }
}

#[derive(Debug, Deserialize)]
struct JsonTrack {
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    artwork: Option<String>,
}

/// Source JSON externe renvoyant `{artist, title, artwork?}`
#[derive(Debug, Clone)]
pub struct JsonMetadataSource {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl JsonMetadataSource {
    pub fn new(client: reqwest::Client, url: Url, timeout: Duration) -> Self {
        Self {
            client,
            url,
            timeout,
        }
    }
}

#[async_trait]
impl MetadataSource for JsonMetadataSource {
    async fn poll(&self) -> Result<Option<TrackInfo>> {
        let response = self
            .client
            .get(self.url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::MetadataFetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::MetadataFetch(format!(
                "{} returned HTTP {}",
                self.url,
                response.status()
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::MetadataFetch(e.to_string()))?;
        let track: JsonTrack = serde_json::from_str(&text)?;

        Ok(match (track.artist, track.title) {
            (Some(artist), Some(title)) if !artist.is_empty() || !title.is_empty() => {
                Some(TrackInfo {
                    artist,
                    title,
                    artwork: track.artwork,
                })
            }
            _ => None,
        })
    }
}

/// Détenteur de l'instantané « now playing »
pub struct NowPlayingTracker {
    tx: watch::Sender<Arc<NowPlayingState>>,
    source: Arc<dyn MetadataSource>,
    interval: Duration,
}

impl std::fmt::Debug for NowPlayingTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NowPlayingTracker")
            .field("current", &*self.tx.borrow())
            .field("interval", &self.interval)
            .finish()
    }
}

impl NowPlayingTracker {
    pub fn new(source: Arc<dyn MetadataSource>, interval: Duration) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(NowPlayingState::default()));
        Self {
            tx,
            source,
            interval: interval.max(MIN_POLL_INTERVAL),
        }
    }

    /// Dernier instantané connu, sans attente
    pub fn current(&self) -> Arc<NowPlayingState> {
        self.tx.borrow().clone()
    }

    /// Récepteur notifié à chaque remplacement de l'instantané
    pub fn subscribe(&self) -> watch::Receiver<Arc<NowPlayingState>> {
        self.tx.subscribe()
    }

    /// Interroge la source une fois
    ///
    /// Retourne `true` si l'instantané a été remplacé. Un échec ou une
    /// réponse vide laisse l'instantané précédent en place.
    pub async fn refresh(&self) -> bool {
        match self.source.poll().await {
            Ok(Some(track)) => {
                let state = NowPlayingState::from_track(track);
                let changed = self.tx.borrow().display() != state.display();
                if changed {
                    info!(track = %state.display().unwrap_or_default(), "Now playing");
                }
                self.tx.send_replace(Arc::new(state));
                true
            }
            Ok(None) => {
                debug!("No usable track in metadata source, keeping previous snapshot");
                false
            }
            Err(e) => {
                warn!(error = %e, "Metadata poll failed, keeping previous snapshot");
                false
            }
        }
    }

    /// Démarre la boucle de rafraîchissement en tâche de fond
    ///
    /// La boucle vit indépendamment des clients connectés ; elle s'arrête
    /// via [`TrackerHandle::stop`] ou quand le handle est abandonné.
    pub fn start(self: &Arc<Self>) -> TrackerHandle {
        let token = CancellationToken::new();
        let tracker = self.clone();
        let stop = token.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        tracker.refresh().await;
                    }
                }
            }
            debug!("Now-playing tracker stopped");
        });

        TrackerHandle {
            token,
            join: Some(join),
        }
    }
}

/// Cycle de vie de la tâche de rafraîchissement
#[derive(Debug)]
pub struct TrackerHandle {
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl TrackerHandle {
    /// Arrête la boucle et attend sa fin
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for TrackerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Source scriptée : renvoie les réponses dans l'ordre, puis la dernière en boucle
    struct Scripted {
        replies: Mutex<Vec<Result<Option<TrackInfo>>>>,
    }

    impl Scripted {
        fn new(mut replies: Vec<Result<Option<TrackInfo>>>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
            })
        }
    }

    #[async_trait]
    impl MetadataSource for Scripted {
        async fn poll(&self) -> Result<Option<TrackInfo>> {
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop().unwrap()
            } else {
                match replies.last() {
                    Some(Ok(t)) => Ok(t.clone()),
                    _ => Err(Error::MetadataFetch("unreachable".into())),
                }
            }
        }
    }

    fn track(artist: &str, title: &str) -> TrackInfo {
        TrackInfo {
            artist: artist.into(),
            title: title.into(),
            artwork: None,
        }
    }

    #[test]
    fn test_track_from_extinf() {
        let t = track_from_extinf(r#"title="Song",artist="Band",url="https://img/x.jpg""#).unwrap();
        assert_eq!(t.title, "Song");
        assert_eq!(t.artist, "Band");
        assert_eq!(t.artwork.as_deref(), Some("https://img/x.jpg"));

        assert!(track_from_extinf(r#"title="Asset 12",artist="Fox""#).is_none());
        assert!(track_from_extinf(r#"title="Song""#).is_none());
        assert!(track_from_extinf("").is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(NowPlayingState::default().display(), None);
        let s = NowPlayingState::from_track(track("Band", "Song"));
        assert_eq!(s.display().as_deref(), Some("Band - Song"));
        assert!(s.fetched_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_snapshot() {
        let source = Scripted::new(vec![
            Ok(Some(track("Band", "Song"))),
            Err(Error::MetadataFetch("down".into())),
            Ok(None),
        ]);
        let tracker = NowPlayingTracker::new(source, Duration::from_secs(60));
        assert!(!tracker.current().is_known());

        assert!(tracker.refresh().await);
        let first = tracker.current();
        assert_eq!(first.display().as_deref(), Some("Band - Song"));

        assert!(!tracker.refresh().await);
        assert_eq!(tracker.current(), first);

        assert!(!tracker.refresh().await);
        assert_eq!(tracker.current(), first);
    }

    #[tokio::test]
    async fn test_background_loop_publishes_and_stops() {
        let source = Scripted::new(vec![Ok(Some(track("Band", "Song")))]);
        let tracker = Arc::new(NowPlayingTracker::new(source, Duration::from_millis(10)));
        let mut rx = tracker.subscribe();

        let handle = tracker.start();
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("tracker published in time")
            .unwrap();
        assert_eq!(rx.borrow().display().as_deref(), Some("Band - Song"));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_zero_interval_is_clamped() {
        let source = Scripted::new(vec![Ok(Some(track("Band", "Song")))]);
        let tracker = Arc::new(NowPlayingTracker::new(source, Duration::ZERO));
        let mut rx = tracker.subscribe();

        let handle = tracker.start();
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("tracker loop is running")
            .unwrap();

        handle.stop().await;
    }
}

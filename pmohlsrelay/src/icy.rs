//! Continuous ICY stream synthesized from the segmented source
//!
//! The [`IcyMultiplexer`] walks the live media playlist segment after segment,
//! concatenates their bodies into one byte stream and, when the client asked
//! for it (`Icy-MetaData: 1`), injects a metadata block every `metaint` audio
//! bytes.
//!
//! # Framing
//!
//! ```text
//! [metaint audio bytes][L][16*L bytes of metadata][metaint audio bytes][L]...
//! ```
//!
//! `L` is a single length byte. The metadata text is
//! `StreamTitle='Artist - Title';`, zero-padded to the next multiple of 16.
//! When the title has not changed since the previous block, `L = 0` and no
//! text follows. Receivers find blocks purely by counting audio bytes, so the
//! counter runs from the first byte of the response and is never reset, even
//! when the playlist is re-fetched between segments.

use crate::error::{Error, Result};
use crate::models::{content_type_for, MediaPlaylist};
use crate::nowplaying::NowPlayingTracker;
use crate::playlist::PlaylistRewriter;
use crate::relay::{ByteSink, SegmentRelay};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Metadata interval advertised by default (bytes of audio between blocks)
pub const DEFAULT_METAINT: usize = 16000;

/// Largest metadata text a length byte can describe
pub const MAX_METADATA_LEN: usize = 255 * 16;

/// Segments to start behind the live edge on connect
pub const DEFAULT_LIVE_EDGE_SEGMENTS: usize = 3;

/// Consecutive upstream failures after which a client stream gives up
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Empty re-fetches (half a target duration apart) tolerated before a
/// frozen live window counts as a failure
pub const MAX_IDLE_REFETCHES: u32 = 6;

/// One inline metadata block: length byte plus padded text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFrame {
    bytes: Bytes,
}

impl MetadataFrame {
    /// Block for an arbitrary metadata text
    ///
    /// Text longer than [`MAX_METADATA_LEN`] is cut at a character boundary.
    pub fn encode(text: &str) -> Self {
        let mut end = text.len().min(MAX_METADATA_LEN);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let text = &text[..end];

        let blocks = text.len().div_ceil(16);
        let mut buf = BytesMut::with_capacity(1 + blocks * 16);
        buf.put_u8(blocks as u8);
        buf.put_slice(text.as_bytes());
        buf.resize(1 + blocks * 16, 0);
        Self {
            bytes: buf.freeze(),
        }
    }

    /// `StreamTitle='<title>';` block
    pub fn stream_title(title: &str) -> Self {
        Self::encode(&format_stream_title(title))
    }

    /// Single zero byte: "no change"
    pub fn empty() -> Self {
        Self {
            bytes: Bytes::from_static(&[0]),
        }
    }

    pub fn length_byte(&self) -> u8 {
        self.bytes[0]
    }

    /// Padded text, without the length byte
    pub fn payload(&self) -> &[u8] {
        &self.bytes[1..]
    }

    /// Wire form
    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.length_byte() == 0
    }
}

pub fn format_stream_title(title: &str) -> String {
    format!("StreamTitle='{}';", title)
}

/// Splits audio into `metaint`-sized runs and interleaves metadata blocks
///
/// The metadata text is asked for at each injection point, so a block
/// always reflects the state at the moment it is emitted.
#[derive(Debug, Clone)]
pub struct IcyFramer {
    metaint: usize,
    until_meta: usize,
    last_text: Option<String>,
    audio_bytes: u64,
}

impl IcyFramer {
    pub fn new(metaint: usize) -> Self {
        let metaint = metaint.max(1);
        Self {
            metaint,
            until_meta: metaint,
            last_text: None,
            audio_bytes: 0,
        }
    }

    pub fn metaint(&self) -> usize {
        self.metaint
    }

    /// Audio bytes framed so far
    pub fn audio_bytes(&self) -> u64 {
        self.audio_bytes
    }

    /// Frames one audio chunk, returning the pieces to write in order
    pub fn frame<F>(&mut self, mut chunk: Bytes, mut text: F) -> Vec<Bytes>
    where
        F: FnMut() -> String,
    {
        let mut out = Vec::with_capacity(2);
        while !chunk.is_empty() {
            let n = self.until_meta.min(chunk.len());
            out.push(chunk.split_to(n));
            self.until_meta -= n;
            self.audio_bytes += n as u64;

            if self.until_meta == 0 {
                out.push(self.next_frame(text()).to_bytes());
                self.until_meta = self.metaint;
            }
        }
        out
    }

    fn next_frame(&mut self, text: String) -> MetadataFrame {
        if text.is_empty() || self.last_text.as_deref() == Some(text.as_str()) {
            return MetadataFrame::empty();
        }
        let frame = MetadataFrame::encode(&text);
        self.last_text = Some(text);
        frame
    }
}

/// Current metadata text for a station: tracker snapshot or station fallback
#[derive(Debug, Clone)]
pub struct StationTitle {
    tracker: Arc<NowPlayingTracker>,
    station: String,
}

impl StationTitle {
    pub fn new(tracker: Arc<NowPlayingTracker>, station: impl Into<String>) -> Self {
        Self {
            tracker,
            station: station.into(),
        }
    }

    /// `"Artist - Title"`, or `"<station> - Live Stream"` while unknown
    pub fn title(&self) -> String {
        self.tracker
            .current()
            .display()
            .unwrap_or_else(|| format!("{} - Live Stream", self.station))
    }

    pub fn stream_title(&self) -> String {
        format_stream_title(&self.title())
    }
}

/// Sink adapter applying ICY framing (or none) on the way to the client
struct IcySink<'a, S: ?Sized> {
    inner: &'a mut S,
    framer: Option<IcyFramer>,
    title: &'a StationTitle,
    audio_bytes: u64,
}

#[async_trait]
impl<'a, S> ByteSink for IcySink<'a, S>
where
    S: ByteSink + ?Sized,
{
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.audio_bytes += chunk.len() as u64;
        match self.framer.as_mut() {
            None => self.inner.write(chunk).await,
            Some(framer) => {
                let title = self.title;
                for piece in framer.frame(chunk, || title.stream_title()) {
                    self.inner.write(piece).await?;
                }
                Ok(())
            }
        }
    }

    async fn closed(&self) {
        self.inner.closed().await
    }
}

/// Response headers of an ICY stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcyHeaders {
    pub content_type: String,
    pub name: String,
    pub genre: String,
    /// Kilobits per second
    pub bitrate: Option<u64>,
    /// Present only when metadata is injected
    pub metaint: Option<usize>,
}

impl IcyHeaders {
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("content-type", self.content_type.clone()),
            ("icy-name", self.name.clone()),
            ("icy-genre", self.genre.clone()),
            ("icy-pub", "1".to_string()),
            ("cache-control", "no-cache".to_string()),
        ];
        if let Some(br) = self.bitrate {
            pairs.push(("icy-br", br.to_string()));
        }
        if let Some(metaint) = self.metaint {
            pairs.push(("icy-metaint", metaint.to_string()));
        }
        pairs
    }
}

/// Drives the segment relay across the live playlist for one client
#[derive(Debug, Clone)]
pub struct IcyMultiplexer {
    rewriter: PlaylistRewriter,
    relay: SegmentRelay,
    title: StationTitle,
    metaint: Option<usize>,
    live_edge: usize,
}

impl IcyMultiplexer {
    /// `metaint = None` produces plain audio without metadata blocks
    pub fn new(
        rewriter: PlaylistRewriter,
        relay: SegmentRelay,
        title: StationTitle,
        metaint: Option<usize>,
    ) -> Self {
        Self {
            rewriter,
            relay,
            title,
            metaint,
            live_edge: DEFAULT_LIVE_EDGE_SEGMENTS,
        }
    }

    /// Number of segments behind the live edge to start from
    pub fn with_live_edge(mut self, segments: usize) -> Self {
        self.live_edge = segments.max(1);
        self
    }

    pub fn metaint(&self) -> Option<usize> {
        self.metaint
    }

    /// Content type of the stream, guessed from the playlist's segments
    pub fn content_type(playlist: &MediaPlaylist) -> &'static str {
        playlist
            .segments
            .first()
            .map(|s| content_type_for(&s.uri))
            .unwrap_or("audio/aac")
    }

    /// Streams until the client disconnects, the playlist ends, or the
    /// origin keeps failing; returns the number of audio bytes sent
    pub async fn stream<S>(&self, sink: &mut S) -> Result<u64>
    where
        S: ByteSink + ?Sized,
    {
        self.stream_from(None, sink).await
    }

    /// Same as [`Self::stream`], starting from an already fetched playlist
    pub async fn stream_from<S>(&self, initial: Option<MediaPlaylist>, sink: &mut S) -> Result<u64>
    where
        S: ByteSink + ?Sized,
    {
        let mut out = IcySink {
            inner: sink,
            framer: self.metaint.map(IcyFramer::new),
            title: &self.title,
            audio_bytes: 0,
        };

        let mut pending = initial;
        let mut last_sequence: Option<u64> = None;
        let mut failures = 0u32;
        let mut idle_refetches = 0u32;

        loop {
            let playlist = match pending.take() {
                Some(p) => p,
                None => match self.rewriter.media_playlist().await {
                    Ok(p) => p,
                    Err(e) => {
                        failures += 1;
                        if failures >= MAX_CONSECUTIVE_FAILURES {
                            return Err(e);
                        }
                        warn!(error = %e, failures, "Media playlist fetch failed");
                        self.pause(&out, Duration::from_secs(1)).await?;
                        continue;
                    }
                },
            };

            if let (Some(last), Some(newest)) = (last_sequence, playlist.last_sequence()) {
                if newest < last {
                    warn!(
                        last,
                        newest, "Media sequence went backwards, restarting from the live edge"
                    );
                    last_sequence = None;
                }
            }

            let start = match last_sequence {
                None => playlist.segments.len().saturating_sub(self.live_edge),
                Some(last) => {
                    let idx = playlist
                        .segments
                        .iter()
                        .position(|s| s.sequence > last)
                        .unwrap_or(playlist.segments.len());
                    if let Some(first) = playlist.segments.get(idx) {
                        if first.sequence > last.saturating_add(1) {
                            warn!(
                                expected = last.saturating_add(1),
                                got = first.sequence,
                                "Live window moved past us, skipping ahead"
                            );
                        }
                    }
                    idx
                }
            };

            if start == playlist.segments.len() {
                if playlist.end_list {
                    info!(bytes = out.audio_bytes, "Playlist ended");
                    return Ok(out.audio_bytes);
                }
                idle_refetches += 1;
                if idle_refetches > MAX_IDLE_REFETCHES {
                    idle_refetches = 0;
                    failures += 1;
                    let e = Error::upstream(format!(
                        "no new segment after sequence {}",
                        last_sequence.unwrap_or_default()
                    ));
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(e);
                    }
                    warn!(error = %e, failures, "Live window is not moving");
                }
                let wait = Duration::from_millis(
                    playlist.target_duration.saturating_mul(500).max(500),
                );
                debug!(?wait, idle_refetches, "No new segment yet");
                self.pause(&out, wait).await?;
                continue;
            }

            idle_refetches = 0;
            for segment in &playlist.segments[start..] {
                match self
                    .relay
                    .relay_url(&segment.uri, segment.byte_range, &mut out)
                    .await
                {
                    Ok(n) => {
                        failures = 0;
                        debug!(sequence = segment.sequence, bytes = n, "Segment streamed");
                    }
                    Err(Error::ClientDisconnected) => return Err(Error::ClientDisconnected),
                    Err(Error::SegmentNotFound(uri)) => {
                        warn!(sequence = segment.sequence, uri = %uri, "Segment vanished, skipping");
                    }
                    Err(e) => {
                        failures += 1;
                        if failures >= MAX_CONSECUTIVE_FAILURES {
                            return Err(e);
                        }
                        warn!(sequence = segment.sequence, error = %e, failures, "Segment failed, skipping");
                    }
                }
                last_sequence = Some(segment.sequence);
            }

            if playlist.end_list {
                info!(bytes = out.audio_bytes, "Playlist ended");
                return Ok(out.audio_bytes);
            }
        }
    }

    /// Sleeps, returning early with [`Error::ClientDisconnected`] if the
    /// client goes away meanwhile
    async fn pause<S>(&self, sink: &IcySink<'_, S>, wait: Duration) -> Result<()>
    where
        S: ByteSink + ?Sized,
    {
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = sink.closed() => Err(Error::ClientDisconnected),
        }
    }
}

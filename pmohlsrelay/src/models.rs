//! Data models for parsed playlists
//!
//! Playlists are parsed into these types on every fetch and thrown away once
//! the request is served; nothing here is cached.

use serde::Serialize;
use url::Url;

/// An inclusive byte range, as used by `Range` headers and `EXT-X-BYTERANGE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteRange {
    /// First byte (0-based)
    pub start: u64,
    /// Last byte, inclusive; `None` means "to the end of the resource"
    pub end: Option<u64>,
}

impl ByteRange {
    /// Range covering `length` bytes from `offset`
    ///
    /// `None` for an empty range or one reaching past `u64::MAX`.
    pub fn sized(offset: u64, length: u64) -> Option<Self> {
        let end = offset.checked_add(length.checked_sub(1)?)?;
        Some(Self {
            start: offset,
            end: Some(end),
        })
    }

    /// Open-ended range starting at `start`
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Number of bytes covered, when bounded
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| (end - self.start).saturating_add(1))
    }

    /// Returns the range left after `delivered` bytes of this one were sent,
    /// or `None` once the range is exhausted.
    pub fn advance(&self, delivered: u64) -> Option<Self> {
        let start = self.start.checked_add(delivered)?;
        match self.end {
            Some(end) if start > end => None,
            end => Some(Self { start, end }),
        }
    }

    /// Value for an HTTP `Range` request header
    pub fn to_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }

    /// Parses a single-range `Range` request header (`bytes=a-b` or `bytes=a-`)
    ///
    /// Suffix ranges (`bytes=-n`) and multi-range requests are not supported
    /// and yield `None`, in which case the whole resource is served.
    pub fn parse_header(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes=")?;
        if spec.contains(',') {
            return None;
        }
        let (start, end) = spec.split_once('-')?;
        let start = start.trim().parse::<u64>().ok()?;
        let end = match end.trim() {
            "" => None,
            e => Some(e.parse::<u64>().ok()?),
        };
        match end {
            Some(e) if e < start => None,
            end => Some(Self { start, end }),
        }
    }
}

/// One quality option of a master playlist
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variant {
    pub bandwidth: u64,
    pub codecs: Option<String>,
    /// Absolute origin URI of the variant's media playlist
    pub uri: Url,
}

/// Top-level playlist: variants in origin order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasterPlaylist {
    pub variants: Vec<Variant>,
}

/// One media segment of a media playlist
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    /// Absolute origin URI
    pub uri: Url,
    /// Duration in seconds, from `#EXTINF`
    pub duration: f64,
    /// Everything after the comma of `#EXTINF` (may carry `title="…"` attributes)
    pub title: String,
    pub byte_range: Option<ByteRange>,
    /// Preceded by `#EXT-X-DISCONTINUITY`
    pub discontinuity: bool,
    /// Media sequence number of this segment
    pub sequence: u64,
}

/// Segment playlist: segments in origin order plus the sequence counter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaPlaylist {
    pub target_duration: u64,
    pub media_sequence: u64,
    pub segments: Vec<Segment>,
    /// `#EXT-X-ENDLIST` seen: the playlist will not grow any more
    pub end_list: bool,
}

impl MediaPlaylist {
    /// Sequence number of the newest segment, if any
    pub fn last_sequence(&self) -> Option<u64> {
        self.segments.last().map(|s| s.sequence)
    }
}

/// A parsed playlist of either kind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

impl Playlist {
    pub fn is_master(&self) -> bool {
        matches!(self, Playlist::Master(_))
    }
}

/// Track metadata reported by a metadata source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackInfo {
    pub artist: String,
    pub title: String,
    pub artwork: Option<String>,
}

/// Guesses the audio content type from a segment URI's extension
pub fn content_type_for(uri: &Url) -> &'static str {
    let ext = uri
        .path_segments()
        .and_then(|mut s| s.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());

    match ext.as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("ts") => "video/mp2t",
        Some("mp4") | Some("m4s") | Some("m4a") => "audio/mp4",
        _ => "audio/aac",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_header_round_trip() {
        let r = ByteRange::parse_header("bytes=100-199").unwrap();
        assert_eq!(Some(r), ByteRange::sized(100, 100));
        assert_eq!(r.to_header(), "bytes=100-199");
        assert_eq!(r.len(), Some(100));

        let open = ByteRange::parse_header("bytes=42-").unwrap();
        assert_eq!(open, ByteRange::from(42));
        assert_eq!(open.to_header(), "bytes=42-");
    }

    #[test]
    fn test_unsupported_range_headers() {
        assert!(ByteRange::parse_header("bytes=-500").is_none());
        assert!(ByteRange::parse_header("bytes=0-1,5-9").is_none());
        assert!(ByteRange::parse_header("items=0-1").is_none());
        assert!(ByteRange::parse_header("bytes=9-1").is_none());
    }

    #[test]
    fn test_sized_rejects_empty_and_overflow() {
        assert_eq!(ByteRange::sized(7, 1), Some(ByteRange { start: 7, end: Some(7) }));
        assert_eq!(ByteRange::sized(7, 0), None);
        assert_eq!(
            ByteRange::sized(u64::MAX, 1),
            Some(ByteRange { start: u64::MAX, end: Some(u64::MAX) })
        );
        assert_eq!(ByteRange::sized(u64::MAX, 2), None);
    }

    #[test]
    fn test_range_advance() {
        let r = ByteRange::sized(10, 10).unwrap();
        assert_eq!(r.advance(0), Some(r));
        assert_eq!(r.advance(4), Some(ByteRange { start: 14, end: Some(19) }));
        assert_eq!(r.advance(10), None);
        assert_eq!(ByteRange::from(5).advance(100), Some(ByteRange::from(105)));
    }

    #[test]
    fn test_content_type_guess() {
        let url = |s: &str| Url::parse(s).unwrap();
        assert_eq!(content_type_for(&url("http://o/a/b.aac?x=1")), "audio/aac");
        assert_eq!(content_type_for(&url("http://o/a/b.TS")), "video/mp2t");
        assert_eq!(content_type_for(&url("http://o/a/b.mp3")), "audio/mpeg");
        assert_eq!(content_type_for(&url("http://o/a/segment")), "audio/aac");
    }
}

//! HLS playlist parsing, local references and line-preserving rewriting
//!
//! Everything in this module is pure: no I/O, no session. The parser turns
//! playlist text into [`Playlist`] values; [`rewrite_playlist`] replaces URI
//! lines with proxy-local references and leaves every other byte (directives,
//! comments, blank lines, line endings) exactly as the origin sent it.
//!
//! # Local references
//!
//! A local reference is `seg/<token>.<ext>` or `media/<token>.m3u8`, where the
//! token is the unpadded URL-safe base64 of the absolute origin URI. Decoding
//! needs no lookup table, so any relay instance can resolve a reference minted
//! by another, and the mapping is trivially invertible.

use crate::error::{Error, Result};
use crate::models::{ByteRange, MasterPlaylist, MediaPlaylist, Playlist, Segment, Variant};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use url::Url;

/// Content type of rewritten playlists
pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// What a local reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    /// A media segment, served by the segment relay
    Segment,
    /// A media playlist, served rewritten
    Media,
}

impl RefKind {
    /// Path component used in local references
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::Segment => "seg",
            RefKind::Media => "media",
        }
    }

    fn from_path_component(s: &str) -> Option<Self> {
        match s {
            "seg" => Some(RefKind::Segment),
            "media" => Some(RefKind::Media),
            _ => None,
        }
    }
}

/// Reversible mapping between an origin URI and a proxy-local path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalRef {
    pub kind: RefKind,
    pub origin: Url,
}

impl LocalRef {
    pub fn segment(origin: Url) -> Self {
        Self {
            kind: RefKind::Segment,
            origin,
        }
    }

    pub fn media(origin: Url) -> Self {
        Self {
            kind: RefKind::Media,
            origin,
        }
    }

    /// Opaque token (no kind prefix, no extension)
    pub fn token(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.origin.as_str())
    }

    /// File name part: token plus a cosmetic extension players like to see
    pub fn file_name(&self) -> String {
        let ext = match self.kind {
            RefKind::Media => Some("m3u8".to_string()),
            RefKind::Segment => origin_extension(&self.origin),
        };
        match ext {
            Some(ext) => format!("{}.{}", self.token(), ext),
            None => self.token(),
        }
    }

    /// Relative path `seg/<token>.<ext>` or `media/<token>.m3u8`
    pub fn encode(&self) -> String {
        format!("{}/{}", self.kind.as_str(), self.file_name())
    }

    /// Resolves the file-name part of a reference (as captured by a router)
    ///
    /// Anything after the first `.` is ignored: the base64 alphabet used for
    /// tokens never contains one.
    pub fn decode(kind: RefKind, file_name: &str) -> Result<Self> {
        let token = file_name.split('.').next().unwrap_or_default();
        if token.is_empty() {
            return Err(Error::not_found(format!("empty {} reference", kind.as_str())));
        }

        let raw = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| Error::not_found(format!("undecodable reference: {}", file_name)))?;
        let text = String::from_utf8(raw)
            .map_err(|_| Error::not_found(format!("undecodable reference: {}", file_name)))?;
        let origin = Url::parse(&text)
            .map_err(|_| Error::not_found(format!("reference is not a URL: {}", file_name)))?;

        if !matches!(origin.scheme(), "http" | "https") {
            return Err(Error::not_found(format!(
                "reference does not point at an HTTP origin: {}",
                file_name
            )));
        }

        Ok(Self { kind, origin })
    }

    /// Resolves a full local path (`/seg/…`, `media/…` or a URL ending in one)
    pub fn parse(path: &str) -> Result<Self> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let (dir, file_name) = path
            .trim_end_matches('/')
            .rsplit_once('/')
            .ok_or_else(|| Error::not_found(format!("not a local reference: {}", path)))?;
        let kind = dir
            .rsplit('/')
            .next()
            .and_then(RefKind::from_path_component)
            .ok_or_else(|| Error::not_found(format!("not a local reference: {}", path)))?;
        Self::decode(kind, file_name)
    }
}

/// Short alphanumeric extension of the origin file name, if any
fn origin_extension(url: &Url) -> Option<String> {
    let name = url.path_segments()?.next_back()?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 || !ext.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

// ============================================================================
// Parsing
// ============================================================================

/// A URI line: not blank, not a tag or comment
fn is_uri_line(line: &str) -> bool {
    !line.is_empty() && !line.starts_with('#')
}

/// Parses playlist text, resolving URIs against `base`
pub fn parse_playlist(text: &str, base: &Url) -> Result<Playlist> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let first = text.lines().map(str::trim).find(|l| !l.is_empty());
    if first != Some("#EXTM3U") {
        return Err(Error::parse("missing #EXTM3U header"));
    }

    if text.lines().any(|l| l.trim_start().starts_with("#EXT-X-STREAM-INF")) {
        parse_master(text, base).map(Playlist::Master)
    } else {
        parse_media(text, base).map(Playlist::Media)
    }
}

/// Parses a master playlist
pub fn parse_master(text: &str, base: &Url) -> Result<MasterPlaylist> {
    let mut variants = Vec::new();
    let mut pending: Option<(u64, Option<String>)> = None;

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let attrs = parse_attributes(attrs);
            let bandwidth = attribute(&attrs, "BANDWIDTH")
                .ok_or_else(|| Error::parse(format!("line {}: STREAM-INF without BANDWIDTH", lineno + 1)))?
                .parse::<u64>()
                .map_err(|_| Error::parse(format!("line {}: invalid BANDWIDTH", lineno + 1)))?;
            let codecs = attribute(&attrs, "CODECS").map(str::to_string);
            pending = Some((bandwidth, codecs));
        } else if is_uri_line(line) {
            let (bandwidth, codecs) = pending
                .take()
                .ok_or_else(|| Error::parse(format!("line {}: URI without STREAM-INF", lineno + 1)))?;
            variants.push(Variant {
                bandwidth,
                codecs,
                uri: resolve(base, line)?,
            });
        }
    }

    if pending.is_some() {
        return Err(Error::parse("STREAM-INF not followed by a URI"));
    }
    if variants.is_empty() {
        return Err(Error::parse("master playlist without variants"));
    }

    Ok(MasterPlaylist { variants })
}

/// Parses a media playlist
pub fn parse_media(text: &str, base: &Url) -> Result<MediaPlaylist> {
    let mut target_duration = None;
    let mut media_sequence = 0u64;
    let mut end_list = false;
    let mut segments: Vec<Segment> = Vec::new();

    let mut extinf: Option<(f64, String)> = None;
    let mut byte_range: Option<(u64, Option<u64>)> = None;
    let mut discontinuity = false;

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        let at = |msg: &str| Error::parse(format!("line {}: {}", lineno + 1, msg));

        if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            let value = value
                .trim()
                .parse::<f64>()
                .map_err(|_| at("invalid TARGETDURATION"))?;
            if !value.is_finite() || value < 0.0 {
                return Err(at("invalid TARGETDURATION"));
            }
            target_duration = Some(value.ceil() as u64);
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media_sequence = value
                .trim()
                .parse()
                .map_err(|_| at("invalid MEDIA-SEQUENCE"))?;
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            let (duration, title) = match value.split_once(',') {
                Some((d, t)) => (d, t),
                None => (value, ""),
            };
            let duration = duration
                .trim()
                .parse::<f64>()
                .map_err(|_| at("invalid EXTINF duration"))?;
            if !duration.is_finite() || duration < 0.0 {
                return Err(at("invalid EXTINF duration"));
            }
            extinf = Some((duration, title.to_string()));
        } else if let Some(value) = line.strip_prefix("#EXT-X-BYTERANGE:") {
            let (len, offset) = match value.trim().split_once('@') {
                Some((l, o)) => (l, Some(o)),
                None => (value.trim(), None),
            };
            let len = len.parse::<u64>().map_err(|_| at("invalid BYTERANGE"))?;
            let offset = offset
                .map(|o| o.parse::<u64>().map_err(|_| at("invalid BYTERANGE offset")))
                .transpose()?;
            byte_range = Some((len, offset));
        } else if line == "#EXT-X-DISCONTINUITY" {
            discontinuity = true;
        } else if line == "#EXT-X-ENDLIST" {
            end_list = true;
        } else if is_uri_line(line) {
            let (duration, title) = extinf.take().ok_or_else(|| at("segment without #EXTINF"))?;
            let uri = resolve(base, line)?;

            let byte_range = match byte_range.take() {
                None => None,
                Some((0, _)) => return Err(at("empty BYTERANGE")),
                Some((len, Some(offset))) => {
                    Some(ByteRange::sized(offset, len).ok_or_else(|| at("BYTERANGE overflows"))?)
                }
                Some((len, None)) => {
                    // Continues the previous sub-range of the same resource
                    let prev_end = segments
                        .last()
                        .filter(|s| s.uri == uri)
                        .and_then(|s| s.byte_range)
                        .and_then(|r| r.end)
                        .ok_or_else(|| at("BYTERANGE without offset and no previous sub-range"))?;
                    let next = prev_end
                        .checked_add(1)
                        .and_then(|start| ByteRange::sized(start, len))
                        .ok_or_else(|| at("BYTERANGE overflows"))?;
                    Some(next)
                }
            };

            segments.push(Segment {
                uri,
                duration,
                title,
                byte_range,
                discontinuity: std::mem::take(&mut discontinuity),
                sequence: 0,
            });
        }
    }

    let target_duration =
        target_duration.ok_or_else(|| Error::parse("media playlist without #EXT-X-TARGETDURATION"))?;

    for (i, segment) in segments.iter_mut().enumerate() {
        segment.sequence = media_sequence + i as u64;
    }

    Ok(MediaPlaylist {
        target_duration,
        media_sequence,
        segments,
        end_list,
    })
}

fn resolve(base: &Url, uri: &str) -> Result<Url> {
    base.join(uri)
        .map_err(|e| Error::parse(format!("invalid URI {:?}: {}", uri, e)))
}

/// Splits an attribute list (`KEY=value,KEY="quoted, value"`)
fn parse_attributes(list: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    let push = |item: &str, attrs: &mut Vec<(String, String)>| {
        if let Some((k, v)) = item.split_once('=') {
            attrs.push((k.trim().to_ascii_uppercase(), v.trim().trim_matches('"').to_string()));
        }
    };

    for c in list.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                push(&current, &mut attrs);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    push(&current, &mut attrs);
    attrs
}

fn attribute<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

// ============================================================================
// Rewriting
// ============================================================================

/// Rewrites every URI line of `text` into `prefix` + local reference
///
/// The whole playlist is validated first; a malformed playlist yields
/// [`Error::PlaylistParse`] and no output at all. Variant URIs of a master
/// playlist become `media/` references, URIs of a media playlist become
/// `seg/` references. All other lines, and every line terminator, are copied
/// unchanged.
pub fn rewrite_playlist(text: &str, base: &Url, prefix: &str) -> Result<(String, Playlist)> {
    let playlist = parse_playlist(text, base)?;
    let kind = if playlist.is_master() {
        RefKind::Media
    } else {
        RefKind::Segment
    };
    let body = rewrite_lines(text, base, prefix, kind)?;
    Ok((body, playlist))
}

/// Line substitution behind [`rewrite_playlist`], for text already validated
pub(crate) fn rewrite_lines(text: &str, base: &Url, prefix: &str, kind: RefKind) -> Result<String> {
    let mut out = String::with_capacity(text.len() + text.len() / 2);
    for raw in text.split_inclusive('\n') {
        let content = raw.trim_end_matches(['\n', '\r']);
        let ending = &raw[content.len()..];
        let trimmed = content.trim().trim_start_matches('\u{feff}');

        if is_uri_line(trimmed) {
            let local = LocalRef {
                kind,
                origin: resolve(base, trimmed)?,
            };
            out.push_str(prefix);
            out.push_str(&local.encode());
        } else {
            out.push_str(content);
        }
        out.push_str(ending);
    }
    Ok(out)
}

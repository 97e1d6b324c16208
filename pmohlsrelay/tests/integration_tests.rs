//! Integration tests for pmohlsrelay against a mock origin

use bytes::Bytes;
use pmohlsrelay::{
    ByteRange, Error, HlsRelay, LocalRef, OriginClient, RelaySettings, RetryPolicy,
    UpstreamSession,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MASTER: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-STREAM-INF:BANDWIDTH=128000,CODECS=\"mp4a.40.2\"\n\
chunklist_w42.m3u8?session=xyz\n";

const LIVE: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-MEDIA-SEQUENCE:7\n\
#EXTINF:10.0,title=\"Song\",artist=\"Artist\",url=\"https://img.test/cover.jpg\"\n\
a.aac\n\
#EXTINF:10.0,\n\
b.aac\n\
#EXTINF:10.0,\n\
c.aac\n";

const SEGMENT_A: &[u8] = b"AAAAAAAAAA";
const SEGMENT_B: &[u8] = b"BBBBBBBBBB";
const SEGMENT_C: &[u8] = b"CCCCCCCCCC";
const SEGMENT_D: &[u8] = b"DDDDDDDDDD";
const SEGMENT_E: &[u8] = b"EEEEEEEEEE";

fn settings(server: &MockServer, stream_path: &str) -> RelaySettings {
    settings_for(&format!("{}{}", server.uri(), stream_path))
}

fn settings_for(stream_url: &str) -> RelaySettings {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("pmohlsrelay=debug")
        .try_init();

    let url = Url::parse(stream_url).unwrap();
    let mut settings = RelaySettings::new(url);
    settings.station_name = "Test FM".to_string();
    settings.request_timeout = Duration::from_secs(2);
    settings.read_idle_timeout = Duration::from_secs(2);
    settings.max_retries = 2;
    settings.retry_base_delay = Duration::from_millis(1);
    settings
}

/// Mounts a media playlist at /live/playlist.m3u8 plus its three segments
async fn mount_live(server: &MockServer, playlist: &str) {
    Mock::given(method("GET"))
        .and(path("/live/playlist.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(playlist))
        .mount(server)
        .await;

    for (name, body) in [("a", SEGMENT_A), ("b", SEGMENT_B), ("c", SEGMENT_C)] {
        Mock::given(method("GET"))
            .and(path(format!("/live/{}.aac", name)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(server)
            .await;
    }
}

/// Live window of one-second segments named `<name>.aac`
fn live_window(sequence: u64, names: &[&str], end_list: bool) -> String {
    let mut playlist = format!(
        "#EXTM3U\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:{}\n",
        sequence
    );
    for name in names {
        playlist.push_str(&format!("#EXTINF:1.0,\n{}.aac\n", name));
    }
    if end_list {
        playlist.push_str("#EXT-X-ENDLIST\n");
    }
    playlist
}

async fn mount_segment(server: &MockServer, name: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/live/{}.aac", name)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

/// Segment references of a rewritten playlist, in order
fn segment_refs(body: &str) -> Vec<String> {
    body.lines()
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            l.rsplit_once("/seg/")
                .map(|(_, r)| r.to_string())
                .unwrap_or_else(|| panic!("not a segment reference: {}", l))
        })
        .collect()
}

async fn drain(mut rx: mpsc::Receiver<Bytes>) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = rx.recv().await {
        out.extend_from_slice(&chunk);
    }
    out
}

/// Splits an ICY body into its audio bytes and the metadata texts it carries
fn split_icy(body: &[u8], metaint: usize) -> (Vec<u8>, Vec<String>) {
    let mut audio = Vec::new();
    let mut titles = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let n = metaint.min(body.len() - pos);
        audio.extend_from_slice(&body[pos..pos + n]);
        pos += n;
        if n < metaint || pos >= body.len() {
            break;
        }
        let len = body[pos] as usize * 16;
        pos += 1;
        if len > 0 {
            let text = String::from_utf8_lossy(&body[pos..pos + len]);
            titles.push(text.trim_end_matches('\0').to_string());
        }
        pos += len;
    }
    (audio, titles)
}

#[tokio::test]
async fn test_concurrent_requests_share_one_handshake() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/live/playlist.m3u8"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "sid=abc; Path=/; Domain=.origin.test; Secure")
                .set_body_string(MASTER),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/live/chunklist_w42.m3u8"))
        .and(header("cookie", "sid=abc"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LIVE))
        .mount(&server)
        .await;

    let relay = Arc::new(HlsRelay::new(settings(&server, "/live/playlist.m3u8")).unwrap());

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let relay = relay.clone();
            tokio::spawn(async move { relay.get_live_playlist("/").await })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        let playlist = task.unwrap().unwrap();
        assert_eq!(segment_refs(&playlist.body).len(), 3);
    }

    assert_eq!(relay.session().handshake_count(), 1);
    let session = relay.session().acquire().await.unwrap();
    assert_eq!(session.bandwidth, Some(128000));
    assert_eq!(session.media_url.query(), Some("session=xyz"));
}

#[tokio::test]
async fn test_rewritten_playlist_relays_exact_bytes() {
    let server = MockServer::start().await;
    mount_live(&server, LIVE).await;

    let relay = HlsRelay::new(settings(&server, "/live/playlist.m3u8")).unwrap();
    let playlist = relay.get_live_playlist("/").await.unwrap();

    // Directives come through untouched, URIs are replaced
    let directives: Vec<&str> = playlist.body.lines().filter(|l| l.starts_with('#')).collect();
    let expected: Vec<&str> = LIVE.lines().filter(|l| l.starts_with('#')).collect();
    assert_eq!(directives, expected);
    assert!(playlist.body.lines().all(|l| l != "a.aac"));

    let refs = segment_refs(&playlist.body);
    assert_eq!(refs.len(), 3);
    assert!(refs.iter().all(|r| r.ends_with(".aac")));

    let first = LocalRef::parse(&format!("/seg/{}", refs[0])).unwrap();
    assert_eq!(first.origin.as_str(), format!("{}/live/a.aac", server.uri()));

    for (r, expected) in refs.iter().zip([SEGMENT_A, SEGMENT_B, SEGMENT_C]) {
        let segment = relay.get_segment(r, None).await.unwrap();
        assert_eq!(segment.status, 200);
        assert_eq!(segment.content_type, "audio/aac");
        assert_eq!(drain(segment.body).await, expected);
    }
}

#[tokio::test]
async fn test_range_request_on_ignoring_origin() {
    let server = MockServer::start().await;
    mount_live(&server, LIVE).await;

    let relay = HlsRelay::new(settings(&server, "/live/playlist.m3u8")).unwrap();
    let local = LocalRef::segment(Url::parse(&format!("{}/live/b.aac", server.uri())).unwrap());

    let segment = relay
        .get_segment(&local.file_name(), ByteRange::sized(2, 3))
        .await
        .unwrap();
    assert_eq!(segment.status, 206);
    assert_eq!(drain(segment.body).await, &SEGMENT_B[2..5]);
}

#[tokio::test]
async fn test_transient_origin_errors_are_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/live/a.aac"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    mount_live(&server, LIVE).await;

    let relay = HlsRelay::new(settings(&server, "/live/playlist.m3u8")).unwrap();
    let local = LocalRef::segment(Url::parse(&format!("{}/live/a.aac", server.uri())).unwrap());

    let segment = relay.get_segment(&local.file_name(), None).await.unwrap();
    assert_eq!(drain(segment.body).await, SEGMENT_A);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/live/gone.aac"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    mount_live(&server, LIVE).await;

    let relay = HlsRelay::new(settings(&server, "/live/playlist.m3u8")).unwrap();
    let local = LocalRef::segment(Url::parse(&format!("{}/live/gone.aac", server.uri())).unwrap());

    let err = relay.get_segment(&local.file_name(), None).await.unwrap_err();
    assert!(matches!(err, Error::SegmentNotFound(_)));
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn test_persistent_outage_is_upstream_unavailable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/live/playlist.m3u8"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let relay = HlsRelay::new(settings(&server, "/live/playlist.m3u8")).unwrap();
    let err = relay.get_live_playlist("/").await.unwrap_err();
    assert!(matches!(err, Error::UpstreamUnavailable(_)));
    assert_eq!(err.status_code(), 502);
}

#[tokio::test]
async fn test_rejected_session_is_renewed_once() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/live/playlist.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MASTER))
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/live/chunklist_w42.m3u8"))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/live/chunklist_w42.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LIVE))
        .mount(&server)
        .await;

    let relay = HlsRelay::new(settings(&server, "/live/playlist.m3u8")).unwrap();
    let playlist = relay.get_live_playlist("/").await.unwrap();

    assert_eq!(segment_refs(&playlist.body).len(), 3);
    assert_eq!(relay.session().handshake_count(), 2);
}

#[tokio::test]
async fn test_master_playlist_points_at_local_media() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/live/playlist.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MASTER))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/live/chunklist_w42.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LIVE))
        .mount(&server)
        .await;

    let relay = HlsRelay::new(settings(&server, "/live/playlist.m3u8")).unwrap();
    let master = relay.get_master_playlist("http://relay.test/").await.unwrap();
    assert!(master.playlist.is_master());

    let uri = master
        .body
        .lines()
        .find(|l| !l.starts_with('#'))
        .unwrap()
        .to_string();
    let variant_ref = uri
        .strip_prefix("http://relay.test/media/")
        .unwrap_or_else(|| panic!("unexpected variant URI {}", uri));

    let media = relay
        .get_media_playlist(variant_ref, "http://relay.test/")
        .await
        .unwrap();
    assert!(!media.playlist.is_master());
    assert!(media
        .body
        .lines()
        .filter(|l| !l.starts_with('#'))
        .all(|l| l.starts_with("http://relay.test/seg/")));
}

#[tokio::test]
async fn test_icy_stream_injects_metadata_across_segments() {
    let server = MockServer::start().await;
    mount_live(&server, &format!("{}#EXT-X-ENDLIST\n", LIVE)).await;

    let mut settings = settings(&server, "/live/playlist.m3u8");
    settings.icy_metaint = 8;
    settings.live_edge_segments = 3;
    let relay = HlsRelay::new(settings).unwrap();

    let stream = relay.get_icy_stream(true).await.unwrap();
    assert_eq!(stream.headers.metaint, Some(8));
    assert_eq!(stream.headers.content_type, "audio/aac");

    let body = drain(stream.body).await;
    let (audio, titles) = split_icy(&body, 8);

    assert_eq!(audio, [SEGMENT_A, SEGMENT_B, SEGMENT_C].concat());
    // First block carries the title, the next two are "unchanged" zero bytes
    assert_eq!(titles, vec!["StreamTitle='Test FM - Live Stream';".to_string()]);
    assert_eq!(body.len(), 30 + (1 + 48) + 1 + 1);
}

#[tokio::test]
async fn test_icy_stream_without_metadata_is_plain_audio() {
    let server = MockServer::start().await;
    mount_live(&server, &format!("{}#EXT-X-ENDLIST\n", LIVE)).await;

    let mut settings = settings(&server, "/live/playlist.m3u8");
    settings.live_edge_segments = 2;
    let relay = HlsRelay::new(settings).unwrap();

    let stream = relay.get_icy_stream(false).await.unwrap();
    assert_eq!(stream.headers.metaint, None);
    assert_eq!(drain(stream.body).await, [SEGMENT_B, SEGMENT_C].concat());
}

#[tokio::test]
async fn test_now_playing_from_playlist() {
    let server = MockServer::start().await;
    mount_live(&server, LIVE).await;

    let relay = HlsRelay::new(settings(&server, "/live/playlist.m3u8")).unwrap();
    assert!(relay.tracker().refresh().await);

    let now = relay.get_now_playing();
    assert_eq!(now.artist, "Artist");
    assert_eq!(now.title, "Song");
    assert_eq!(now.artwork.as_deref(), Some("https://img.test/cover.jpg"));
    assert!(now.fetched_at.is_some());
}

#[tokio::test]
async fn test_now_playing_survives_origin_failure() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/live/playlist.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LIVE))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/live/playlist.m3u8"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let relay = HlsRelay::new(settings(&server, "/live/playlist.m3u8")).unwrap();
    // Handshake + first playlist fetch
    assert!(relay.tracker().refresh().await);
    assert!(!relay.tracker().refresh().await);

    let now = relay.get_now_playing();
    assert_eq!(now.artist, "Artist");
    assert_eq!(now.title, "Song");
}

#[tokio::test]
async fn test_icy_counter_spans_playlist_refetch() {
    let server = MockServer::start().await;

    // Handshake + initial fetch see [a,b], the refresh adds c and ends
    Mock::given(method("GET"))
        .and(path("/live/playlist.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(live_window(7, &["a", "b"], false)))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/live/playlist.m3u8"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(live_window(7, &["a", "b", "c"], true)),
        )
        .mount(&server)
        .await;
    for (name, body) in [("a", SEGMENT_A), ("b", SEGMENT_B), ("c", SEGMENT_C)] {
        mount_segment(&server, name, body).await;
    }

    let mut settings = settings(&server, "/live/playlist.m3u8");
    settings.icy_metaint = 7;
    settings.live_edge_segments = 3;
    let relay = HlsRelay::new(settings).unwrap();

    let stream = relay.get_icy_stream(true).await.unwrap();
    let body = tokio::time::timeout(Duration::from_secs(10), drain(stream.body))
        .await
        .expect("stream did not end");
    let (audio, titles) = split_icy(&body, 7);

    assert_eq!(audio, [SEGMENT_A, SEGMENT_B, SEGMENT_C].concat());
    assert_eq!(titles, vec!["StreamTitle='Test FM - Live Stream';".to_string()]);
    // Blocks after 7, 14, 21 and 28 audio bytes
    assert_eq!(body.len(), 30 + (1 + 48) + 3);
}

#[tokio::test]
async fn test_icy_stream_follows_sequence_restart() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/live/playlist.m3u8"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(live_window(100, &["a", "b"], false)),
        )
        .up_to_n_times(2)
        .mount(&server)
        .await;
    // Origin restarted its numbering
    Mock::given(method("GET"))
        .and(path("/live/playlist.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(live_window(0, &["d", "e"], true)))
        .mount(&server)
        .await;
    for (name, body) in [("a", SEGMENT_A), ("b", SEGMENT_B), ("d", SEGMENT_D), ("e", SEGMENT_E)] {
        mount_segment(&server, name, body).await;
    }

    let mut settings = settings(&server, "/live/playlist.m3u8");
    settings.live_edge_segments = 3;
    let relay = HlsRelay::new(settings).unwrap();

    let stream = relay.get_icy_stream(false).await.unwrap();
    let body = tokio::time::timeout(Duration::from_secs(5), drain(stream.body))
        .await
        .expect("stream stalled after the sequence restart");
    assert_eq!(body, [SEGMENT_A, SEGMENT_B, SEGMENT_D, SEGMENT_E].concat());
}

#[tokio::test]
async fn test_icy_stream_gives_up_on_frozen_window() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/live/playlist.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(live_window(7, &["a", "b"], false)))
        .mount(&server)
        .await;
    mount_segment(&server, "a", SEGMENT_A).await;
    mount_segment(&server, "b", SEGMENT_B).await;

    let relay = HlsRelay::new(settings(&server, "/live/playlist.m3u8")).unwrap();
    let stream = relay.get_icy_stream(false).await.unwrap();

    // Three stalls of a few half-second polls each, then the stream closes
    let body = tokio::time::timeout(Duration::from_secs(30), drain(stream.body))
        .await
        .expect("frozen live window kept the stream open");
    assert_eq!(body, [SEGMENT_A, SEGMENT_B].concat());
}

#[tokio::test]
async fn test_client_disconnect_releases_upstream_without_retry() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/live/big.aac"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 4 * 1024 * 1024]))
        .expect(1)
        .mount(&server)
        .await;
    mount_live(&server, LIVE).await;

    let relay = HlsRelay::new(settings(&server, "/live/playlist.m3u8")).unwrap();
    let local = LocalRef::segment(Url::parse(&format!("{}/live/big.aac", server.uri())).unwrap());

    let mut segment = relay.get_segment(&local.file_name(), None).await.unwrap();
    assert!(segment.body.recv().await.is_some());
    drop(segment);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let requests = server.received_requests().await.unwrap();
    let fetches = requests
        .iter()
        .filter(|r| r.url.path() == "/live/big.aac")
        .count();
    assert_eq!(fetches, 1);
}

/// Origin whose first segment response breaks after four of its ten bytes;
/// later requests honour `Range: bytes=4-`. Returns the base URL and the
/// `Range` header of every segment request.
async fn breaking_origin() -> (String, Arc<Mutex<Vec<Option<String>>>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let ranges = Arc::new(Mutex::new(Vec::new()));
    let seen = ranges.clone();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let seen = seen.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&request).to_string();
                let target = request.split_whitespace().nth(1).unwrap_or("").to_string();
                let range = request.lines().find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.trim()
                        .eq_ignore_ascii_case("range")
                        .then(|| value.trim().to_string())
                });

                let response = if target.ends_with(".m3u8") {
                    let body = "#EXTM3U\n#EXT-X-TARGETDURATION:1\n#EXTINF:1.0,\nseg.aac\n";
                    format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    )
                } else {
                    seen.lock().unwrap().push(range.clone());
                    match range.as_deref() {
                        Some("bytes=4-") => "HTTP/1.1 206 Partial Content\r\n\
                            content-range: bytes 4-9/10\r\ncontent-length: 6\r\n\
                            connection: close\r\n\r\n456789"
                            .to_string(),
                        _ => "HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\
                            connection: close\r\n\r\n0123"
                            .to_string(),
                    }
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (base, ranges)
}

#[tokio::test]
async fn test_broken_body_resumes_at_first_missing_byte() {
    let (base, ranges) = breaking_origin().await;

    let relay = HlsRelay::new(settings_for(&format!("{}/live.m3u8", base))).unwrap();
    let local = LocalRef::segment(Url::parse(&format!("{}/seg.aac", base)).unwrap());

    let segment = relay.get_segment(&local.file_name(), None).await.unwrap();
    assert_eq!(segment.status, 200);
    assert_eq!(drain(segment.body).await, b"0123456789");
    assert_eq!(
        *ranges.lock().unwrap(),
        vec![None, Some("bytes=4-".to_string())]
    );
}

#[tokio::test]
async fn test_stale_session_is_served_within_grace_only() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/live/playlist.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MASTER))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/live/playlist.m3u8"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = OriginClient::builder()
        .request_timeout(Duration::from_secs(2))
        .retry_policy(RetryPolicy::none())
        .build()
        .unwrap();
    let url = Url::parse(&format!("{}/live/playlist.m3u8", server.uri())).unwrap();
    let session = UpstreamSession::new(client, url)
        .with_ttl(Duration::from_millis(100), Duration::from_millis(400));

    let first = session.acquire().await.unwrap();

    // Expired, refresh fails, still inside TTL + grace
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stale = session.acquire().await.unwrap();
    assert!(Arc::ptr_eq(&first, &stale));

    // Past TTL + grace
    tokio::time::sleep(Duration::from_millis(400)).await;
    let err = session.acquire().await.unwrap_err();
    assert!(matches!(err, Error::UpstreamUnavailable(_)));
    assert_eq!(session.handshake_count(), 3);
}

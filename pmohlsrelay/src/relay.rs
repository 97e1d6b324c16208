//! Segment relaying
//!
//! Streams origin segment bodies to a [`ByteSink`] as they arrive, without
//! buffering whole segments. Transient origin failures are retried with
//! backoff; when a failure interrupts a body, the retry asks the origin for
//! the remaining bytes only, so the sink never sees a byte twice.
//!
//! A sink that stops accepting data ends the relay immediately with
//! [`Error::ClientDisconnected`]: the origin response is dropped (which
//! releases the upstream connection) and nothing is retried.

use crate::error::{Error, Result};
use crate::hls::{LocalRef, RefKind};
use crate::models::{content_type_for, ByteRange};
use crate::session::UpstreamSession;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

/// Capacity (in chunks) of the channel behind [`SegmentRelay::open`]
pub const SEGMENT_CHANNEL_CAPACITY: usize = 16;

/// Destination of relayed bytes
///
/// `write` applies backpressure by awaiting; an error means the consumer is
/// gone and must be reported as [`Error::ClientDisconnected`].
#[async_trait]
pub trait ByteSink: Send + Sync {
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Resolves once the consumer has gone away
    ///
    /// Lets the relay notice a disconnect while it is still waiting on the
    /// origin. Sinks that cannot tell never resolve.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

#[async_trait]
impl ByteSink for mpsc::Sender<Bytes> {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.send(chunk)
            .await
            .map_err(|_| Error::ClientDisconnected)
    }

    async fn closed(&self) {
        mpsc::Sender::closed(self).await
    }
}

#[async_trait]
impl ByteSink for Vec<u8> {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.extend_from_slice(&chunk);
        Ok(())
    }
}

/// Part of a response body that belongs to the caller
///
/// An origin that ignores a `Range` request answers 200 with the whole
/// resource; the window then skips the prefix and stops after the range.
#[derive(Debug, Clone, Copy)]
struct BodyWindow {
    skip: u64,
    remaining: Option<u64>,
}

impl BodyWindow {
    fn for_response(status: StatusCode, requested: Option<ByteRange>) -> Self {
        match requested {
            Some(range) if status != StatusCode::PARTIAL_CONTENT => Self {
                skip: range.start,
                remaining: range.len(),
            },
            _ => Self {
                skip: 0,
                remaining: None,
            },
        }
    }

    /// Trims `chunk` to the window, advancing it
    fn apply(&mut self, mut chunk: Bytes) -> Option<Bytes> {
        if self.skip > 0 {
            let n = (self.skip).min(chunk.len() as u64);
            self.skip -= n;
            chunk = chunk.slice(n as usize..);
        }
        if let Some(remaining) = self.remaining.as_mut() {
            let n = (*remaining).min(chunk.len() as u64);
            *remaining -= n;
            chunk.truncate(n as usize);
        }
        if chunk.is_empty() { None } else { Some(chunk) }
    }

    fn is_done(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// An opened segment: response metadata plus a body channel
#[derive(Debug)]
pub struct OpenedSegment {
    /// 200, or 206 when a range was requested
    pub status: u16,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    /// Body chunks; closed when the segment is complete or the relay failed
    pub body: mpsc::Receiver<Bytes>,
}

/// Relays segment bytes from the origin to callers
#[derive(Debug, Clone)]
pub struct SegmentRelay {
    session: Arc<UpstreamSession>,
}

impl SegmentRelay {
    pub fn new(session: Arc<UpstreamSession>) -> Self {
        Self { session }
    }

    /// Streams the segment behind `local` into `sink`, returning the number
    /// of bytes delivered
    pub async fn relay<S>(
        &self,
        local: &LocalRef,
        range: Option<ByteRange>,
        sink: &mut S,
    ) -> Result<u64>
    where
        S: ByteSink + ?Sized,
    {
        check_segment_ref(local)?;
        self.relay_url(&local.origin, range, sink).await
    }

    /// Streams an origin URL into `sink`
    pub async fn relay_url<S>(
        &self,
        url: &Url,
        range: Option<ByteRange>,
        sink: &mut S,
    ) -> Result<u64>
    where
        S: ByteSink + ?Sized,
    {
        let session = self.session.acquire().await?;
        self.run(url, &session.headers, range, None, sink).await
    }

    /// Opens the segment behind `local` and relays it in a background task
    ///
    /// The first origin response is awaited here so that its status and
    /// headers can be returned; body chunks then flow through
    /// [`OpenedSegment::body`]. Dropping the receiver stops the task.
    pub async fn open(&self, local: &LocalRef, range: Option<ByteRange>) -> Result<OpenedSegment> {
        check_segment_ref(local)?;
        let url = local.origin.clone();
        let session = self.session.acquire().await?;
        let headers = session.headers.clone();
        let client = self.session.client();

        let response = client
            .with_retry(url.as_str(), || client.send(&url, &headers, range))
            .await?;

        let status = response.status();
        let origin_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|t| !t.starts_with("application/octet-stream"))
            .map(str::to_string);
        let origin_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let (status, content_length, content_range) = match range {
            None => (200, origin_length, None),
            Some(_) if status == StatusCode::PARTIAL_CONTENT => (
                206,
                origin_length,
                response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
            ),
            Some(r) => {
                // The origin ignored the range: the window is applied locally
                match origin_length {
                    Some(total) if total > r.start => {
                        let end = r.end.map_or(total - 1, |e| e.min(total - 1));
                        (
                            206,
                            Some(end + 1 - r.start),
                            Some(format!("bytes {}-{}/{}", r.start, end, total)),
                        )
                    }
                    Some(total) => {
                        return Err(Error::not_found(format!(
                            "range {} beyond end of {} ({} bytes)",
                            r.to_header(),
                            url,
                            total
                        )));
                    }
                    None => (206, r.len(), None),
                }
            }
        };

        let (tx, rx) = mpsc::channel(SEGMENT_CHANNEL_CAPACITY);
        let relay = self.clone();
        let task_url = url.clone();
        tokio::spawn(async move {
            let mut tx = tx;
            match relay
                .run(&task_url, &headers, range, Some(response), &mut tx)
                .await
            {
                Ok(n) => debug!(url = %task_url, bytes = n, "Segment relayed"),
                Err(Error::ClientDisconnected) => {
                    debug!(url = %task_url, "Client went away during segment")
                }
                Err(e) => warn!(url = %task_url, error = %e, "Segment relay aborted"),
            }
        });

        Ok(OpenedSegment {
            status,
            content_type: origin_type.unwrap_or_else(|| content_type_for(&url).to_string()),
            content_length,
            content_range,
            body: rx,
        })
    }

    /// Fetch-and-stream loop with resumption
    ///
    /// `first` is an already obtained response for the initial attempt.
    async fn run<S>(
        &self,
        url: &Url,
        headers: &HeaderMap,
        range: Option<ByteRange>,
        mut first: Option<Response>,
        sink: &mut S,
    ) -> Result<u64>
    where
        S: ByteSink + ?Sized,
    {
        let client = self.session.client();
        let policy = client.retry_policy();
        let mut delivered = 0u64;
        let mut attempt = 0u32;

        loop {
            let requested = match (range, delivered) {
                (Some(r), n) => match r.advance(n) {
                    Some(rest) => Some(rest),
                    None => return Ok(delivered),
                },
                (None, 0) => None,
                (None, n) => Some(ByteRange::from(n)),
            };

            let outcome = match first.take() {
                Some(response) => self.pump(response, requested, sink, &mut delivered).await,
                None => match client.send(url, headers, requested).await {
                    Ok(response) => self.pump(response, requested, sink, &mut delivered).await,
                    Err(e) => Err(e),
                },
            };

            match outcome {
                Ok(()) => return Ok(delivered),
                Err(Error::ClientDisconnected) => {
                    info!(url = %url, bytes = delivered, "Client disconnected, releasing upstream");
                    return Err(Error::ClientDisconnected);
                }
                // Resuming exactly at the end of the resource
                Err(Error::UpstreamStatus { status: 416, .. }) if delivered > 0 => {
                    return Ok(delivered);
                }
                Err(e) if e.is_transient() && attempt < policy.max_retries => {
                    let delay = policy.delay_for(attempt);
                    attempt += 1;
                    warn!(url = %url, attempt, delivered, error = %e, ?delay, "Segment fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(Error::upstream(format!(
                        "{} failed after {} attempts: {}",
                        url,
                        attempt + 1,
                        e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Copies one response body into `sink`, counting delivered bytes
    async fn pump<S>(
        &self,
        mut response: Response,
        requested: Option<ByteRange>,
        sink: &mut S,
        delivered: &mut u64,
    ) -> Result<()>
    where
        S: ByteSink + ?Sized,
    {
        let client = self.session.client();
        let mut window = BodyWindow::for_response(response.status(), requested);

        while !window.is_done() {
            let next = tokio::select! {
                chunk = client.next_chunk(&mut response) => chunk?,
                _ = sink.closed() => return Err(Error::ClientDisconnected),
            };
            let Some(chunk) = next else {
                return Ok(());
            };
            if let Some(chunk) = window.apply(chunk) {
                let n = chunk.len() as u64;
                sink.write(chunk).await?;
                *delivered += n;
            }
        }
        Ok(())
    }
}

fn check_segment_ref(local: &LocalRef) -> Result<()> {
    if local.kind != RefKind::Segment {
        return Err(Error::not_found(format!(
            "not a segment reference: {}",
            local.encode()
        )));
    }
    Ok(())
}

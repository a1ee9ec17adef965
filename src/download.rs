// Copyright (c) 2024-2025 Federico G. Schwindt <fgsch@lodoss.net>
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use futures::StreamExt as _;
use reqwest::{StatusCode, header};
use serde::Serialize;
use std::{error::Error as _, fmt, time::Duration};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::progress::{DownloadProgress, ProgressSender};
use crate::range::{RangeRequest, parse_content_range};
use crate::writer::{ChunkSink, WriteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One network attempt of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId {
    pub session: SessionId,
    pub attempt: u32,
}

/// Bytes moved over the network by one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySample {
    pub segment: SegmentId,
    pub bytes_transferred: u64,
}

/// Notifications emitted while a session runs.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// The first response headers arrived.
    Started {
        session: SessionId,
        offset: u64,
        expected: Option<u64>,
        resource_size: Option<u64>,
    },
    /// `len` bytes were written at `offset` of the destination.
    Chunk {
        session: SessionId,
        offset: u64,
        len: u64,
        progress: DownloadProgress,
    },
    Segment(TelemetrySample),
    Finished {
        session: SessionId,
        summary: String,
    },
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Client error {status}: not retrying")]
    Client { status: StatusCode },
    #[error("Requested range is not satisfiable")]
    NotSatisfiable { total: Option<u64> },
    #[error("HTTP error {status}: failed after {retries} retries")]
    Http { status: StatusCode, retries: usize },
    #[error("Network error {error}: failed after {retries} retries")]
    Network { error: String, retries: usize },
    #[error("No data for {after:?}: failed after {retries} retries")]
    Stalled { after: Duration, retries: usize },
    #[error("Body ended after {received} of {expected} bytes: failed after {retries} retries")]
    Truncated {
        received: u64,
        expected: u64,
        retries: usize,
    },
    #[error("Server sent more than the announced {expected} bytes")]
    Overflow { expected: u64 },
    #[error("Server answered {requested} with {status}")]
    RangeIgnored { requested: String, status: StatusCode },
    #[error("Invalid Content-Range {value:?}")]
    BadContentRange { value: String },
    #[error(transparent)]
    Storage(#[from] WriteError),
    #[error("Transfer task failed: {0}")]
    Task(String),
}

impl DownloadError {
    fn with_retries(mut self, count: usize) -> Self {
        match &mut self {
            DownloadError::Http { retries, .. }
            | DownloadError::Network { retries, .. }
            | DownloadError::Stalled { retries, .. }
            | DownloadError::Truncated { retries, .. } => *retries = count,
            _ => {}
        }
        self
    }
}

/// Internal error classification for retry logic
#[derive(Debug)]
enum InternalDownloadError {
    /// Fatal error that should not be retried
    Fatal(DownloadError),
    /// Retriable error that may succeed on retry
    Retriable(DownloadError),
    /// The session was cancelled
    Cancelled,
}

#[derive(Debug)]
pub enum TransferOutcome {
    Completed,
    Cancelled,
    Failed(DownloadError),
}

/// Terminal state of a session.
#[derive(Debug)]
pub struct TransferReport {
    pub session: SessionId,
    pub received: u64,
    pub expected: Option<u64>,
    pub outcome: TransferOutcome,
}

impl TransferReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, TransferOutcome::Completed)
    }

    /// Human-readable reason for the presentation layer.
    pub fn summary(&self) -> String {
        match &self.outcome {
            TransferOutcome::Completed => {
                format!("Session {} completed: {} bytes", self.session, self.received)
            }
            TransferOutcome::Cancelled => format!(
                "Session {} cancelled after {} bytes",
                self.session, self.received
            ),
            TransferOutcome::Failed(err) => format!(
                "Session {} failed after {} bytes: {err}",
                self.session, self.received
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Attempts per session, including the first one.
    pub max_retries: usize,
    /// Longest wait for the next chunk before the attempt fails.
    pub stall_timeout: Duration,
    /// Delay before the first retry; doubled on each following one.
    pub retry_backoff: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            stall_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Bookkeeping for one in-flight window of a resource.
#[derive(Debug)]
pub struct TransferSession<W> {
    id: SessionId,
    window: Option<RangeRequest>,
    expected: Option<u64>,
    received: u64,
    started: bool,
    destination: W,
}

impl<W: ChunkSink> TransferSession<W> {
    /// `window` of `None` fetches the whole resource without a `Range` header.
    pub fn new(id: SessionId, window: Option<RangeRequest>, destination: W) -> Self {
        Self {
            id,
            window,
            expected: None,
            received: 0,
            started: false,
            destination,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Resource offset of the first byte of the window.
    pub fn offset(&self) -> u64 {
        self.window.map_or(0, |window| window.start)
    }

    pub fn progress(&self) -> DownloadProgress {
        DownloadProgress {
            received: self.received,
            expected: self.expected,
        }
    }

    /// Range to ask for so that the transfer continues where it stopped.
    fn next_request(&self) -> Option<RangeRequest> {
        match self.window {
            None if self.received == 0 => None,
            None => Some(RangeRequest::starting_at(self.received)),
            Some(window) => Some(window.advanced(self.received)),
        }
    }

    async fn accept_chunk(&mut self, chunk: &[u8]) -> Result<DownloadProgress, DownloadError> {
        let len = chunk.len() as u64;
        if let Some(expected) = self.expected
            && self.received + len > expected
        {
            return Err(DownloadError::Overflow { expected });
        }
        self.destination.write_chunk(chunk).await?;
        self.received += len;
        Ok(self.progress())
    }

    /// Release the destination and produce the terminal report.
    pub async fn finalize(mut self, outcome: TransferOutcome) -> TransferReport {
        let outcome = match (self.destination.finish().await, outcome) {
            (Ok(()), outcome) => outcome,
            (Err(err), TransferOutcome::Completed) => {
                TransferOutcome::Failed(DownloadError::Storage(err))
            }
            (Err(err), outcome) => {
                tracing::warn!("Session {}: releasing destination failed: {err}", self.id);
                outcome
            }
        };
        TransferReport {
            session: self.id,
            received: self.received,
            expected: self.expected,
            outcome,
        }
    }
}

fn network_error(err: reqwest::Error) -> InternalDownloadError {
    InternalDownloadError::Retriable(DownloadError::Network {
        error: err
            .source()
            .map(|e| e.to_string())
            .unwrap_or_else(|| err.to_string()),
        retries: 0,
    })
}

/// Window length and resource size announced by a response.
fn announced_lengths(
    response: &reqwest::Response,
    requested: Option<RangeRequest>,
) -> Result<(Option<u64>, Option<u64>), InternalDownloadError> {
    let status = response.status();
    if status == StatusCode::PARTIAL_CONTENT {
        let value = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let content_range = parse_content_range(value).ok_or_else(|| {
            InternalDownloadError::Fatal(DownloadError::BadContentRange {
                value: value.to_string(),
            })
        })?;
        let requested_start = requested.map_or(0, |range| range.start);
        if content_range.start != requested_start {
            return Err(InternalDownloadError::Fatal(DownloadError::BadContentRange {
                value: value.to_string(),
            }));
        }
        return Ok((Some(content_range.len()), content_range.total));
    }

    // A full response is only usable when the whole resource was wanted.
    if let Some(range) = requested
        && (range.start > 0 || range.end.is_some())
    {
        return Err(InternalDownloadError::Fatal(DownloadError::RangeIgnored {
            requested: range.to_string(),
            status,
        }));
    }
    let length = response.content_length();
    Ok((length, length))
}

async fn transfer_once<W: ChunkSink>(
    client: &reqwest::Client,
    url: &str,
    session: &mut TransferSession<W>,
    attempt: u32,
    options: &DownloadOptions,
    events: &ProgressSender,
    token: &CancellationToken,
) -> Result<(), InternalDownloadError> {
    let requested = session.next_request();
    let mut request = client.get(url);
    if let Some(range) = requested {
        request = request.header(header::RANGE, range.to_string());
    }

    let response = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(InternalDownloadError::Cancelled),
        response = request.send() => response.map_err(network_error)?,
    };

    match response.status() {
        StatusCode::OK | StatusCode::PARTIAL_CONTENT => {}
        StatusCode::RANGE_NOT_SATISFIABLE => {
            let total = response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("bytes */"))
                .and_then(|total| total.parse().ok());
            return Err(InternalDownloadError::Fatal(DownloadError::NotSatisfiable {
                total,
            }));
        }
        status @ (StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS) => {
            return Err(InternalDownloadError::Retriable(DownloadError::Http {
                status,
                retries: 0,
            }));
        }
        status if status.is_client_error() => {
            return Err(InternalDownloadError::Fatal(DownloadError::Client { status }));
        }
        status => {
            return Err(InternalDownloadError::Retriable(DownloadError::Http {
                status,
                retries: 0,
            }));
        }
    }

    let (window_length, resource_size) = announced_lengths(&response, requested)?;
    if session.expected.is_none() {
        session.expected = window_length.map(|length| session.received + length);
    }
    if !session.started {
        session.started = true;
        tracing::info!(
            "Session {}: receiving {} from offset {}",
            session.id,
            session
                .expected
                .map_or_else(|| "unknown length".to_string(), |len| format!("{len} bytes")),
            session.offset()
        );
        let _ = events.send(
            TransferEvent::Started {
                session: session.id,
                offset: session.offset(),
                expected: session.expected,
                resource_size,
            }
            .into(),
        );
    }

    let mut stream = response.bytes_stream();
    let mut transferred = 0u64;
    let result = loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break Err(InternalDownloadError::Cancelled),
            next = timeout(options.stall_timeout, stream.next()) => next,
        };
        let chunk = match next {
            Err(_) => {
                break Err(InternalDownloadError::Retriable(DownloadError::Stalled {
                    after: options.stall_timeout,
                    retries: 0,
                }));
            }
            Ok(None) => break Ok(()),
            Ok(Some(Err(err))) => break Err(network_error(err)),
            Ok(Some(Ok(chunk))) => chunk,
        };

        let offset = session.offset() + session.received;
        let progress = match session.accept_chunk(&chunk).await {
            Ok(progress) => progress,
            Err(err) => break Err(InternalDownloadError::Fatal(err)),
        };
        transferred += chunk.len() as u64;
        tracing::debug!(
            "Session {}: {} bytes at {offset} ({}/{:?})",
            session.id,
            chunk.len(),
            progress.received,
            progress.expected
        );
        let _ = events.send(
            TransferEvent::Chunk {
                session: session.id,
                offset,
                len: chunk.len() as u64,
                progress,
            }
            .into(),
        );
    };

    let _ = events.send(
        TransferEvent::Segment(TelemetrySample {
            segment: SegmentId {
                session: session.id,
                attempt,
            },
            bytes_transferred: transferred,
        })
        .into(),
    );
    result?;

    match session.expected {
        Some(expected) if session.received < expected => {
            Err(InternalDownloadError::Retriable(DownloadError::Truncated {
                received: session.received,
                expected,
                retries: 0,
            }))
        }
        _ => Ok(()),
    }
}

async fn run_attempts<W: ChunkSink>(
    client: &reqwest::Client,
    url: &str,
    session: &mut TransferSession<W>,
    options: &DownloadOptions,
    events: &ProgressSender,
    token: &CancellationToken,
) -> TransferOutcome {
    let max_retries = options.max_retries.max(1);
    for retry in 1..=max_retries {
        match transfer_once(client, url, session, retry as u32, options, events, token).await {
            Ok(()) => return TransferOutcome::Completed,
            Err(InternalDownloadError::Cancelled) => return TransferOutcome::Cancelled,
            Err(InternalDownloadError::Fatal(err)) => return TransferOutcome::Failed(err),
            Err(InternalDownloadError::Retriable(err)) => {
                if retry == max_retries {
                    return TransferOutcome::Failed(err.with_retries(max_retries));
                }
                // Exponential backoff before retry
                let delay = options.retry_backoff * 2u32.pow(retry as u32 - 1);
                tracing::warn!(
                    "Session {}: attempt {retry} failed: {err}; resuming at byte {} in {delay:?}",
                    session.id,
                    session.offset() + session.received
                );
                tokio::select! {
                    _ = token.cancelled() => return TransferOutcome::Cancelled,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    unreachable!()
}

/// Run `session` against `url` to a terminal state.
///
/// The destination is released exactly once, whatever the outcome, and a
/// `Finished` event carrying the report summary is emitted last.
pub async fn transfer<W: ChunkSink>(
    client: &reqwest::Client,
    url: &str,
    mut session: TransferSession<W>,
    options: &DownloadOptions,
    events: &ProgressSender,
    token: &CancellationToken,
) -> TransferReport {
    let outcome = run_attempts(client, url, &mut session, options, events, token).await;
    let report = session.finalize(outcome).await;

    let summary = report.summary();
    match &report.outcome {
        TransferOutcome::Failed(_) => tracing::error!("{summary}"),
        _ => tracing::info!("{summary}"),
    }
    let _ = events.send(
        TransferEvent::Finished {
            session: report.session,
            summary,
        }
        .into(),
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressEvent;
    use crate::server::{DEFAULT_CHUNK_SIZE, MediaResource, router};
    use crate::test_support::{
        flaky_router, media_bytes, media_fixture, spawn_server, throttled_router,
    };
    use crate::writer::RangeFileWriter;
    use async_trait::async_trait;
    use mockito::Server;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn test_options() -> DownloadOptions {
        DownloadOptions {
            max_retries: 3,
            stall_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(1),
        }
    }

    /// In-memory sink that counts how often it is released.
    #[derive(Clone, Default)]
    struct CountingSink {
        written: Arc<Mutex<Vec<u8>>>,
        finished: Arc<AtomicUsize>,
        fail_writes: bool,
    }

    #[async_trait]
    impl ChunkSink for CountingSink {
        async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), WriteError> {
            if self.fail_writes {
                return Err(WriteError::Write {
                    path: "memory".to_string(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.written.lock().unwrap().extend_from_slice(chunk);
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), WriteError> {
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn drain(receiver: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            if let ProgressEvent::Transfer(event) = event {
                events.push(event);
            }
        }
        events
    }

    async fn media_server(size: usize) -> (TempDir, Vec<u8>, String) {
        let (dir, path, data) = media_fixture(size);
        let resource = MediaResource::open(&path, None).await.unwrap();
        let base = spawn_server(router(resource, "/video", DEFAULT_CHUNK_SIZE)).await;
        (dir, data, format!("{base}/video"))
    }

    #[tokio::test]
    async fn full_download_is_byte_exact() {
        let (dir, data, url) = media_server(300_000).await;
        let destination = dir.path().join("copy.mp4");
        let (events, mut receiver) = mpsc::unbounded_channel();

        let writer = RangeFileWriter::open(&destination, 0, true).await.unwrap();
        let session = TransferSession::new(SessionId(1), None, writer);
        let report = transfer(
            &reqwest::Client::new(),
            &url,
            session,
            &test_options(),
            &events,
            &CancellationToken::new(),
        )
        .await;

        assert!(report.is_completed(), "{}", report.summary());
        assert_eq!(report.expected, Some(300_000));
        assert_eq!(report.received, 300_000);
        assert_eq!(std::fs::read(&destination).unwrap(), data);

        let events = drain(&mut receiver);
        assert!(matches!(
            events.first(),
            Some(TransferEvent::Started {
                offset: 0,
                expected: Some(300_000),
                resource_size: Some(300_000),
                ..
            })
        ));
        let fractions: Vec<f64> = events
            .iter()
            .filter_map(|event| match event {
                TransferEvent::Chunk { progress, .. } => progress.fraction(),
                _ => None,
            })
            .collect();
        assert!(!fractions.is_empty());
        assert!(fractions.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(fractions.last(), Some(&1.0));
        assert!(events.contains(&TransferEvent::Segment(TelemetrySample {
            segment: SegmentId {
                session: SessionId(1),
                attempt: 1
            },
            bytes_transferred: 300_000,
        })));
        assert!(matches!(events.last(), Some(TransferEvent::Finished { .. })));
    }

    #[tokio::test]
    async fn range_download_lands_at_its_offset() {
        let (dir, data, url) = media_server(300_000).await;
        let destination = dir.path().join("copy.mp4");
        let (events, mut receiver) = mpsc::unbounded_channel();

        let window = RangeRequest {
            start: 100_000,
            end: Some(199_999),
        };
        let writer = RangeFileWriter::open(&destination, window.start, true)
            .await
            .unwrap();
        let session = TransferSession::new(SessionId(7), Some(window), writer);
        let report = transfer(
            &reqwest::Client::new(),
            &url,
            session,
            &test_options(),
            &events,
            &CancellationToken::new(),
        )
        .await;

        assert!(report.is_completed(), "{}", report.summary());
        assert_eq!(report.received, 100_000);
        assert_eq!(report.expected, Some(100_000));
        let copy = std::fs::read(&destination).unwrap();
        assert_eq!(copy.len(), 200_000);
        assert_eq!(&copy[100_000..], &data[100_000..200_000]);

        let started = drain(&mut receiver).into_iter().next();
        assert_eq!(
            started,
            Some(TransferEvent::Started {
                session: SessionId(7),
                offset: 100_000,
                expected: Some(100_000),
                resource_size: Some(300_000),
            })
        );
    }

    #[tokio::test]
    async fn resumes_after_dropped_connection() {
        let data = media_bytes(200_000);
        let (app, requests) = flaky_router(data.clone());
        let url = format!("{}/video", spawn_server(app).await);
        let (events, mut receiver) = mpsc::unbounded_channel();

        let sink = CountingSink::default();
        let session = TransferSession::new(SessionId(1), None, sink.clone());
        let report = transfer(
            &reqwest::Client::new(),
            &url,
            session,
            &test_options(),
            &events,
            &CancellationToken::new(),
        )
        .await;

        assert!(report.is_completed(), "{}", report.summary());
        let requests = requests.load(Ordering::SeqCst);
        assert!(requests >= 2);
        assert_eq!(*sink.written.lock().unwrap(), data);
        assert_eq!(sink.finished.load(Ordering::SeqCst), 1);

        let segments: Vec<TelemetrySample> = drain(&mut receiver)
            .into_iter()
            .filter_map(|event| match event {
                TransferEvent::Segment(sample) => Some(sample),
                _ => None,
            })
            .collect();
        assert_eq!(segments.len(), requests);
        assert_eq!(
            segments.iter().map(|s| s.bytes_transferred).sum::<u64>(),
            200_000
        );
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/video")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;
        let (events, _receiver) = mpsc::unbounded_channel();

        let sink = CountingSink::default();
        let session = TransferSession::new(SessionId(1), None, sink.clone());
        let report = transfer(
            &reqwest::Client::new(),
            &format!("{}/video", server.url()),
            session,
            &test_options(),
            &events,
            &CancellationToken::new(),
        )
        .await;

        mock.assert_async().await;
        assert!(matches!(
            report.outcome,
            TransferOutcome::Failed(DownloadError::Client {
                status: StatusCode::NOT_FOUND
            })
        ));
        assert_eq!(sink.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_error_is_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/video")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;
        let (events, _receiver) = mpsc::unbounded_channel();

        let session = TransferSession::new(SessionId(1), None, CountingSink::default());
        let report = transfer(
            &reqwest::Client::new(),
            &format!("{}/video", server.url()),
            session,
            &test_options(),
            &events,
            &CancellationToken::new(),
        )
        .await;

        mock.assert_async().await;
        match report.outcome {
            TransferOutcome::Failed(DownloadError::Http { status, retries }) => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(retries, 3);
            }
            other => panic!("Expected Http failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_reported() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/video")
            .match_header("range", "bytes=5000-")
            .with_status(416)
            .with_header("content-range", "bytes */1000")
            .expect(1)
            .create_async()
            .await;
        let (events, _receiver) = mpsc::unbounded_channel();

        let session = TransferSession::new(
            SessionId(1),
            Some(RangeRequest::starting_at(5000)),
            CountingSink::default(),
        );
        let report = transfer(
            &reqwest::Client::new(),
            &format!("{}/video", server.url()),
            session,
            &test_options(),
            &events,
            &CancellationToken::new(),
        )
        .await;

        mock.assert_async().await;
        assert!(matches!(
            report.outcome,
            TransferOutcome::Failed(DownloadError::NotSatisfiable { total: Some(1000) })
        ));
    }

    #[tokio::test]
    async fn partial_content_must_carry_matching_content_range() {
        for content_range in [None, Some("bytes 0-3/10"), Some("bytes 4-nine/10")] {
            let mut server = Server::new_async().await;
            let mut mock = server
                .mock("GET", "/video")
                .match_header("range", "bytes=4-")
                .with_status(206)
                .with_body("efghij");
            if let Some(value) = content_range {
                mock = mock.with_header("content-range", value);
            }
            let mock = mock.expect(1).create_async().await;
            let (events, _receiver) = mpsc::unbounded_channel();

            let sink = CountingSink::default();
            let session = TransferSession::new(
                SessionId(1),
                Some(RangeRequest::starting_at(4)),
                sink.clone(),
            );
            let report = transfer(
                &reqwest::Client::new(),
                &format!("{}/video", server.url()),
                session,
                &test_options(),
                &events,
                &CancellationToken::new(),
            )
            .await;

            mock.assert_async().await;
            assert!(
                matches!(
                    report.outcome,
                    TransferOutcome::Failed(DownloadError::BadContentRange { .. })
                ),
                "{content_range:?}: {}",
                report.summary()
            );
            assert!(sink.written.lock().unwrap().is_empty());
            assert_eq!(sink.finished.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn body_longer_than_announced_is_fatal() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/video")
            .match_header("range", "bytes=0-3")
            .with_status(206)
            .with_header("content-range", "bytes 0-3/10")
            .with_body("abcdefgh")
            .expect(1)
            .create_async()
            .await;
        let (events, _receiver) = mpsc::unbounded_channel();

        let sink = CountingSink::default();
        let window = RangeRequest {
            start: 0,
            end: Some(3),
        };
        let session = TransferSession::new(SessionId(1), Some(window), sink.clone());
        let report = transfer(
            &reqwest::Client::new(),
            &format!("{}/video", server.url()),
            session,
            &test_options(),
            &events,
            &CancellationToken::new(),
        )
        .await;

        mock.assert_async().await;
        assert!(matches!(
            report.outcome,
            TransferOutcome::Failed(DownloadError::Overflow { expected: 4 })
        ));
        assert!(report.received <= 4);
        assert_eq!(sink.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_bodies_resume_then_fail_as_truncated() {
        let mut server = Server::new_async().await;
        let mut mocks = Vec::new();
        for (range, content_range, body) in [
            ("bytes=0-9", "bytes 0-9/10", "abcd"),
            ("bytes=4-9", "bytes 4-9/10", "ef"),
            ("bytes=6-9", "bytes 6-9/10", "gh"),
        ] {
            mocks.push(
                server
                    .mock("GET", "/video")
                    .match_header("range", range)
                    .with_status(206)
                    .with_header("content-range", content_range)
                    .with_body(body)
                    .expect(1)
                    .create_async()
                    .await,
            );
        }
        let (events, _receiver) = mpsc::unbounded_channel();

        let sink = CountingSink::default();
        let window = RangeRequest {
            start: 0,
            end: Some(9),
        };
        let session = TransferSession::new(SessionId(1), Some(window), sink.clone());
        let report = transfer(
            &reqwest::Client::new(),
            &format!("{}/video", server.url()),
            session,
            &test_options(),
            &events,
            &CancellationToken::new(),
        )
        .await;

        for mock in &mocks {
            mock.assert_async().await;
        }
        match report.outcome {
            TransferOutcome::Failed(DownloadError::Truncated {
                received,
                expected,
                retries,
            }) => {
                assert_eq!((received, expected, retries), (8, 10, 3));
            }
            other => panic!("Expected Truncated failure, got {other:?}"),
        }
        assert_eq!(*sink.written.lock().unwrap(), b"abcdefgh");
        assert_eq!(sink.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ignored_range_is_fatal() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/video")
            .with_status(200)
            .with_body("whole file")
            .expect(1)
            .create_async()
            .await;
        let (events, _receiver) = mpsc::unbounded_channel();

        let sink = CountingSink::default();
        let session = TransferSession::new(
            SessionId(1),
            Some(RangeRequest::starting_at(4)),
            sink.clone(),
        );
        let report = transfer(
            &reqwest::Client::new(),
            &format!("{}/video", server.url()),
            session,
            &test_options(),
            &events,
            &CancellationToken::new(),
        )
        .await;

        mock.assert_async().await;
        assert!(matches!(
            report.outcome,
            TransferOutcome::Failed(DownloadError::RangeIgnored { .. })
        ));
        assert!(sink.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_is_surfaced_and_releases_once() {
        let (_dir, _data, url) = media_server(10_000).await;
        let (events, _receiver) = mpsc::unbounded_channel();

        let sink = CountingSink {
            fail_writes: true,
            ..Default::default()
        };
        let session = TransferSession::new(SessionId(1), None, sink.clone());
        let report = transfer(
            &reqwest::Client::new(),
            &url,
            session,
            &test_options(),
            &events,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            report.outcome,
            TransferOutcome::Failed(DownloadError::Storage(WriteError::Write { .. }))
        ));
        assert_eq!(report.received, 0);
        assert_eq!(sink.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_releases_destination_once() {
        let data = media_bytes(64 * 1024);
        let app = throttled_router(data, 1024, Duration::from_millis(20));
        let url = format!("{}/video", spawn_server(app).await);
        let (events, mut receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let sink = CountingSink::default();
        let session = TransferSession::new(SessionId(1), None, sink.clone());
        let handle = tokio::spawn({
            let token = token.clone();
            async move {
                transfer(
                    &reqwest::Client::new(),
                    &url,
                    session,
                    &test_options(),
                    &events,
                    &token,
                )
                .await
            }
        });

        // Cancel once the first chunk has been written.
        while let Some(event) = receiver.recv().await {
            if matches!(event, ProgressEvent::Transfer(TransferEvent::Chunk { .. })) {
                token.cancel();
                break;
            }
        }
        let report = handle.await.unwrap();

        assert!(matches!(report.outcome, TransferOutcome::Cancelled));
        assert!(report.received < 64 * 1024);
        assert_eq!(sink.finished.load(Ordering::SeqCst), 1);
        let finished: Vec<_> = drain(&mut receiver)
            .into_iter()
            .filter(|event| matches!(event, TransferEvent::Finished { .. }))
            .collect();
        assert_eq!(finished.len(), 1);
    }

    #[tokio::test]
    async fn stalled_transfer_fails() {
        let data = media_bytes(4096);
        let app = throttled_router(data, 1024, Duration::from_secs(30));
        let url = format!("{}/video", spawn_server(app).await);
        let (events, _receiver) = mpsc::unbounded_channel();

        let options = DownloadOptions {
            max_retries: 1,
            stall_timeout: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(1),
        };
        let session = TransferSession::new(SessionId(1), None, CountingSink::default());
        let report = transfer(
            &reqwest::Client::new(),
            &url,
            session,
            &options,
            &events,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            report.outcome,
            TransferOutcome::Failed(DownloadError::Stalled { retries: 1, .. })
        ));
    }

    #[tokio::test]
    async fn network_error_is_reported() {
        let (events, _receiver) = mpsc::unbounded_channel();
        let options = DownloadOptions {
            max_retries: 2,
            ..test_options()
        };

        // Nothing listens on port 9 of the loopback interface.
        let session = TransferSession::new(SessionId(1), None, CountingSink::default());
        let report = transfer(
            &reqwest::Client::new(),
            "http://127.0.0.1:9/video",
            session,
            &options,
            &events,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            report.outcome,
            TransferOutcome::Failed(DownloadError::Network { retries: 2, .. })
        ));
    }

    #[test]
    fn next_request_resumes_after_received_bytes() {
        let mut session = TransferSession::new(SessionId(1), None, CountingSink::default());
        assert_eq!(session.next_request(), None);
        session.received = 10;
        assert_eq!(session.next_request(), Some(RangeRequest::starting_at(10)));

        let mut session = TransferSession::new(
            SessionId(2),
            Some(RangeRequest {
                start: 100,
                end: Some(199),
            }),
            CountingSink::default(),
        );
        session.received = 50;
        assert_eq!(
            session.next_request(),
            Some(RangeRequest {
                start: 150,
                end: Some(199)
            })
        );
        assert_eq!(session.offset(), 100);
    }
}

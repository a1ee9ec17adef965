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

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse as _, Response},
    routing::get,
};
use futures::StreamExt as _;
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;

use crate::range::parse_range_header;

/// Deterministic, non-repeating-looking media bytes.
pub fn media_bytes(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8)
        .collect()
}

/// Write `size` bytes to `media.mp4` in a fresh temporary directory.
pub fn media_fixture(size: usize) -> (TempDir, PathBuf, Vec<u8>) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("media.mp4");
    let data = media_bytes(size);
    std::fs::write(&path, &data).unwrap();
    (dir, path, data)
}

/// Serve `app` on an ephemeral port and return its base URL.
pub async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind random port");
    let addr: SocketAddr = listener.local_addr().expect("failed to get local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{addr}")
}

#[derive(Clone)]
struct Throttled {
    data: Arc<Vec<u8>>,
    chunk_size: usize,
    delay: Duration,
}

/// Router serving `data` at `/video` in `chunk_size` pieces, sleeping `delay`
/// before each piece. Honours `Range` like the real server.
pub fn throttled_router(data: Vec<u8>, chunk_size: usize, delay: Duration) -> Router {
    let state = Throttled {
        data: Arc::new(data),
        chunk_size,
        delay,
    };
    Router::new()
        .route("/video", get(throttled))
        .with_state(state)
}

async fn throttled(State(state): State<Throttled>, headers: HeaderMap) -> Response {
    let total = state.data.len() as u64;
    let range = match headers.get(header::RANGE) {
        Some(value) => match parse_range_header(value.to_str().unwrap(), total) {
            Ok(range) => Some(range),
            Err(_) => return StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        },
        None => None,
    };
    let (start, end) = range.map_or((0, total), |range| (range.start, range.end + 1));

    let window = state.data[start as usize..end as usize].to_vec();
    let pieces: Vec<Bytes> = window
        .chunks(state.chunk_size)
        .map(Bytes::copy_from_slice)
        .collect();
    let delay = state.delay;
    let stream = futures::stream::iter(pieces).then(move |piece| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, std::io::Error>(piece)
    });

    let mut builder = Response::builder()
        .header(header::CONTENT_LENGTH, end - start)
        .header(header::ACCEPT_RANGES, "bytes");
    builder = match range {
        Some(range) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, range.content_range(total)),
        None => builder.status(StatusCode::OK),
    };
    builder.body(Body::from_stream(stream)).unwrap()
}

#[derive(Clone)]
struct Flaky {
    data: Arc<Vec<u8>>,
    requests: Arc<AtomicUsize>,
}

/// Router whose first response announces the whole of `data` but aborts the
/// connection after at most half of it. Later requests are served normally.
pub fn flaky_router(data: Vec<u8>) -> (Router, Arc<AtomicUsize>) {
    let requests = Arc::new(AtomicUsize::new(0));
    let state = Flaky {
        data: Arc::new(data),
        requests: requests.clone(),
    };
    let router = Router::new()
        .route("/video", get(flaky))
        .with_state(state);
    (router, requests)
}

async fn flaky(State(state): State<Flaky>, headers: HeaderMap) -> Response {
    let total = state.data.len() as u64;
    if state.requests.fetch_add(1, Ordering::SeqCst) == 0 {
        let half = Bytes::copy_from_slice(&state.data[..state.data.len() / 2]);
        let stream = futures::stream::iter([
            Ok(half),
            Err(std::io::Error::other("connection dropped")),
        ])
        .then(|item| async move {
            // Give the first half time to reach the client.
            if item.is_err() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            item
        });
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, total)
            .body(Body::from_stream(stream))
            .unwrap();
    }

    let Some(value) = headers.get(header::RANGE) else {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, total)
            .body(Body::from(state.data.to_vec()))
            .unwrap();
    };
    let range = parse_range_header(value.to_str().unwrap(), total).unwrap();
    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_LENGTH, range.len())
        .header(header::CONTENT_RANGE, range.content_range(total))
        .body(Body::from(
            state.data[range.start as usize..=range.end as usize].to_vec(),
        ))
        .unwrap()
}

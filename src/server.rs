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
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse as _, Response},
    routing::get,
};
use std::{
    io::SeekFrom,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt as _, AsyncSeekExt as _},
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tower_http::trace::TraceLayer;

use crate::args::ServeArgs;
use crate::range::{ByteRange, RangeError, parse_range_header, unsatisfied_content_range};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("stat on {path} failed: {source}")]
    Stat {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a regular file")]
    NotAFile { path: String },
}

#[derive(Error, Debug)]
pub enum ServeError {
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error("bind on {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// The file being served. Resolved once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct MediaResource {
    path: PathBuf,
    total_size: u64,
    content_type: String,
}

impl MediaResource {
    pub async fn open(path: &Path, content_type: Option<&str>) -> Result<Self, ResourceError> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|source| ResourceError::Stat {
                path: path.display().to_string(),
                source,
            })?;
        if !metadata.is_file() {
            return Err(ResourceError::NotAFile {
                path: path.display().to_string(),
            });
        }

        let content_type = content_type
            .map(String::from)
            .unwrap_or_else(|| content_type_for(path).to_string());

        Ok(Self {
            path: path.to_path_buf(),
            total_size: metadata.len(),
            content_type,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }
}

/// Determine content type from the file extension.
fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "ts" | "m2ts" => "video/mp2t",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

#[derive(Clone)]
struct ServerState {
    resource: Arc<MediaResource>,
    chunk_size: usize,
}

/// Build the router serving `resource` at `route`.
pub fn router(resource: MediaResource, route: &str, chunk_size: usize) -> Router {
    let state = ServerState {
        resource: Arc::new(resource),
        chunk_size,
    };
    Router::new()
        .route(route, get(serve_media))
        .with_state(state)
}

/// `200` with the whole file, `206` with exactly the requested window, or
/// `416` with no body. Bodies are streamed in `chunk_size` pieces.
async fn serve_media(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    let resource = &state.resource;
    let total = resource.total_size();

    let range = match headers.get(header::RANGE) {
        None => None,
        Some(value) => {
            let parsed = value
                .to_str()
                .map_err(|_| RangeError::Malformed(String::from_utf8_lossy(value.as_bytes()).into()))
                .and_then(|value| parse_range_header(value, total));
            match parsed {
                Ok(range) => Some(range),
                Err(err) => {
                    tracing::warn!("rejecting range request: {err}");
                    return not_satisfiable(total);
                }
            }
        }
    };

    let file = match open_at(resource, range).await {
        Ok(file) => file,
        Err(err) => {
            tracing::error!("{} is unavailable: {err}", resource.path().display());
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let (status, length) = match range {
        Some(range) => (StatusCode::PARTIAL_CONTENT, range.len()),
        None => (StatusCode::OK, total),
    };
    match range {
        Some(range) => tracing::info!(
            "serving bytes {}-{} ({} bytes)",
            range.start,
            range.end,
            length
        ),
        None => tracing::info!("serving full resource ({length} bytes)"),
    }

    let stream = ReaderStream::with_capacity(file.take(length), state.chunk_size);
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, resource.content_type())
        .header(header::CONTENT_LENGTH, length)
        .header(header::ACCEPT_RANGES, "bytes");
    if let Some(range) = range {
        builder = builder.header(header::CONTENT_RANGE, range.content_range(total));
    }

    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|err| {
            tracing::error!("failed to build response: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

/// Open the backing file positioned at the start of `range`.
///
/// The file must still have the size recorded at startup.
async fn open_at(resource: &MediaResource, range: Option<ByteRange>) -> std::io::Result<File> {
    let mut file = File::open(resource.path()).await?;
    let size = file.metadata().await?.len();
    if size != resource.total_size() {
        return Err(std::io::Error::other(format!(
            "size changed from {} to {size} bytes",
            resource.total_size()
        )));
    }
    if let Some(range) = range {
        file.seek(SeekFrom::Start(range.start)).await?;
    }
    Ok(file)
}

fn not_satisfiable(total: u64) -> Response {
    let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
    if let Ok(value) = HeaderValue::from_str(&unsatisfied_content_range(total)) {
        response.headers_mut().insert(header::CONTENT_RANGE, value);
    }
    response
}

/// Serve the file named in `args` until `token` is cancelled.
pub async fn run(args: &ServeArgs, token: CancellationToken) -> Result<(), ServeError> {
    let resource = MediaResource::open(&args.file, args.content_type.as_deref()).await?;
    tracing::info!(
        "serving {} ({} bytes, {})",
        resource.path().display(),
        resource.total_size(),
        resource.content_type()
    );

    let app = router(resource, &args.route, args.chunk_size).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .map_err(|source| ServeError::Bind {
            addr: args.bind,
            source,
        })?;
    tracing::info!("listening on http://{}{}", args.bind, args.route);

    axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .map_err(ServeError::Serve)
}

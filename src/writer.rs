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

use async_trait::async_trait;
use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs,
    io::{AsyncSeekExt as _, AsyncWriteExt as _},
};

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("open on {path} failed: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("seek on {path} failed: {source}")]
    Seek {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("write on {path} failed: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("flush on {path} failed: {source}")]
    Flush {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Local destination for the bytes of one transfer session.
///
/// Chunks are written sequentially starting at the sink's initial offset.
/// `finish` releases the underlying handle; calling it again is a no-op.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), WriteError>;
    async fn finish(&mut self) -> Result<(), WriteError>;
}

/// Writes a byte window into a file at its offset.
#[derive(Debug)]
pub struct RangeFileWriter {
    path: PathBuf,
    file: Option<fs::File>,
}

impl RangeFileWriter {
    /// Open `path` for writing at `offset`.
    ///
    /// With `truncate` the file is replaced. Otherwise the bytes already on
    /// disk are kept whatever the offset, including 0.
    pub async fn open(path: &Path, offset: u64, truncate: bool) -> Result<Self, WriteError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(truncate)
            .open(path)
            .await
            .map_err(|source| WriteError::Open {
                path: path.display().to_string(),
                source,
            })?;

        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|source| WriteError::Seek {
                    path: path.display().to_string(),
                    source,
                })?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    #[cfg(test)]
    fn is_released(&self) -> bool {
        self.file.is_none()
    }
}

#[async_trait]
impl ChunkSink for RangeFileWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), WriteError> {
        let file = self.file.as_mut().ok_or_else(|| WriteError::Write {
            path: self.path.display().to_string(),
            source: std::io::Error::other("destination already released"),
        })?;

        file.write_all(chunk)
            .await
            .map_err(|source| WriteError::Write {
                path: self.path.display().to_string(),
                source,
            })?;
        // Flush so the whole span is on disk before it is reported as buffered.
        file.flush().await.map_err(|source| WriteError::Flush {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), WriteError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.shutdown().await.map_err(|source| WriteError::Flush {
            path: self.path.display().to_string(),
            source,
        })
    }
}

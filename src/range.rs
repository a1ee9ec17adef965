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

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("malformed range header {0:?}")]
    Malformed(String),
    #[error("range start {start} is beyond resource size {total}")]
    StartOutOfBounds { start: u64, total: u64 },
    #[error("range start {start} is after range end {end}")]
    Inverted { start: u64, end: u64 },
}

/// A satisfiable byte window over a resource, end inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Validates `start..=end` against a resource of `total` bytes.
    ///
    /// An `end` past the last byte is clamped to it; a `start` past the last
    /// byte, or after `end`, is rejected.
    pub fn new(start: u64, end: u64, total: u64) -> Result<Self, RangeError> {
        if start >= total {
            return Err(RangeError::StartOutOfBounds { start, total });
        }
        if start > end {
            return Err(RangeError::Inverted { start, end });
        }
        Ok(Self {
            start,
            end: end.min(total - 1),
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for a `Content-Range` header.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Value for the `Content-Range` header of a 416 response.
pub fn unsatisfied_content_range(total: u64) -> String {
    format!("bytes */{total}")
}

/// Parse a `Range` header against a resource of `total` bytes.
///
/// Supports formats:
/// - bytes=0-499
/// - bytes=500-
/// - bytes=-500 (last 500 bytes)
///
/// Multiple ranges and units other than `bytes` are rejected.
pub fn parse_range_header(header: &str, total: u64) -> Result<ByteRange, RangeError> {
    let malformed = || RangeError::Malformed(header.to_string());

    let set = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(malformed)?;
    if set.contains(',') {
        return Err(malformed());
    }
    let (start, end) = set.split_once('-').ok_or_else(malformed)?;
    let (start, end) = (start.trim(), end.trim());

    match (start.is_empty(), end.is_empty()) {
        (true, false) => {
            let suffix: u64 = end.parse().map_err(|_| malformed())?;
            if suffix == 0 {
                return Err(malformed());
            }
            ByteRange::new(total.saturating_sub(suffix), u64::MAX, total)
        }
        (false, true) => {
            let start: u64 = start.parse().map_err(|_| malformed())?;
            ByteRange::new(start, u64::MAX, total)
        }
        (false, false) => {
            let start: u64 = start.parse().map_err(|_| malformed())?;
            let end: u64 = end.parse().map_err(|_| malformed())?;
            ByteRange::new(start, end, total)
        }
        (true, true) => Err(malformed()),
    }
}

/// The window a client asks for, before the resource size is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub start: u64,
    pub end: Option<u64>,
}

impl RangeRequest {
    pub fn starting_at(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Number of bytes requested, when bounded.
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start) + 1)
    }

    /// The same window with its first `consumed` bytes already transferred.
    pub fn advanced(&self, consumed: u64) -> Self {
        Self {
            start: self.start + consumed,
            end: self.end,
        }
    }
}

impl fmt::Display for RangeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "bytes={}-{}", self.start, end),
            None => write!(f, "bytes={}-", self.start),
        }
    }
}

/// A parsed `Content-Range: bytes start-end/total` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` when the server sent `*`.
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

pub fn parse_content_range(header: &str) -> Option<ContentRange> {
    let value = header.trim().strip_prefix("bytes ")?;
    let (range, total) = value.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if start > end {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        total => Some(total.parse().ok()?),
    };
    if let Some(total) = total
        && end >= total
    {
        return None;
    }
    Some(ContentRange { start, end, total })
}

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

use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    ops::Range,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::download::{SegmentId, SessionId, TransferEvent};
use crate::playback::MediaTimeline;

/// `value / total` clamped to `[0, 1]`, or `None` when `total` is not a
/// finite positive number.
pub fn ratio(value: f64, total: f64) -> Option<f64> {
    if !total.is_finite() || total <= 0.0 || !value.is_finite() {
        return None;
    }
    Some((value / total).clamp(0.0, 1.0))
}

/// A span of media time, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub duration: f64,
}

impl TimeRange {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Fraction of `total_duration` covered up to the end of the earliest
/// loaded range. Later ranges are not considered.
pub fn buffer_fraction(ranges: &[TimeRange], total_duration: f64) -> Option<f64> {
    let end = ranges
        .iter()
        .min_by(|a, b| a.start.total_cmp(&b.start))
        .map(TimeRange::end)
        .unwrap_or(0.0);
    ratio(end, total_duration)
}

pub fn play_fraction(current_time: f64, total_duration: f64) -> Option<f64> {
    ratio(current_time, total_duration)
}

/// Byte progress of a single transfer session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub received: u64,
    /// `None` when the server did not announce a length.
    pub expected: Option<u64>,
}

impl DownloadProgress {
    pub fn fraction(&self) -> Option<f64> {
        self.expected
            .and_then(|expected| ratio(self.received as f64, expected as f64))
    }
}

/// Disjoint, sorted, half-open byte spans already written locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteIntervals {
    spans: Vec<Range<u64>>,
}

impl ByteIntervals {
    /// Record `len` bytes at `start`, merging with overlapping or adjacent spans.
    pub fn insert(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut merged = start..start + len;
        let mut spans = Vec::with_capacity(self.spans.len() + 1);
        for span in self.spans.drain(..) {
            if span.end < merged.start || span.start > merged.end {
                spans.push(span);
            } else {
                merged.start = merged.start.min(span.start);
                merged.end = merged.end.max(span.end);
            }
        }
        spans.push(merged);
        spans.sort_by_key(|span| span.start);
        self.spans = spans;
    }

    pub fn spans(&self) -> &[Range<u64>] {
        &self.spans
    }

    pub fn clear(&mut self) {
        self.spans.clear();
    }
}

/// Everything a presentation layer reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub session: Option<SessionId>,
    pub received: u64,
    pub expected: Option<u64>,
    pub download_fraction: Option<f64>,
    pub buffer_fraction: Option<f64>,
    pub play_fraction: Option<f64>,
    pub bytes_transferred: u64,
    pub last_event: Option<String>,
}

#[derive(Debug)]
pub enum ProgressEvent {
    Transfer(TransferEvent),
    /// Current playback time in seconds.
    Position(f64),
    /// A seek started a new window on the same resource.
    SeekReset,
    /// A new resource is being fetched.
    Reset,
}

impl From<TransferEvent> for ProgressEvent {
    fn from(event: TransferEvent) -> Self {
        ProgressEvent::Transfer(event)
    }
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;

/// Folds transfer events, timeline updates and position samples into one
/// [`ProgressSnapshot`]. Run it as a single task so that readers see one
/// ordering of updates.
pub struct ProgressAggregator {
    timeline: Box<dyn MediaTimeline>,
    active: Option<SessionId>,
    finished: HashSet<SessionId>,
    download: DownloadProgress,
    buffer: Option<f64>,
    play: Option<f64>,
    segments: HashMap<SegmentId, u64>,
    bytes_transferred: u64,
    last_event: Option<String>,
}

/// Keep the larger of the published and the new fraction.
fn raise(slot: &mut Option<f64>, value: Option<f64>) -> bool {
    match (*slot, value) {
        (_, None) => false,
        (Some(current), Some(value)) if value <= current => false,
        (_, value) => {
            *slot = value;
            true
        }
    }
}

impl ProgressAggregator {
    pub fn new(timeline: Box<dyn MediaTimeline>) -> Self {
        Self {
            timeline,
            active: None,
            finished: HashSet::new(),
            download: DownloadProgress::default(),
            buffer: None,
            play: None,
            segments: HashMap::new(),
            bytes_transferred: 0,
            last_event: None,
        }
    }

    /// Fold one event into the aggregate. Returns whether the snapshot changed.
    pub fn apply(&mut self, event: ProgressEvent) -> bool {
        match event {
            ProgressEvent::Transfer(event) => self.apply_transfer(event),
            ProgressEvent::Position(seconds) => {
                raise(&mut self.play, play_fraction(seconds, self.timeline.duration()))
            }
            ProgressEvent::SeekReset => {
                self.active = None;
                self.download = DownloadProgress::default();
                self.buffer = None;
                self.play = None;
                self.refresh_buffer();
                true
            }
            ProgressEvent::Reset => {
                self.timeline.reset();
                self.active = None;
                self.finished.clear();
                self.download = DownloadProgress::default();
                self.buffer = None;
                self.play = None;
                self.segments.clear();
                self.bytes_transferred = 0;
                self.last_event = None;
                true
            }
        }
    }

    fn apply_transfer(&mut self, event: TransferEvent) -> bool {
        match event {
            TransferEvent::Started {
                session,
                expected,
                resource_size,
                ..
            } => {
                if self.active == Some(session) || self.finished.contains(&session) {
                    return false;
                }
                self.active = Some(session);
                self.download = DownloadProgress {
                    received: 0,
                    expected,
                };
                if let Some(size) = resource_size {
                    self.timeline.observe_total_size(size);
                }
                self.refresh_buffer();
                true
            }
            TransferEvent::Chunk {
                session,
                offset,
                len,
                progress,
            } => {
                // Written bytes are buffered whichever session wrote them.
                self.timeline.observe_bytes(offset, len);
                let mut changed = self.refresh_buffer();
                if self.active == Some(session) && progress.received > self.download.received {
                    self.download = progress;
                    changed = true;
                }
                changed
            }
            TransferEvent::Segment(sample) => {
                if self.segments.contains_key(&sample.segment) {
                    return false;
                }
                self.segments
                    .insert(sample.segment, sample.bytes_transferred);
                self.bytes_transferred += sample.bytes_transferred;
                true
            }
            TransferEvent::Finished { session, summary } => {
                if !self.finished.insert(session) {
                    return false;
                }
                self.last_event = Some(summary);
                true
            }
        }
    }

    fn refresh_buffer(&mut self) -> bool {
        let fraction = buffer_fraction(&self.timeline.loaded_ranges(), self.timeline.duration());
        raise(&mut self.buffer, fraction)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            session: self.active,
            received: self.download.received,
            expected: self.download.expected,
            download_fraction: self.download.fraction(),
            buffer_fraction: self.buffer,
            play_fraction: self.play,
            bytes_transferred: self.bytes_transferred,
            last_event: self.last_event.clone(),
        }
    }
}

/// Run `aggregator` until every sender of `events` is dropped.
///
/// The returned handle resolves to the last snapshot.
pub fn spawn_aggregator(
    mut aggregator: ProgressAggregator,
    mut events: mpsc::UnboundedReceiver<ProgressEvent>,
) -> (JoinHandle<ProgressSnapshot>, watch::Receiver<ProgressSnapshot>) {
    let (publisher, snapshots) = watch::channel(aggregator.snapshot());
    let handle = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if aggregator.apply(event) {
                publisher.send_replace(aggregator.snapshot());
            }
        }
        aggregator.snapshot()
    });
    (handle, snapshots)
}

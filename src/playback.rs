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

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::progress::{ByteIntervals, ProgressEvent, ProgressSender, TimeRange};

/// Says how long the media is and which time ranges are playable from local
/// bytes. Nothing is decoded.
pub trait MediaTimeline: Send {
    /// Called when the size of the whole resource becomes known.
    fn observe_total_size(&mut self, total_bytes: u64);
    /// Called after `len` bytes at `offset` were written locally.
    fn observe_bytes(&mut self, offset: u64, len: u64);
    /// Total media duration in seconds; not finite when unknown.
    fn duration(&self) -> f64;
    /// Locally playable time ranges, sorted and disjoint.
    fn loaded_ranges(&self) -> Vec<TimeRange>;
    fn reset(&mut self);
}

/// Timeline for media without duration information.
#[derive(Debug, Default)]
pub struct UnknownTimeline;

impl MediaTimeline for UnknownTimeline {
    fn observe_total_size(&mut self, _total_bytes: u64) {}

    fn observe_bytes(&mut self, _offset: u64, _len: u64) {}

    fn duration(&self) -> f64 {
        f64::NAN
    }

    fn loaded_ranges(&self) -> Vec<TimeRange> {
        Vec::new()
    }

    fn reset(&mut self) {}
}

/// Maps bytes to time assuming the media has a constant bitrate.
#[derive(Debug)]
pub struct ConstantBitrateTimeline {
    duration: f64,
    total_bytes: Option<u64>,
    loaded: ByteIntervals,
}

impl ConstantBitrateTimeline {
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            total_bytes: None,
            loaded: ByteIntervals::default(),
        }
    }

    fn seconds_at(&self, offset: u64, total_bytes: u64) -> f64 {
        offset as f64 * self.duration / total_bytes as f64
    }
}

impl MediaTimeline for ConstantBitrateTimeline {
    fn observe_total_size(&mut self, total_bytes: u64) {
        self.total_bytes = Some(total_bytes);
    }

    fn observe_bytes(&mut self, offset: u64, len: u64) {
        self.loaded.insert(offset, len);
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn loaded_ranges(&self) -> Vec<TimeRange> {
        let Some(total_bytes) = self.total_bytes.filter(|&total| total > 0) else {
            return Vec::new();
        };
        self.loaded
            .spans()
            .iter()
            .map(|span| {
                let start = self.seconds_at(span.start, total_bytes);
                let end = self.seconds_at(span.end.min(total_bytes), total_bytes);
                TimeRange {
                    start,
                    duration: end - start,
                }
            })
            .collect()
    }

    fn reset(&mut self) {
        self.total_bytes = None;
        self.loaded.clear();
    }
}

pub trait PositionProvider: Send + Sync {
    /// Current playback time in seconds.
    fn current_time(&self) -> f64;
}

#[derive(Debug)]
struct Clock {
    anchor: Instant,
    position: f64,
    playable_end: f64,
}

/// Simulated playback advancing in real time.
///
/// Playback stalls at the end of the playable data and at the media
/// duration, and resumes from where it stalled once more data is buffered.
#[derive(Debug)]
pub struct WallClockPosition {
    duration: f64,
    clock: Mutex<Clock>,
}

impl WallClockPosition {
    /// Everything up to `duration` is playable until told otherwise.
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            clock: Mutex::new(Clock {
                anchor: Instant::now(),
                position: 0.0,
                playable_end: f64::INFINITY,
            }),
        }
    }

    /// Playback that waits for buffered data before it advances.
    pub fn buffering(duration: f64) -> Self {
        let position = Self::new(duration);
        position.set_buffered_fraction(0.0);
        position
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Clock> {
        self.clock.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Continue playback from `seconds`.
    pub fn seek(&self, seconds: f64) {
        let mut clock = self.lock();
        clock.anchor = Instant::now();
        clock.position = seconds.max(0.0);
    }

    /// Limit playback to the first `fraction` of the media.
    pub fn set_buffered_fraction(&self, fraction: f64) {
        let mut clock = self.lock();
        Self::advance(&mut clock, self.duration);
        clock.playable_end = fraction.clamp(0.0, 1.0) * self.duration;
    }

    fn advance(clock: &mut Clock, duration: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(clock.anchor).as_secs_f64();
        clock.anchor = now;
        if clock.position < clock.playable_end {
            clock.position = (clock.position + elapsed).min(clock.playable_end);
        }
        if duration.is_finite() {
            clock.position = clock.position.min(duration);
        }
    }
}

impl PositionProvider for WallClockPosition {
    fn current_time(&self) -> f64 {
        let mut clock = self.lock();
        Self::advance(&mut clock, self.duration);
        clock.position
    }
}

/// Sample `provider` every `period` into `events` until `token` is cancelled
/// or the aggregator goes away.
pub fn spawn_position_sampler(
    provider: Arc<dyn PositionProvider>,
    events: ProgressSender,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if events.send(ProgressEvent::Position(provider.current_time())).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

//! Render-timing quality monitor.
//!
//! Tracks `|render time - presentation timestamp|` over a sliding window and flags
//! samples that stray too far from the window average. Decoder input and renderer
//! output are counted to detect dropped frames. A reporting thread drains the
//! counters every cycle via [`QualityMonitor::take_report`].

pub mod qsm;

use std::collections::VecDeque;

use tracing::debug;

use crate::media::FrameTimestamp;

/// Samples kept in the sliding window.
pub const WINDOW_SIZE: usize = 100;
/// Deviation from the window average beyond which a sample counts as delayed.
pub const RENDER_TIME_THRESHOLD: i64 = 300;
/// Input/output imbalance beyond which frames count as dropped.
pub const DROP_FRAME_THRESHOLD: u64 = 5;

/// Counts collected over one reporting cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualityReport {
    pub delayed: u64,
    pub dropped: u64,
}

impl QualityReport {
    pub fn total(&self) -> u64 {
        self.delayed + self.dropped
    }
}

/// Sliding-window jitter and drop statistics for one decoder.
#[derive(Debug, Default)]
pub struct QualityMonitor {
    window: VecDeque<i64>,
    sum: i64,
    error_count: u64,
    decoder_in: u64,
    renderer_out: u64,
}

impl QualityMonitor {
    pub fn new() -> Self {
        Self { window: VecDeque::with_capacity(WINDOW_SIZE + 1), ..Self::default() }
    }

    pub fn record_decoder_input(&mut self) {
        self.decoder_in += 1;
    }

    /// Records one rendered frame.
    ///
    /// A [`FrameTimestamp::Hold`] frame triggers an outlier scan of the window and
    /// then clears it.
    pub fn record_render(&mut self, pts: FrameTimestamp, render_time: i64) {
        self.renderer_out += 1;
        match pts {
            FrameTimestamp::Hold => self.check_and_reset(),
            FrameTimestamp::Pts(pts) => self.add_sample(render_time.abs_diff(pts) as i64),
        }
    }

    /// Average of the samples in the window.
    pub fn average(&self) -> Option<i64> {
        if self.window.is_empty() { None } else { Some(self.sum / self.window.len() as i64) }
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// Input/output imbalance, reported only once it exceeds the drop threshold.
    pub fn drop_count(&self) -> u64 {
        let diff = self.decoder_in.abs_diff(self.renderer_out);
        if diff > DROP_FRAME_THRESHOLD { diff } else { 0 }
    }

    /// Evicts outliers from the window without clearing it.
    ///
    /// Samples are visited oldest first. Each sample deviating from the current
    /// average by more than the threshold is removed and counted, and the average
    /// is recomputed from the remaining samples before the scan continues.
    pub fn evict_outliers(&mut self) {
        let Some(mut average) = self.average() else {
            return;
        };
        let mut evicted = Vec::new();
        let mut index = 0;
        while index < self.window.len() {
            let value = self.window[index];
            if (value - average).abs() > RENDER_TIME_THRESHOLD {
                self.window.remove(index);
                self.sum -= value;
                self.error_count += 1;
                evicted.push(value);
                if let Some(updated) = self.average() {
                    average = updated;
                }
            } else {
                index += 1;
            }
        }
        if !evicted.is_empty() {
            debug!(?evicted, "Render timing outliers");
        }
    }

    /// Returns this cycle's counts and zeroes every counter.
    pub fn take_report(&mut self) -> QualityReport {
        let report = QualityReport { delayed: self.error_count, dropped: self.drop_count() };
        self.error_count = 0;
        self.decoder_in = 0;
        self.renderer_out = 0;
        report
    }

    /// Clears the window and every counter.
    pub fn reset(&mut self) {
        self.window.clear();
        self.sum = 0;
        self.error_count = 0;
        self.decoder_in = 0;
        self.renderer_out = 0;
    }

    fn check_and_reset(&mut self) {
        self.evict_outliers();
        self.window.clear();
        self.sum = 0;
    }

    fn add_sample(&mut self, delta: i64) {
        self.window.push_back(delta);
        self.sum += delta;
        if self.window.len() > WINDOW_SIZE {
            if let Some(oldest) = self.window.pop_front() {
                self.sum -= oldest;
            }
        }
        debug_assert_eq!(self.sum, self.window.iter().sum::<i64>());
    }
}

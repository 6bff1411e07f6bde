// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reusable flip-timing metrics and grading for test rigs.
//!
//! Feed every [`FlipResult`] (or a raw onset interval) into a
//! [`SyncTracker`] to get a rolling deadline-miss rate, onset jitter and a
//! letter grade whose thresholds depend on how much the timestamps can be
//! trusted.

use vblsync_core::time::{HostTime, Timebase};
use vblsync_core::timing::{FlipResult, TimestampConfidence};

/// Per-flip sample fed into [`SyncTracker::observe`].
#[derive(Clone, Copy, Debug)]
pub struct SyncSample {
    /// Confidence of the onset timestamp.
    pub confidence: TimestampConfidence,
    /// Signed onset error against the ideal cadence, in ms.
    pub onset_error_ms: f64,
    /// The flip missed its deadline.
    pub missed: bool,
    /// Interval since the previous onset, in ms.
    pub frame_delta_ms: f64,
}

impl SyncSample {
    /// Builds a sample from the interval between two consecutive onsets.
    ///
    /// An interval longer than one and a half nominal frames counts as a
    /// miss.
    #[must_use]
    pub fn from_interval(
        confidence: TimestampConfidence,
        frame_delta_ms: f64,
        nominal_ms: f64,
    ) -> Self {
        let frames = (frame_delta_ms / nominal_ms).round().max(1.0);
        Self {
            confidence,
            onset_error_ms: frame_delta_ms - frames * nominal_ms,
            missed: frame_delta_ms > 1.5 * nominal_ms,
            frame_delta_ms,
        }
    }
}

/// Letter grade for presentation timing quality.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncGrade {
    /// Tight onsets and a low miss rate.
    A,
    /// Good timing with moderate misses.
    B,
    /// Degraded but usable.
    C,
    /// Poor timing.
    D,
}

impl SyncGrade {
    /// Returns a short label for reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
        }
    }
}

/// Aggregated report returned by [`SyncTracker::observe`].
#[derive(Clone, Copy, Debug)]
pub struct SyncReport {
    /// Current grade.
    pub grade: SyncGrade,
    /// Misses per 1000 observed flips.
    pub miss_rate_per_1000: f64,
    /// Current flip's signed onset error in milliseconds.
    pub onset_error_ms: f64,
    /// Mean absolute onset error over the history window, in ms.
    pub jitter_ms: f64,
    /// Total flips observed.
    pub total_frames: u64,
    /// Total misses observed.
    pub missed_frames: u64,
}

/// Rolling tracker with a fixed-size onset-interval history.
#[derive(Debug)]
pub struct SyncTracker<const N: usize> {
    deltas_ms: [f64; N],
    errors_ms: [f64; N],
    cursor: usize,
    total_frames: u64,
    missed_frames: u64,
    nominal_ms: f64,
    last_onset: Option<HostTime>,
}

impl<const N: usize> Default for SyncTracker<N> {
    fn default() -> Self {
        Self::new(16.67)
    }
}

impl<const N: usize> SyncTracker<N> {
    /// Creates a tracker for a display with the given nominal frame time,
    /// prefilling the history with it.
    #[must_use]
    pub const fn new(nominal_ms: f64) -> Self {
        Self {
            deltas_ms: [nominal_ms; N],
            errors_ms: [0.0; N],
            cursor: 0,
            total_frames: 0,
            missed_frames: 0,
            nominal_ms,
            last_onset: None,
        }
    }

    /// Observes one sample and returns an updated report.
    #[must_use]
    pub fn observe(&mut self, sample: SyncSample) -> SyncReport {
        self.total_frames = self.total_frames.saturating_add(1);
        self.deltas_ms[self.cursor % N] = sample.frame_delta_ms;
        self.errors_ms[self.cursor % N] = sample.onset_error_ms.abs();
        self.cursor = (self.cursor + 1) % N;

        if sample.missed {
            self.missed_frames = self.missed_frames.saturating_add(1);
        }

        let miss_rate = if self.total_frames == 0 {
            0.0
        } else {
            self.missed_frames as f64 * 1000.0 / self.total_frames as f64
        };
        let window = usize::try_from(self.total_frames).map_or(N, |t| t.min(N));
        let jitter = if window == 0 {
            0.0
        } else {
            let sum: f64 = (0..window)
                .map(|i| self.errors_ms[(self.cursor + N - 1 - i) % N])
                .sum();
            sum / window as f64
        };

        SyncReport {
            grade: grade_for(sample.confidence, jitter, miss_rate),
            miss_rate_per_1000: miss_rate,
            onset_error_ms: sample.onset_error_ms,
            jitter_ms: jitter,
            total_frames: self.total_frames,
            missed_frames: self.missed_frames,
        }
    }

    /// Observes one flip result.
    ///
    /// The frame delta is measured from the previous observed onset; the
    /// first flip only seeds it and reports the nominal frame time. The miss
    /// flag comes from the engine's own deadline check.
    #[must_use]
    pub fn observe_flip(&mut self, result: &FlipResult, timebase: Timebase) -> SyncReport {
        let delta_ms = match self.last_onset {
            Some(prev) => result.onset.signed_secs_since(prev, timebase) * 1000.0,
            None => self.nominal_ms,
        };
        self.last_onset = Some(result.onset);
        let mut sample = SyncSample::from_interval(result.confidence, delta_ms, self.nominal_ms);
        sample.missed = result.missed();
        self.observe(sample)
    }

    /// Returns ring-buffer frame deltas oldest→newest.
    #[must_use]
    pub fn frame_deltas(&self) -> [f64; N] {
        let mut out = [0.0; N];
        let mut i = 0;
        while i < N {
            let idx = (self.cursor + i) % N;
            out[i] = self.deltas_ms[idx];
            i += 1;
        }
        out
    }

    /// Returns an ASCII sparkline over `frame_deltas()`.
    #[must_use]
    pub fn sparkline_ascii(&self, min_ms: f64, max_ms: f64) -> String {
        const LEVELS: &[u8] = b" .:-=+*#%@";
        let mut out = String::with_capacity(N);
        for v in self.frame_deltas() {
            let t = (v.clamp(min_ms, max_ms) - min_ms) / (max_ms - min_ms);
            #[expect(
                clippy::cast_possible_truncation,
                reason = "index is clamped to ASCII level count"
            )]
            let level = (t * (LEVELS.len() as f64 - 1.0) + 0.5) as usize;
            out.push(LEVELS[level] as char);
        }
        out
    }
}

fn grade_for(
    conf: TimestampConfidence,
    jitter_ms: f64,
    miss_rate_per_1000: f64,
) -> SyncGrade {
    let (a_jitter, b_jitter, c_jitter, a_miss, b_miss, c_miss) = match conf {
        TimestampConfidence::Verified => (0.5, 1.0, 2.0, 1.0, 5.0, 15.0),
        TimestampConfidence::Estimated => (1.0, 2.0, 4.0, 3.0, 10.0, 25.0),
        TimestampConfidence::Unverified => (2.0, 4.0, 8.0, 10.0, 30.0, 80.0),
    };

    if jitter_ms < a_jitter && miss_rate_per_1000 < a_miss {
        SyncGrade::A
    } else if jitter_ms < b_jitter && miss_rate_per_1000 < b_miss {
        SyncGrade::B
    } else if jitter_ms < c_jitter && miss_rate_per_1000 < c_miss {
        SyncGrade::C
    } else {
        SyncGrade::D
    }
}

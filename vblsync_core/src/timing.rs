// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Request, result and per-surface timing types.
//!
//! These types flow through one presentation call:
//!
//! 1. The caller builds a [`SwapRequest`].
//! 2. The [`FlipEngine`](crate::scheduler::FlipEngine) resolves it against
//!    the surface's [`SurfaceTiming`] and issues exactly one swap.
//! 3. A [`FlipResult`] comes back with the arbitrated onset timestamp and the
//!    signed deadline-miss estimate.
//!
//! [`CalibrationResult`] is the output of a refresh-interval calibration run.

use crate::time::{HostTime, Timebase};

/// When a swap should happen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SwapTarget {
    /// At the next vertical blank.
    #[default]
    Asap,
    /// At the first vertical blank after the given time. A time in the past
    /// behaves like [`Asap`](Self::Asap) but the deadline check still uses it.
    At(HostTime),
    /// At the vertical blank with the given counter value.
    VblankCount(u64),
}

/// Restricts a swap to even or odd blanking counts (interlaced field
/// selection).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldParity {
    /// Even blanking counts.
    Even,
    /// Odd blanking counts.
    Odd,
}

impl FieldParity {
    /// Remainder modulo two that this parity selects.
    #[must_use]
    pub const fn remainder(self) -> u32 {
        match self {
            Self::Even => 0,
            Self::Odd => 1,
        }
    }
}

/// Swap only on blanking counts where `count % divisor == remainder`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Periodicity {
    /// Divisor applied to the blanking count. Must be non-zero.
    pub divisor: u32,
    /// Required remainder.
    pub remainder: u32,
}

impl Periodicity {
    /// Returns `true` if the blanking count satisfies this constraint.
    #[must_use]
    pub const fn admits(self, count: u64) -> bool {
        self.divisor != 0 && count % self.divisor as u64 == (self.remainder % self.divisor) as u64
    }
}

/// How the caller waits for the swap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SyncMode {
    /// Swap at blanking and block until the swap completed.
    #[default]
    WaitForVblank,
    /// Swap at blanking but return right after issuing it. No timestamps are
    /// taken and the last-blank reference is invalidated.
    NoWait,
    /// Swap immediately without blanking sync (may tear).
    Immediate,
    /// Swap at blanking and busy-poll the beam into the blanking region
    /// instead of blocking on completion.
    SpinWait,
}

impl SyncMode {
    /// Whether this mode produces verifiable timestamps.
    #[must_use]
    pub const fn is_timestamped(self) -> bool {
        matches!(self, Self::WaitForVblank | Self::SpinWait)
    }
}

/// What happens to the back buffer after the swap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ClearMode {
    /// Clear to the background color.
    #[default]
    Clear,
    /// Restore the pre-swap back buffer content (incremental drawing).
    Preserve,
    /// Leave the back buffer undefined.
    Untouched,
}

/// One of the two views of a stereo surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Eye {
    /// Left-eye view.
    Left,
    /// Right-eye view.
    Right,
}

impl Eye {
    /// Eye shown on frames with the given blanking count. Even counts show
    /// the left eye.
    #[must_use]
    pub const fn for_count(count: u64) -> Self {
        if count % 2 == 0 { Self::Left } else { Self::Right }
    }

    /// The other eye.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

/// A presentation request. Immutable once submitted.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SwapRequest {
    /// When to swap.
    pub target: SwapTarget,
    /// Optional periodic field selection.
    pub periodicity: Option<Periodicity>,
    /// Optional even/odd field selection.
    pub parity: Option<FieldParity>,
    /// Back-buffer treatment after the swap.
    pub clear: ClearMode,
    /// Stereo draw buffer to select after the swap.
    pub stereo: Option<Eye>,
    /// How the caller waits.
    pub sync: SyncMode,
}

impl SwapRequest {
    /// Swap at the next vertical blank.
    #[must_use]
    pub fn asap() -> Self {
        Self::default()
    }

    /// Swap at the first vertical blank after `when`.
    #[must_use]
    pub fn at(when: HostTime) -> Self {
        Self {
            target: SwapTarget::At(when),
            ..Self::default()
        }
    }

    /// Swap at the vertical blank with counter value `count`.
    #[must_use]
    pub fn at_count(count: u64) -> Self {
        Self {
            target: SwapTarget::VblankCount(count),
            ..Self::default()
        }
    }

    /// Restricts the swap to counts with `count % divisor == remainder`.
    #[must_use]
    pub fn with_periodicity(mut self, divisor: u32, remainder: u32) -> Self {
        self.periodicity = Some(Periodicity { divisor, remainder });
        self
    }

    /// Restricts the swap to even or odd fields.
    #[must_use]
    pub fn with_parity(mut self, parity: FieldParity) -> Self {
        self.parity = Some(parity);
        self
    }

    /// Sets the back-buffer treatment.
    #[must_use]
    pub fn with_clear(mut self, clear: ClearMode) -> Self {
        self.clear = clear;
        self
    }

    /// Selects a stereo draw buffer after the swap.
    #[must_use]
    pub fn with_stereo(mut self, eye: Eye) -> Self {
        self.stereo = Some(eye);
        self
    }

    /// Sets the sync mode.
    #[must_use]
    pub fn with_sync(mut self, sync: SyncMode) -> Self {
        self.sync = sync;
        self
    }
}

/// Origin of a timestamp candidate, in descending default priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimestampSource {
    /// Completion reported by the platform's scheduled-swap path.
    Scheduled,
    /// Raw completion corrected by the beam position.
    BeamPosition,
    /// Timestamp of the blanking interrupt.
    BlankingInterrupt,
    /// Uncorrected time at which completion was observed.
    RawCompletion,
}

impl TimestampSource {
    /// All sources in default priority order.
    pub const ALL: [Self; 4] = [
        Self::Scheduled,
        Self::BeamPosition,
        Self::BlankingInterrupt,
        Self::RawCompletion,
    ];

    /// Stable index in `0..4`.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Scheduled => 0,
            Self::BeamPosition => 1,
            Self::BlankingInterrupt => 2,
            Self::RawCompletion => 3,
        }
    }
}

/// How much the final onset timestamp can be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimestampConfidence {
    /// No verifiable timing: raw completion time or an unsynchronized swap.
    Unverified,
    /// A corrected source with no second source to cross-check.
    Estimated,
    /// A corrected source that agreed with an independent source.
    Verified,
}

/// Outcome of one presentation call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlipResult {
    /// Corrected start of the vertical blank in which the swap took effect.
    pub onset: HostTime,
    /// End of that blank, when scanout of the new image started.
    pub scanout_start: HostTime,
    /// Time at which completion was observed, uncorrected.
    pub raw_completion: HostTime,
    /// Time the swap was requested.
    pub requested_at: HostTime,
    /// Time the flip call finished.
    pub flip_end: HostTime,
    /// Beam position sampled right after completion, if available.
    pub beam_position: Option<u32>,
    /// Onset minus deadline in seconds: negative is margin, positive a miss.
    pub deadline_miss_secs: f64,
    /// Per-surface swap sequence number, starting at 1.
    pub swap_sequence: u64,
    /// Blanking count of the swap, if the platform reports one.
    pub vblank_count: Option<u64>,
    /// Source the onset was taken from.
    pub source: TimestampSource,
    /// How much the onset can be trusted.
    pub confidence: TimestampConfidence,
    /// A source that was permanently disabled during this flip.
    pub demoted: Option<TimestampSource>,
    /// Eye shown by this swap on a frame-sequential stereo surface.
    pub eye: Option<Eye>,
}

impl FlipResult {
    /// Whether this flip missed its deadline.
    #[must_use]
    pub fn missed(&self) -> bool {
        self.deadline_miss_secs > 0.0
    }
}

/// Outcome of a refresh-interval calibration run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationResult {
    /// Measured refresh interval in seconds.
    pub refresh_interval_secs: f64,
    /// Number of accepted samples.
    pub sample_count: u32,
    /// Standard deviation of the accepted samples in seconds.
    pub std_dev_secs: f64,
    /// Whether every swap during calibration was a hardware pageflip.
    pub pageflip_confirmed: bool,
}

/// Calibrated refresh interval of a surface.
///
/// `interval_secs` is either `0.0` (unset) or strictly positive.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RefreshEstimate {
    /// Mean interval in seconds; zero when unset.
    pub interval_secs: f64,
    /// Samples behind the estimate.
    pub samples: u32,
    /// Standard deviation of the samples in seconds.
    pub std_dev_secs: f64,
}

impl RefreshEstimate {
    /// Whether an interval has been measured.
    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        self.interval_secs > 0.0
    }

    /// Interval in clock ticks.
    #[must_use]
    pub fn interval_ticks(&self, timebase: Timebase) -> u64 {
        timebase.secs_to_ticks(self.interval_secs)
    }

    /// Resets the estimate to unset.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Scanline range of the vertical blanking region.
///
/// Lines `0..start` are visible; lines `start..=end` are blanking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlankingGeometry {
    /// First blanking scanline (the visible height).
    pub start: u32,
    /// Last scanline of the frame.
    pub end: u32,
}

impl BlankingGeometry {
    /// Total scanlines per frame.
    #[must_use]
    pub const fn total_lines(&self) -> u32 {
        self.end + 1
    }

    /// Whether the scanline lies inside the blanking region.
    #[must_use]
    pub const fn in_blanking(&self, line: u32) -> bool {
        line >= self.start && line <= self.end
    }

    /// Scanlines elapsed since blanking started, and scanlines left until
    /// scanout of the next frame starts.
    ///
    /// Positions before `start` are treated as having wrapped past the end
    /// of the blank, so the remaining count is negative.
    #[must_use]
    pub fn lines_since_blank(&self, line: u32) -> (f64, f64) {
        let line = f64::from(line);
        let start = f64::from(self.start);
        let end = f64::from(self.end);
        if line >= start {
            (line - start, end - line + 1.0)
        } else {
            (end - start + 1.0 + line, -line)
        }
    }
}

/// Timing state owned by one on-screen surface.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SurfaceTiming {
    /// Calibrated refresh interval.
    pub refresh: RefreshEstimate,
    /// Blanking scanline range, if detected.
    pub blanking: Option<BlankingGeometry>,
    /// Onset of the last accepted blank, if still valid.
    pub last_vbl: Option<HostTime>,
    /// Blanking count of the last accepted blank, if known.
    pub last_vbl_count: Option<u64>,
    /// Onset of the last accepted timestamped flip.
    pub last_onset: Option<HostTime>,
    /// Swaps issued so far.
    pub swap_count: u64,
    /// Deadline misses counted so far.
    pub missed_deadlines: u64,
    /// Whether swaps are synchronized to the blank.
    pub vsync_enabled: bool,
    /// Whether the surface covers the whole display.
    pub fullscreen: bool,
    /// Whether the surface uses native quad-buffered stereo.
    pub native_stereo: bool,
    /// Whether the surface is multisampled.
    pub multisample: bool,
}

impl SurfaceTiming {
    /// Fresh, uncalibrated state for a newly opened surface.
    #[must_use]
    pub fn new(fullscreen: bool) -> Self {
        Self {
            vsync_enabled: true,
            fullscreen,
            ..Self::default()
        }
    }

    /// Forgets the last-blank reference.
    pub fn invalidate_vbl_reference(&mut self) {
        self.last_vbl = None;
        self.last_vbl_count = None;
    }
}

// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tracing and diagnostics for flips and calibration.
//!
//! A [`FlipEngine`](crate::scheduler::FlipEngine) reports each stage of a
//! flip, each timestamp-source demotion and each calibration interval to
//! the [`TraceSink`] installed on it. Sinks override only the events they
//! record.
//!
//! The engine reaches its sink through a [`Tracer`]. Without the `trace`
//! feature a `Tracer` holds nothing and its methods are empty, so the
//! events cost nothing to emit.
//!
//! These events are for per-flip instrumentation. Human-readable
//! diagnostics (calibration results, demoted sources, synchronization
//! disasters) go through `tracing` regardless of this feature.
//!
//! # Crate features
//!
//! - `trace`: enables the `Tracer` method bodies (one branch per call).

use crate::surface::SurfaceId;
use crate::time::HostTime;
use crate::timing::{
    CalibrationResult, FlipResult, SwapTarget, SyncMode, TimestampConfidence, TimestampSource,
};

/// Emitted when a flip request enters the engine.
#[derive(Clone, Copy, Debug)]
pub struct FlipRequestEvent {
    /// Surface being flipped.
    pub surface: SurfaceId,
    /// Sequence number the swap will get.
    pub swap_sequence: u64,
    /// Time the request arrived.
    pub requested_at: HostTime,
    /// Requested target.
    pub target: SwapTarget,
    /// Requested sync mode.
    pub sync: SyncMode,
}

/// Emitted right after the swap was handed to the platform.
#[derive(Clone, Copy, Debug)]
pub struct SwapIssuedEvent {
    /// Surface being flipped.
    pub surface: SurfaceId,
    /// Sequence number of the swap.
    pub swap_sequence: u64,
    /// Time the swap was issued.
    pub issued_at: HostTime,
    /// Whether the platform's scheduled-swap path was used.
    pub scheduled: bool,
    /// Blanking count the swap was aimed at, if resolved.
    pub target_count: Option<u64>,
    /// Beam position right before issuing, if available.
    pub beam_before: Option<u32>,
}

/// Per-flip timing summary.
#[derive(Clone, Copy, Debug)]
pub struct FlipSummary {
    /// Surface that was flipped.
    pub surface: SurfaceId,
    /// Sequence number of the swap.
    pub swap_sequence: u64,
    /// Time the request arrived.
    pub requested_at: HostTime,
    /// Arbitrated onset.
    pub onset: HostTime,
    /// Observed completion time.
    pub raw_completion: HostTime,
    /// Time the flip call finished.
    pub flip_end: HostTime,
    /// Onset minus deadline, in seconds.
    pub deadline_miss_secs: f64,
    /// Source of the onset.
    pub source: TimestampSource,
    /// Confidence of the onset.
    pub confidence: TimestampConfidence,
    /// Blanking count of the swap, if known.
    pub vblank_count: Option<u64>,
}

impl FlipSummary {
    /// Builds a summary from a finished flip.
    #[must_use]
    pub fn new(surface: SurfaceId, result: &FlipResult) -> Self {
        Self {
            surface,
            swap_sequence: result.swap_sequence,
            requested_at: result.requested_at,
            onset: result.onset,
            raw_completion: result.raw_completion,
            flip_end: result.flip_end,
            deadline_miss_secs: result.deadline_miss_secs,
            source: result.source,
            confidence: result.confidence,
            vblank_count: result.vblank_count,
        }
    }

    /// Whether the deadline was missed.
    #[must_use]
    pub fn missed_deadline(&self) -> bool {
        self.deadline_miss_secs > 0.0
    }
}

/// Emitted when a timestamp source is disabled for the session.
#[derive(Clone, Copy, Debug)]
pub struct SourceDemotedEvent {
    /// Surface whose arbiter disabled the source.
    pub surface: SurfaceId,
    /// The disabled source.
    pub source: TimestampSource,
    /// Sequence number of the swap that exposed it.
    pub swap_sequence: u64,
    /// Completion time of that swap.
    pub timestamp: HostTime,
}

/// Emitted for every interval measured during calibration.
#[derive(Clone, Copy, Debug)]
pub struct CalibrationSampleEvent {
    /// Surface being calibrated.
    pub surface: SurfaceId,
    /// Measured interval in seconds.
    pub delta_secs: f64,
    /// Whether the interval passed the plausibility filter.
    pub accepted: bool,
    /// Completion time of the swap that ended the interval.
    pub timestamp: HostTime,
}

/// Emitted when a calibration run ends.
#[derive(Clone, Copy, Debug)]
pub struct CalibrationDoneEvent {
    /// Surface that was calibrated.
    pub surface: SurfaceId,
    /// Result, or `None` if calibration failed.
    pub result: Option<CalibrationResult>,
    /// Time calibration ended.
    pub timestamp: HostTime,
}

/// Receives per-flip and calibration events from the engine.
///
/// Every method defaults to doing nothing.
pub trait TraceSink {
    /// Called when a flip request arrives.
    fn on_flip_request(&mut self, e: &FlipRequestEvent) {
        _ = e;
    }

    /// Called after the swap was issued.
    fn on_swap_issued(&mut self, e: &SwapIssuedEvent) {
        _ = e;
    }

    /// Called with the summary of a finished flip.
    fn on_flip_summary(&mut self, s: &FlipSummary) {
        _ = s;
    }

    /// Called when a timestamp source is disabled.
    fn on_source_demoted(&mut self, e: &SourceDemotedEvent) {
        _ = e;
    }

    /// Called for every calibration interval.
    fn on_calibration_sample(&mut self, e: &CalibrationSampleEvent) {
        _ = e;
    }

    /// Called when calibration ends.
    fn on_calibration_done(&mut self, e: &CalibrationDoneEvent) {
        _ = e;
    }
}

/// Ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl TraceSink for NoopSink {}

/// Borrowed handle to the engine's sink, if any.
///
/// Compiled down to a zero-sized no-op without the `trace` feature.
pub struct Tracer<'a> {
    #[cfg(feature = "trace")]
    sink: Option<&'a mut dyn TraceSink>,
    #[cfg(not(feature = "trace"))]
    _marker: core::marker::PhantomData<&'a mut dyn TraceSink>,
}

impl core::fmt::Debug for Tracer<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tracer").finish_non_exhaustive()
    }
}

impl<'a> Tracer<'a> {
    /// Forwards events to `sink`.
    #[inline]
    #[must_use]
    pub fn new(sink: &'a mut dyn TraceSink) -> Self {
        #[cfg(feature = "trace")]
        {
            Self { sink: Some(sink) }
        }
        #[cfg(not(feature = "trace"))]
        {
            _ = sink;
            Self {
                _marker: core::marker::PhantomData,
            }
        }
    }

    /// Creates a tracer from an optional sink.
    #[inline]
    #[must_use]
    pub fn from_option(sink: Option<&'a mut dyn TraceSink>) -> Self {
        match sink {
            Some(sink) => Self::new(sink),
            None => Self::none(),
        }
    }

    /// Drops every event.
    #[inline]
    #[must_use]
    pub fn none() -> Self {
        #[cfg(feature = "trace")]
        {
            Self { sink: None }
        }
        #[cfg(not(feature = "trace"))]
        {
            Self {
                _marker: core::marker::PhantomData,
            }
        }
    }

    /// Emits a [`FlipRequestEvent`].
    #[inline]
    pub fn flip_request(&mut self, e: &FlipRequestEvent) {
        #[cfg(feature = "trace")]
        if let Some(s) = &mut self.sink {
            s.on_flip_request(e);
        }
        #[cfg(not(feature = "trace"))]
        {
            _ = e;
        }
    }

    /// Emits a [`SwapIssuedEvent`].
    #[inline]
    pub fn swap_issued(&mut self, e: &SwapIssuedEvent) {
        #[cfg(feature = "trace")]
        if let Some(s) = &mut self.sink {
            s.on_swap_issued(e);
        }
        #[cfg(not(feature = "trace"))]
        {
            _ = e;
        }
    }

    /// Emits a [`FlipSummary`].
    #[inline]
    pub fn flip_summary(&mut self, s: &FlipSummary) {
        #[cfg(feature = "trace")]
        if let Some(sink) = &mut self.sink {
            sink.on_flip_summary(s);
        }
        #[cfg(not(feature = "trace"))]
        {
            _ = s;
        }
    }

    /// Emits a [`SourceDemotedEvent`].
    #[inline]
    pub fn source_demoted(&mut self, e: &SourceDemotedEvent) {
        #[cfg(feature = "trace")]
        if let Some(s) = &mut self.sink {
            s.on_source_demoted(e);
        }
        #[cfg(not(feature = "trace"))]
        {
            _ = e;
        }
    }

    /// Emits a [`CalibrationSampleEvent`].
    #[inline]
    pub fn calibration_sample(&mut self, e: &CalibrationSampleEvent) {
        #[cfg(feature = "trace")]
        if let Some(s) = &mut self.sink {
            s.on_calibration_sample(e);
        }
        #[cfg(not(feature = "trace"))]
        {
            _ = e;
        }
    }

    /// Emits a [`CalibrationDoneEvent`].
    #[inline]
    pub fn calibration_done(&mut self, e: &CalibrationDoneEvent) {
        #[cfg(feature = "trace")]
        if let Some(s) = &mut self.sink {
            s.on_calibration_done(e);
        }
        #[cfg(not(feature = "trace"))]
        {
            _ = e;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::Eye;

    fn sample_result() -> FlipResult {
        FlipResult {
            onset: HostTime(1_016_667),
            scanout_start: HostTime(1_017_300),
            raw_completion: HostTime(1_017_000),
            requested_at: HostTime(1_000_000),
            flip_end: HostTime(1_017_100),
            beam_position: Some(1090),
            deadline_miss_secs: -0.000_8,
            swap_sequence: 42,
            vblank_count: Some(600),
            source: TimestampSource::BeamPosition,
            confidence: TimestampConfidence::Verified,
            demoted: None,
            eye: Some(Eye::Left),
        }
    }

    #[test]
    fn flip_summary_from_result() {
        let summary = FlipSummary::new(SurfaceId(3), &sample_result());
        assert_eq!(summary.surface, SurfaceId(3));
        assert_eq!(summary.swap_sequence, 42);
        assert_eq!(summary.onset, HostTime(1_016_667));
        assert!(!summary.missed_deadline(), "negative miss is margin");
    }

    #[test]
    fn noop_sink_compiles() {
        let mut sink = NoopSink;
        sink.on_flip_summary(&FlipSummary::new(SurfaceId(0), &sample_result()));
        sink.on_calibration_done(&CalibrationDoneEvent {
            surface: SurfaceId(0),
            result: None,
            timestamp: HostTime(0),
        });
    }

    #[test]
    fn tracer_none_does_nothing() {
        let mut tracer = Tracer::none();
        tracer.flip_summary(&FlipSummary::new(SurfaceId(0), &sample_result()));
        tracer.source_demoted(&SourceDemotedEvent {
            surface: SurfaceId(0),
            source: TimestampSource::Scheduled,
            swap_sequence: 1,
            timestamp: HostTime(0),
        });
    }

    #[cfg(feature = "trace")]
    #[test]
    fn tracer_dispatches_to_sink() {
        struct RecordingSink {
            sequences: Vec<u64>,
        }
        impl TraceSink for RecordingSink {
            fn on_flip_summary(&mut self, s: &FlipSummary) {
                self.sequences.push(s.swap_sequence);
            }
        }

        let mut sink = RecordingSink {
            sequences: Vec::new(),
        };
        let mut tracer = Tracer::new(&mut sink);
        tracer.flip_summary(&FlipSummary::new(SurfaceId(0), &sample_result()));
        drop(tracer);
        assert_eq!(sink.sequences, &[42], "summary forwarded");
    }
}

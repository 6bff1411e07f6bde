// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Compact binary event recording and decoding.
//!
//! [`RecorderSink`] implements [`TraceSink`] and encodes events into a
//! `Vec<u8>` as fixed-size little-endian records. [`decode`] reads them back
//! as an iterator of [`RecordedEvent`]. Floating-point fields are stored as
//! their IEEE-754 bit patterns, so they decode exactly.

use vblsync_core::surface::SurfaceId;
use vblsync_core::time::HostTime;
use vblsync_core::timing::{
    CalibrationResult, SwapTarget, SyncMode, TimestampConfidence, TimestampSource,
};
use vblsync_core::trace::{
    CalibrationDoneEvent, CalibrationSampleEvent, FlipRequestEvent, FlipSummary,
    SourceDemotedEvent, SwapIssuedEvent, TraceSink,
};

// ---------------------------------------------------------------------------
// Event type discriminants
// ---------------------------------------------------------------------------

const TAG_FLIP_REQUEST: u8 = 1;
const TAG_SWAP_ISSUED: u8 = 2;
const TAG_FLIP_SUMMARY: u8 = 3;
const TAG_SOURCE_DEMOTED: u8 = 4;
const TAG_CALIBRATION_SAMPLE: u8 = 5;
const TAG_CALIBRATION_DONE: u8 = 6;

// ---------------------------------------------------------------------------
// RecorderSink
// ---------------------------------------------------------------------------

/// A [`TraceSink`] that encodes events into a compact binary buffer.
#[derive(Debug, Default)]
pub struct RecorderSink {
    buf: Vec<u8>,
}

impl RecorderSink {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a view of the recorded bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the recorder and returns the recorded bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    // -- encoding helpers --------------------------------------------------

    fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_f64(&mut self, v: f64) {
        self.write_u64(v.to_bits());
    }

    fn write_bool(&mut self, v: bool) {
        self.write_u8(u8::from(v));
    }

    fn write_option_u64(&mut self, v: Option<u64>) {
        self.write_bool(v.is_some());
        self.write_u64(v.unwrap_or(0));
    }

    fn write_option_u32(&mut self, v: Option<u32>) {
        self.write_bool(v.is_some());
        self.write_u32(v.unwrap_or(0));
    }

    fn write_target(&mut self, t: SwapTarget) {
        let (kind, value) = match t {
            SwapTarget::Asap => (0, 0),
            SwapTarget::At(when) => (1, when.ticks()),
            SwapTarget::VblankCount(n) => (2, n),
        };
        self.write_u8(kind);
        self.write_u64(value);
    }

    fn write_sync(&mut self, s: SyncMode) {
        self.write_u8(match s {
            SyncMode::WaitForVblank => 0,
            SyncMode::NoWait => 1,
            SyncMode::Immediate => 2,
            SyncMode::SpinWait => 3,
        });
    }

    fn write_source(&mut self, s: TimestampSource) {
        self.write_u8(match s {
            TimestampSource::Scheduled => 0,
            TimestampSource::BeamPosition => 1,
            TimestampSource::BlankingInterrupt => 2,
            TimestampSource::RawCompletion => 3,
        });
    }

    fn write_confidence(&mut self, c: TimestampConfidence) {
        self.write_u8(match c {
            TimestampConfidence::Unverified => 0,
            TimestampConfidence::Estimated => 1,
            TimestampConfidence::Verified => 2,
        });
    }
}

impl TraceSink for RecorderSink {
    fn on_flip_request(&mut self, e: &FlipRequestEvent) {
        self.write_u8(TAG_FLIP_REQUEST);
        self.write_u32(e.surface.0);
        self.write_u64(e.swap_sequence);
        self.write_u64(e.requested_at.ticks());
        self.write_target(e.target);
        self.write_sync(e.sync);
    }

    fn on_swap_issued(&mut self, e: &SwapIssuedEvent) {
        self.write_u8(TAG_SWAP_ISSUED);
        self.write_u32(e.surface.0);
        self.write_u64(e.swap_sequence);
        self.write_u64(e.issued_at.ticks());
        self.write_bool(e.scheduled);
        self.write_option_u64(e.target_count);
        self.write_option_u32(e.beam_before);
    }

    fn on_flip_summary(&mut self, s: &FlipSummary) {
        self.write_u8(TAG_FLIP_SUMMARY);
        self.write_u32(s.surface.0);
        self.write_u64(s.swap_sequence);
        self.write_u64(s.requested_at.ticks());
        self.write_u64(s.onset.ticks());
        self.write_u64(s.raw_completion.ticks());
        self.write_u64(s.flip_end.ticks());
        self.write_f64(s.deadline_miss_secs);
        self.write_source(s.source);
        self.write_confidence(s.confidence);
        self.write_option_u64(s.vblank_count);
    }

    fn on_source_demoted(&mut self, e: &SourceDemotedEvent) {
        self.write_u8(TAG_SOURCE_DEMOTED);
        self.write_u32(e.surface.0);
        self.write_source(e.source);
        self.write_u64(e.swap_sequence);
        self.write_u64(e.timestamp.ticks());
    }

    fn on_calibration_sample(&mut self, e: &CalibrationSampleEvent) {
        self.write_u8(TAG_CALIBRATION_SAMPLE);
        self.write_u32(e.surface.0);
        self.write_f64(e.delta_secs);
        self.write_bool(e.accepted);
        self.write_u64(e.timestamp.ticks());
    }

    fn on_calibration_done(&mut self, e: &CalibrationDoneEvent) {
        self.write_u8(TAG_CALIBRATION_DONE);
        self.write_u32(e.surface.0);
        let r = e.result;
        self.write_bool(r.is_some());
        self.write_f64(r.map_or(0.0, |r| r.refresh_interval_secs));
        self.write_u32(r.map_or(0, |r| r.sample_count));
        self.write_f64(r.map_or(0.0, |r| r.std_dev_secs));
        self.write_bool(r.is_some_and(|r| r.pageflip_confirmed));
        self.write_u64(e.timestamp.ticks());
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// A decoded event from a binary recording.
#[derive(Clone, Debug)]
pub enum RecordedEvent {
    /// A [`FlipRequestEvent`].
    FlipRequest(FlipRequestEvent),
    /// A [`SwapIssuedEvent`].
    SwapIssued(SwapIssuedEvent),
    /// A [`FlipSummary`].
    FlipSummary(FlipSummary),
    /// A [`SourceDemotedEvent`].
    SourceDemoted(SourceDemotedEvent),
    /// A [`CalibrationSampleEvent`].
    CalibrationSample(CalibrationSampleEvent),
    /// A [`CalibrationDoneEvent`].
    CalibrationDone(CalibrationDoneEvent),
}

/// Decodes a byte slice produced by [`RecorderSink`] into an iterator of
/// [`RecordedEvent`].
pub fn decode(bytes: &[u8]) -> DecodeIter<'_> {
    DecodeIter {
        data: bytes,
        pos: 0,
    }
}

/// Iterator over decoded events.
///
/// Stops at the first unknown tag or truncated record.
#[derive(Debug)]
pub struct DecodeIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl DecodeIter<'_> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.data.get(self.pos..self.pos + N)?.try_into().ok()?;
        self.pos += N;
        Some(bytes)
    }

    fn read_u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|[b]| b)
    }

    fn read_u32(&mut self) -> Option<u32> {
        self.take().map(u32::from_le_bytes)
    }

    fn read_u64(&mut self) -> Option<u64> {
        self.take().map(u64::from_le_bytes)
    }

    fn read_f64(&mut self) -> Option<f64> {
        self.read_u64().map(f64::from_bits)
    }

    fn read_bool(&mut self) -> Option<bool> {
        self.read_u8().map(|b| b != 0)
    }

    fn read_option_u64(&mut self) -> Option<Option<u64>> {
        let present = self.read_bool()?;
        let val = self.read_u64()?;
        Some(present.then_some(val))
    }

    fn read_option_u32(&mut self) -> Option<Option<u32>> {
        let present = self.read_bool()?;
        let val = self.read_u32()?;
        Some(present.then_some(val))
    }

    fn read_surface(&mut self) -> Option<SurfaceId> {
        self.read_u32().map(SurfaceId)
    }

    fn read_time(&mut self) -> Option<HostTime> {
        self.read_u64().map(HostTime)
    }

    fn read_target(&mut self) -> Option<SwapTarget> {
        let kind = self.read_u8()?;
        let value = self.read_u64()?;
        Some(match kind {
            0 => SwapTarget::Asap,
            1 => SwapTarget::At(HostTime(value)),
            _ => SwapTarget::VblankCount(value),
        })
    }

    fn read_sync(&mut self) -> Option<SyncMode> {
        Some(match self.read_u8()? {
            0 => SyncMode::WaitForVblank,
            1 => SyncMode::NoWait,
            2 => SyncMode::Immediate,
            _ => SyncMode::SpinWait,
        })
    }

    fn read_source(&mut self) -> Option<TimestampSource> {
        Some(match self.read_u8()? {
            0 => TimestampSource::Scheduled,
            1 => TimestampSource::BeamPosition,
            2 => TimestampSource::BlankingInterrupt,
            _ => TimestampSource::RawCompletion,
        })
    }

    fn read_confidence(&mut self) -> Option<TimestampConfidence> {
        Some(match self.read_u8()? {
            0 => TimestampConfidence::Unverified,
            1 => TimestampConfidence::Estimated,
            _ => TimestampConfidence::Verified,
        })
    }

    fn decode_flip_request(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::FlipRequest(FlipRequestEvent {
            surface: self.read_surface()?,
            swap_sequence: self.read_u64()?,
            requested_at: self.read_time()?,
            target: self.read_target()?,
            sync: self.read_sync()?,
        }))
    }

    fn decode_swap_issued(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::SwapIssued(SwapIssuedEvent {
            surface: self.read_surface()?,
            swap_sequence: self.read_u64()?,
            issued_at: self.read_time()?,
            scheduled: self.read_bool()?,
            target_count: self.read_option_u64()?,
            beam_before: self.read_option_u32()?,
        }))
    }

    fn decode_flip_summary(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::FlipSummary(FlipSummary {
            surface: self.read_surface()?,
            swap_sequence: self.read_u64()?,
            requested_at: self.read_time()?,
            onset: self.read_time()?,
            raw_completion: self.read_time()?,
            flip_end: self.read_time()?,
            deadline_miss_secs: self.read_f64()?,
            source: self.read_source()?,
            confidence: self.read_confidence()?,
            vblank_count: self.read_option_u64()?,
        }))
    }

    fn decode_source_demoted(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::SourceDemoted(SourceDemotedEvent {
            surface: self.read_surface()?,
            source: self.read_source()?,
            swap_sequence: self.read_u64()?,
            timestamp: self.read_time()?,
        }))
    }

    fn decode_calibration_sample(&mut self) -> Option<RecordedEvent> {
        Some(RecordedEvent::CalibrationSample(CalibrationSampleEvent {
            surface: self.read_surface()?,
            delta_secs: self.read_f64()?,
            accepted: self.read_bool()?,
            timestamp: self.read_time()?,
        }))
    }

    fn decode_calibration_done(&mut self) -> Option<RecordedEvent> {
        let surface = self.read_surface()?;
        let present = self.read_bool()?;
        let result = CalibrationResult {
            refresh_interval_secs: self.read_f64()?,
            sample_count: self.read_u32()?,
            std_dev_secs: self.read_f64()?,
            pageflip_confirmed: self.read_bool()?,
        };
        Some(RecordedEvent::CalibrationDone(CalibrationDoneEvent {
            surface,
            result: present.then_some(result),
            timestamp: self.read_time()?,
        }))
    }
}

impl Iterator for DecodeIter<'_> {
    type Item = RecordedEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let tag = self.read_u8()?;
        match tag {
            TAG_FLIP_REQUEST => self.decode_flip_request(),
            TAG_SWAP_ISSUED => self.decode_swap_issued(),
            TAG_FLIP_SUMMARY => self.decode_flip_summary(),
            TAG_SOURCE_DEMOTED => self.decode_source_demoted(),
            TAG_CALIBRATION_SAMPLE => self.decode_calibration_sample(),
            TAG_CALIBRATION_DONE => self.decode_calibration_done(),
            _ => None, // unknown tag → stop iteration
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_summary() -> FlipSummary {
        FlipSummary {
            surface: SurfaceId(2),
            swap_sequence: 41,
            requested_at: HostTime(1_000_000),
            onset: HostTime(1_016_667),
            raw_completion: HostTime(1_016_900),
            flip_end: HostTime(1_017_000),
            deadline_miss_secs: -0.000_123_456_789,
            source: TimestampSource::BeamPosition,
            confidence: TimestampConfidence::Verified,
            vblank_count: Some(600),
        }
    }

    #[test]
    fn flip_summary_keeps_exact_miss() {
        let mut rec = RecorderSink::new();
        let orig = sample_summary();
        rec.on_flip_summary(&orig);

        let events: Vec<_> = decode(rec.as_bytes()).collect();
        assert_eq!(events.len(), 1, "one event recorded");
        match &events[0] {
            RecordedEvent::FlipSummary(s) => {
                assert_eq!(s.surface, orig.surface);
                assert_eq!(s.swap_sequence, orig.swap_sequence);
                assert_eq!(s.onset, orig.onset);
                assert_eq!(
                    s.deadline_miss_secs.to_bits(),
                    orig.deadline_miss_secs.to_bits(),
                    "floats are stored bit-exact"
                );
                assert_eq!(s.source, orig.source);
                assert_eq!(s.confidence, orig.confidence);
                assert_eq!(s.vblank_count, orig.vblank_count);
            }
            other => panic!("expected FlipSummary, got {other:?}"),
        }
    }

    #[test]
    fn request_and_issue_sequence() {
        let mut rec = RecorderSink::new();
        rec.on_flip_request(&FlipRequestEvent {
            surface: SurfaceId(1),
            swap_sequence: 3,
            requested_at: HostTime(500),
            target: SwapTarget::At(HostTime(20_000)),
            sync: SyncMode::SpinWait,
        });
        rec.on_swap_issued(&SwapIssuedEvent {
            surface: SurfaceId(1),
            swap_sequence: 3,
            issued_at: HostTime(19_000),
            scheduled: false,
            target_count: None,
            beam_before: Some(1_024),
        });
        rec.on_flip_summary(&sample_summary());

        let events: Vec<_> = decode(rec.as_bytes()).collect();
        assert_eq!(events.len(), 3, "three events recorded");
        match &events[0] {
            RecordedEvent::FlipRequest(e) => {
                assert_eq!(e.target, SwapTarget::At(HostTime(20_000)));
                assert_eq!(e.sync, SyncMode::SpinWait);
            }
            other => panic!("expected FlipRequest, got {other:?}"),
        }
        match &events[1] {
            RecordedEvent::SwapIssued(e) => {
                assert!(!e.scheduled, "unscheduled swap");
                assert_eq!(e.target_count, None);
                assert_eq!(e.beam_before, Some(1_024));
            }
            other => panic!("expected SwapIssued, got {other:?}"),
        }
        assert!(
            matches!(events[2], RecordedEvent::FlipSummary(_)),
            "summary last"
        );
    }

    #[test]
    fn failed_calibration_decodes_as_none() {
        let mut rec = RecorderSink::new();
        rec.on_calibration_sample(&CalibrationSampleEvent {
            surface: SurfaceId(0),
            delta_secs: 0.060,
            accepted: false,
            timestamp: HostTime(9_000),
        });
        rec.on_calibration_done(&CalibrationDoneEvent {
            surface: SurfaceId(0),
            result: None,
            timestamp: HostTime(9_500),
        });

        let events: Vec<_> = decode(rec.as_bytes()).collect();
        match &events[..] {
            [
                RecordedEvent::CalibrationSample(sample),
                RecordedEvent::CalibrationDone(done),
            ] => {
                assert!(!sample.accepted, "rejected sample");
                assert!(done.result.is_none(), "failed calibration has no result");
                assert_eq!(done.timestamp, HostTime(9_500), "end time kept");
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn truncated_record_stops_decoding() {
        let mut rec = RecorderSink::new();
        rec.on_source_demoted(&SourceDemotedEvent {
            surface: SurfaceId(1),
            source: TimestampSource::BlankingInterrupt,
            swap_sequence: 9,
            timestamp: HostTime(4_000),
        });
        rec.on_flip_summary(&sample_summary());
        let bytes = rec.into_bytes();
        let events: Vec<_> = decode(&bytes[..bytes.len() - 3]).collect();
        assert_eq!(events.len(), 1, "only the complete record decodes");
        assert!(
            matches!(events[0], RecordedEvent::SourceDemoted(_)),
            "demotion survives"
        );
    }

    #[test]
    fn empty_buffer_decodes_to_nothing() {
        let events: Vec<_> = decode(&[]).collect();
        assert!(events.is_empty(), "no events in an empty buffer");
    }
}

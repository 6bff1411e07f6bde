// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Chrome Trace Event Format exporter.
//!
//! [`export`] reads recorded bytes from a [`RecorderSink`](super::recorder::RecorderSink)
//! and writes [Chrome Trace Event Format][format] JSON to the given writer.
//!
//! Every finished flip becomes a complete (`"X"`) span from request to the
//! end of the flip call, plus an instant marker at the stimulus onset, so
//! missed deadlines line up visually against the refresh cadence.
//!
//! [format]: https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU

use std::io::{self, Write};

use serde_json::{Value, json};

use vblsync_core::time::Timebase;
use vblsync_core::timing::SwapTarget;

use crate::recorder::{RecordedEvent, decode};

/// Exports recorded events as Chrome Trace Event Format JSON.
///
/// The output is a complete JSON array of trace event objects, suitable for
/// loading into `chrome://tracing` or [Perfetto](https://ui.perfetto.dev/).
/// Each surface gets its own process lane.
///
/// Timestamps are converted to microseconds using the provided [`Timebase`].
pub fn export(bytes: &[u8], timebase: Timebase, writer: &mut dyn Write) -> io::Result<()> {
    let mut events: Vec<Value> = Vec::new();

    for recorded in decode(bytes) {
        match recorded {
            RecordedEvent::FlipRequest(e) => {
                let (target, target_value) = match e.target {
                    SwapTarget::Asap => ("asap", Value::Null),
                    SwapTarget::At(t) => ("at", json!(ticks_to_us(t.ticks(), timebase))),
                    SwapTarget::VblankCount(n) => ("vblank_count", json!(n)),
                };
                events.push(json!({
                    "ph": "i",
                    "name": "FlipRequest",
                    "cat": "Flip",
                    "ts": ticks_to_us(e.requested_at.ticks(), timebase),
                    "pid": e.surface.0,
                    "tid": 0,
                    "s": "t",
                    "args": {
                        "swap_sequence": e.swap_sequence,
                        "target": target,
                        "target_value": target_value,
                        "sync": format!("{:?}", e.sync),
                    }
                }));
            }
            RecordedEvent::SwapIssued(e) => {
                events.push(json!({
                    "ph": "i",
                    "name": "SwapIssued",
                    "cat": "Flip",
                    "ts": ticks_to_us(e.issued_at.ticks(), timebase),
                    "pid": e.surface.0,
                    "tid": 0,
                    "s": "t",
                    "args": {
                        "swap_sequence": e.swap_sequence,
                        "scheduled": e.scheduled,
                        "target_count": e.target_count,
                        "beam_before": e.beam_before,
                    }
                }));
            }
            RecordedEvent::FlipSummary(s) => {
                let start = ticks_to_us(s.requested_at.ticks(), timebase);
                let end = ticks_to_us(s.flip_end.ticks(), timebase);
                events.push(json!({
                    "ph": "X",
                    "name": "Flip",
                    "cat": "Flip",
                    "ts": start,
                    "dur": (end - start).max(0.0),
                    "pid": s.surface.0,
                    "tid": 0,
                    "args": {
                        "swap_sequence": s.swap_sequence,
                        "deadline_miss_ms": s.deadline_miss_secs * 1000.0,
                        "missed_deadline": s.missed_deadline(),
                        "source": format!("{:?}", s.source),
                        "confidence": format!("{:?}", s.confidence),
                        "vblank_count": s.vblank_count,
                        "raw_completion_us": ticks_to_us(s.raw_completion.ticks(), timebase),
                    }
                }));
                events.push(json!({
                    "ph": "i",
                    "name": "Onset",
                    "cat": "Summary",
                    "ts": ticks_to_us(s.onset.ticks(), timebase),
                    "pid": s.surface.0,
                    "tid": 0,
                    "s": "p",
                    "args": {
                        "swap_sequence": s.swap_sequence,
                    }
                }));
            }
            RecordedEvent::SourceDemoted(e) => {
                events.push(json!({
                    "ph": "i",
                    "name": "SourceDemoted",
                    "cat": "Arbiter",
                    "ts": ticks_to_us(e.timestamp.ticks(), timebase),
                    "pid": e.surface.0,
                    "tid": 0,
                    "s": "p",
                    "args": {
                        "source": format!("{:?}", e.source),
                        "swap_sequence": e.swap_sequence,
                    }
                }));
            }
            RecordedEvent::CalibrationSample(e) => {
                events.push(json!({
                    "ph": "C",
                    "name": "RefreshInterval",
                    "cat": "Calibration",
                    "ts": ticks_to_us(e.timestamp.ticks(), timebase),
                    "pid": e.surface.0,
                    "tid": 0,
                    "args": {
                        "delta_ms": e.delta_secs * 1000.0,
                        "accepted": u8::from(e.accepted),
                    }
                }));
            }
            RecordedEvent::CalibrationDone(e) => {
                let args = match e.result {
                    Some(r) => json!({
                        "refresh_interval_ms": r.refresh_interval_secs * 1000.0,
                        "sample_count": r.sample_count,
                        "std_dev_ms": r.std_dev_secs * 1000.0,
                        "pageflip_confirmed": r.pageflip_confirmed,
                    }),
                    None => json!({ "failed": true }),
                };
                events.push(json!({
                    "ph": "i",
                    "name": "CalibrationDone",
                    "cat": "Calibration",
                    "ts": ticks_to_us(e.timestamp.ticks(), timebase),
                    "pid": e.surface.0,
                    "tid": 0,
                    "s": "p",
                    "args": args,
                }));
            }
        }
    }

    serde_json::to_writer_pretty(writer, &events)?;
    Ok(())
}

fn ticks_to_us(ticks: u64, timebase: Timebase) -> f64 {
    timebase.ticks_to_nanos(ticks) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::RecorderSink;
    use vblsync_core::surface::SurfaceId;
    use vblsync_core::time::HostTime;
    use vblsync_core::timing::{SyncMode, TimestampConfidence, TimestampSource};
    use vblsync_core::trace::{
        CalibrationDoneEvent, FlipRequestEvent, FlipSummary, SourceDemotedEvent, TraceSink,
    };

    #[test]
    fn export_produces_valid_json() {
        let mut rec = RecorderSink::new();
        rec.on_flip_request(&FlipRequestEvent {
            surface: SurfaceId(3),
            swap_sequence: 7,
            requested_at: HostTime(1_000_000),
            target: SwapTarget::VblankCount(60),
            sync: SyncMode::WaitForVblank,
        });
        rec.on_flip_summary(&FlipSummary {
            surface: SurfaceId(3),
            swap_sequence: 7,
            requested_at: HostTime(1_000_000),
            onset: HostTime(1_016_000),
            raw_completion: HostTime(1_016_050),
            flip_end: HostTime(1_017_000),
            deadline_miss_secs: 0.002,
            source: TimestampSource::Scheduled,
            confidence: TimestampConfidence::Verified,
            vblank_count: Some(60),
        });
        rec.on_source_demoted(&SourceDemotedEvent {
            surface: SurfaceId(3),
            source: TimestampSource::BeamPosition,
            swap_sequence: 7,
            timestamp: HostTime(1_016_050),
        });

        let mut out = Vec::new();
        export(rec.as_bytes(), Timebase::NANOS, &mut out).expect("export");
        let json_str = String::from_utf8(out).expect("utf-8");
        let parsed: Vec<Value> = serde_json::from_str(&json_str).expect("a JSON array");
        assert_eq!(parsed.len(), 4, "request, span, onset, demotion");

        assert_eq!(parsed[0]["name"], "FlipRequest", "request first");
        assert_eq!(parsed[0]["args"]["target_value"], 60, "count target kept");

        assert_eq!(parsed[1]["ph"], "X", "flip is a complete span");
        assert_eq!(parsed[1]["pid"], 3, "lane per surface");
        assert_eq!(parsed[1]["args"]["missed_deadline"], true, "late flip");
        assert!(
            (parsed[1]["dur"].as_f64().unwrap_or_default() - 17.0).abs() < 1e-9,
            "span covers request to flip end"
        );

        assert_eq!(parsed[2]["name"], "Onset", "onset marker follows");
        assert_eq!(parsed[3]["args"]["source"], "BeamPosition", "demoted source");
        assert!(
            (parsed[3]["ts"].as_f64().unwrap_or_default() - 1_016.05).abs() < 1e-9,
            "demotion placed at its swap"
        );
    }

    #[test]
    fn inverted_span_is_clamped_and_calibration_is_placed() {
        let mut rec = RecorderSink::new();
        rec.on_flip_summary(&FlipSummary {
            surface: SurfaceId(1),
            swap_sequence: 2,
            requested_at: HostTime(5_000_000),
            onset: HostTime(4_990_000),
            raw_completion: HostTime(4_990_000),
            flip_end: HostTime(4_995_000),
            deadline_miss_secs: -0.001,
            source: TimestampSource::RawCompletion,
            confidence: TimestampConfidence::Unverified,
            vblank_count: None,
        });
        rec.on_calibration_done(&CalibrationDoneEvent {
            surface: SurfaceId(1),
            result: None,
            timestamp: HostTime(3_000_000),
        });

        let mut out = Vec::new();
        export(rec.as_bytes(), Timebase::NANOS, &mut out).expect("export");
        let parsed: Vec<Value> = serde_json::from_slice(&out).expect("a JSON array");
        assert_eq!(parsed.len(), 3, "span, onset, calibration");
        assert_eq!(
            parsed[0]["dur"].as_f64(),
            Some(0.0),
            "flip end before request clamps to an empty span"
        );
        assert_eq!(parsed[2]["name"], "CalibrationDone", "calibration last");
        assert_eq!(parsed[2]["ts"].as_f64(), Some(3_000.0), "placed at its end time");
        assert_eq!(parsed[2]["args"]["failed"], true, "failure flagged");
    }

    #[test]
    fn export_empty_recording() {
        let mut out = Vec::new();
        export(&[], Timebase::NANOS, &mut out).expect("export");
        let json_str = String::from_utf8(out).expect("utf-8");
        let parsed: Vec<Value> = serde_json::from_str(&json_str).expect("a JSON array");
        assert!(parsed.is_empty(), "no events");
    }
}

// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Human-readable trace output.
//!
//! [`PrettyPrintSink`] implements [`TraceSink`] and writes one line per event
//! to a [`Write`](std::io::Write) destination (default: stderr). Timestamps
//! are converted to microseconds using a [`Timebase`].

use std::io::Write;

use vblsync_core::time::{HostTime, Timebase};
use vblsync_core::timing::SwapTarget;
use vblsync_core::trace::{
    CalibrationDoneEvent, CalibrationSampleEvent, FlipRequestEvent, FlipSummary,
    SourceDemotedEvent, SwapIssuedEvent, TraceSink,
};

/// Writes human-readable trace lines to a [`Write`](std::io::Write) destination.
///
/// The default writer is `Send` so the sink can be installed on a
/// [`FlipEngine`](vblsync_core::scheduler::FlipEngine) that moves to a
/// worker thread.
pub struct PrettyPrintSink<W: Write = Box<dyn Write + Send>> {
    writer: W,
    timebase: Timebase,
}

impl<W: Write> std::fmt::Debug for PrettyPrintSink<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrettyPrintSink")
            .field("timebase", &self.timebase)
            .finish_non_exhaustive()
    }
}

impl PrettyPrintSink {
    /// Creates a sink that writes to stderr.
    #[must_use]
    pub fn stderr(timebase: Timebase) -> Self {
        Self {
            writer: Box::new(std::io::stderr()),
            timebase,
        }
    }

    /// Creates a sink that writes to a boxed writer.
    #[must_use]
    pub fn new(writer: Box<dyn Write + Send>, timebase: Timebase) -> Self {
        Self { writer, timebase }
    }
}

impl<W: Write> PrettyPrintSink<W> {
    /// Creates a sink that writes to the given destination.
    #[must_use]
    pub fn with_writer(writer: W, timebase: Timebase) -> Self {
        Self { writer, timebase }
    }

    /// Consumes the sink and returns its writer.
    #[must_use]
    pub fn into_writer(self) -> W {
        self.writer
    }

    fn host_us(&self, t: HostTime) -> f64 {
        self.timebase.ticks_to_nanos(t.ticks()) as f64 / 1000.0
    }

    fn target_label(&self, target: SwapTarget) -> String {
        match target {
            SwapTarget::Asap => "asap".into(),
            SwapTarget::At(t) => format!("at {:.1}µs", self.host_us(t)),
            SwapTarget::VblankCount(n) => format!("vbl #{n}"),
        }
    }
}

fn opt<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map_or_else(|| "-".into(), |v| v.to_string())
}

impl<W: Write> TraceSink for PrettyPrintSink<W> {
    fn on_flip_request(&mut self, e: &FlipRequestEvent) {
        let target = self.target_label(e.target);
        let _ = writeln!(
            self.writer,
            "[request] surface={} swap={} at={:.1}µs target={target} sync={:?}",
            e.surface,
            e.swap_sequence,
            self.host_us(e.requested_at),
            e.sync,
        );
    }

    fn on_swap_issued(&mut self, e: &SwapIssuedEvent) {
        let _ = writeln!(
            self.writer,
            "[issue] surface={} swap={} at={:.1}µs scheduled={} count={} beam={}",
            e.surface,
            e.swap_sequence,
            self.host_us(e.issued_at),
            e.scheduled,
            opt(e.target_count),
            opt(e.beam_before),
        );
    }

    fn on_flip_summary(&mut self, s: &FlipSummary) {
        let miss = if s.missed_deadline() { " MISSED" } else { "" };
        let _ = writeln!(
            self.writer,
            "[flip] surface={} swap={} onset={:.1}µs miss={:+.3}ms source={:?} \
             confidence={:?} vbl={}{miss}",
            s.surface,
            s.swap_sequence,
            self.host_us(s.onset),
            s.deadline_miss_secs * 1000.0,
            s.source,
            s.confidence,
            opt(s.vblank_count),
        );
    }

    fn on_source_demoted(&mut self, e: &SourceDemotedEvent) {
        let _ = writeln!(
            self.writer,
            "[demote] surface={} source={:?} swap={} at={:.1}µs",
            e.surface,
            e.source,
            e.swap_sequence,
            self.host_us(e.timestamp),
        );
    }

    fn on_calibration_sample(&mut self, e: &CalibrationSampleEvent) {
        let verdict = if e.accepted { "accepted" } else { "rejected" };
        let _ = writeln!(
            self.writer,
            "[calib] surface={} delta={:.3}ms {verdict}",
            e.surface,
            e.delta_secs * 1000.0,
        );
    }

    fn on_calibration_done(&mut self, e: &CalibrationDoneEvent) {
        let _ = match e.result {
            Some(r) => writeln!(
                self.writer,
                "[calib] surface={} interval={:.4}ms samples={} sd={:.4}ms pageflip={}",
                e.surface,
                r.refresh_interval_secs * 1000.0,
                r.sample_count,
                r.std_dev_secs * 1000.0,
                r.pageflip_confirmed,
            ),
            None => writeln!(self.writer, "[calib] surface={} FAILED", e.surface),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use vblsync_core::config::TimingConfig;
    use vblsync_core::context::PresentationContext;
    use vblsync_core::scheduler::FlipEngine;
    use vblsync_core::sim::{SimConfig, SimDisplay};
    use vblsync_core::surface::SurfaceId;
    use vblsync_core::timing::{SwapRequest, SyncMode};

    /// Writer shared between the engine-owned sink and the test.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("buffer lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn pretty_print_request() {
        let mut sink = PrettyPrintSink::with_writer(Vec::<u8>::new(), Timebase::NANOS);
        sink.on_flip_request(&FlipRequestEvent {
            surface: SurfaceId(1),
            swap_sequence: 5,
            requested_at: HostTime(1_000_000),
            target: SwapTarget::VblankCount(12),
            sync: SyncMode::WaitForVblank,
        });
        let output = String::from_utf8(sink.into_writer()).expect("utf-8");
        assert!(output.contains("[request]"), "got: {output}");
        assert!(output.contains("swap=5"), "got: {output}");
        assert!(output.contains("target=vbl #12"), "got: {output}");
    }

    #[test]
    fn engine_flips_are_printed() {
        let sim = SimDisplay::new(SimConfig::default());
        let mut engine = FlipEngine::open(
            SurfaceId(2),
            sim.binding(),
            TimingConfig::standard(),
            PresentationContext::new(),
            true,
        )
        .expect("open");

        let buf = SharedBuf::default();
        let timebase = engine.timebase();
        engine.set_trace_sink(Some(Box::new(PrettyPrintSink::with_writer(
            buf.clone(),
            timebase,
        ))));
        engine.flip(&SwapRequest::asap()).expect("flip");
        engine.flip(&SwapRequest::asap()).expect("flip");
        drop(engine.take_trace_sink());

        let output = String::from_utf8(buf.0.lock().expect("buffer lock").clone()).expect("utf-8");
        let flips = output.lines().filter(|l| l.starts_with("[flip]")).count();
        assert_eq!(flips, 2, "one summary per flip, got: {output}");
        assert!(output.contains("[issue]"), "swap issue logged, got: {output}");
        assert!(!output.contains("MISSED"), "asap never misses, got: {output}");
    }
}

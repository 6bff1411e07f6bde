// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Swap scheduling and onset timestamping.
//!
//! [`FlipEngine`] owns one surface's platform collaborators and timing state
//! and turns each [`SwapRequest`] into exactly one buffer swap and one
//! [`FlipResult`]:
//!
//! 1. Resolve the request to a target blanking count from the latest
//!    blanking reference and the calibrated refresh interval.
//! 2. Try the platform's scheduled-swap path. If it is unavailable, sleep
//!    until the frame before the target, issue an unscheduled swap and stall
//!    on a synchronization token (or busy-poll the beam into blanking).
//! 3. Gather timestamp candidates (scheduled completion, raw completion
//!    corrected by beam position, blanking-interrupt timestamp) and let the
//!    [`TimestampArbiter`] pick one.
//! 4. Compare the onset against the slack-adjusted deadline.
//!
//! The refresh interval only ever changes through [`FlipEngine::calibrate`],
//! never from a single flip.

use core::fmt;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::adapter::{
    BlankingSample, BufferKind, PlatformBinding, ScheduleTarget, SwapCompletion,
};
use crate::arbiter::{Candidates, TimestampArbiter};
use crate::calibrate;
use crate::config::{CalibrationParams, TimingConfig};
use crate::context::{BoundContext, PresentationContext};
use crate::error::{FlipError, RequestError, SyncFailure};
use crate::io::SwapIo;
use crate::surface::SurfaceId;
use crate::time::{HostTime, Timebase};
use crate::timing::{
    BlankingGeometry, CalibrationResult, Eye, FlipResult, Periodicity, RefreshEstimate,
    SurfaceTiming, SwapRequest, SwapTarget, SyncMode, TimestampConfidence, TimestampSource,
};
use crate::trace::{
    CalibrationDoneEvent, FlipRequestEvent, FlipSummary, SourceDemotedEvent, SwapIssuedEvent,
    TraceSink, Tracer,
};
use crate::wait::{AbortToken, PollOutcome};

/// Upper bound on frame-by-frame waits while steering an unscheduled swap
/// onto its target count.
const MAX_FRAME_WAITS: u32 = 256;

/// Scanlines to wait before re-reading a beam position that looks stuck.
const FROZEN_BEAM_RECHECK_LINES: f64 = 3.0;

/// Fraction of a frame to wake after the estimated blank, so interval
/// estimation error cannot wake us one frame early.
const WAKE_MARGIN_FRAMES: f64 = 0.05;

fn tracer(sink: &mut Option<Box<dyn TraceSink + Send>>) -> Tracer<'_> {
    Tracer::from_option(sink.as_deref_mut().map(|s| s as &mut dyn TraceSink))
}

/// Parity and periodicity folded into one constraint.
fn constraint_of(request: &SwapRequest) -> Option<Periodicity> {
    request.periodicity.or(request.parity.map(|parity| Periodicity {
        divisor: 2,
        remainder: parity.remainder(),
    }))
}

/// Smallest count at or after `count` that `constraint` admits.
fn next_admitted(count: u64, constraint: Option<Periodicity>) -> u64 {
    let Some(p) = constraint else {
        return count;
    };
    let divisor = u64::from(p.divisor.max(1));
    let remainder = u64::from(p.remainder) % divisor;
    count.saturating_add((remainder + divisor - count % divisor) % divisor)
}

/// Count of the first blank strictly after `target`.
#[expect(
    clippy::cast_possible_truncation,
    reason = "frame counts within the future horizon fit in u64"
)]
fn count_after(
    reference: (u64, HostTime),
    target: HostTime,
    interval_secs: f64,
    tb: Timebase,
) -> u64 {
    let (count, ts) = reference;
    let frames = (target.signed_secs_since(ts, tb) / interval_secs).floor();
    if frames <= 0.0 {
        count.saturating_add(1)
    } else {
        count.saturating_add(frames as u64).saturating_add(1)
    }
}

/// Blank `frames` refresh intervals after `ts`; negative goes back.
fn frames_from(ts: HostTime, frames: f64, interval_secs: f64, tb: Timebase) -> HostTime {
    ts.offset_secs(frames * interval_secs, tb)
}

/// What happened while issuing one swap.
#[derive(Clone, Copy, Debug)]
struct Issued {
    beam_before: Option<u32>,
    pre_blank: Option<BlankingSample>,
    completion: Option<SwapCompletion>,
    raw: HostTime,
    beam_after: Option<u32>,
}

/// Issues timed swaps for one surface.
///
/// An engine is owned by exactly one thread at a time: the caller, or a
/// background worker while an asynchronous flip is outstanding. It is
/// `Send` so it can move between them.
pub struct FlipEngine {
    surface: SurfaceId,
    config: TimingConfig,
    ctx: Arc<PresentationContext>,
    io: SwapIo,
    timing: SurfaceTiming,
    arbiter: TimestampArbiter,
    sink: Option<Box<dyn TraceSink + Send>>,
    worker_context: Option<BoundContext>,
    last_calibration: Option<CalibrationResult>,
}

impl fmt::Debug for FlipEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlipEngine")
            .field("surface", &self.surface)
            .field("io", &self.io)
            .field("timing", &self.timing)
            .field("arbiter", &self.arbiter)
            .field("tracing", &self.sink.is_some())
            .field("last_calibration", &self.last_calibration)
            .finish_non_exhaustive()
    }
}

impl FlipEngine {
    /// Creates an uncalibrated engine.
    ///
    /// Flips fail with [`SyncFailure::Uncalibrated`] until
    /// [`calibrate`](Self::calibrate) succeeds. Most callers want
    /// [`open`](Self::open).
    #[must_use]
    pub fn new(
        surface: SurfaceId,
        binding: PlatformBinding,
        config: TimingConfig,
        ctx: Arc<PresentationContext>,
        fullscreen: bool,
    ) -> Self {
        let (io, worker_context) = SwapIo::from_binding(binding);
        let mut timing = SurfaceTiming::new(fullscreen);
        timing.native_stereo = io.target.buffer_kind() == BufferKind::Stereo;
        Self {
            surface,
            arbiter: TimestampArbiter::new(&config),
            config,
            ctx,
            io,
            timing,
            sink: None,
            worker_context: worker_context.map(BoundContext::new),
            last_calibration: None,
        }
    }

    /// Creates an engine, runs the initial calibration and detects the
    /// blanking region.
    ///
    /// The calibration uses [`TimingConfig::initial_calibration`], hinted
    /// with the adapter's nominal refresh interval when it reports one.
    pub fn open(
        surface: SurfaceId,
        binding: PlatformBinding,
        config: TimingConfig,
        ctx: Arc<PresentationContext>,
        fullscreen: bool,
    ) -> Result<Self, FlipError> {
        let mut engine = Self::new(surface, binding, config, ctx, fullscreen);
        let mut params = engine.config.initial_calibration;
        if params.hint_secs.is_none() {
            params.hint_secs = engine.io.adapter.nominal_interval_secs();
        }
        let result = engine.calibrate(&params)?;
        let blanking = engine.detect_blanking();
        info!(
            %surface,
            interval_secs = result.refresh_interval_secs,
            caps = ?engine.io.caps,
            ?blanking,
            "surface opened"
        );
        Ok(engine)
    }

    /// The surface this engine flips.
    #[must_use]
    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    /// Thresholds in use.
    #[must_use]
    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    /// Per-surface timing state.
    #[must_use]
    pub fn timing(&self) -> &SurfaceTiming {
        &self.timing
    }

    /// The session's timestamp arbiter.
    #[must_use]
    pub fn arbiter(&self) -> &TimestampArbiter {
        &self.arbiter
    }

    /// Result of the last successful calibration.
    #[must_use]
    pub fn last_calibration(&self) -> Option<CalibrationResult> {
        self.last_calibration
    }

    /// The shared presentation context.
    #[must_use]
    pub fn context(&self) -> &Arc<PresentationContext> {
        &self.ctx
    }

    /// Current time on the engine's clock.
    #[must_use]
    pub fn now(&self) -> HostTime {
        self.io.now()
    }

    /// Timebase of the engine's clock.
    #[must_use]
    pub fn timebase(&self) -> Timebase {
        self.io.timebase()
    }

    /// Buffer configuration of the drawing target.
    #[must_use]
    pub fn buffer_kind(&self) -> BufferKind {
        self.io.target.buffer_kind()
    }

    /// Token that interrupts this engine's waits when raised.
    #[must_use]
    pub fn abort_token(&self) -> AbortToken {
        self.io.abort.clone()
    }

    /// Records whether the surface renders multisampled, which widens the
    /// calibration hint band.
    pub fn set_multisample(&mut self, multisample: bool) {
        self.timing.multisample = multisample;
    }

    /// Installs or removes the trace sink.
    pub fn set_trace_sink(&mut self, sink: Option<Box<dyn TraceSink + Send>>) {
        self.sink = sink;
    }

    /// Removes and returns the trace sink.
    pub fn take_trace_sink(&mut self) -> Option<Box<dyn TraceSink + Send>> {
        self.sink.take()
    }

    /// Hands out the background worker's graphics context.
    ///
    /// Returns `None` if the platform has none or it was already taken.
    pub fn take_worker_context(&mut self) -> Option<BoundContext> {
        self.worker_context.take()
    }

    /// Returns a worker's graphics context after its thread exited.
    pub fn restore_worker_context(&mut self, context: BoundContext) {
        self.worker_context = Some(context);
    }

    /// Presents an eye image through the drawing target (frame-sequential
    /// stereo on a mono surface).
    pub fn present_eye(&mut self, eye: Eye) -> Result<(), FlipError> {
        Ok(self.io.target.present_eye(eye)?)
    }

    /// Blanking count of the most recent vertical blank, if any count
    /// reference is available.
    pub fn current_blank_count(&mut self) -> Option<u64> {
        self.current_blank().map(|(count, _)| count)
    }

    /// Measures the refresh interval and replaces the surface's estimate.
    ///
    /// A synchronization failure resets the estimate, so later flips fail
    /// with [`SyncFailure::Uncalibrated`] until a calibration succeeds.
    pub fn calibrate(
        &mut self,
        params: &CalibrationParams,
    ) -> Result<CalibrationResult, FlipError> {
        let allow_double = self.timing.native_stereo || self.timing.multisample;
        let ctx = Arc::clone(&self.ctx);
        let switch = ctx.switch_target(self.surface)?;
        self.io.target.detach();
        self.io.target.flush();
        let outcome = {
            let mut t = tracer(&mut self.sink);
            calibrate::measure_refresh(
                &mut self.io,
                self.surface,
                &self.config,
                params,
                allow_double,
                &mut t,
            )
        };
        self.io.target.reattach();
        drop(switch);

        let result = match outcome {
            Ok((result, _samples)) => result,
            Err(err) => {
                if matches!(err, FlipError::SyncDisaster(_)) {
                    self.timing.refresh.reset();
                    error!(
                        surface = %self.surface,
                        %err,
                        "refresh calibration failed; estimate reset"
                    );
                }
                let timestamp = self.io.now();
                tracer(&mut self.sink).calibration_done(&CalibrationDoneEvent {
                    surface: self.surface,
                    result: None,
                    timestamp,
                });
                return Err(err);
            }
        };
        self.timing.refresh = RefreshEstimate {
            interval_secs: result.refresh_interval_secs,
            samples: result.sample_count,
            std_dev_secs: result.std_dev_secs,
        };
        self.timing.invalidate_vbl_reference();
        self.last_calibration = Some(result);
        let timestamp = self.io.now();
        tracer(&mut self.sink).calibration_done(&CalibrationDoneEvent {
            surface: self.surface,
            result: Some(result),
            timestamp,
        });
        Ok(result)
    }

    /// Polls the beam to find the blanking region and stores it.
    pub fn detect_blanking(&mut self) -> Option<BlankingGeometry> {
        let geometry = calibrate::detect_blanking(
            &mut self.io,
            self.timing.refresh.interval_secs,
            self.config.spin_poll_limit,
        );
        self.timing.blanking = geometry;
        geometry
    }

    /// Issues exactly one swap for `request` and timestamps it.
    pub fn flip(&mut self, request: &SwapRequest) -> Result<FlipResult, FlipError> {
        self.validate(request)?;
        let tb = self.io.timebase();
        let requested_at = self.io.now();
        if let SwapTarget::At(t) = request.target {
            let ahead = t.signed_secs_since(requested_at, tb);
            if ahead > self.config.max_future_secs {
                return Err(RequestError::TooFarInFuture { secs: ahead }.into());
            }
        }
        if !self.timing.refresh.is_calibrated() {
            return Err(SyncFailure::Uncalibrated.into());
        }
        if let SwapTarget::VblankCount(n) = request.target
            && let Some((count, ts)) = self.current_blank()
        {
            let frames = n as f64 - count as f64;
            let ahead = frames * self.timing.refresh.interval_secs
                - requested_at.signed_secs_since(ts, tb);
            if ahead > self.config.max_future_secs {
                return Err(RequestError::TooFarInFuture { secs: ahead }.into());
            }
        }

        let swap_sequence = self.timing.swap_count + 1;
        tracer(&mut self.sink).flip_request(&FlipRequestEvent {
            surface: self.surface,
            swap_sequence,
            requested_at,
            target: request.target,
            sync: request.sync,
        });

        let ctx = Arc::clone(&self.ctx);
        let switch = ctx.switch_target(self.surface)?;
        self.io.target.detach();
        self.io.target.prepare_clear(request.clear);
        self.io.target.flush();
        let outcome = if request.sync.is_timestamped() {
            self.timed_flip(request, requested_at, swap_sequence)
        } else {
            self.untimed_flip(request, requested_at, swap_sequence)
        };
        if outcome.is_ok() {
            self.io.target.apply_clear(request.clear);
            if let Some(eye) = request.stereo {
                self.io.target.select_stereo_buffer(eye);
            }
        }
        self.io.target.reattach();
        drop(switch);

        let mut result = outcome?;
        result.flip_end = self.io.now();
        tracer(&mut self.sink).flip_summary(&FlipSummary::new(self.surface, &result));
        Ok(result)
    }

    fn validate(&self, request: &SwapRequest) -> Result<(), FlipError> {
        if let Some(p) = request.periodicity {
            if p.divisor == 0 {
                return Err(RequestError::ZeroDivisor.into());
            }
            if let Some(parity) = request.parity
                && (p.divisor % 2 != 0 || p.remainder % 2 != parity.remainder())
            {
                return Err(RequestError::ConflictingConstraints.into());
            }
        }
        match self.io.target.buffer_kind() {
            BufferKind::Single => Err(RequestError::SingleBuffered.into()),
            BufferKind::Double if request.stereo.is_some() => Err(RequestError::NotStereo.into()),
            BufferKind::Double | BufferKind::Stereo => Ok(()),
        }
    }

    /// Count and start time of the most recent blank.
    ///
    /// Uses the blanking counter while its timestamps are trusted, otherwise
    /// extrapolates from the last accepted onset.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "elapsed frames since the last onset fit in u64"
    )]
    fn current_blank(&mut self) -> Option<(u64, HostTime)> {
        if !self.arbiter.is_disabled(TimestampSource::BlankingInterrupt)
            && let Some(sample) = self.io.query_blanking()
        {
            return Some((sample.count, sample.timestamp));
        }
        let (count, ts) = (self.timing.last_vbl_count?, self.timing.last_vbl?);
        let tb = self.io.timebase();
        let interval = self.timing.refresh.interval_secs;
        let frames = (self.io.now().signed_secs_since(ts, tb) / interval)
            .floor()
            .max(0.0);
        Some((count + frames as u64, frames_from(ts, frames, interval, tb)))
    }

    /// Resolves the request's target count, if a count reference exists.
    fn target_count(
        &self,
        request: &SwapRequest,
        reference: Option<(u64, HostTime)>,
        constraint: Option<Periodicity>,
    ) -> Option<u64> {
        let tb = self.io.timebase();
        let interval = self.timing.refresh.interval_secs;
        let count = match (request.target, reference) {
            (SwapTarget::VblankCount(n), _) => n,
            (SwapTarget::Asap, Some((count, _))) => count.saturating_add(1),
            (SwapTarget::At(t), Some(reference)) => count_after(reference, t, interval, tb),
            (_, None) => return None,
        };
        Some(next_admitted(count, constraint))
    }

    /// Slack-adjusted deadline for the request.
    fn deadline(
        &self,
        request: &SwapRequest,
        requested_at: HostTime,
        reference: Option<(u64, HostTime)>,
    ) -> HostTime {
        let tb = self.io.timebase();
        let interval = self.timing.refresh.interval_secs;
        let base = match (request.target, reference) {
            (SwapTarget::VblankCount(n), Some((count, ts))) => {
                let frames = n as f64 - 1.0 - count as f64;
                frames_from(ts, frames, interval, tb)
            }
            (SwapTarget::VblankCount(_), None) | (SwapTarget::Asap, None) => requested_at,
            (SwapTarget::At(t), None) => t,
            (SwapTarget::Asap | SwapTarget::At(_), Some((_, ts))) => {
                let wanted = match request.target {
                    SwapTarget::At(t) => t,
                    _ => requested_at,
                };
                let frames = (wanted.signed_secs_since(ts, tb) / interval).floor();
                frames_from(ts, frames, interval, tb)
            }
        };
        let slack = self.config.slack(self.timing.blanking.is_some());
        base.offset_secs(slack * interval, tb)
    }

    fn emit_swap_issued(
        &mut self,
        swap_sequence: u64,
        issued_at: HostTime,
        scheduled: bool,
        target_count: Option<u64>,
        beam_before: Option<u32>,
    ) {
        tracer(&mut self.sink).swap_issued(&SwapIssuedEvent {
            surface: self.surface,
            swap_sequence,
            issued_at,
            scheduled,
            target_count,
            beam_before,
        });
    }

    fn timed_flip(
        &mut self,
        request: &SwapRequest,
        requested_at: HostTime,
        swap_sequence: u64,
    ) -> Result<FlipResult, FlipError> {
        let tb = self.io.timebase();
        let interval = self.timing.refresh.interval_secs;
        let constraint = constraint_of(request);
        let reference = self.current_blank();
        let target_count = self.target_count(request, reference, constraint);
        let deadline = self.deadline(request, requested_at, reference);

        let scheduled = if self.io.caps.scheduled_swap && request.sync == SyncMode::WaitForVblank {
            let target = match (target_count, request.target) {
                (Some(n), _) | (None, SwapTarget::VblankCount(n)) => ScheduleTarget::Count(n),
                (None, SwapTarget::At(t)) => ScheduleTarget::Time(t),
                (None, SwapTarget::Asap) => ScheduleTarget::NextVblank,
            };
            self.scheduled_swap(target, constraint, swap_sequence, target_count)?
        } else {
            None
        };
        let issued = match scheduled {
            Some(issued) => issued,
            None => self.unscheduled_swap(request, target_count, constraint, swap_sequence)?,
        };

        let beam = self.plausible_beam(&issued);
        let line_secs = self
            .timing
            .blanking
            .map(|g| interval / f64::from(g.total_lines()));
        let beam_candidate = match (self.timing.blanking, beam, line_secs) {
            (Some(g), Some(line), Some(line_secs)) => {
                let (elapsed, _) = g.lines_since_blank(line);
                Some(issued.raw.offset_secs(-elapsed * line_secs, tb))
            }
            _ => None,
        };
        let interrupt = self.interrupt_sample(issued.pre_blank);

        let candidates = Candidates {
            scheduled: issued.completion.map(|c| c.timestamp),
            beam: beam_candidate,
            interrupt: interrupt.map(|s| s.timestamp),
            raw: issued.raw,
        };
        let not_before = requested_at.offset_secs(-interval, tb);
        let decision = self.arbiter.arbitrate(&candidates, not_before, tb);
        for demotion in &decision.demotions {
            tracer(&mut self.sink).source_demoted(&SourceDemotedEvent {
                surface: self.surface,
                source: demotion.source,
                swap_sequence,
                timestamp: issued.raw,
            });
        }
        let onset = decision.onset;

        let eps = self.config.ordering_epsilon_secs;
        let early_by_secs = requested_at.signed_secs_since(onset, tb);
        let outside_blanking = matches!(
            (self.timing.blanking, issued.beam_before),
            (Some(g), Some(line)) if !g.in_blanking(line)
        );
        if early_by_secs > eps && outside_blanking {
            error!(
                surface = %self.surface,
                swap_sequence,
                early_by_secs,
                source = ?decision.source,
                "onset precedes the swap request although it was issued outside blanking"
            );
            self.timing.invalidate_vbl_reference();
            return Err(SyncFailure::OnsetBeforeRequest { early_by_secs }.into());
        }
        if let Some(last) = self.timing.last_onset {
            let regression_secs = last.signed_secs_since(onset, tb);
            if regression_secs > eps {
                error!(
                    surface = %self.surface,
                    swap_sequence,
                    regression_secs,
                    "onset went backwards"
                );
                self.timing.invalidate_vbl_reference();
                return Err(SyncFailure::TimestampRegression { regression_secs }.into());
            }
        }

        let vblank_count = issued
            .completion
            .map(|c| c.vblank_count)
            .or(interrupt.map(|s| s.count))
            .or_else(|| self.extrapolate_count(onset));
        let scanout_start = match (self.timing.blanking, line_secs) {
            (Some(g), Some(line_secs)) => {
                onset.offset_secs(f64::from(g.end - g.start + 1) * line_secs, tb)
            }
            _ => onset,
        };
        let deadline_miss_secs = onset.signed_secs_since(deadline, tb);
        if deadline_miss_secs > 0.0 && reference.is_some() {
            self.timing.missed_deadlines += 1;
        }

        if decision.confidence > TimestampConfidence::Unverified {
            self.timing.last_vbl = Some(onset);
            self.timing.last_vbl_count = vblank_count;
        } else {
            self.timing.invalidate_vbl_reference();
        }
        self.timing.last_onset = Some(onset);
        self.timing.swap_count = swap_sequence;

        debug!(
            surface = %self.surface,
            swap_sequence,
            ?vblank_count,
            source = ?decision.source,
            confidence = ?decision.confidence,
            deadline_miss_secs,
            "flip complete"
        );

        Ok(FlipResult {
            onset,
            scanout_start,
            raw_completion: issued.raw,
            requested_at,
            flip_end: issued.raw,
            beam_position: beam,
            deadline_miss_secs,
            swap_sequence,
            vblank_count,
            source: decision.source,
            confidence: decision.confidence,
            demoted: decision.demotions.first().map(|d| d.source),
            eye: request.stereo,
        })
    }

    /// Tries the platform's scheduled-swap path. `Ok(None)` means fall back.
    fn scheduled_swap(
        &mut self,
        target: ScheduleTarget,
        constraint: Option<Periodicity>,
        swap_sequence: u64,
        target_count: Option<u64>,
    ) -> Result<Option<Issued>, FlipError> {
        let pre_blank = self.io.query_blanking();
        let beam_before = self.io.beam();
        let issued_at = self.io.now();
        let id = match self.io.with_adapter(|a| a.schedule_swap(target, constraint)) {
            Ok(id) => id,
            Err(err) => {
                debug!(surface = %self.surface, %err, "scheduled swap unavailable; falling back");
                return Ok(None);
            }
        };
        self.emit_swap_issued(swap_sequence, issued_at, true, target_count, beam_before);

        let completion = match self.io.with_adapter(|a| a.wait_for_swap_completion(id)) {
            Ok(done) => Some(done),
            Err(crate::error::AdapterError::Unsupported) => {
                self.io.target.finish_with_sync_token()?;
                None
            }
            Err(err) => return Err(err.into()),
        };
        let raw = self.io.now();
        let beam_after = self.io.beam();
        Ok(Some(Issued {
            beam_before,
            pre_blank,
            completion,
            raw,
            beam_after,
        }))
    }

    fn unscheduled_swap(
        &mut self,
        request: &SwapRequest,
        target_count: Option<u64>,
        constraint: Option<Periodicity>,
        swap_sequence: u64,
    ) -> Result<Issued, FlipError> {
        self.wait_for_target(request.target, target_count, constraint)?;
        let pre_blank = self.io.query_blanking();
        let beam_before = self.io.beam();
        let issued_at = self.io.now();
        self.io.with_adapter(|a| a.flip_buffers())?;
        self.emit_swap_issued(swap_sequence, issued_at, false, target_count, beam_before);

        if request.sync == SyncMode::SpinWait {
            self.spin_into_blanking()?;
        } else {
            self.io.target.finish_with_sync_token()?;
        }
        let raw = self.io.now();
        let beam_after = self.io.beam();
        Ok(Issued {
            beam_before,
            pre_blank,
            completion: None,
            raw,
            beam_after,
        })
    }

    /// Sleeps until an unscheduled swap issued now lands on the target.
    fn wait_for_target(
        &mut self,
        target: SwapTarget,
        target_count: Option<u64>,
        constraint: Option<Periodicity>,
    ) -> Result<(), FlipError> {
        if let SwapTarget::At(t) = target {
            self.io.wait_until(t)?;
        }
        let want = match target {
            SwapTarget::VblankCount(_) => target_count,
            SwapTarget::Asap | SwapTarget::At(_) => None,
        };
        if want.is_none() && constraint.is_none() {
            return Ok(());
        }

        let tb = self.io.timebase();
        let interval = self.timing.refresh.interval_secs;
        for _ in 0..MAX_FRAME_WAITS {
            let Some((count, ts)) = self.current_blank() else {
                return Err(FlipError::Unsupported(
                    "count-targeted swap without a blanking counter",
                ));
            };
            let next = count + 1;
            let frames = match want {
                Some(n) if n > next => (n - next) as f64,
                _ if constraint.is_some_and(|p| !p.admits(next)) => 1.0,
                _ => return Ok(()),
            };
            let wake = frames_from(ts, frames + WAKE_MARGIN_FRAMES, interval, tb);
            self.io.wait_until(wake)?;
        }
        debug!(surface = %self.surface, "gave up steering swap onto its target count");
        Ok(())
    }

    /// Busy-polls the beam until the swap's blank begins.
    fn spin_into_blanking(&mut self) -> Result<(), FlipError> {
        let Some(geometry) = self.timing.blanking else {
            debug!(surface = %self.surface, "no blanking geometry; spin wait uses the sync token");
            return Ok(self.io.target.finish_with_sync_token()?);
        };
        let limit = self.config.spin_poll_limit;
        // A swap issued inside blanking lands on the next one, so leave it first.
        for entering in [false, true] {
            match self
                .io
                .poll_beam(|line| geometry.in_blanking(line) == entering, limit)
            {
                PollOutcome::Reached(_) => {}
                PollOutcome::Aborted => return Err(FlipError::Aborted),
                PollOutcome::Unavailable | PollOutcome::Exhausted => {
                    debug!(surface = %self.surface, "beam poll gave up; using the sync token");
                    self.io.target.finish_with_sync_token()?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Beam position after the swap, if it is usable for correction.
    ///
    /// Equal readings before and after the swap are normal when the two are
    /// a whole frame apart, so the beam only counts as frozen if it still
    /// has not moved a few scanlines later.
    fn plausible_beam(&mut self, issued: &Issued) -> Option<u32> {
        let geometry = self.timing.blanking?;
        let line = issued.beam_after?;
        if line > geometry.end {
            debug!(surface = %self.surface, line, end = geometry.end, "beam position out of range");
            return None;
        }
        if issued.beam_before == Some(line) {
            let line_secs =
                self.timing.refresh.interval_secs / f64::from(geometry.total_lines());
            self.io.pause(FROZEN_BEAM_RECHECK_LINES * line_secs);
            if self.io.beam() == Some(line) {
                debug!(surface = %self.surface, line, "beam position is frozen");
                return None;
            }
        }
        Some(line)
    }

    /// Blanking counter sample of the swap's blank.
    ///
    /// Retries until the sample differs from the one taken before the swap,
    /// since the interrupt may not have been serviced yet.
    fn interrupt_sample(&mut self, pre: Option<BlankingSample>) -> Option<BlankingSample> {
        let pre = pre?;
        if self.arbiter.is_disabled(TimestampSource::BlankingInterrupt) {
            return None;
        }
        for _ in 0..self.config.irq_retry_limit {
            let sample = self.io.query_blanking()?;
            if sample != pre {
                return Some(sample);
            }
            if self.io.abort.is_aborted() {
                break;
            }
            self.io.pause(self.config.irq_retry_interval_secs);
        }
        debug!(surface = %self.surface, "blanking interrupt timestamp never updated");
        None
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "rounded frame counts since the last onset fit in u64"
    )]
    fn extrapolate_count(&self, onset: HostTime) -> Option<u64> {
        let (count, ts) = (self.timing.last_vbl_count?, self.timing.last_vbl?);
        let frames =
            onset.signed_secs_since(ts, self.io.timebase()) / self.timing.refresh.interval_secs;
        (frames >= 0.0).then(|| count + frames.round() as u64)
    }

    /// `NoWait` and `Immediate` swaps: issued without timestamping.
    fn untimed_flip(
        &mut self,
        request: &SwapRequest,
        requested_at: HostTime,
        swap_sequence: u64,
    ) -> Result<FlipResult, FlipError> {
        let constraint = constraint_of(request);
        let reference = self.current_blank();
        let target_count = self.target_count(request, reference, constraint);
        self.wait_for_target(request.target, target_count, constraint)?;

        let beam_before = self.io.beam();
        let issued_at = self.io.now();
        let raw = if request.sync == SyncMode::Immediate {
            self.io.with_adapter(|a| a.set_sync_to_blanking(false))?;
            let swapped = self.swap_and_finish();
            let restored = self.io.with_adapter(|a| a.set_sync_to_blanking(true));
            swapped?;
            restored?;
            self.io.now()
        } else {
            self.io.with_adapter(|a| a.flip_buffers())?;
            issued_at
        };
        self.emit_swap_issued(swap_sequence, issued_at, false, target_count, beam_before);

        self.timing.invalidate_vbl_reference();
        self.timing.swap_count = swap_sequence;
        debug!(surface = %self.surface, swap_sequence, sync = ?request.sync, "untimed flip issued");

        Ok(FlipResult {
            onset: raw,
            scanout_start: raw,
            raw_completion: raw,
            requested_at,
            flip_end: raw,
            beam_position: beam_before,
            deadline_miss_secs: 0.0,
            swap_sequence,
            vblank_count: None,
            source: TimestampSource::RawCompletion,
            confidence: TimestampConfidence::Unverified,
            demoted: None,
            eye: request.stereo,
        })
    }

    fn swap_and_finish(&mut self) -> Result<(), FlipError> {
        self.io.with_adapter(|a| a.flip_buffers())?;
        self.io.target.finish_with_sync_token()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SharedConnection;
    use crate::error::ConcurrencyViolation;
    use crate::sim::{SimConfig, SimDisplay};
    use crate::timing::{ClearMode, FieldParity};

    fn open(config: SimConfig) -> (SimDisplay, FlipEngine) {
        let sim = SimDisplay::new(config);
        let engine = FlipEngine::open(
            SurfaceId(1),
            sim.binding(),
            TimingConfig::standard(),
            PresentationContext::new(),
            true,
        )
        .expect("calibration succeeds on a nominal display");
        (sim, engine)
    }

    fn scheduled() -> SimConfig {
        SimConfig::default()
    }

    fn unscheduled() -> SimConfig {
        SimConfig {
            scheduled_swap: false,
            ..SimConfig::default()
        }
    }

    fn period_ns(sim: &SimDisplay) -> u64 {
        sim.config().period_ns
    }

    #[test]
    fn open_calibrates_and_finds_blanking() {
        let (sim, engine) = open(scheduled());
        let interval = engine.timing().refresh.interval_secs;
        assert!(
            (interval - sim.period_secs()).abs() < 1e-6,
            "interval {interval} vs {}",
            sim.period_secs()
        );
        assert_eq!(
            engine.timing().blanking,
            Some(BlankingGeometry {
                start: 1080,
                end: 1124
            })
        );
        assert!(
            engine.last_calibration().is_some_and(|c| c.pageflip_confirmed),
            "pageflips confirmed"
        );
    }

    #[test]
    fn onset_never_precedes_request() {
        for config in [scheduled(), unscheduled()] {
            let (sim, mut engine) = open(config);
            let tb = engine.timebase();
            let eps = engine.config().ordering_epsilon_secs;
            for i in 0..30_u64 {
                let ahead = (i * 3_700_000) % 40_000_000;
                let target = HostTime(sim.now().0 + ahead);
                let result = engine.flip(&SwapRequest::at(target)).expect("flip");
                let lead = result.onset.signed_secs_since(result.requested_at, tb);
                assert!(lead >= -eps, "onset {lead}s relative to request (flip {i})");
                assert!(
                    result.onset.signed_secs_since(target, tb) >= -eps,
                    "onset before target time (flip {i})"
                );
            }
        }
    }

    #[test]
    fn late_swap_reports_positive_miss() {
        for config in [scheduled(), unscheduled()] {
            let (sim, mut engine) = open(config);
            let period = period_ns(&sim);
            let k = sim.count_at(sim.now()) + 3;
            let target = HostTime(sim.blank_time(k).0 + period / 10);
            sim.with_faults(|f| f.late_once = 1);

            let result = engine.flip(&SwapRequest::at(target)).expect("flip");
            let interval = sim.period_secs();
            assert_eq!(result.vblank_count, Some(k + 2), "landed one frame late");
            assert!(result.missed(), "a late swap is a miss");
            assert!(
                (result.deadline_miss_secs - interval).abs() < 0.1 * interval,
                "miss {} should be about one frame",
                result.deadline_miss_secs
            );
            assert_eq!(engine.timing().missed_deadlines, 1, "miss counted");
        }
    }

    #[test]
    fn asap_under_perfect_sync_never_misses() {
        for config in [scheduled(), unscheduled()] {
            let (_sim, mut engine) = open(config);
            for _ in 0..20 {
                let result = engine.flip(&SwapRequest::asap()).expect("flip");
                assert!(
                    result.deadline_miss_secs <= 0.0,
                    "asap flip missed by {}",
                    result.deadline_miss_secs
                );
                assert_eq!(result.confidence, TimestampConfidence::Verified);
            }
            assert_eq!(engine.timing().missed_deadlines, 0, "no misses counted");
            assert_eq!(engine.timing().swap_count, 20, "one swap per flip");
        }
    }

    #[test]
    fn consecutive_asap_flips_land_on_consecutive_blanks() {
        let (sim, mut engine) = open(scheduled());
        let first = engine.flip(&SwapRequest::asap()).expect("flip");
        let second = engine.flip(&SwapRequest::asap()).expect("flip");
        let (a, b) = (
            first.vblank_count.expect("count"),
            second.vblank_count.expect("count"),
        );
        assert_eq!(b, a + 1, "back-to-back flips");
        assert_eq!(second.onset, sim.blank_time(b), "scheduled completion wins");
        assert_eq!(second.source, TimestampSource::Scheduled);
    }

    #[test]
    fn disagreeing_interrupt_is_demoted_once() {
        let (sim, mut engine) = open(scheduled());
        sim.with_faults(|f| f.irq_offset_ns = -3_000_000);
        let mut demoted = Vec::new();
        for _ in 0..20 {
            let result = engine.flip(&SwapRequest::asap()).expect("flip");
            assert_eq!(result.source, TimestampSource::Scheduled, "priority order");
            demoted.push(result.demoted);
        }
        assert_eq!(demoted[0], Some(TimestampSource::BlankingInterrupt));
        assert!(
            demoted[1..].iter().all(Option::is_none),
            "demotion is reported once"
        );
        assert_eq!(engine.arbiter().diagnostics_emitted(), 1, "one diagnostic");
        assert!(
            engine
                .arbiter()
                .is_disabled(TimestampSource::BlankingInterrupt),
            "disabled for the session"
        );
    }

    #[test]
    fn far_future_count_target_is_rejected() {
        let (sim, mut engine) = open(unscheduled());
        let now_count = sim.count_at(sim.now());
        let started = sim.now();
        let err = engine
            .flip(&SwapRequest::at_count(now_count + 100_000_000))
            .expect_err("about 19 days ahead");
        assert!(
            matches!(
                err,
                FlipError::InvalidRequest(RequestError::TooFarInFuture { .. })
            ),
            "got {err:?}"
        );
        assert_eq!(engine.timing().swap_count, 0, "no swap issued");
        assert!(
            sim.now().signed_secs_since(started, engine.timebase()) < 1.0,
            "rejected without waiting"
        );
    }

    #[test]
    fn count_target_at_the_counter_limit_does_not_overflow() {
        let (_sim, mut engine) = open(scheduled());
        let err = engine
            .flip(&SwapRequest::at_count(u64::MAX).with_periodicity(2, 0))
            .expect_err("beyond the horizon");
        assert!(
            matches!(
                err,
                FlipError::InvalidRequest(RequestError::TooFarInFuture { .. })
            ),
            "got {err:?}"
        );
        assert_eq!(
            next_admitted(u64::MAX, Some(Periodicity { divisor: 2, remainder: 0 })),
            u64::MAX,
            "saturates instead of wrapping"
        );
        assert_eq!(
            next_admitted(7, Some(Periodicity { divisor: 4, remainder: 1 })),
            9,
            "next admitted count"
        );
    }

    #[test]
    fn far_future_target_is_rejected() {
        let (sim, mut engine) = open(scheduled());
        let target = HostTime(sim.now().0 + 1_001_000_000_000);
        let err = engine.flip(&SwapRequest::at(target)).expect_err("too far");
        assert!(
            matches!(
                err,
                FlipError::InvalidRequest(RequestError::TooFarInFuture { .. })
            ),
            "got {err:?}"
        );
        assert_eq!(engine.timing().swap_count, 0, "no swap issued");
        assert!(sim.swap_log().len() >= 50, "only calibration swaps happened");
    }

    #[test]
    fn uncalibrated_engine_refuses_to_flip() {
        let sim = SimDisplay::new(scheduled());
        let mut engine = FlipEngine::new(
            SurfaceId(2),
            sim.binding(),
            TimingConfig::standard(),
            PresentationContext::new(),
            false,
        );
        assert_eq!(
            engine.flip(&SwapRequest::asap()),
            Err(FlipError::SyncDisaster(SyncFailure::Uncalibrated))
        );
        assert!(sim.swap_log().is_empty(), "nothing was swapped");
    }

    #[test]
    fn failed_calibration_resets_estimate() {
        let (sim, mut engine) = open(unscheduled());
        sim.with_faults(|f| f.fall_through = true);
        let err = engine
            .calibrate(&CalibrationParams::initial())
            .expect_err("sync token falls through");
        assert_eq!(
            err,
            FlipError::SyncDisaster(SyncFailure::CalibrationFailed { rejected: 10 })
        );
        assert!(!engine.timing().refresh.is_calibrated(), "estimate reset");
        assert_eq!(
            engine.flip(&SwapRequest::asap()),
            Err(FlipError::SyncDisaster(SyncFailure::Uncalibrated))
        );
    }

    #[test]
    fn no_wait_returns_unverified_timing() {
        let (sim, mut engine) = open(scheduled());
        engine.flip(&SwapRequest::asap()).expect("flip");
        assert!(engine.timing().last_vbl.is_some(), "reference known");
        let before = sim.now();
        let result = engine
            .flip(&SwapRequest::asap().with_sync(SyncMode::NoWait))
            .expect("flip");
        assert_eq!(result.confidence, TimestampConfidence::Unverified);
        assert_eq!(result.deadline_miss_secs, 0.0, "no miss estimate");
        assert_eq!(result.onset, before, "onset is the issue time");
        assert!(engine.timing().last_vbl.is_none(), "reference invalidated");
    }

    #[test]
    fn immediate_swap_restores_blank_sync() {
        let (sim, mut engine) = open(scheduled());
        let result = engine
            .flip(&SwapRequest::asap().with_sync(SyncMode::Immediate))
            .expect("flip");
        assert!(sim.sync_to_blank(), "sync restored");
        let last = *sim.swap_log().last().expect("logged");
        assert_eq!(last.landed_at, last.issued_at, "tearing swap took effect at once");
        assert_eq!(result.source, TimestampSource::RawCompletion);
        assert!(engine.timing().last_vbl.is_none(), "reference invalidated");
    }

    #[test]
    fn spin_wait_timestamps_blank_start() {
        let (sim, mut engine) = open(unscheduled());
        for _ in 0..5 {
            let result = engine
                .flip(&SwapRequest::asap().with_sync(SyncMode::SpinWait))
                .expect("flip");
            let count = result.vblank_count.expect("counter available");
            let offset = result
                .onset
                .signed_secs_since(sim.blank_time(count), engine.timebase());
            assert!(offset.abs() < 1e-4, "onset {offset}s from blank start");
            assert_ne!(result.source, TimestampSource::RawCompletion, "corrected");
        }
    }

    #[test]
    fn frozen_beam_is_ignored() {
        let (sim, mut engine) = open(unscheduled());
        sim.with_faults(|f| f.frozen_beam = Some(500));
        let result = engine.flip(&SwapRequest::asap()).expect("flip");
        assert_eq!(result.beam_position, None, "frozen beam discarded");
        assert_eq!(result.source, TimestampSource::BlankingInterrupt);
        let count = result.vblank_count.expect("counter");
        assert_eq!(result.onset, sim.blank_time(count), "interrupt timestamp");
    }

    #[test]
    fn back_to_back_unscheduled_flips_keep_beam_timestamps() {
        let (sim, mut engine) = open(unscheduled());
        for i in 0..4 {
            let result = engine.flip(&SwapRequest::asap()).expect("flip");
            assert_eq!(
                result.source,
                TimestampSource::BeamPosition,
                "flip {i} timestamped from the beam"
            );
            assert_eq!(result.confidence, TimestampConfidence::Verified, "flip {i}");
            assert!(result.beam_position.is_some(), "flip {i} reports its scanline");
            let count = result.vblank_count.expect("counter");
            let offset = result
                .onset
                .signed_secs_since(sim.blank_time(count), engine.timebase());
            assert!(offset.abs() < 2e-5, "flip {i} onset {offset}s from blank start");
        }
    }

    #[test]
    fn beam_correction_recovers_blank_start() {
        let (sim, mut engine) = open(SimConfig {
            scheduled_swap: false,
            blanking_query: false,
            completion_latency_ns: 2_000_000,
            ..SimConfig::default()
        });
        let result = engine.flip(&SwapRequest::asap()).expect("flip");
        assert_eq!(result.source, TimestampSource::BeamPosition);
        let count = sim.count_at(result.raw_completion);
        let offset = result
            .onset
            .signed_secs_since(sim.blank_time(count), engine.timebase());
        assert!(
            offset.abs() < 2e-5,
            "corrected onset {offset}s from blank start despite 2 ms latency"
        );
        assert!(result.scanout_start > result.onset, "scanout follows blanking");
    }

    #[test]
    fn periodicity_and_parity_select_blanks() {
        for config in [scheduled(), unscheduled()] {
            let (_sim, mut engine) = open(config);
            for _ in 0..4 {
                let odd = engine
                    .flip(&SwapRequest::asap().with_periodicity(2, 1))
                    .expect("flip");
                assert_eq!(odd.vblank_count.map(|c| c % 2), Some(1), "odd blank");
                let even = engine
                    .flip(&SwapRequest::asap().with_parity(FieldParity::Even))
                    .expect("flip");
                assert_eq!(even.vblank_count.map(|c| c % 2), Some(0), "even blank");
            }
            let third = engine
                .flip(&SwapRequest::asap().with_periodicity(3, 2))
                .expect("flip");
            assert_eq!(third.vblank_count.map(|c| c % 3), Some(2), "every third");
        }
    }

    #[test]
    fn conflicting_constraints_are_rejected() {
        let (_sim, mut engine) = open(scheduled());
        assert_eq!(
            engine.flip(
                &SwapRequest::asap()
                    .with_periodicity(3, 0)
                    .with_parity(FieldParity::Odd)
            ),
            Err(FlipError::InvalidRequest(RequestError::ConflictingConstraints))
        );
        assert_eq!(
            engine.flip(&SwapRequest::asap().with_periodicity(0, 0)),
            Err(FlipError::InvalidRequest(RequestError::ZeroDivisor))
        );
        assert!(
            engine
                .flip(
                    &SwapRequest::asap()
                        .with_periodicity(4, 3)
                        .with_parity(FieldParity::Odd)
                )
                .is_ok(),
            "compatible constraints"
        );
    }

    #[test]
    fn buffer_configuration_is_validated() {
        let single = SimDisplay::new(SimConfig {
            buffer_kind: BufferKind::Single,
            ..SimConfig::default()
        });
        let mut engine = FlipEngine::new(
            SurfaceId(3),
            single.binding(),
            TimingConfig::standard(),
            PresentationContext::new(),
            false,
        );
        assert_eq!(
            engine.flip(&SwapRequest::asap()),
            Err(FlipError::InvalidRequest(RequestError::SingleBuffered))
        );

        let (_sim, mut engine) = open(scheduled());
        assert_eq!(
            engine.flip(&SwapRequest::asap().with_stereo(Eye::Left)),
            Err(FlipError::InvalidRequest(RequestError::NotStereo))
        );
    }

    #[test]
    fn count_target_lands_on_that_blank() {
        for config in [scheduled(), unscheduled()] {
            let (sim, mut engine) = open(config);
            let n = sim.count_at(sim.now()) + 5;
            let result = engine.flip(&SwapRequest::at_count(n)).expect("flip");
            assert_eq!(result.vblank_count, Some(n), "landed on requested count");
            assert!(!result.missed(), "on time");
        }
    }

    #[test]
    fn onset_before_request_is_a_disaster() {
        let (sim, mut engine) = open(scheduled());
        let k = sim.count_at(sim.now()) + 2;
        let one_ms_before = sim.blank_time(k).0 - 1_000_000;
        sim.advance_ns(one_ms_before - sim.now().0);
        sim.with_faults(|f| f.completion_offset_ns = -5_000_000);
        let err = engine.flip(&SwapRequest::asap()).expect_err("impossible onset");
        assert!(
            matches!(
                err,
                FlipError::SyncDisaster(SyncFailure::OnsetBeforeRequest { .. })
            ),
            "got {err:?}"
        );
        assert_eq!(err.category(), crate::error::ErrorCategory::SyncDisaster);
    }

    #[test]
    fn stereo_surface_selects_buffer_and_clear_mode() {
        let (sim, mut engine) = open(SimConfig {
            buffer_kind: BufferKind::Stereo,
            ..SimConfig::default()
        });
        assert!(engine.timing().native_stereo, "stereo detected");
        let result = engine
            .flip(
                &SwapRequest::asap()
                    .with_stereo(Eye::Right)
                    .with_clear(ClearMode::Preserve),
            )
            .expect("flip");
        assert_eq!(result.eye, Some(Eye::Right));
        assert_eq!(sim.applied_clears().last(), Some(&ClearMode::Preserve));
    }

    #[test]
    fn shared_connection_is_released_after_flip() {
        let sim = SimDisplay::new(scheduled());
        let connection = SharedConnection::new();
        let mut engine = FlipEngine::open(
            SurfaceId(4),
            sim.binding_with_connection(connection.clone()),
            TimingConfig::standard(),
            PresentationContext::new(),
            true,
        )
        .expect("open");
        engine.flip(&SwapRequest::asap()).expect("flip");
        assert!(!connection.is_locked(), "lock released");
    }

    #[test]
    fn abort_interrupts_a_pending_wait() {
        let (sim, mut engine) = open(unscheduled());
        engine.abort_token().abort();
        let target = HostTime(sim.now().0 + 100_000_000);
        assert_eq!(
            engine.flip(&SwapRequest::at(target)),
            Err(FlipError::Aborted)
        );
        engine.abort_token().reset();
        assert!(engine.flip(&SwapRequest::asap()).is_ok(), "usable after reset");
    }

    #[test]
    fn target_switch_restores_current_target() {
        let (_sim, mut engine) = open(scheduled());
        let ctx = Arc::clone(engine.context());
        ctx.bind_target(Some(SurfaceId(1)));
        engine.flip(&SwapRequest::asap()).expect("flip");
        assert_eq!(ctx.current_target(), Some(SurfaceId(1)), "rebound after swap");

        let _outer = ctx.switch_target(SurfaceId(9)).expect("outer switch");
        assert_eq!(
            engine.flip(&SwapRequest::asap()),
            Err(FlipError::Concurrency(
                ConcurrencyViolation::ReentrantTargetSwitch
            ))
        );
    }
}

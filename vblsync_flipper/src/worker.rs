// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Background flip worker.
//!
//! [`AsyncFlipper`] runs [`FlipEngine::flip`] on a dedicated thread so the
//! caller can prepare the next frame while a swap is pending. The engine
//! itself travels with each request: it belongs to the worker while a flip
//! is outstanding and to the caller otherwise, so the two threads can never
//! touch it (or its graphics context) at the same time.

use core::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use vblsync_core::context::{BoundContext, PresentationContext, Registration};
use vblsync_core::error::{ConcurrencyViolation, FlipError};
use vblsync_core::scheduler::FlipEngine;
use vblsync_core::surface::SurfaceId;
use vblsync_core::timing::{FlipResult, SwapRequest};
use vblsync_core::wait::AbortToken;

use crate::mailbox::{FlipperState, Mailbox};

struct Job {
    engine: Box<FlipEngine>,
    request: SwapRequest,
}

struct Done {
    engine: Box<FlipEngine>,
    result: Result<FlipResult, FlipError>,
}

/// Converts the configured shutdown budget, clamping nonsense to zero.
pub(crate) fn terminate_budget(engine: &FlipEngine) -> Duration {
    Duration::try_from_secs_f64(engine.config().terminate_timeout_secs).unwrap_or(Duration::ZERO)
}

/// Binds the worker's own graphics context, if the platform provided one.
pub(crate) fn bind_worker_context(
    surface: SurfaceId,
    context: Option<&mut BoundContext>,
) -> Result<(), FlipError> {
    if let Some(context) = context {
        context.bind().inspect_err(|err| {
            warn!(%surface, %err, "worker could not bind its graphics context");
        })?;
    }
    Ok(())
}

/// Releases the worker's graphics context on the way out.
pub(crate) fn release_worker_context(surface: SurfaceId, context: Option<&mut BoundContext>) {
    if let Some(context) = context
        && let Err(err) = context.release()
    {
        warn!(%surface, %err, "worker could not release its graphics context");
    }
}

/// Asynchronous `Begin`/`End` flips on a dedicated thread.
///
/// One worker serves one surface. At most one flip is outstanding;
/// [`begin`](Self::begin) while one is outstanding fails with
/// [`ConcurrencyViolation::FlipOutstanding`].
pub struct AsyncFlipper {
    surface: SurfaceId,
    engine: Option<Box<FlipEngine>>,
    mailbox: Arc<Mailbox<Job, Done>>,
    worker: Option<JoinHandle<Option<BoundContext>>>,
    abort: AbortToken,
    ctx: Arc<PresentationContext>,
    terminate_timeout: Duration,
    in_flight: Option<Registration>,
}

impl fmt::Debug for AsyncFlipper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncFlipper")
            .field("surface", &self.surface)
            .field("state", &self.mailbox.state())
            .field("outstanding", &self.in_flight.is_some())
            .finish_non_exhaustive()
    }
}

impl AsyncFlipper {
    /// Starts the worker thread `vblsync-flip-<surface>` and waits for it
    /// to bind its graphics context.
    ///
    /// Startup failures do not lose the engine: the flipper is returned in
    /// [`FlipperState::Error`], [`begin`](Self::begin) reports the failure
    /// and [`terminate`](Self::terminate) hands the engine back.
    #[must_use]
    pub fn spawn(mut engine: FlipEngine) -> Self {
        let surface = engine.surface();
        let mailbox = Arc::new(Mailbox::new());
        let context = engine.take_worker_context();
        let abort = engine.abort_token();
        let ctx = Arc::clone(engine.context());
        let terminate_timeout = terminate_budget(&engine);

        let worker_mailbox = Arc::clone(&mailbox);
        let spawned = thread::Builder::new()
            .name(format!("vblsync-flip-{surface}"))
            .spawn(move || run(surface, &worker_mailbox, context));
        let worker = match spawned {
            Ok(handle) => {
                let state = mailbox.wait_started();
                debug!(%surface, ?state, "flip worker started");
                Some(handle)
            }
            Err(err) => {
                error!(%surface, %err, "failed to spawn flip worker");
                mailbox.fail(FlipError::Platform(format!("failed to spawn flip worker: {err}")));
                None
            }
        };

        Self {
            surface,
            engine: Some(Box::new(engine)),
            mailbox,
            worker,
            abort,
            ctx,
            terminate_timeout,
            in_flight: None,
        }
    }

    /// Surface this worker serves.
    #[must_use]
    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    /// Current worker state.
    #[must_use]
    pub fn state(&self) -> FlipperState {
        self.mailbox.state()
    }

    /// Whether a flip was begun and not yet claimed.
    #[must_use]
    pub fn is_outstanding(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Whether any worker lock is currently held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.mailbox.is_locked()
    }

    /// The engine, while no flip is outstanding.
    #[must_use]
    pub fn engine(&self) -> Option<&FlipEngine> {
        self.engine.as_deref()
    }

    /// Mutable access to the engine for synchronous work between flips.
    pub fn engine_mut(&mut self) -> Result<&mut FlipEngine, FlipError> {
        self.engine
            .as_deref_mut()
            .ok_or(FlipError::Concurrency(ConcurrencyViolation::SurfaceBusy))
    }

    /// Hands `request` to the worker and returns immediately.
    pub fn begin(&mut self, request: SwapRequest) -> Result<(), FlipError> {
        if self.in_flight.is_some() {
            return Err(ConcurrencyViolation::FlipOutstanding.into());
        }
        let Some(engine) = self.engine.take() else {
            return Err(ConcurrencyViolation::FlipOutstanding.into());
        };
        let registration = match self.ctx.register_async_flip() {
            Ok(registration) => registration,
            Err(err) => {
                self.engine = Some(engine);
                return Err(err);
            }
        };
        match self.mailbox.post(Job { engine, request }) {
            Ok(()) => {
                self.in_flight = Some(registration);
                Ok(())
            }
            Err((err, job)) => {
                self.engine = Some(job.engine);
                Err(err)
            }
        }
    }

    /// Blocks until the outstanding flip completes and returns its result.
    pub fn end(&mut self) -> Result<FlipResult, FlipError> {
        let claimed = self.mailbox.wait_result();
        self.settle(claimed.map(Some))?
            .ok_or(FlipError::Concurrency(ConcurrencyViolation::NoFlipOutstanding))
    }

    /// Returns the result if the outstanding flip has completed, without
    /// blocking. `Ok(None)` means not ready yet.
    pub fn poll(&mut self) -> Result<Option<FlipResult>, FlipError> {
        let claimed = self.mailbox.try_result();
        self.settle(claimed)
    }

    fn settle(
        &mut self,
        claimed: Result<Option<Done>, FlipError>,
    ) -> Result<Option<FlipResult>, FlipError> {
        match claimed {
            Ok(Some(done)) => {
                self.engine = Some(done.engine);
                self.release_flip();
                done.result.map(Some)
            }
            Ok(None) => Ok(None),
            Err(err) => {
                if self.mailbox.state().is_stopped() {
                    self.release_flip();
                }
                Err(err)
            }
        }
    }

    fn release_flip(&mut self) {
        self.in_flight = None;
    }

    /// Shuts the worker down and hands the engine back.
    ///
    /// An idle worker exits at once. An executing flip is aborted through
    /// the engine's abort token and allowed to unwind. If the worker does
    /// not exit within the configured budget the thread is detached and
    /// [`FlipError::TerminateTimedOut`] is returned; the engine is then
    /// lost with it, but the flip no longer counts as active on the
    /// presentation context. Returns `Ok(None)` if the engine was already handed
    /// back.
    pub fn terminate(&mut self) -> Result<Option<FlipEngine>, FlipError> {
        let mut returned_context = None;
        if let Some(handle) = self.worker.take() {
            self.abort.abort();
            self.mailbox.request_terminate();
            if !self.mailbox.wait_stopped(self.terminate_timeout) {
                warn!(
                    surface = %self.surface,
                    timeout_secs = self.terminate_timeout.as_secs_f64(),
                    "flip worker did not terminate in time, detaching"
                );
                self.release_flip();
                return Err(FlipError::TerminateTimedOut);
            }
            match handle.join() {
                Ok(context) => returned_context = context,
                Err(_) => warn!(surface = %self.surface, "flip worker panicked during shutdown"),
            }
            self.abort.reset();
            info!(surface = %self.surface, "flip worker terminated");
        }
        if let Some(done) = self.mailbox.take_result() {
            self.engine = Some(done.engine);
        }
        if let Some(job) = self.mailbox.take_request() {
            self.engine = Some(job.engine);
        }
        self.release_flip();
        if let Some(engine) = self.engine.as_mut()
            && let Some(context) = returned_context
        {
            engine.restore_worker_context(context);
        }
        Ok(self.engine.take().map(|engine| *engine))
    }
}

impl Drop for AsyncFlipper {
    fn drop(&mut self) {
        if self.worker.is_some()
            && let Err(err) = self.terminate()
        {
            warn!(surface = %self.surface, %err, "flip worker shutdown failed on drop");
        }
    }
}

fn run(
    surface: SurfaceId,
    mailbox: &Mailbox<Job, Done>,
    mut context: Option<BoundContext>,
) -> Option<BoundContext> {
    if let Err(err) = bind_worker_context(surface, context.as_mut()) {
        mailbox.fail(err);
        return context;
    }
    mailbox.ready();
    info!(%surface, "flip worker ready");

    while let Some(Job {
        mut engine,
        request,
    }) = mailbox.next_request()
    {
        let flipped = panic::catch_unwind(AssertUnwindSafe(|| engine.flip(&request)));
        match flipped {
            Ok(result) => {
                if let Err(err) = &result {
                    debug!(%surface, %err, "asynchronous flip failed");
                }
                mailbox.complete(Done { engine, result });
            }
            Err(_) => {
                error!(%surface, "flip worker panicked, engine lost");
                mailbox.fail(FlipError::Platform("flip worker panicked".into()));
                release_worker_context(surface, context.as_mut());
                return context;
            }
        }
    }

    release_worker_context(surface, context.as_mut());
    mailbox.finish();
    info!(%surface, "flip worker exited");
    context
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use vblsync_core::config::TimingConfig;
    use vblsync_core::sim::{SimConfig, SimDisplay, SimFaults};
    use vblsync_core::time::HostTime;

    use super::*;

    fn open(config: SimConfig, ctx: &Arc<PresentationContext>) -> (SimDisplay, FlipEngine) {
        let sim = SimDisplay::new(config);
        let engine = FlipEngine::open(
            SurfaceId(3),
            sim.binding(),
            TimingConfig::standard(),
            Arc::clone(ctx),
            true,
        )
        .expect("calibration succeeds on a nominal display");
        (sim, engine)
    }

    #[test]
    fn begin_end_matches_synchronous_flip() {
        let ctx = PresentationContext::new();
        let (sync_sim, mut sync_engine) = open(SimConfig::default(), &ctx);
        let (async_sim, async_engine) = open(SimConfig::default(), &ctx);
        let mut flipper = AsyncFlipper::spawn(async_engine);
        assert_eq!(flipper.state(), FlipperState::ReadyWaiting, "worker ready");

        for i in 0..5_u64 {
            let target = HostTime(sync_sim.now().0 + i * 7_000_000);
            assert_eq!(sync_sim.now(), async_sim.now(), "sims in lock-step");
            let request = SwapRequest::at(target);
            let expected = sync_engine.flip(&request).expect("sync flip");
            flipper.begin(request).expect("begin");
            let got = flipper.end().expect("end");
            assert_eq!(got, expected, "asynchronous result equals synchronous (flip {i})");
        }

        let engine = flipper.terminate().expect("terminate").expect("engine back");
        assert_eq!(engine.surface(), SurfaceId(3));
        assert_eq!(ctx.active_async_flips(), 0, "no flip left registered");
    }

    #[test]
    fn second_begin_is_a_violation() {
        let ctx = PresentationContext::new();
        let (_sim, engine) = open(SimConfig::default(), &ctx);
        let mut flipper = AsyncFlipper::spawn(engine);

        flipper.begin(SwapRequest::asap()).expect("first begin");
        assert_eq!(
            flipper.begin(SwapRequest::asap()),
            Err(ConcurrencyViolation::FlipOutstanding.into()),
            "second begin while outstanding"
        );
        assert!(
            matches!(
                flipper.engine_mut(),
                Err(FlipError::Concurrency(ConcurrencyViolation::SurfaceBusy))
            ),
            "engine is with the worker"
        );
        flipper.end().expect("the first flip still completes");
        assert!(flipper.engine().is_some(), "engine returned after end");
        assert_eq!(
            flipper.end(),
            Err(ConcurrencyViolation::NoFlipOutstanding.into()),
            "end without begin"
        );
    }

    #[test]
    fn poll_reports_not_ready_then_result() {
        let ctx = PresentationContext::new();
        let (_sim, engine) = open(SimConfig::default(), &ctx);
        let mut flipper = AsyncFlipper::spawn(engine);
        flipper.begin(SwapRequest::asap()).expect("begin");
        assert_eq!(ctx.active_async_flips(), 1, "flip registered");

        let started = Instant::now();
        let result = loop {
            if let Some(result) = flipper.poll().expect("poll") {
                break result;
            }
            assert!(started.elapsed() < Duration::from_secs(10), "flip never completed");
            thread::yield_now();
        };
        assert!(result.deadline_miss_secs <= 0.0, "asap flip met its deadline");
        assert_eq!(ctx.active_async_flips(), 0, "flip released");
        assert!(!flipper.is_outstanding(), "nothing outstanding");
    }

    #[test]
    fn terminate_is_bounded_with_a_pending_flip() {
        let ctx = PresentationContext::new();
        let config = SimConfig {
            scheduled_swap: false,
            ..SimConfig::default()
        };
        let (sim, engine) = open(config, &ctx);
        sim.with_faults(|f: &mut SimFaults| f.real_stall = Some(Duration::from_secs(30)));
        let mut flipper = AsyncFlipper::spawn(engine);

        let far = HostTime(sim.now().0 + 2_000_000_000);
        flipper.begin(SwapRequest::at(far)).expect("begin");
        thread::sleep(Duration::from_millis(20));
        assert_eq!(flipper.state(), FlipperState::Executing, "worker is stalled");

        let started = Instant::now();
        let engine = flipper.terminate().expect("terminate").expect("engine back");
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "terminate took {:?}",
            started.elapsed()
        );
        assert_eq!(flipper.state(), FlipperState::Dead, "worker dead");
        assert!(!flipper.is_locked(), "no worker lock left held");
        assert!(!engine.abort_token().is_aborted(), "abort token reset");
        assert_eq!(ctx.active_async_flips(), 0, "flip released");
    }

    #[test]
    fn timed_out_terminate_releases_the_flip() {
        let ctx = PresentationContext::new();
        let sim = SimDisplay::new(SimConfig {
            scheduled_swap: false,
            ..SimConfig::default()
        });
        let config = TimingConfig {
            terminate_timeout_secs: 0.05,
            ..TimingConfig::standard()
        };
        let engine = FlipEngine::open(
            SurfaceId(5),
            sim.binding(),
            config,
            Arc::clone(&ctx),
            true,
        )
        .expect("open");
        sim.with_faults(|f: &mut SimFaults| {
            f.stuck_sync_token = Some(Duration::from_secs(1));
        });
        let mut flipper = AsyncFlipper::spawn(engine);

        flipper.begin(SwapRequest::asap()).expect("begin");
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ctx.active_async_flips(), 1, "flip registered while stuck");

        assert_eq!(
            flipper.terminate().map(|engine| engine.is_some()),
            Err(FlipError::TerminateTimedOut),
            "worker ignores the abort and is detached"
        );
        assert_eq!(ctx.active_async_flips(), 0, "flip released on timeout");
        assert_eq!(ctx.active_stereo(), 0, "no stereo dispatcher registered");
        assert!(!flipper.is_outstanding(), "nothing outstanding after detaching");
    }

    #[test]
    fn idle_worker_terminates_immediately() {
        let ctx = PresentationContext::new();
        let (_sim, engine) = open(SimConfig::default(), &ctx);
        let mut flipper = AsyncFlipper::spawn(engine);
        let started = Instant::now();
        assert!(flipper.terminate().expect("terminate").is_some(), "engine back");
        assert!(started.elapsed() < Duration::from_secs(1), "idle exit is prompt");
        assert_eq!(
            flipper.begin(SwapRequest::asap()),
            Err(ConcurrencyViolation::FlipOutstanding.into()),
            "engine is gone after terminate"
        );
        assert!(
            matches!(flipper.terminate(), Ok(None)),
            "second terminate is a no-op"
        );
    }

    #[test]
    fn worker_binds_its_own_context() {
        let ctx = PresentationContext::new();
        let sim = SimDisplay::new(SimConfig::default());
        let engine = FlipEngine::open(
            SurfaceId(4),
            sim.binding(),
            TimingConfig::standard(),
            Arc::clone(&ctx),
            true,
        )
        .expect("open");
        let binds_before = sim.context_binds();
        let mut flipper = AsyncFlipper::spawn(engine);
        flipper.begin(SwapRequest::asap()).expect("begin");
        flipper.end().expect("end");
        flipper.terminate().expect("terminate");
        assert!(
            sim.context_binds() > binds_before,
            "worker bound a graphics context on its own thread"
        );
    }
}

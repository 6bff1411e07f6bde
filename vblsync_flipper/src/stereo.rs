// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Frame-sequential stereo on a mono surface.
//!
//! [`StereoDispatcher`] owns a surface's engine on a dedicated thread and
//! swaps on every vertical blank, presenting the left or right eye image
//! according to the parity of the blanking count. A client request
//! ([`submit`](StereoDispatcher::submit)) is honoured by the first swap
//! that meets its target; between requests the thread keeps swapping so
//! the alternation never stalls.

use core::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use vblsync_core::context::Registration;
use vblsync_core::error::{ConcurrencyViolation, FlipError, RequestError};
use vblsync_core::scheduler::FlipEngine;
use vblsync_core::surface::SurfaceId;
use vblsync_core::time::HostTime;
use vblsync_core::timing::{Eye, FlipResult, SwapRequest, SwapTarget};
use vblsync_core::wait::AbortToken;

use crate::mailbox::{FlipperState, Inbox, Mailbox};
use crate::worker::{bind_worker_context, release_worker_context, terminate_budget};

/// Consecutive failed swaps before the dispatcher gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// External eye-shutter synchronization (e.g. shutter-glasses emitter).
pub trait ShutterSignal: Send {
    /// Called after each swap with the eye that is now on screen and its
    /// onset time.
    fn signal(&mut self, eye: Eye, onset: HostTime);
}

/// A shutter signal that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoShutter;

impl ShutterSignal for NoShutter {
    fn signal(&mut self, eye: Eye, onset: HostTime) {
        _ = (eye, onset);
    }
}

type Reply = Result<FlipResult, FlipError>;

/// Why a [`StereoDispatcher`] could not start.
#[derive(Debug)]
pub struct StartError {
    /// What went wrong.
    pub error: FlipError,
    /// The engine, handed back unless the thread panicked with it.
    pub engine: Option<Box<FlipEngine>>,
}

/// Alternates left and right eye images on successive vertical blanks.
pub struct StereoDispatcher {
    surface: SurfaceId,
    mailbox: Arc<Mailbox<SwapRequest, Reply>>,
    worker: Option<JoinHandle<Option<Box<FlipEngine>>>>,
    abort: AbortToken,
    registration: Option<Registration>,
    terminate_timeout: Duration,
}

impl fmt::Debug for StereoDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StereoDispatcher")
            .field("surface", &self.surface)
            .field("state", &self.mailbox.state())
            .finish_non_exhaustive()
    }
}

impl StereoDispatcher {
    /// Moves `engine` onto the thread `vblsync-stereo-<surface>` and starts
    /// alternating.
    ///
    /// Fails if the thread cannot be spawned or its graphics context cannot
    /// be bound; in both cases the engine is handed back.
    pub fn start(
        mut engine: FlipEngine,
        shutter: Box<dyn ShutterSignal>,
    ) -> Result<Self, StartError> {
        let surface = engine.surface();
        let registration = match engine.context().register_stereo() {
            Ok(registration) => registration,
            Err(error) => {
                return Err(StartError {
                    error,
                    engine: Some(Box::new(engine)),
                });
            }
        };
        let abort = engine.abort_token();
        let terminate_timeout = terminate_budget(&engine);
        let context = engine.take_worker_context();
        let mailbox = Arc::new(Mailbox::new());
        // The thread takes the engine out of here and puts it back if it
        // cannot bind its context.
        let handoff = Arc::new(Mutex::new(Some(Box::new(engine))));

        let worker_mailbox = Arc::clone(&mailbox);
        let worker_handoff = Arc::clone(&handoff);
        let spawned = thread::Builder::new()
            .name(format!("vblsync-stereo-{surface}"))
            .spawn(move || {
                let mut context = context;
                let Some(mut engine) = worker_handoff.lock().take() else {
                    worker_mailbox.fail(ConcurrencyViolation::WorkerNotRunning.into());
                    return None;
                };
                if let Err(err) = bind_worker_context(surface, context.as_mut()) {
                    *worker_handoff.lock() = Some(engine);
                    worker_mailbox.fail(err);
                    return None;
                }
                worker_mailbox.ready();
                info!(%surface, "stereo dispatcher running");
                run(&mut engine, &worker_mailbox, shutter);
                release_worker_context(surface, context.as_mut());
                worker_mailbox.finish();
                info!(%surface, "stereo dispatcher exited");
                Some(engine)
            });

        let error = match spawned {
            Ok(handle) if mailbox.wait_started() != FlipperState::Error => {
                return Ok(Self {
                    surface,
                    mailbox,
                    worker: Some(handle),
                    abort,
                    registration: Some(registration),
                    terminate_timeout,
                });
            }
            Ok(handle) => {
                if handle.join().is_err() {
                    warn!(%surface, "stereo dispatcher panicked during startup");
                }
                mailbox
                    .try_result()
                    .err()
                    .unwrap_or_else(|| ConcurrencyViolation::WorkerNotRunning.into())
            }
            Err(err) => {
                error!(%surface, %err, "failed to spawn stereo dispatcher");
                FlipError::Platform(format!("failed to spawn stereo dispatcher: {err}"))
            }
        };
        drop(registration);
        let engine = handoff.lock().take();
        Err(StartError { error, engine })
    }

    /// Surface being driven.
    #[must_use]
    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    /// Current dispatcher state.
    #[must_use]
    pub fn state(&self) -> FlipperState {
        self.mailbox.state()
    }

    /// Asks the dispatcher to present new content.
    ///
    /// The content goes out with the first alternating swap that meets
    /// `request.target`; its clear mode applies to that swap. A sync mode
    /// without timestamps is ignored since the alternation depends on
    /// them. Targets beyond the configured horizon are rejected through
    /// the presented result.
    pub fn submit(&self, request: SwapRequest) -> Result<(), FlipError> {
        self.mailbox.post(request).map_err(|(err, _)| err)
    }

    /// Blocks until the submitted content has been presented.
    pub fn wait_presented(&self) -> Result<FlipResult, FlipError> {
        self.mailbox.wait_result()?
    }

    /// Returns the result of the submitted content if it has been presented.
    pub fn poll_presented(&self) -> Result<Option<FlipResult>, FlipError> {
        self.mailbox.try_result()?.transpose()
    }

    /// Stops alternating and hands the engine back.
    ///
    /// Fails with [`FlipError::TerminateTimedOut`] if the thread does not
    /// exit within the configured budget; the thread is then detached and
    /// no longer counts as active on the presentation context.
    pub fn stop(mut self) -> Result<FlipEngine, FlipError> {
        self.shutdown()?
            .map(|engine| *engine)
            .ok_or(FlipError::Concurrency(ConcurrencyViolation::WorkerNotRunning))
    }

    fn shutdown(&mut self) -> Result<Option<Box<FlipEngine>>, FlipError> {
        let Some(handle) = self.worker.take() else {
            return Ok(None);
        };
        self.abort.abort();
        self.mailbox.request_terminate();
        let stopped = self.mailbox.wait_stopped(self.terminate_timeout);
        self.registration = None;
        if !stopped {
            warn!(surface = %self.surface, "stereo dispatcher did not stop in time, detaching");
            return Err(FlipError::TerminateTimedOut);
        }
        self.abort.reset();
        match handle.join() {
            Ok(engine) => Ok(engine),
            Err(_) => {
                error!(surface = %self.surface, "stereo dispatcher panicked, engine lost");
                Err(FlipError::Platform("stereo dispatcher panicked".into()))
            }
        }
    }
}

impl Drop for StereoDispatcher {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(surface = %self.surface, %err, "stereo dispatcher shutdown failed on drop");
        }
    }
}

/// Rejects client targets beyond the configured horizon.
fn admit(engine: &mut FlipEngine, request: &SwapRequest) -> Result<(), FlipError> {
    let tb = engine.timebase();
    let ahead = match request.target {
        SwapTarget::Asap => return Ok(()),
        SwapTarget::At(t) => t.signed_secs_since(engine.now(), tb),
        SwapTarget::VblankCount(n) => match engine.current_blank_count() {
            Some(count) => (n as f64 - count as f64) * engine.timing().refresh.interval_secs,
            None => return Ok(()),
        },
    };
    if ahead > engine.config().max_future_secs {
        return Err(RequestError::TooFarInFuture { secs: ahead }.into());
    }
    Ok(())
}

/// Whether the swap onto blank `count` meets `target`.
///
/// `last` is the blanking count and onset of the previous swap, used to
/// predict when `count` starts.
fn is_due(
    engine: &FlipEngine,
    target: SwapTarget,
    count: u64,
    last: Option<(u64, HostTime)>,
) -> bool {
    match target {
        SwapTarget::Asap => true,
        SwapTarget::VblankCount(n) => count >= n,
        SwapTarget::At(t) => match last {
            Some((last_count, onset)) => {
                let frames = count.saturating_sub(last_count) as f64;
                let predicted = onset.offset_secs(
                    frames * engine.timing().refresh.interval_secs,
                    engine.timebase(),
                );
                predicted >= t
            }
            None => engine.now() >= t,
        },
    }
}

fn run(
    engine: &mut FlipEngine,
    mailbox: &Mailbox<SwapRequest, Reply>,
    mut shutter: Box<dyn ShutterSignal>,
) {
    let surface = engine.surface();
    let mut next: Option<u64> = None;
    let mut last: Option<(u64, HostTime)> = None;
    let mut pending: Option<SwapRequest> = None;
    let mut failures = 0_u32;

    loop {
        match mailbox.poll_request() {
            Inbox::Terminate => return,
            Inbox::Request(request) => match admit(engine, &request) {
                Ok(()) => pending = Some(request),
                Err(err) => {
                    debug!(%surface, %err, "stereo request rejected");
                    mailbox.complete(Err(err));
                }
            },
            Inbox::Empty => {}
        }

        let Some(count) = next.or_else(|| engine.current_blank_count().map(|c| c + 1)) else {
            error!(%surface, "frame-sequential stereo needs a blanking count reference");
            mailbox.fail(FlipError::Unsupported("blanking count for stereo alternation"));
            return;
        };
        let honouring = pending.filter(|request| is_due(engine, request.target, count, last));
        let mut swap = SwapRequest::at_count(count);
        if let Some(request) = honouring {
            swap = swap.with_clear(request.clear);
            if request.sync.is_timestamped() {
                swap = swap.with_sync(request.sync);
            }
        }
        let eye = Eye::for_count(count);
        let swapped = engine.present_eye(eye).and_then(|()| engine.flip(&swap));
        if honouring.is_some() {
            pending = None;
        }

        match swapped {
            Ok(mut result) => {
                failures = 0;
                result.eye = Some(eye);
                shutter.signal(eye, result.onset);
                let landed = result.vblank_count.unwrap_or(count);
                next = Some(landed + 1);
                last = Some((landed, result.onset));
                if honouring.is_some() {
                    mailbox.complete(Ok(result));
                }
            }
            Err(FlipError::Aborted) => {
                if honouring.is_some() {
                    mailbox.complete(Err(FlipError::Aborted));
                }
                return;
            }
            Err(err) => {
                failures += 1;
                next = None;
                last = None;
                debug!(%surface, %err, failures, "stereo swap failed");
                if honouring.is_some() {
                    mailbox.complete(Err(err.clone()));
                }
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    error!(%surface, %err, "stereo dispatcher giving up");
                    mailbox.fail(err);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use vblsync_core::config::TimingConfig;
    use vblsync_core::context::PresentationContext;
    use vblsync_core::sim::{SimConfig, SimDisplay, SimFaults};
    use vblsync_core::time::Timebase;
    use vblsync_core::timing::TimestampConfidence;
    use vblsync_sync_harness::{SyncGrade, SyncSample, SyncTracker};

    use super::*;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(Eye, HostTime)>>>);

    impl ShutterSignal for Recorder {
        fn signal(&mut self, eye: Eye, onset: HostTime) {
            self.0.lock().push((eye, onset));
        }
    }

    fn open(ctx: &Arc<PresentationContext>) -> (SimDisplay, FlipEngine) {
        let sim = SimDisplay::new(SimConfig::default());
        let engine = FlipEngine::open(
            SurfaceId(9),
            sim.binding(),
            TimingConfig::standard(),
            Arc::clone(ctx),
            true,
        )
        .expect("calibration succeeds on a nominal display");
        (sim, engine)
    }

    fn wait_for_signals(recorder: &Recorder, n: usize) {
        let started = Instant::now();
        while recorder.0.lock().len() < n {
            assert!(
                started.elapsed() < Duration::from_secs(10),
                "dispatcher stalled"
            );
            thread::yield_now();
        }
    }

    #[test]
    fn eyes_strictly_alternate() {
        let ctx = PresentationContext::new();
        let (sim, engine) = open(&ctx);
        let recorder = Recorder::default();
        let dispatcher =
            StereoDispatcher::start(engine, Box::new(recorder.clone())).expect("start");
        assert_eq!(ctx.active_stereo(), 1, "dispatcher registered");

        wait_for_signals(&recorder, 120);
        let engine = dispatcher.stop().expect("stop");
        assert_eq!(engine.surface(), SurfaceId(9), "engine handed back");
        assert_eq!(ctx.active_stereo(), 0, "dispatcher unregistered");

        let eyes = sim.presented_eyes();
        assert!(eyes.len() >= 120, "only {} eye images presented", eyes.len());
        assert!(
            eyes.windows(2).all(|w| w[0] != w[1]),
            "an eye was presented twice in a row"
        );
        let signalled = recorder.0.lock();
        assert!(
            signalled.windows(2).all(|w| w[0].0 != w[1].0),
            "shutter signal repeated an eye"
        );
        assert!(
            signalled.windows(2).all(|w| w[1].1 > w[0].1),
            "onsets advance"
        );
    }

    #[test]
    fn client_request_is_honoured_on_matching_parity() {
        let ctx = PresentationContext::new();
        let (_sim, engine) = open(&ctx);
        let dispatcher = StereoDispatcher::start(engine, Box::new(NoShutter)).expect("start");

        for _ in 0..5 {
            dispatcher.submit(SwapRequest::asap()).expect("submit");
            let result = dispatcher.wait_presented().expect("presented");
            let eye = result.eye.expect("stereo result names its eye");
            let count = result.vblank_count.expect("count reported");
            assert_eq!(eye, Eye::for_count(count), "eye follows blanking parity");
        }

        dispatcher.submit(SwapRequest::asap()).expect("submit");
        assert_eq!(
            dispatcher.submit(SwapRequest::asap()),
            Err(ConcurrencyViolation::FlipOutstanding.into()),
            "one client request at a time"
        );
        dispatcher.stop().expect("stop");
    }

    #[test]
    fn timed_request_waits_for_its_target() {
        let ctx = PresentationContext::new();
        let (sim, engine) = open(&ctx);
        let dispatcher = StereoDispatcher::start(engine, Box::new(NoShutter)).expect("start");

        for _ in 0..3 {
            let target = sim.now().offset_secs(0.1, Timebase::NANOS);
            dispatcher.submit(SwapRequest::at(target)).expect("submit");
            let result = dispatcher.wait_presented().expect("presented");
            assert!(
                result.onset >= target,
                "onset {:?} came before the target {target:?}",
                result.onset
            );
            let count = result.vblank_count.expect("count reported");
            assert_eq!(result.eye, Some(Eye::for_count(count)), "eye follows parity");
        }
        dispatcher.stop().expect("stop");
    }

    #[test]
    fn request_beyond_the_horizon_is_rejected() {
        let ctx = PresentationContext::new();
        let (sim, engine) = open(&ctx);
        let dispatcher = StereoDispatcher::start(engine, Box::new(NoShutter)).expect("start");

        let far = sim.now().offset_secs(5_000.0, Timebase::NANOS);
        dispatcher.submit(SwapRequest::at(far)).expect("submit");
        assert!(
            matches!(
                dispatcher.wait_presented(),
                Err(FlipError::InvalidRequest(RequestError::TooFarInFuture { .. }))
            ),
            "far target is refused instead of stalling the client"
        );
        dispatcher.submit(SwapRequest::asap()).expect("dispatcher still accepts work");
        dispatcher.wait_presented().expect("presented");
        dispatcher.stop().expect("stop");
    }

    #[test]
    fn housekeeping_swaps_keep_nominal_cadence() {
        let ctx = PresentationContext::new();
        let (sim, engine) = open(&ctx);
        let recorder = Recorder::default();
        let dispatcher =
            StereoDispatcher::start(engine, Box::new(recorder.clone())).expect("start");
        wait_for_signals(&recorder, 60);
        dispatcher.stop().expect("stop");

        let period_ms = sim.period_secs() * 1000.0;
        let mut tracker = SyncTracker::<32>::new(period_ms);
        let mut report = None;
        let onsets: Vec<HostTime> = recorder.0.lock().iter().map(|(_, t)| *t).collect();
        for pair in onsets.windows(2) {
            let delta_ms = pair[1].signed_secs_since(pair[0], Timebase::NANOS) * 1000.0;
            let sample =
                SyncSample::from_interval(TimestampConfidence::Verified, delta_ms, period_ms);
            report = Some(tracker.observe(sample));
        }
        let report = report.expect("observed at least one interval");
        assert_eq!(report.missed_frames, 0, "no dropped frame under nominal timing");
        assert_eq!(report.grade, SyncGrade::A, "nominal cadence grades A");
    }

    #[test]
    fn stop_is_prompt_and_leaves_no_lock_held() {
        let ctx = PresentationContext::new();
        let (_sim, engine) = open(&ctx);
        let dispatcher = StereoDispatcher::start(engine, Box::new(NoShutter)).expect("start");
        let mailbox = Arc::clone(&dispatcher.mailbox);
        let started = Instant::now();
        dispatcher.stop().expect("stop");
        assert!(started.elapsed() < Duration::from_secs(2), "stop is bounded");
        assert_eq!(mailbox.state(), FlipperState::Dead, "thread exited");
        assert!(!mailbox.is_locked(), "no lock left held");
    }

    #[test]
    fn timed_out_stop_releases_the_registration() {
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
            SurfaceId(10),
            sim.binding(),
            config,
            Arc::clone(&ctx),
            true,
        )
        .expect("open");
        sim.with_faults(|f: &mut SimFaults| {
            f.stuck_sync_token = Some(Duration::from_secs(1));
        });
        let dispatcher = StereoDispatcher::start(engine, Box::new(NoShutter)).expect("start");
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ctx.active_stereo(), 1, "dispatcher registered while stuck");

        assert!(
            matches!(dispatcher.stop(), Err(FlipError::TerminateTimedOut)),
            "stuck dispatcher is detached"
        );
        assert_eq!(ctx.active_stereo(), 0, "registration released on timeout");
        assert_eq!(ctx.active_async_flips(), 0, "no async flip registered");
    }
}

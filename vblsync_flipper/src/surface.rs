// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-surface facade over synchronous, asynchronous and stereo flips.

use core::fmt;
use std::sync::Arc;

use tracing::{info, warn};
use vblsync_core::adapter::PlatformBinding;
use vblsync_core::callbacks::FlipCallbacks;
use vblsync_core::config::{CalibrationParams, TimingConfig};
use vblsync_core::context::PresentationContext;
use vblsync_core::error::{ConcurrencyViolation, FlipError};
use vblsync_core::scheduler::FlipEngine;
use vblsync_core::surface::SurfaceId;
use vblsync_core::timing::{CalibrationResult, FlipResult, SwapRequest};

use crate::stereo::{ShutterSignal, StartError, StereoDispatcher};
use crate::worker::AsyncFlipper;

enum Mode {
    Direct(Box<FlipEngine>),
    Worker(AsyncFlipper),
    Stereo(StereoDispatcher),
    /// The engine was lost with a worker that failed to shut down.
    Lost,
}

/// An on-screen surface.
///
/// Owns the surface's [`FlipEngine`] and hands it to a background worker
/// on the first [`begin_flip`](Self::begin_flip). Callbacks scheduled with
/// [`on_next_flip`](Self::on_next_flip) run with the result of the next
/// flip this surface completes, synchronous or not. Dropping the surface
/// stops its worker.
pub struct Surface {
    id: SurfaceId,
    mode: Mode,
    callbacks: FlipCallbacks,
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match &self.mode {
            Mode::Direct(_) => "direct",
            Mode::Worker(_) => "worker",
            Mode::Stereo(_) => "stereo",
            Mode::Lost => "lost",
        };
        f.debug_struct("Surface")
            .field("id", &self.id)
            .field("mode", &mode)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

impl Surface {
    /// Opens a surface and calibrates its refresh interval.
    pub fn open(
        id: SurfaceId,
        binding: PlatformBinding,
        config: TimingConfig,
        ctx: Arc<PresentationContext>,
        fullscreen: bool,
    ) -> Result<Self, FlipError> {
        FlipEngine::open(id, binding, config, ctx, fullscreen).map(Self::from_engine)
    }

    /// Wraps an existing engine.
    #[must_use]
    pub fn from_engine(engine: FlipEngine) -> Self {
        Self {
            id: engine.surface(),
            mode: Mode::Direct(Box::new(engine)),
            callbacks: FlipCallbacks::new(),
        }
    }

    /// Surface identifier.
    #[must_use]
    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// The engine, while it is not busy on another thread.
    #[must_use]
    pub fn engine(&self) -> Option<&FlipEngine> {
        match &self.mode {
            Mode::Direct(engine) => Some(engine.as_ref()),
            Mode::Worker(flipper) => flipper.engine(),
            Mode::Stereo(_) | Mode::Lost => None,
        }
    }

    fn engine_mut(&mut self) -> Result<&mut FlipEngine, FlipError> {
        match &mut self.mode {
            Mode::Direct(engine) => Ok(engine.as_mut()),
            Mode::Worker(flipper) => flipper.engine_mut(),
            Mode::Stereo(_) => Err(ConcurrencyViolation::SurfaceBusy.into()),
            Mode::Lost => Err(ConcurrencyViolation::WorkerNotRunning.into()),
        }
    }

    /// Whether an asynchronous flip is outstanding.
    #[must_use]
    pub fn flip_outstanding(&self) -> bool {
        matches!(&self.mode, Mode::Worker(flipper) if flipper.is_outstanding())
    }

    /// Whether the stereo dispatcher is running.
    #[must_use]
    pub fn is_stereo_running(&self) -> bool {
        matches!(self.mode, Mode::Stereo(_))
    }

    /// Schedules `f` to run with the result of the next completed flip.
    pub fn on_next_flip(&mut self, f: impl FnOnce(&FlipResult) + Send + 'static) {
        self.callbacks.schedule(f);
    }

    /// Drops all scheduled callbacks.
    pub fn clear_callbacks(&mut self) {
        self.callbacks.clear();
    }

    /// Re-measures the refresh interval.
    pub fn calibrate(
        &mut self,
        params: &CalibrationParams,
    ) -> Result<CalibrationResult, FlipError> {
        self.engine_mut()?.calibrate(params)
    }

    /// Flips on the calling thread.
    ///
    /// Fails with [`ConcurrencyViolation::SurfaceBusy`] while an
    /// asynchronous flip is outstanding or stereo is running.
    pub fn flip(&mut self, request: &SwapRequest) -> Result<FlipResult, FlipError> {
        let result = self.engine_mut()?.flip(request)?;
        self.callbacks.run(&result);
        Ok(result)
    }

    /// Starts an asynchronous flip, creating the worker on first use.
    pub fn begin_flip(&mut self, request: SwapRequest) -> Result<(), FlipError> {
        self.mode = match core::mem::replace(&mut self.mode, Mode::Lost) {
            Mode::Direct(engine) => {
                info!(surface = %self.id, "creating flip worker");
                Mode::Worker(AsyncFlipper::spawn(*engine))
            }
            other => other,
        };
        match &mut self.mode {
            Mode::Worker(flipper) => flipper.begin(request),
            Mode::Stereo(_) => Err(ConcurrencyViolation::SurfaceBusy.into()),
            Mode::Direct(_) | Mode::Lost => Err(ConcurrencyViolation::WorkerNotRunning.into()),
        }
    }

    /// Blocks until the outstanding asynchronous flip completes.
    pub fn end_flip(&mut self) -> Result<FlipResult, FlipError> {
        let Mode::Worker(flipper) = &mut self.mode else {
            return Err(ConcurrencyViolation::NoFlipOutstanding.into());
        };
        let result = flipper.end()?;
        self.callbacks.run(&result);
        Ok(result)
    }

    /// Non-blocking [`end_flip`](Self::end_flip); `Ok(None)` means not
    /// ready yet.
    pub fn poll_flip(&mut self) -> Result<Option<FlipResult>, FlipError> {
        let Mode::Worker(flipper) = &mut self.mode else {
            return Err(ConcurrencyViolation::NoFlipOutstanding.into());
        };
        let result = flipper.poll()?;
        if let Some(result) = &result {
            self.callbacks.run(result);
        }
        Ok(result)
    }

    /// Hands the surface to a frame-sequential stereo dispatcher.
    ///
    /// Any idle flip worker is stopped first. Fails with
    /// [`ConcurrencyViolation::FlipOutstanding`] while an asynchronous flip
    /// is outstanding.
    pub fn start_stereo(&mut self, shutter: Box<dyn ShutterSignal>) -> Result<(), FlipError> {
        if self.flip_outstanding() {
            return Err(ConcurrencyViolation::FlipOutstanding.into());
        }
        if self.is_stereo_running() {
            return Err(ConcurrencyViolation::SurfaceBusy.into());
        }
        let engine = self.reclaim_engine()?;
        match StereoDispatcher::start(*engine, shutter) {
            Ok(dispatcher) => {
                self.mode = Mode::Stereo(dispatcher);
                Ok(())
            }
            Err(StartError { error, engine }) => {
                self.mode = engine.map_or(Mode::Lost, Mode::Direct);
                Err(error)
            }
        }
    }

    /// Stops the stereo dispatcher and returns to direct flipping.
    pub fn stop_stereo(&mut self) -> Result<(), FlipError> {
        match core::mem::replace(&mut self.mode, Mode::Lost) {
            Mode::Stereo(dispatcher) => self.mode = Mode::Direct(Box::new(dispatcher.stop()?)),
            other => self.mode = other,
        }
        Ok(())
    }

    /// The running stereo dispatcher, for submitting content.
    pub fn stereo(&self) -> Option<&StereoDispatcher> {
        match &self.mode {
            Mode::Stereo(dispatcher) => Some(dispatcher),
            _ => None,
        }
    }

    /// Stops any background thread and takes the engine back onto the
    /// calling thread.
    fn reclaim_engine(&mut self) -> Result<Box<FlipEngine>, FlipError> {
        match core::mem::replace(&mut self.mode, Mode::Lost) {
            Mode::Direct(engine) => Ok(engine),
            Mode::Worker(mut flipper) => flipper
                .terminate()?
                .map(Box::new)
                .ok_or(FlipError::Concurrency(ConcurrencyViolation::WorkerNotRunning)),
            Mode::Stereo(dispatcher) => dispatcher.stop().map(Box::new),
            Mode::Lost => Err(ConcurrencyViolation::WorkerNotRunning.into()),
        }
    }

    /// Stops background threads and returns the engine.
    pub fn close(mut self) -> Result<FlipEngine, FlipError> {
        self.reclaim_engine().map(|engine| *engine)
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        if matches!(self.mode, Mode::Worker(_) | Mode::Stereo(_))
            && let Err(err) = self.reclaim_engine()
        {
            warn!(surface = %self.id, %err, "background flip thread did not stop cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use vblsync_core::sim::{SimConfig, SimDisplay};

    use super::*;
    use crate::stereo::NoShutter;

    fn open(ctx: &Arc<PresentationContext>) -> (SimDisplay, Surface) {
        let sim = SimDisplay::new(SimConfig::default());
        let surface = Surface::open(
            SurfaceId(5),
            sim.binding(),
            TimingConfig::standard(),
            Arc::clone(ctx),
            true,
        )
        .expect("calibration succeeds on a nominal display");
        (sim, surface)
    }

    #[test]
    fn worker_is_created_lazily() {
        let ctx = PresentationContext::new();
        let (_sim, mut surface) = open(&ctx);
        surface.flip(&SwapRequest::asap()).expect("sync flip");
        assert!(matches!(surface.mode, Mode::Direct(_)), "no worker yet");

        surface.begin_flip(SwapRequest::asap()).expect("begin");
        assert!(surface.flip_outstanding(), "flip outstanding");
        assert_eq!(
            surface.flip(&SwapRequest::asap()),
            Err(ConcurrencyViolation::SurfaceBusy.into()),
            "no sync flip while the worker owns the engine"
        );
        let result = surface.end_flip().expect("end");
        assert_eq!(result.swap_sequence, 2, "second swap on this surface");

        let sync = surface.flip(&SwapRequest::asap()).expect("sync flip between async ones");
        assert_eq!(sync.swap_sequence, 3, "sequence continues");
    }

    #[test]
    fn callbacks_run_after_sync_and_async_flips() {
        let ctx = PresentationContext::new();
        let (_sim, mut surface) = open(&ctx);
        let seen = Arc::new(AtomicU64::new(0));

        let s = Arc::clone(&seen);
        surface.on_next_flip(move |r| s.store(r.swap_sequence, Ordering::SeqCst));
        surface.flip(&SwapRequest::asap()).expect("flip");
        assert_eq!(seen.load(Ordering::SeqCst), 1, "callback saw the sync flip");

        let s = Arc::clone(&seen);
        surface.on_next_flip(move |r| s.store(r.swap_sequence, Ordering::SeqCst));
        surface.begin_flip(SwapRequest::asap()).expect("begin");
        surface.end_flip().expect("end");
        assert_eq!(seen.load(Ordering::SeqCst), 2, "callback saw the async flip");

        let s = Arc::clone(&seen);
        surface.on_next_flip(move |r| s.store(r.swap_sequence, Ordering::SeqCst));
        surface.clear_callbacks();
        surface.flip(&SwapRequest::asap()).expect("flip");
        assert_eq!(seen.load(Ordering::SeqCst), 2, "cleared callback did not run");
    }

    #[test]
    fn stereo_takes_over_and_hands_back() {
        let ctx = PresentationContext::new();
        let (sim, mut surface) = open(&ctx);
        surface.begin_flip(SwapRequest::asap()).expect("begin");
        assert_eq!(
            surface.start_stereo(Box::new(NoShutter)),
            Err(ConcurrencyViolation::FlipOutstanding.into()),
            "stereo refused while a flip is outstanding"
        );
        surface.end_flip().expect("end");

        surface.start_stereo(Box::new(NoShutter)).expect("stereo starts");
        assert_eq!(
            surface.flip(&SwapRequest::asap()),
            Err(ConcurrencyViolation::SurfaceBusy.into()),
            "stereo owns the engine"
        );
        let dispatcher = surface.stereo().expect("dispatcher");
        dispatcher.submit(SwapRequest::asap()).expect("submit");
        dispatcher.wait_presented().expect("presented");
        surface.stop_stereo().expect("stop");
        assert!(!sim.presented_eyes().is_empty(), "eyes were presented");

        surface.flip(&SwapRequest::asap()).expect("direct flips resume");
        assert_eq!(ctx.active_stereo(), 0, "stereo unregistered");
    }

    #[test]
    fn close_stops_the_worker() {
        let ctx = PresentationContext::new();
        let (_sim, mut surface) = open(&ctx);
        surface.begin_flip(SwapRequest::asap()).expect("begin");
        let engine = surface.close().expect("close");
        assert_eq!(engine.surface(), SurfaceId(5), "engine returned");
        assert_eq!(ctx.active_async_flips(), 0, "outstanding flip released");
    }
}

// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Process-wide presentation bookkeeping.
//!
//! [`PresentationContext`] holds what would otherwise be global mutable
//! state: the caller's current render target, the number of asynchronous
//! flips in flight, and the number of running stereo dispatchers. One
//! context is created per process (or per test), shared through an [`Arc`],
//! and handed to every engine.
//!
//! # Init/teardown contract
//!
//! - [`PresentationContext::new`] returns an initialized context.
//! - Engines register asynchronous flips and stereo dispatchers while they
//!   run and unregister when they stop.
//! - [`PresentationContext::teardown`] succeeds only once every
//!   registration has been released; afterwards the context refuses new
//!   registrations.
//!
//! Render-target switches around a swap go through
//! [`PresentationContext::switch_target`], a non-reentrant guard.
//!
//! [`SharedConnection`] is the coarse lock for surfaces that share one
//! display-server connection. [`BoundContext`] tracks which thread owns a
//! worker's graphics context.

use core::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Mutex, MutexGuard};

use crate::adapter::GraphicsContext;
use crate::error::{ConcurrencyViolation, FlipError};
use crate::surface::SurfaceId;

#[derive(Debug, Default)]
struct ContextState {
    current_target: Option<SurfaceId>,
    active_async_flips: u32,
    active_stereo: u32,
    switching: Vec<ThreadId>,
    torn_down: bool,
}

impl ContextState {
    fn counter(&mut self, kind: RegistrationKind) -> &mut u32 {
        match kind {
            RegistrationKind::AsyncFlip => &mut self.active_async_flips,
            RegistrationKind::Stereo => &mut self.active_stereo,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RegistrationKind {
    AsyncFlip,
    Stereo,
}

/// Shared bookkeeping for every surface in the process.
#[derive(Debug, Default)]
pub struct PresentationContext {
    state: Mutex<ContextState>,
}

impl PresentationContext {
    /// Creates an initialized context.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Surface currently bound for drawing by the caller, if any.
    #[must_use]
    pub fn current_target(&self) -> Option<SurfaceId> {
        self.state.lock().current_target
    }

    /// Records that the caller bound `surface` for drawing.
    pub fn bind_target(&self, surface: Option<SurfaceId>) {
        self.state.lock().current_target = surface;
    }

    /// Detaches `surface` for the duration of a swap.
    ///
    /// If `surface` is the current target it is unbound and rebound when
    /// the returned guard drops. Entering a second switch on the same thread
    /// before the first guard dropped is a
    /// [`ConcurrencyViolation::ReentrantTargetSwitch`].
    pub fn switch_target(&self, surface: SurfaceId) -> Result<TargetSwitch<'_>, FlipError> {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        if state.switching.contains(&me) {
            return Err(ConcurrencyViolation::ReentrantTargetSwitch.into());
        }
        state.switching.push(me);
        let restore = if state.current_target == Some(surface) {
            state.current_target = None;
            Some(surface)
        } else {
            None
        };
        Ok(TargetSwitch {
            ctx: self,
            thread: me,
            restore,
        })
    }

    /// Registers an asynchronous flip in flight until the returned guard
    /// drops.
    pub fn register_async_flip(self: &Arc<Self>) -> Result<Registration, FlipError> {
        self.register(RegistrationKind::AsyncFlip)
    }

    /// Registers a running stereo dispatcher until the returned guard drops.
    pub fn register_stereo(self: &Arc<Self>) -> Result<Registration, FlipError> {
        self.register(RegistrationKind::Stereo)
    }

    fn register(self: &Arc<Self>, kind: RegistrationKind) -> Result<Registration, FlipError> {
        let mut state = self.state.lock();
        if state.torn_down {
            return Err(ConcurrencyViolation::WorkerNotRunning.into());
        }
        *state.counter(kind) += 1;
        Ok(Registration {
            ctx: Arc::clone(self),
            kind,
        })
    }

    /// Number of asynchronous flips in flight.
    #[must_use]
    pub fn active_async_flips(&self) -> u32 {
        self.state.lock().active_async_flips
    }

    /// Number of running stereo dispatchers.
    #[must_use]
    pub fn active_stereo(&self) -> u32 {
        self.state.lock().active_stereo
    }

    /// Tears the context down.
    ///
    /// Fails with [`ConcurrencyViolation::SurfaceBusy`] while asynchronous
    /// flips or stereo dispatchers are still registered.
    pub fn teardown(&self) -> Result<(), FlipError> {
        let mut state = self.state.lock();
        if state.active_async_flips > 0 || state.active_stereo > 0 {
            return Err(ConcurrencyViolation::SurfaceBusy.into());
        }
        state.current_target = None;
        state.torn_down = true;
        Ok(())
    }

    /// Whether [`teardown`](Self::teardown) has completed.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.state.lock().torn_down
    }
}

/// An asynchronous flip or stereo dispatcher counted by a
/// [`PresentationContext`].
///
/// Dropping it releases the registration, whichever way the owner exits.
#[must_use = "the registration is released as soon as it is dropped"]
pub struct Registration {
    ctx: Arc<PresentationContext>,
    kind: RegistrationKind,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut state = self.ctx.state.lock();
        let counter = state.counter(self.kind);
        *counter = counter.saturating_sub(1);
    }
}

/// Guard returned by [`PresentationContext::switch_target`].
pub struct TargetSwitch<'a> {
    ctx: &'a PresentationContext,
    thread: ThreadId,
    restore: Option<SurfaceId>,
}

impl fmt::Debug for TargetSwitch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetSwitch")
            .field("thread", &self.thread)
            .field("restore", &self.restore)
            .finish_non_exhaustive()
    }
}

impl Drop for TargetSwitch<'_> {
    fn drop(&mut self) {
        let mut state = self.ctx.state.lock();
        state.switching.retain(|t| *t != self.thread);
        if let Some(surface) = self.restore
            && state.current_target.is_none()
        {
            state.current_target = Some(surface);
        }
    }
}

/// Coarse lock around a display-server connection shared by several
/// surfaces.
///
/// Clones share the same lock.
#[derive(Clone, Debug, Default)]
pub struct SharedConnection(Arc<Mutex<()>>);

impl SharedConnection {
    /// Creates a new, unlocked connection lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the connection until the guard drops.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock()
    }

    /// Whether some thread holds the connection right now.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.0.is_locked()
    }
}

/// A graphics context together with the thread it is bound to.
pub struct BoundContext {
    context: Box<dyn GraphicsContext>,
    owner: Option<ThreadId>,
}

impl fmt::Debug for BoundContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundContext")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl BoundContext {
    /// Wraps an unbound context.
    #[must_use]
    pub fn new(context: Box<dyn GraphicsContext>) -> Self {
        Self {
            context,
            owner: None,
        }
    }

    /// Binds the context to the calling thread.
    ///
    /// Binding again on the owning thread is a no-op; binding from any other
    /// thread is a [`ConcurrencyViolation::ContextBoundElsewhere`].
    pub fn bind(&mut self) -> Result<(), FlipError> {
        let me = std::thread::current().id();
        match self.owner {
            Some(owner) if owner == me => Ok(()),
            Some(_) => Err(ConcurrencyViolation::ContextBoundElsewhere.into()),
            None => {
                self.context.make_current().map_err(FlipError::from)?;
                self.owner = Some(me);
                Ok(())
            }
        }
    }

    /// Unbinds the context. Only the owning thread may release it.
    pub fn release(&mut self) -> Result<(), FlipError> {
        let me = std::thread::current().id();
        match self.owner {
            None => Ok(()),
            Some(owner) if owner != me => Err(ConcurrencyViolation::ContextBoundElsewhere.into()),
            Some(_) => {
                self.owner = None;
                self.context.release().map_err(FlipError::from)
            }
        }
    }

    /// Thread currently owning the context.
    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }
}

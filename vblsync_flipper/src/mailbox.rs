// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Request/result hand-off between a caller and one background worker.
//!
//! A [`Mailbox`] carries at most one request and one result at a time and
//! tracks the worker's [`FlipperState`]. All transitions happen under one
//! mutex; two condition variables wake the worker (new request, termination)
//! and the caller (worker started, result ready, worker gone).

use core::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use vblsync_core::error::{ConcurrencyViolation, FlipError};

/// Lifecycle of a background flip worker.
///
/// ```text
/// Uninitialized ─► ReadyWaiting ─► Executing ─► Completed ─┐
///                       ▲                                  │
///                       └──────────────────────────────────┘
/// any non-Executing ─► Terminating ─► Dead      failure ─► Error
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlipperState {
    /// The worker thread has not reported in yet.
    Uninitialized,
    /// Idle, waiting for a request.
    ReadyWaiting,
    /// A request was handed over and is being processed.
    Executing,
    /// A result is waiting to be claimed.
    Completed,
    /// Shutdown was requested; the worker is exiting.
    Terminating,
    /// The worker has exited.
    Dead,
    /// The worker failed and exited.
    Error,
}

impl FlipperState {
    /// Whether the worker thread has finished (or is about to).
    #[must_use]
    pub const fn is_stopped(self) -> bool {
        matches!(self, Self::Dead | Self::Error)
    }
}

/// What a worker finds when it polls for work without blocking.
#[derive(Debug)]
pub enum Inbox<Req> {
    /// A request was handed over.
    Request(Req),
    /// Nothing to do right now.
    Empty,
    /// Shutdown was requested.
    Terminate,
}

struct Slot<Req, Res> {
    state: FlipperState,
    request: Option<Req>,
    result: Option<Res>,
    failure: Option<FlipError>,
    terminate: bool,
}

/// One-request, one-result hand-off with a worker state machine.
pub struct Mailbox<Req, Res> {
    slot: Mutex<Slot<Req, Res>>,
    to_worker: Condvar,
    to_caller: Condvar,
}

impl<Req, Res> fmt::Debug for Mailbox<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<Req, Res> Default for Mailbox<Req, Res> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Res> Mailbox<Req, Res> {
    /// Creates a mailbox in [`FlipperState::Uninitialized`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                state: FlipperState::Uninitialized,
                request: None,
                result: None,
                failure: None,
                terminate: false,
            }),
            to_worker: Condvar::new(),
            to_caller: Condvar::new(),
        }
    }

    /// Current worker state.
    #[must_use]
    pub fn state(&self) -> FlipperState {
        self.slot.lock().state
    }

    /// Whether the mailbox mutex is currently held by anyone.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.slot.is_locked()
    }

    // Worker side.

    /// Reports the worker as started.
    pub fn ready(&self) {
        let mut slot = self.slot.lock();
        if slot.state == FlipperState::Uninitialized {
            slot.state = if slot.terminate {
                FlipperState::Terminating
            } else {
                FlipperState::ReadyWaiting
            };
        }
        self.to_caller.notify_all();
    }

    /// Blocks until a request arrives or shutdown is requested.
    ///
    /// Returns `None` on shutdown; the state is then
    /// [`FlipperState::Terminating`].
    pub fn next_request(&self) -> Option<Req> {
        let mut slot = self.slot.lock();
        loop {
            if slot.terminate {
                slot.state = FlipperState::Terminating;
                return None;
            }
            if slot.state == FlipperState::Executing
                && let Some(request) = slot.request.take()
            {
                return Some(request);
            }
            self.to_worker.wait(&mut slot);
        }
    }

    /// Non-blocking variant of [`next_request`](Self::next_request).
    pub fn poll_request(&self) -> Inbox<Req> {
        let mut slot = self.slot.lock();
        if slot.terminate {
            slot.state = FlipperState::Terminating;
            return Inbox::Terminate;
        }
        if slot.state == FlipperState::Executing
            && let Some(request) = slot.request.take()
        {
            return Inbox::Request(request);
        }
        Inbox::Empty
    }

    /// Publishes the result of the current request.
    pub fn complete(&self, result: Res) {
        let mut slot = self.slot.lock();
        slot.result = Some(result);
        slot.state = FlipperState::Completed;
        self.to_caller.notify_all();
    }

    /// Records an unrecoverable worker failure.
    pub fn fail(&self, err: FlipError) {
        let mut slot = self.slot.lock();
        slot.failure = Some(err);
        slot.state = FlipperState::Error;
        self.to_caller.notify_all();
    }

    /// Reports the worker as exited.
    pub fn finish(&self) {
        let mut slot = self.slot.lock();
        if slot.state != FlipperState::Error {
            slot.state = FlipperState::Dead;
        }
        self.to_caller.notify_all();
    }

    // Caller side.

    /// Blocks until the worker has reported in (ready or failed).
    pub fn wait_started(&self) -> FlipperState {
        let mut slot = self.slot.lock();
        while slot.state == FlipperState::Uninitialized {
            self.to_caller.wait(&mut slot);
        }
        slot.state
    }

    /// Hands a request to an idle worker.
    ///
    /// On failure the request is handed back with the error.
    pub fn post(&self, request: Req) -> Result<(), (FlipError, Req)> {
        let mut slot = self.slot.lock();
        let err = match slot.state {
            FlipperState::ReadyWaiting if !slot.terminate => {
                slot.request = Some(request);
                slot.state = FlipperState::Executing;
                self.to_worker.notify_all();
                return Ok(());
            }
            FlipperState::Executing | FlipperState::Completed => {
                ConcurrencyViolation::FlipOutstanding.into()
            }
            FlipperState::Error => slot
                .failure
                .clone()
                .unwrap_or_else(|| ConcurrencyViolation::WorkerNotRunning.into()),
            FlipperState::ReadyWaiting
            | FlipperState::Uninitialized
            | FlipperState::Terminating
            | FlipperState::Dead => ConcurrencyViolation::WorkerNotRunning.into(),
        };
        Err((err, request))
    }

    /// Blocks until the outstanding request completes and claims its result.
    pub fn wait_result(&self) -> Result<Res, FlipError> {
        let mut slot = self.slot.lock();
        loop {
            match slot.state {
                FlipperState::Executing => self.to_caller.wait(&mut slot),
                _ => return Self::claim(&mut slot)?.ok_or_else(|| Self::idle_error(&slot)),
            }
        }
    }

    /// Claims the result if the outstanding request has completed.
    ///
    /// Returns `Ok(None)` while it is still executing.
    pub fn try_result(&self) -> Result<Option<Res>, FlipError> {
        let mut slot = self.slot.lock();
        match slot.state {
            FlipperState::Executing => Ok(None),
            _ => Self::claim(&mut slot)?
                .map(Some)
                .ok_or_else(|| Self::idle_error(&slot)),
        }
    }

    fn claim(slot: &mut Slot<Req, Res>) -> Result<Option<Res>, FlipError> {
        match slot.state {
            FlipperState::Completed => {
                slot.state = FlipperState::ReadyWaiting;
                Ok(slot.result.take())
            }
            FlipperState::Error => Err(slot
                .failure
                .clone()
                .unwrap_or_else(|| ConcurrencyViolation::WorkerNotRunning.into())),
            _ => Ok(None),
        }
    }

    fn idle_error(slot: &Slot<Req, Res>) -> FlipError {
        match slot.state {
            FlipperState::ReadyWaiting => ConcurrencyViolation::NoFlipOutstanding.into(),
            _ => ConcurrencyViolation::WorkerNotRunning.into(),
        }
    }

    /// Asks the worker to exit and wakes it.
    ///
    /// An executing request is allowed to finish; its result stays in the
    /// mailbox for [`take_result`](Self::take_result).
    pub fn request_terminate(&self) {
        let mut slot = self.slot.lock();
        slot.terminate = true;
        if matches!(
            slot.state,
            FlipperState::Uninitialized | FlipperState::ReadyWaiting | FlipperState::Completed
        ) {
            slot.state = FlipperState::Terminating;
        }
        self.to_worker.notify_all();
        self.to_caller.notify_all();
    }

    /// Waits up to `timeout` for the worker to exit.
    ///
    /// Returns whether it did.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while !slot.state.is_stopped() {
            if self.to_caller.wait_until(&mut slot, deadline).timed_out() {
                return slot.state.is_stopped();
            }
        }
        true
    }

    /// Removes an unclaimed result, whatever the state.
    pub fn take_result(&self) -> Option<Res> {
        self.slot.lock().result.take()
    }

    /// Removes a request the worker never picked up.
    pub fn take_request(&self) -> Option<Req> {
        self.slot.lock().request.take()
    }
}

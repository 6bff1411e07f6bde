// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Platform collaborators owned by one engine.

use core::fmt;
use std::sync::Arc;

use crate::adapter::{
    AdapterCaps, BlankingSample, DrawingTarget, GraphicsContext, PlatformBinding, ScheduleTarget,
    SwapAdapter, SwapKind,
};
use crate::context::SharedConnection;
use crate::error::{AdapterError, FlipError};
use crate::time::{HostTime, Timebase};
use crate::wait::{AbortToken, Clock, PollOutcome, WaitStrategy, poll_beam_until};

/// Adapter, drawing target, clock and waiter of one surface.
///
/// Every adapter call goes through [`with_adapter`](Self::with_adapter),
/// which holds the shared display-connection lock, if any, for the duration
/// of the call.
pub(crate) struct SwapIo {
    pub(crate) adapter: Box<dyn SwapAdapter>,
    pub(crate) target: Box<dyn DrawingTarget>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) waiter: Box<dyn WaitStrategy>,
    pub(crate) connection: Option<SharedConnection>,
    pub(crate) abort: AbortToken,
    pub(crate) caps: AdapterCaps,
}

impl fmt::Debug for SwapIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapIo")
            .field("caps", &self.caps)
            .field("shared_connection", &self.connection.is_some())
            .field("aborted", &self.abort.is_aborted())
            .finish_non_exhaustive()
    }
}

impl SwapIo {
    /// Splits a binding into the engine's collaborators. The worker context
    /// is returned separately.
    pub(crate) fn from_binding(
        binding: PlatformBinding,
    ) -> (Self, Option<Box<dyn GraphicsContext>>) {
        let PlatformBinding {
            adapter,
            target,
            clock,
            waiter,
            worker_context,
            connection,
        } = binding;
        let caps = adapter.capabilities();
        (
            Self {
                adapter,
                target,
                clock,
                waiter,
                connection,
                abort: AbortToken::new(),
                caps,
            },
            worker_context,
        )
    }

    pub(crate) fn now(&self) -> HostTime {
        self.clock.now()
    }

    pub(crate) fn timebase(&self) -> Timebase {
        self.clock.timebase()
    }

    /// Runs `f` on the adapter while holding the shared connection lock.
    pub(crate) fn with_adapter<R>(&mut self, f: impl FnOnce(&mut dyn SwapAdapter) -> R) -> R {
        let _guard = self.connection.as_ref().map(SharedConnection::lock);
        f(self.adapter.as_mut())
    }

    pub(crate) fn beam(&mut self) -> Option<u32> {
        if self.caps.beam_position {
            self.with_adapter(|a| a.beam_position())
        } else {
            None
        }
    }

    pub(crate) fn query_blanking(&mut self) -> Option<BlankingSample> {
        if !self.caps.blanking_query {
            return None;
        }
        self.with_adapter(|a| a.query_blanking()).ok()
    }

    /// Busy-polls the beam until `done` accepts a scanline.
    pub(crate) fn poll_beam(&mut self, done: impl FnMut(u32) -> bool, limit: u32) -> PollOutcome {
        if !self.caps.beam_position {
            return PollOutcome::Unavailable;
        }
        let Self {
            adapter,
            clock,
            waiter,
            connection,
            abort,
            ..
        } = self;
        poll_beam_until(
            || {
                let _guard = connection.as_ref().map(SharedConnection::lock);
                adapter.beam_position()
            },
            done,
            limit,
            || waiter.spin(clock.as_ref()),
            abort,
        )
    }

    pub(crate) fn swap_kind(&self) -> SwapKind {
        self.adapter.last_swap_kind()
    }

    pub(crate) fn wait_until(&mut self, deadline: HostTime) -> Result<(), FlipError> {
        self.waiter
            .wait_until(self.clock.as_ref(), deadline, &self.abort)
    }

    pub(crate) fn pause(&mut self, secs: f64) {
        self.waiter.pause(self.clock.as_ref(), secs);
    }

    pub(crate) fn spin(&mut self) {
        self.waiter.spin(self.clock.as_ref());
    }

    /// Swaps at the next blank and blocks until the swap completed.
    ///
    /// Prefers the scheduled path and its completion timestamp; otherwise
    /// issues an unscheduled swap and stalls on a synchronization token.
    /// Returns the completion time and, on the scheduled path, the blanking
    /// count.
    pub(crate) fn swap_and_wait(&mut self) -> Result<(HostTime, Option<u64>), FlipError> {
        if self.caps.scheduled_swap {
            match self.with_adapter(|a| a.schedule_swap(ScheduleTarget::NextVblank, None)) {
                Ok(id) => {
                    return match self.with_adapter(|a| a.wait_for_swap_completion(id)) {
                        Ok(done) => Ok((done.timestamp, Some(done.vblank_count))),
                        Err(AdapterError::Unsupported) => {
                            self.target.finish_with_sync_token()?;
                            Ok((self.now(), None))
                        }
                        Err(err) => Err(err.into()),
                    };
                }
                Err(AdapterError::Unsupported) => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.with_adapter(|a| a.flip_buffers())?;
        self.target.finish_with_sync_token()?;
        Ok((self.now(), None))
    }
}

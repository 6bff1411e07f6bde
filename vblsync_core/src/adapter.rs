// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Platform contract for swap scheduling and drawing targets.
//!
//! vblsync splits platform-specific work into *adapter* implementations
//! selected once, when a surface is opened. Each platform provides:
//!
//! - **[`SwapAdapter`]**: swap scheduling, completion waits, blanking-counter
//!   and beam-position queries, and the unscheduled [`flip_buffers`] that
//!   every platform must support.
//!
//! - **[`DrawingTarget`]**: render-target binding, flushing and the
//!   synchronization-token stall used when the platform cannot report swap
//!   completion itself.
//!
//! - **[`GraphicsContext`]**: a context that a background worker binds on
//!   its own thread.
//!
//! - **[`Clock`]** and **[`WaitStrategy`]**: the time source and the way
//!   the engine sleeps or spins until a deadline.
//!
//! Capabilities a platform lacks are reported as
//! [`AdapterError::Unsupported`]; the engine then falls back silently to the
//! next strategy. [`PlatformBinding`] bundles one implementation of each.
//!
//! [`flip_buffers`]: SwapAdapter::flip_buffers

use core::fmt;
use std::sync::Arc;

use crate::context::SharedConnection;
use crate::error::AdapterError;
use crate::time::HostTime;
use crate::timing::{ClearMode, Eye, Periodicity};
use crate::wait::{Clock, WaitStrategy};

/// Identifies a swap queued through [`SwapAdapter::schedule_swap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SwapId(pub u64);

/// Where a scheduled swap should land.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScheduleTarget {
    /// The next vertical blank.
    NextVblank,
    /// The first vertical blank after the given time.
    Time(HostTime),
    /// The vertical blank with the given counter value.
    Count(u64),
}

/// Completion report of a scheduled swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapCompletion {
    /// When the swap took effect.
    pub timestamp: HostTime,
    /// Blanking count at which it took effect.
    pub vblank_count: u64,
}

/// Most recent blanking interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlankingSample {
    /// Blanking counter.
    pub count: u64,
    /// Time of the interrupt.
    pub timestamp: HostTime,
}

/// How the last swap was carried out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SwapKind {
    /// Scanout switched buffers without copying.
    Pageflip,
    /// Pixels were copied into the front buffer.
    Copy,
    /// The platform cannot tell.
    #[default]
    Unknown,
}

/// Buffer configuration of a drawing target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Single front buffer.
    Single,
    /// Front and back buffer.
    Double,
    /// Front and back buffers for each eye.
    Stereo,
}

/// Capabilities a [`SwapAdapter`] advertises at bind time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AdapterCaps {
    /// Swaps can be queued for a target blank.
    pub scheduled_swap: bool,
    /// Completion of scheduled swaps can be awaited with a timestamp.
    pub completion_wait: bool,
    /// The blanking counter and interrupt timestamp can be queried.
    pub blanking_query: bool,
    /// The beam position can be queried.
    pub beam_position: bool,
}

/// Swap-scheduling primitives of one platform.
///
/// Every method except [`flip_buffers`](Self::flip_buffers) may return
/// [`AdapterError::Unsupported`].
pub trait SwapAdapter: Send {
    /// Reports which optional capabilities exist.
    fn capabilities(&self) -> AdapterCaps;

    /// Queues a swap for the given blank, optionally restricted to blanking
    /// counts admitted by `constraint`.
    fn schedule_swap(
        &mut self,
        target: ScheduleTarget,
        constraint: Option<Periodicity>,
    ) -> Result<SwapId, AdapterError>;

    /// Blocks until the given swap took effect.
    fn wait_for_swap_completion(&mut self, id: SwapId) -> Result<SwapCompletion, AdapterError>;

    /// Returns the most recent blanking count and interrupt timestamp.
    fn query_blanking(&mut self) -> Result<BlankingSample, AdapterError>;

    /// Returns the scanline currently being output, if the platform can
    /// tell.
    fn beam_position(&mut self) -> Option<u32>;

    /// Issues an unscheduled swap at the next blank (or immediately when
    /// blanking sync is off).
    fn flip_buffers(&mut self) -> Result<(), AdapterError>;

    /// Enables or disables synchronization of swaps to the blank.
    fn set_sync_to_blanking(&mut self, enabled: bool) -> Result<(), AdapterError>;

    /// Number of visible scanlines, which is where blanking starts.
    fn visible_lines(&self) -> Option<u32> {
        None
    }

    /// How the most recent swap was carried out.
    fn last_swap_kind(&self) -> SwapKind {
        SwapKind::Unknown
    }

    /// Nominal refresh interval in seconds, if the platform reports one.
    fn nominal_interval_secs(&self) -> Option<f64> {
        None
    }
}

/// Render-target operations the engine needs around a swap.
pub trait DrawingTarget: Send {
    /// Unbinds the surface as the current render target.
    fn detach(&mut self);

    /// Binds the surface as the current render target again.
    fn reattach(&mut self);

    /// Submits pending rendering work without waiting for it.
    fn flush(&mut self);

    /// Buffer configuration of the surface.
    fn buffer_kind(&self) -> BufferKind;

    /// Directs subsequent drawing to one eye's back buffer.
    fn select_stereo_buffer(&mut self, eye: Eye) {
        _ = eye;
    }

    /// Draws a minimal token into the back buffer and blocks until it was
    /// rendered, which stalls until the pending swap completed.
    fn finish_with_sync_token(&mut self) -> Result<(), AdapterError>;

    /// Saves whatever the clear mode needs before the swap.
    fn prepare_clear(&mut self, mode: ClearMode) {
        _ = mode;
    }

    /// Applies the clear mode to the new back buffer after the swap.
    fn apply_clear(&mut self, mode: ClearMode) {
        _ = mode;
    }

    /// Copies the pre-rendered image for `eye` into the presentation
    /// surface.
    fn present_eye(&mut self, eye: Eye) -> Result<(), AdapterError> {
        _ = eye;
        Err(AdapterError::Unsupported)
    }
}

/// A graphics context bound by a background worker.
pub trait GraphicsContext: Send {
    /// Binds the context to the calling thread.
    fn make_current(&mut self) -> Result<(), AdapterError>;

    /// Unbinds the context from the calling thread.
    fn release(&mut self) -> Result<(), AdapterError>;
}

/// One platform's implementation of every collaborator the engine uses.
pub struct PlatformBinding {
    /// Swap scheduling primitives.
    pub adapter: Box<dyn SwapAdapter>,
    /// Render-target operations.
    pub target: Box<dyn DrawingTarget>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Sleep/spin strategy.
    pub waiter: Box<dyn WaitStrategy>,
    /// Context for a background worker, if the platform needs one.
    pub worker_context: Option<Box<dyn GraphicsContext>>,
    /// Display connection shared with other surfaces, if any.
    pub connection: Option<SharedConnection>,
}

impl fmt::Debug for PlatformBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformBinding")
            .field("caps", &self.adapter.capabilities())
            .field("timebase", &self.clock.timebase())
            .field("worker_context", &self.worker_context.is_some())
            .field("connection", &self.connection.is_some())
            .finish_non_exhaustive()
    }
}

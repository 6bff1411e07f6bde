// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Who pumps the Wayland queue that delivers presentation feedback.
//!
//! - [`OwnedQueueMode`]: vblsync creates and owns an
//!   `EventQueue<WaylandState>`; the host only has to call its dispatch
//!   methods from some thread.
//! - [`EmbeddedStateMode`]: the host keeps its own `EventQueue<HostState>`
//!   and forwards the presentation objects to [`WaylandState`].
//!
//! # Wiring
//!
//! ```text
//! Owned queue mode
//! ----------------
//! backend owns:
//!   EventQueue<WaylandState> + WaylandState
//!     -> QueueHandle<WaylandState>
//! wp_presentation is bound and feedback is requested with
//! QueueHandle<WaylandState>
//! some thread pumps OwnedQueueMode::blocking_dispatch() in a loop
//!
//! Embedded-state mode
//! -------------------
//! host owns:
//!   EventQueue<HostState> + HostState { wayland: WaylandState, ... }
//!     -> QueueHandle<HostState>
//! HostState: AsMut<WaylandState>, plus
//!   delegate_dispatch!(HostState: [WpPresentation: ()] => WaylandState);
//!   delegate_dispatch!(HostState: [WpPresentationFeedback: SubmissionId] => WaylandState);
//! host dispatches via its own EventQueue
//! ```
//!
//! In both modes the swap adapter never touches the queue: feedback reaches
//! it through the [`FeedbackChannel`] stored in [`WaylandState`], so flips
//! may run on a worker thread while the host keeps dispatching.
//!
//! Single-surface contract: one [`WaylandState`] feeds one adapter.
//!
//! Using the wrong queue handle causes silent non-delivery of events; the
//! adapter then reports a feedback timeout.

use tracing::trace;
use wayland_client::{
    Connection, Dispatch, DispatchError, EventQueue, QueueHandle, WEnum,
    backend::{ReadEventsGuard, WaylandError},
};
use wayland_protocols::wp::presentation_time::client::{
    wp_presentation::{self, WpPresentation},
    wp_presentation_feedback::{self, WpPresentationFeedback},
};

use crate::feedback::{FeedbackChannel, PresentFeedback, PresentedFrame, SubmissionId};
use crate::time::{ClockSource, protocol_time_to_host};

/// Dispatch target for `wp_presentation` and its feedback objects.
///
/// Embedded hosts keep one inside their own state and expose it through
/// `AsMut<WaylandState>`.
#[derive(Debug, Default)]
pub struct WaylandState {
    feedback: FeedbackChannel,
}

impl WaylandState {
    /// Creates a state that publishes into `feedback`.
    #[must_use]
    pub fn new(feedback: FeedbackChannel) -> Self {
        Self { feedback }
    }

    /// The channel feedback is published into.
    #[must_use]
    pub fn feedback(&self) -> &FeedbackChannel {
        &self.feedback
    }

    fn on_presented(&self, id: SubmissionId, frame: PresentedFrame) {
        trace!(%id, msc = frame.msc, flags = frame.flags, "presented");
        self.feedback.push(PresentFeedback::Presented { id, frame });
    }

    fn on_discarded(&self, id: SubmissionId) {
        trace!(%id, "discarded");
        self.feedback.push(PresentFeedback::Discarded { id });
    }
}

impl AsMut<Self> for WaylandState {
    fn as_mut(&mut self) -> &mut Self {
        self
    }
}

/// Assembles a frame from the split 32-bit fields of a `presented` event.
fn presented_frame(
    tv_sec_hi: u32,
    tv_sec_lo: u32,
    tv_nsec: u32,
    refresh: u32,
    seq_hi: u32,
    seq_lo: u32,
    flags: u32,
) -> PresentedFrame {
    let seconds = (u64::from(tv_sec_hi) << 32) | u64::from(tv_sec_lo);
    PresentedFrame {
        timestamp: protocol_time_to_host(seconds, u64::from(tv_nsec.min(999_999_999))),
        refresh_ns: refresh,
        msc: (u64::from(seq_hi) << 32) | u64::from(seq_lo),
        flags,
    }
}

impl<D: AsMut<WaylandState> + Dispatch<WpPresentation, ()>> Dispatch<WpPresentation, (), D>
    for WaylandState
{
    fn event(
        state: &mut D,
        _proxy: &WpPresentation,
        event: wp_presentation::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<D>,
    ) {
        if let wp_presentation::Event::ClockId { clk_id } = event {
            state.as_mut().feedback.set_clock(ClockSource::from_raw(clk_id));
        }
    }
}

impl<D: AsMut<WaylandState> + Dispatch<WpPresentationFeedback, SubmissionId>>
    Dispatch<WpPresentationFeedback, SubmissionId, D> for WaylandState
{
    fn event(
        state: &mut D,
        _proxy: &WpPresentationFeedback,
        event: wp_presentation_feedback::Event,
        id: &SubmissionId,
        _conn: &Connection,
        _qh: &QueueHandle<D>,
    ) {
        let state = state.as_mut();
        match event {
            wp_presentation_feedback::Event::Presented {
                tv_sec_hi,
                tv_sec_lo,
                tv_nsec,
                refresh,
                seq_hi,
                seq_lo,
                flags,
            } => {
                let flags = match flags {
                    WEnum::Value(kind) => kind.bits(),
                    WEnum::Unknown(raw) => raw,
                };
                state.on_presented(
                    *id,
                    presented_frame(tv_sec_hi, tv_sec_lo, tv_nsec, refresh, seq_hi, seq_lo, flags),
                );
            }
            wp_presentation_feedback::Event::Discarded => state.on_discarded(*id),
            _ => {}
        }
    }
}

/// A feedback queue owned by vblsync.
///
/// Something still has to dispatch it; a dedicated thread looping on
/// [`blocking_dispatch`](Self::blocking_dispatch) is the simplest option.
#[derive(Debug)]
pub struct OwnedQueueMode {
    event_queue: EventQueue<WaylandState>,
    state: WaylandState,
}

impl OwnedQueueMode {
    /// Opens a new queue on `connection` whose handlers publish into
    /// `feedback`.
    #[must_use]
    pub fn new(connection: &Connection, feedback: FeedbackChannel) -> Self {
        Self {
            event_queue: connection.new_event_queue(),
            state: WaylandState::new(feedback),
        }
    }

    /// Handle to bind `wp_presentation` with; feedback requested through
    /// any other queue never reaches the channel.
    #[must_use]
    pub fn queue_handle(&self) -> QueueHandle<WaylandState> {
        self.event_queue.handle()
    }

    /// Runs handlers for events already read into the queue, without
    /// touching the socket.
    pub fn dispatch_pending(&mut self) -> Result<usize, DispatchError> {
        self.event_queue.dispatch_pending(&mut self.state)
    }

    /// Flushes, waits for events if none are queued, then dispatches.
    pub fn blocking_dispatch(&mut self) -> Result<usize, DispatchError> {
        self.event_queue.blocking_dispatch(&mut self.state)
    }

    /// Writes buffered requests to the socket.
    pub fn flush(&self) -> Result<(), WaylandError> {
        self.event_queue.flush()
    }

    /// Begins a socket read for hosts that poll the connection fd.
    ///
    /// [`None`] means events are still queued; dispatch them first.
    #[must_use]
    pub fn prepare_read(&self) -> Option<ReadEventsGuard> {
        self.event_queue.prepare_read()
    }

    /// State the handlers publish through.
    #[must_use]
    pub fn state(&self) -> &WaylandState {
        &self.state
    }
}

/// Feedback delivered through a queue the host owns.
///
/// Only the queue handle is kept here; the host dispatches and forwards
/// events with `delegate_dispatch!`.
#[derive(Debug, Clone)]
pub struct EmbeddedStateMode<HostState> {
    queue_handle: QueueHandle<HostState>,
}

impl<HostState> EmbeddedStateMode<HostState> {
    /// Wraps the host's queue handle.
    #[must_use]
    pub fn new(queue_handle: QueueHandle<HostState>) -> Self {
        Self { queue_handle }
    }

    /// Handle to bind `wp_presentation` with.
    #[must_use]
    pub fn queue_handle(&self) -> QueueHandle<HostState> {
        self.queue_handle.clone()
    }
}

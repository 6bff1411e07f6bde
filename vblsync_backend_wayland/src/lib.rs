// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Wayland backend for vblsync.
//!
//! - [`PresentationAdapter`] / [`PresentationTarget`]: engine collaborators
//!   built on `wp_presentation` feedback, bundled by
//!   [`presentation_binding`].
//! - [`OwnedQueueMode`] / [`EmbeddedStateMode`]: who owns the event queue
//!   that delivers the feedback.
//! - [`PosixClock`]: reads the POSIX clock the compositor timestamps with.

mod adapter;
mod event_loop;
mod feedback;
mod queue;
mod time;

pub use adapter::{
    DEFAULT_FEEDBACK_TIMEOUT, PresentationAdapter, PresentationTarget, SurfaceCommit,
    WaylandCommit, presentation_binding,
};
pub use event_loop::{EmbeddedStateMode, OwnedQueueMode, WaylandState};
pub use feedback::{FeedbackChannel, PresentFeedback, PresentedFrame, SubmissionId};
pub use time::{ClockSource, PosixClock, now, timebase};

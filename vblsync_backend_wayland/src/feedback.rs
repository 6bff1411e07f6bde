// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Presentation feedback contracts and the channel that carries them.
//!
//! The Wayland dispatch loop pushes one [`PresentFeedback`] per committed
//! submission into a [`FeedbackChannel`]; the swap adapter, usually on
//! another thread, blocks on the same channel until the feedback for its
//! own submission arrives.

use core::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use vblsync_core::error::AdapterError;
use vblsync_core::time::HostTime;

use crate::queue::BoundedQueue;
use crate::time::ClockSource;

/// Unique identity for one `wl_surface.commit` submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmissionId(pub u64);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A frame the compositor reported as presented.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PresentedFrame {
    /// Time the frame turned into light, in presentation-clock ticks.
    pub timestamp: HostTime,
    /// Nominal refresh interval in nanoseconds; 0 if unknown.
    pub refresh_ns: u32,
    /// Media stream counter of the output (vertical retrace count).
    pub msc: u64,
    /// Raw `wp_presentation_feedback.kind` flags.
    pub flags: u32,
}

impl PresentedFrame {
    /// Presentation was synchronized to the vertical retrace.
    pub const VSYNC: u32 = 0x1;
    /// The timestamp comes from a hardware clock.
    pub const HW_CLOCK: u32 = 0x2;
    /// Completion was signalled by hardware.
    pub const HW_COMPLETION: u32 = 0x4;
    /// The client buffer was scanned out directly.
    pub const ZERO_COPY: u32 = 0x8;

    /// Whether all bits of `flag` are set.
    #[must_use]
    pub const fn has(&self, flag: u32) -> bool {
        self.flags & flag == flag
    }
}

/// Per-commit presentation feedback event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PresentFeedback {
    /// The submission was presented.
    Presented {
        /// Identity of the commit this event corresponds to.
        id: SubmissionId,
        /// What the compositor reported.
        frame: PresentedFrame,
    },
    /// The compositor discarded the submission.
    Discarded {
        /// Identity of the commit this event corresponds to.
        id: SubmissionId,
    },
}

impl PresentFeedback {
    /// The submission this event belongs to.
    #[must_use]
    pub const fn id(&self) -> SubmissionId {
        match self {
            Self::Presented { id, .. } | Self::Discarded { id } => *id,
        }
    }
}

#[derive(Debug)]
struct FeedbackState {
    unclaimed: BoundedQueue<PresentFeedback>,
    latest: Option<PresentedFrame>,
    clock: ClockSource,
    presented: u64,
    discarded: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<FeedbackState>,
    arrived: Condvar,
}

/// Cloneable handle connecting the dispatch loop to the swap adapter.
///
/// Clones share the same state.
#[derive(Clone, Debug)]
pub struct FeedbackChannel {
    shared: Arc<Shared>,
}

impl FeedbackChannel {
    /// Default number of unclaimed events kept before the oldest is evicted.
    pub const DEFAULT_CAPACITY: usize = 64;

    /// Creates a channel keeping up to `capacity` unclaimed events.
    ///
    /// `capacity == 0` is promoted to `1`.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(FeedbackState {
                    unclaimed: BoundedQueue::with_capacity(capacity),
                    latest: None,
                    clock: ClockSource::default(),
                    presented: 0,
                    discarded: 0,
                }),
                arrived: Condvar::new(),
            }),
        }
    }

    /// Records one feedback event and wakes waiters.
    pub fn push(&self, event: PresentFeedback) {
        let mut state = self.shared.state.lock();
        match event {
            PresentFeedback::Presented { frame, .. } => {
                state.presented += 1;
                state.latest = Some(frame);
            }
            PresentFeedback::Discarded { .. } => state.discarded += 1,
        }
        state.unclaimed.push(event);
        drop(state);
        self.shared.arrived.notify_all();
    }

    /// Blocks until feedback for `id` arrives, for at most `timeout`.
    pub fn wait_for(
        &self,
        id: SubmissionId,
        timeout: Duration,
    ) -> Result<PresentFeedback, AdapterError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(event) = state.unclaimed.take_where(|e| e.id() == id) {
                return Ok(event);
            }
            if self
                .shared
                .arrived
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state
                    .unclaimed
                    .take_where(|e| e.id() == id)
                    .ok_or_else(|| {
                        AdapterError::Failed(format!(
                            "no presentation feedback for submission {id} within {timeout:?}"
                        ))
                    });
            }
        }
    }

    /// Most recent presented frame on any submission.
    #[must_use]
    pub fn latest_presented(&self) -> Option<PresentedFrame> {
        self.shared.state.lock().latest
    }

    /// Records the clock announced by `wp_presentation`.
    pub fn set_clock(&self, clock: ClockSource) {
        self.shared.state.lock().clock = clock;
    }

    /// Clock the compositor's timestamps use.
    #[must_use]
    pub fn clock(&self) -> ClockSource {
        self.shared.state.lock().clock
    }

    /// Totals of presented and discarded submissions.
    #[must_use]
    pub fn counts(&self) -> (u64, u64) {
        let state = self.shared.state.lock();
        (state.presented, state.discarded)
    }

    /// Number of events evicted before anyone claimed them.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.shared.state.lock().unclaimed.evicted()
    }
}

impl Default for FeedbackChannel {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn presented(id: u64, msc: u64) -> PresentFeedback {
        PresentFeedback::Presented {
            id: SubmissionId(id),
            frame: PresentedFrame {
                timestamp: HostTime(1_000_000 * msc),
                refresh_ns: 16_666_667,
                msc,
                flags: PresentedFrame::VSYNC | PresentedFrame::ZERO_COPY,
            },
        }
    }

    #[test]
    fn waiter_is_woken_by_another_thread() {
        let channel = FeedbackChannel::default();
        let producer = channel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            producer.push(presented(2, 10));
        });
        let event = channel
            .wait_for(SubmissionId(2), Duration::from_secs(5))
            .expect("feedback arrives");
        handle.join().expect("producer");
        assert_eq!(event, presented(2, 10), "the submission's own feedback");
        assert_eq!(channel.counts(), (1, 0), "one presented");
    }

    #[test]
    fn feedback_for_other_submissions_is_left_alone() {
        let channel = FeedbackChannel::default();
        channel.push(PresentFeedback::Discarded { id: SubmissionId(1) });
        channel.push(presented(2, 11));

        let second = channel
            .wait_for(SubmissionId(2), Duration::ZERO)
            .expect("already queued");
        assert_eq!(second.id(), SubmissionId(2), "matched by id");
        let first = channel
            .wait_for(SubmissionId(1), Duration::ZERO)
            .expect("still queued");
        assert!(
            matches!(first, PresentFeedback::Discarded { .. }),
            "discard kept for its owner"
        );
        assert_eq!(
            channel.latest_presented().map(|f| f.msc),
            Some(11),
            "latest presented frame tracked"
        );
    }

    #[test]
    fn missing_feedback_times_out() {
        let channel = FeedbackChannel::default();
        let err = channel
            .wait_for(SubmissionId(7), Duration::from_millis(2))
            .expect_err("nothing was pushed");
        assert!(matches!(err, AdapterError::Failed(_)), "timeout is a failure");
    }

    #[test]
    fn unclaimed_overflow_evicts_oldest() {
        let channel = FeedbackChannel::with_capacity(2);
        for id in 1..=3 {
            channel.push(presented(id, id));
        }
        assert_eq!(channel.evicted(), 1, "one evicted");
        assert!(
            channel.wait_for(SubmissionId(1), Duration::ZERO).is_err(),
            "evicted feedback is gone"
        );
    }

    #[test]
    fn flags_are_tested_bitwise() {
        let PresentFeedback::Presented { frame, .. } = presented(1, 1) else {
            panic!("constructed as presented");
        };
        assert!(frame.has(PresentedFrame::ZERO_COPY), "zero-copy set");
        assert!(!frame.has(PresentedFrame::HW_CLOCK), "hw clock unset");
    }
}

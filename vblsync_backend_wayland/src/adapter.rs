// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Swap adapter and drawing target backed by `wp_presentation` feedback.
//!
//! Wayland clients cannot queue a swap for a chosen retrace, query the beam
//! or read a blanking counter directly. What they get instead is, for every
//! commit, the time the frame turned into light and the output's media
//! stream counter (MSC). This module maps that onto the engine contract:
//!
//! | Engine operation | Wayland rendition |
//! |---|---|
//! | `flip_buffers` | request feedback, commit the surface |
//! | `finish_with_sync_token` | block until that commit's feedback arrives |
//! | `query_blanking` | MSC and timestamp of the latest vsynced presentation |
//! | `schedule_swap`, `beam_position` | unsupported; the engine falls back |
//!
//! Buffer attachment and rendering stay with the host; [`SurfaceCommit`] is
//! the seam where the adapter asks it to commit.

use core::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};
use vblsync_core::adapter::{
    AdapterCaps, BlankingSample, BufferKind, DrawingTarget, PlatformBinding, ScheduleTarget,
    SwapAdapter, SwapCompletion, SwapId, SwapKind,
};
use vblsync_core::error::AdapterError;
use vblsync_core::timing::Periodicity;
use vblsync_core::wait::SleepWait;
use wayland_client::protocol::wl_surface::WlSurface;
use wayland_client::{Connection, Dispatch, QueueHandle};
use wayland_protocols::wp::presentation_time::client::{
    wp_presentation::WpPresentation, wp_presentation_feedback::WpPresentationFeedback,
};

use crate::feedback::{FeedbackChannel, PresentFeedback, PresentedFrame, SubmissionId};
use crate::time::PosixClock;

/// Longest wait for the feedback of one commit before the flip fails.
pub const DEFAULT_FEEDBACK_TIMEOUT: Duration = Duration::from_millis(250);

/// Commits the host's surface with presentation feedback attached.
pub trait SurfaceCommit: Send {
    /// Requests feedback tagged `id`, commits the surface and flushes the
    /// connection.
    fn commit(&mut self, id: SubmissionId) -> Result<(), AdapterError>;
}

/// [`SurfaceCommit`] for a plain `wl_surface`.
///
/// `qh` must be the queue handle of the integration mode in use (see
/// [`OwnedQueueMode`](crate::OwnedQueueMode)).
pub struct WaylandCommit<D> {
    surface: WlSurface,
    presentation: WpPresentation,
    qh: QueueHandle<D>,
    connection: Connection,
}

impl<D> fmt::Debug for WaylandCommit<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaylandCommit")
            .field("surface", &self.surface)
            .finish_non_exhaustive()
    }
}

impl<D> WaylandCommit<D> {
    /// Wraps a surface and the bound `wp_presentation` global.
    #[must_use]
    pub fn new(
        surface: WlSurface,
        presentation: WpPresentation,
        qh: QueueHandle<D>,
        connection: Connection,
    ) -> Self {
        Self {
            surface,
            presentation,
            qh,
            connection,
        }
    }
}

impl<D> SurfaceCommit for WaylandCommit<D>
where
    D: Dispatch<WpPresentationFeedback, SubmissionId> + Send + 'static,
{
    fn commit(&mut self, id: SubmissionId) -> Result<(), AdapterError> {
        let _feedback = self.presentation.feedback(&self.surface, &self.qh, id);
        self.surface.commit();
        self.connection
            .flush()
            .map_err(|err| AdapterError::Failed(format!("wayland flush failed: {err}")))
    }
}

/// Submission bookkeeping shared by the adapter and the drawing target.
#[derive(Debug, Default)]
struct Submissions {
    next: u64,
    pending: Option<SubmissionId>,
    last: Option<PresentedFrame>,
}

/// [`SwapAdapter`] over presentation feedback.
pub struct PresentationAdapter<C> {
    commit: C,
    feedback: FeedbackChannel,
    submissions: Arc<Mutex<Submissions>>,
}

impl<C> fmt::Debug for PresentationAdapter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresentationAdapter")
            .field("feedback", &self.feedback)
            .finish_non_exhaustive()
    }
}

impl<C: SurfaceCommit> PresentationAdapter<C> {
    /// Creates an adapter and the drawing target that waits for its
    /// feedback.
    #[must_use]
    pub fn new(
        commit: C,
        feedback: FeedbackChannel,
        timeout: Duration,
    ) -> (Self, PresentationTarget) {
        let submissions = Arc::new(Mutex::new(Submissions::default()));
        let target = PresentationTarget {
            feedback: feedback.clone(),
            submissions: Arc::clone(&submissions),
            timeout,
        };
        (
            Self {
                commit,
                feedback,
                submissions,
            },
            target,
        )
    }

    fn latest(&self) -> Option<PresentedFrame> {
        self.submissions
            .lock()
            .last
            .or_else(|| self.feedback.latest_presented())
    }
}

impl<C: SurfaceCommit> SwapAdapter for PresentationAdapter<C> {
    fn capabilities(&self) -> AdapterCaps {
        AdapterCaps {
            scheduled_swap: false,
            completion_wait: false,
            blanking_query: true,
            beam_position: false,
        }
    }

    fn schedule_swap(
        &mut self,
        _target: ScheduleTarget,
        _constraint: Option<Periodicity>,
    ) -> Result<SwapId, AdapterError> {
        Err(AdapterError::Unsupported)
    }

    fn wait_for_swap_completion(&mut self, _id: SwapId) -> Result<SwapCompletion, AdapterError> {
        Err(AdapterError::Unsupported)
    }

    fn query_blanking(&mut self) -> Result<BlankingSample, AdapterError> {
        match self.latest() {
            Some(frame) if frame.has(PresentedFrame::VSYNC) => Ok(BlankingSample {
                count: frame.msc,
                timestamp: frame.timestamp,
            }),
            _ => Err(AdapterError::Unsupported),
        }
    }

    fn beam_position(&mut self) -> Option<u32> {
        None
    }

    fn flip_buffers(&mut self) -> Result<(), AdapterError> {
        let id = {
            let mut subs = self.submissions.lock();
            if let Some(stale) = subs.pending {
                warn!(%stale, "previous commit was never awaited");
            }
            subs.next += 1;
            SubmissionId(subs.next)
        };
        self.commit.commit(id)?;
        self.submissions.lock().pending = Some(id);
        Ok(())
    }

    fn set_sync_to_blanking(&mut self, enabled: bool) -> Result<(), AdapterError> {
        if enabled {
            Ok(())
        } else {
            debug!("compositor presentation is always retrace-synchronized");
            Err(AdapterError::Unsupported)
        }
    }

    fn last_swap_kind(&self) -> SwapKind {
        match self.submissions.lock().last {
            Some(frame) if frame.has(PresentedFrame::ZERO_COPY) => SwapKind::Pageflip,
            Some(_) => SwapKind::Copy,
            None => SwapKind::Unknown,
        }
    }

    fn nominal_interval_secs(&self) -> Option<f64> {
        self.latest()
            .filter(|frame| frame.refresh_ns > 0)
            .map(|frame| f64::from(frame.refresh_ns) / 1e9)
    }
}

/// [`DrawingTarget`] whose synchronization token is the presentation
/// feedback of the last commit.
///
/// Binding and flushing are the host renderer's business, so those are
/// no-ops here.
#[derive(Debug)]
pub struct PresentationTarget {
    feedback: FeedbackChannel,
    submissions: Arc<Mutex<Submissions>>,
    timeout: Duration,
}

impl DrawingTarget for PresentationTarget {
    fn detach(&mut self) {}

    fn reattach(&mut self) {}

    fn flush(&mut self) {}

    fn buffer_kind(&self) -> BufferKind {
        BufferKind::Double
    }

    fn finish_with_sync_token(&mut self) -> Result<(), AdapterError> {
        let Some(id) = self.submissions.lock().pending.take() else {
            return Ok(());
        };
        match self.feedback.wait_for(id, self.timeout)? {
            PresentFeedback::Presented { frame, .. } => {
                self.submissions.lock().last = Some(frame);
                Ok(())
            }
            PresentFeedback::Discarded { .. } => Err(AdapterError::Failed(format!(
                "compositor discarded submission {id}"
            ))),
        }
    }
}

/// Bundles a presentation-feedback adapter into a [`PlatformBinding`].
///
/// The clock reads whichever POSIX clock `wp_presentation` announced on
/// `feedback`, so bind the global and roundtrip before calling this.
#[must_use]
pub fn presentation_binding<C: SurfaceCommit + 'static>(
    commit: C,
    feedback: FeedbackChannel,
    timeout: Duration,
) -> PlatformBinding {
    let clock = PosixClock::new(feedback.clock());
    let (adapter, target) = PresentationAdapter::new(commit, feedback, timeout);
    PlatformBinding {
        adapter: Box::new(adapter),
        target: Box::new(target),
        clock: Arc::new(clock),
        waiter: Box::new(SleepWait::new()),
        worker_context: None,
        connection: None,
    }
}

// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! One-shot callbacks run with the result of the next completed flip.

use core::fmt;

use crate::timing::FlipResult;

type Callback = Box<dyn FnOnce(&FlipResult) + Send>;

/// Pending per-surface flip callbacks.
///
/// Callbacks run in the order they were scheduled, on the thread that
/// retrieves the flip result, and each runs exactly once.
#[derive(Default)]
pub struct FlipCallbacks {
    pending: Vec<Callback>,
}

impl fmt::Debug for FlipCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlipCallbacks")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl FlipCallbacks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `f` to run after the next completed flip.
    pub fn schedule(&mut self, f: impl FnOnce(&FlipResult) + Send + 'static) {
        self.pending.push(Box::new(f));
    }

    /// Drops every pending callback without running it.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of pending callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Runs and removes every pending callback.
    pub fn run(&mut self, result: &FlipResult) {
        for f in core::mem::take(&mut self.pending) {
            f(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::time::HostTime;
    use crate::timing::{TimestampConfidence, TimestampSource};

    fn result(seq: u64) -> FlipResult {
        FlipResult {
            onset: HostTime(100),
            scanout_start: HostTime(110),
            raw_completion: HostTime(120),
            requested_at: HostTime(50),
            flip_end: HostTime(130),
            beam_position: None,
            deadline_miss_secs: -0.001,
            swap_sequence: seq,
            vblank_count: None,
            source: TimestampSource::RawCompletion,
            confidence: TimestampConfidence::Unverified,
            demoted: None,
            eye: None,
        }
    }

    #[test]
    fn callbacks_run_once_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut callbacks = FlipCallbacks::new();
        for tag in 0..3_u64 {
            let seen = Arc::clone(&seen);
            callbacks.schedule(move |r| seen.lock().push((tag, r.swap_sequence)));
        }
        callbacks.run(&result(7));
        callbacks.run(&result(8));
        assert_eq!(
            *seen.lock(),
            vec![(0, 7), (1, 7), (2, 7)],
            "each callback sees only the next flip"
        );
        assert!(callbacks.is_empty(), "registry drained");
    }

    #[test]
    fn cleared_callbacks_never_run() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut callbacks = FlipCallbacks::new();
        let h = Arc::clone(&hits);
        callbacks.schedule(move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(callbacks.len(), 1, "one pending");
        callbacks.clear();
        callbacks.run(&result(1));
        assert_eq!(hits.load(Ordering::Relaxed), 0, "cleared callback ran");
    }
}

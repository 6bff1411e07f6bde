// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Clocks, wait strategies and bounded beam-position polling.
//!
//! The engine never calls `std::thread::sleep` or reads `Instant` directly.
//! It asks a [`Clock`] for the time and a [`WaitStrategy`] to get there, so a
//! simulated display can drive it with a fake clock and tests stay
//! deterministic.
//!
//! Busy-waiting on the beam position goes through [`poll_beam_until`], which
//! is always bounded and always honours an [`AbortToken`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::error::FlipError;
use crate::time::{HostTime, Timebase};

/// Longest single [`SleepWait::pause`]; retry intervals are far shorter.
const MAX_PAUSE: std::time::Duration = std::time::Duration::from_secs(1);

/// A monotonic time source.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> HostTime;

    /// Tick-to-nanosecond conversion of [`now`](Self::now).
    fn timebase(&self) -> Timebase;
}

/// How the engine waits for a point in time.
pub trait WaitStrategy: Send {
    /// Blocks until `clock` reaches `deadline`.
    ///
    /// Returns [`FlipError::Aborted`] if `abort` is raised first.
    fn wait_until(
        &mut self,
        clock: &dyn Clock,
        deadline: HostTime,
        abort: &AbortToken,
    ) -> Result<(), FlipError>;

    /// Pauses for roughly `secs` seconds.
    fn pause(&mut self, clock: &dyn Clock, secs: f64);

    /// One iteration of a busy-poll loop.
    fn spin(&mut self, clock: &dyn Clock) {
        _ = clock;
        core::hint::spin_loop();
    }
}

/// Shared flag that interrupts waits and retry loops.
///
/// Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct AbortToken(Arc<AtomicBool>);

impl AbortToken {
    /// Creates a token that is not raised.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the token.
    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Lowers the token.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Whether the token is raised.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns [`FlipError::Aborted`] if the token is raised.
    pub fn check(&self) -> Result<(), FlipError> {
        if self.is_aborted() {
            Err(FlipError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Monotonic clock backed by [`Instant`], in nanoseconds since creation.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a clock whose zero is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "u64 nanoseconds cover centuries of uptime"
    )]
    fn now(&self) -> HostTime {
        HostTime(self.origin.elapsed().as_nanos() as u64)
    }

    fn timebase(&self) -> Timebase {
        Timebase::NANOS
    }
}

/// Sleeps until close to the deadline, then spins the rest.
///
/// Sleeping happens in slices of at most `slice` so an abort is noticed
/// promptly.
#[derive(Clone, Copy, Debug)]
pub struct SleepWait {
    /// Remaining time below which the wait spins instead of sleeping.
    pub spin_margin: std::time::Duration,
    /// Longest single sleep.
    pub slice: std::time::Duration,
}

impl SleepWait {
    /// A strategy that spins for the last 200 µs and sleeps at most 1 ms at a
    /// time.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            spin_margin: std::time::Duration::from_micros(200),
            slice: std::time::Duration::from_millis(1),
        }
    }
}

impl Default for SleepWait {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for SleepWait {
    fn wait_until(
        &mut self,
        clock: &dyn Clock,
        deadline: HostTime,
        abort: &AbortToken,
    ) -> Result<(), FlipError> {
        let tb = clock.timebase();
        loop {
            abort.check()?;
            let now = clock.now();
            if now >= deadline {
                return Ok(());
            }
            let remaining = std::time::Duration::from_nanos(now.nanos_until(deadline, tb));
            if remaining > self.spin_margin {
                std::thread::sleep((remaining - self.spin_margin).min(self.slice));
            } else {
                std::thread::yield_now();
            }
        }
    }

    fn pause(&mut self, clock: &dyn Clock, secs: f64) {
        _ = clock;
        if let Ok(pause) = std::time::Duration::try_from_secs_f64(secs) {
            std::thread::sleep(pause.min(MAX_PAUSE));
        }
    }

    fn spin(&mut self, clock: &dyn Clock) {
        _ = clock;
        std::thread::yield_now();
    }
}

/// Result of [`poll_beam_until`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate accepted this scanline.
    Reached(u32),
    /// The platform stopped reporting a beam position.
    Unavailable,
    /// The poll limit ran out first.
    Exhausted,
    /// The abort token was raised.
    Aborted,
}

/// Polls the beam position until `done` accepts it, at most `limit` times.
///
/// `between` runs after every rejected poll, typically a
/// [`WaitStrategy::spin`].
pub fn poll_beam_until(
    mut query: impl FnMut() -> Option<u32>,
    mut done: impl FnMut(u32) -> bool,
    limit: u32,
    mut between: impl FnMut(),
    abort: &AbortToken,
) -> PollOutcome {
    for _ in 0..limit {
        if abort.is_aborted() {
            return PollOutcome::Aborted;
        }
        match query() {
            None => return PollOutcome::Unavailable,
            Some(line) if done(line) => return PollOutcome::Reached(line),
            Some(_) => between(),
        }
    }
    PollOutcome::Exhausted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_token_is_shared_between_clones() {
        let token = AbortToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok(), "fresh token is lowered");
        clone.abort();
        assert_eq!(token.check(), Err(FlipError::Aborted), "clone raised it");
        token.reset();
        assert!(!clone.is_aborted(), "reset is visible to clones");
    }

    #[test]
    fn poll_stops_when_predicate_matches() {
        let mut line = 0_u32;
        let outcome = poll_beam_until(
            || {
                line += 10;
                Some(line)
            },
            |l| l >= 50,
            100,
            || {},
            &AbortToken::new(),
        );
        assert_eq!(outcome, PollOutcome::Reached(50));
    }

    #[test]
    fn pause_ignores_unrepresentable_durations() {
        let clock = MonotonicClock::new();
        let mut wait = SleepWait::new();
        let started = Instant::now();
        for secs in [f64::NAN, f64::INFINITY, -1.0, f64::MAX, 1e-4] {
            wait.pause(&clock, secs);
        }
        assert!(
            started.elapsed() < std::time::Duration::from_secs(3),
            "huge pauses are clamped"
        );
    }

    #[test]
    fn poll_is_bounded() {
        let mut polls = 0;
        let outcome = poll_beam_until(
            || {
                polls += 1;
                Some(3)
            },
            |_| false,
            25,
            || {},
            &AbortToken::new(),
        );
        assert_eq!(outcome, PollOutcome::Exhausted);
        assert_eq!(polls, 25, "exactly the limit");
    }

    #[test]
    fn poll_reports_missing_beam_and_abort() {
        let token = AbortToken::new();
        assert_eq!(
            poll_beam_until(|| None, |_| true, 5, || {}, &token),
            PollOutcome::Unavailable
        );
        token.abort();
        assert_eq!(
            poll_beam_until(|| Some(0), |_| true, 5, || {}, &token),
            PollOutcome::Aborted
        );
    }

    #[test]
    fn sleep_wait_reaches_deadline() {
        let clock = MonotonicClock::new();
        let deadline = clock.now().offset_secs(0.002, clock.timebase());
        let mut waiter = SleepWait::new();
        waiter
            .wait_until(&clock, deadline, &AbortToken::new())
            .expect("not aborted");
        assert!(clock.now() >= deadline, "woke after the deadline");
    }

    #[test]
    fn sleep_wait_honours_abort() {
        let clock = MonotonicClock::new();
        let token = AbortToken::new();
        token.abort();
        let far = clock.now().offset_secs(10.0, clock.timebase());
        assert_eq!(
            SleepWait::new().wait_until(&clock, far, &token),
            Err(FlipError::Aborted),
            "raised token returns immediately"
        );
    }
}

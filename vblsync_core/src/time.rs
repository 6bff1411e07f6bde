// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Host clock ticks and their conversion to seconds.
//!
//! Every timestamp the engine handles (swap targets, blanking samples,
//! onsets) is a [`HostTime`] on the platform's monotonic clock. Timing
//! policy is expressed in `f64` seconds; [`Timebase`] converts between the
//! two. Integer conversions go through `u128` so long uptimes on clocks
//! with large ratios cannot overflow.

use core::fmt;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// A point on the platform's monotonic clock, in native ticks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HostTime(pub u64);

impl HostTime {
    /// Raw tick value.
    #[inline]
    #[must_use]
    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// `self - other` in seconds; negative when `self` is earlier.
    #[must_use]
    pub fn signed_secs_since(self, other: Self, timebase: Timebase) -> f64 {
        match self.0.checked_sub(other.0) {
            Some(ahead) => timebase.ticks_to_secs(ahead),
            None => -timebase.ticks_to_secs(other.0 - self.0),
        }
    }

    /// Shifts this time by a signed number of seconds, saturating at the
    /// ends of the tick range.
    #[must_use]
    pub fn offset_secs(self, secs: f64, timebase: Timebase) -> Self {
        let delta = timebase.secs_to_ticks(secs.abs());
        if secs >= 0.0 {
            Self(self.0.saturating_add(delta))
        } else {
            Self(self.0.saturating_sub(delta))
        }
    }

    /// Nanoseconds from `self` until `deadline`, zero once it has passed.
    #[inline]
    #[must_use]
    pub const fn nanos_until(self, deadline: Self, timebase: Timebase) -> u64 {
        timebase.ticks_to_nanos(deadline.0.saturating_sub(self.0))
    }
}

impl fmt::Debug for HostTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostTime({})", self.0)
    }
}

/// Ratio converting clock ticks to nanoseconds: `ns = ticks * numer / denom`.
///
/// Each [`Clock`](crate::wait::Clock) reports the timebase of its ticks.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timebase {
    /// Nanoseconds per `denom` ticks.
    pub numer: u32,
    /// Ticks per `numer` nanoseconds.
    pub denom: u32,
}

impl Timebase {
    /// Ticks are nanoseconds.
    pub const NANOS: Self = Self { numer: 1, denom: 1 };

    /// Creates a timebase.
    ///
    /// # Panics
    ///
    /// Panics if `denom` is zero.
    #[must_use]
    pub const fn new(numer: u32, denom: u32) -> Self {
        assert!(denom != 0, "timebase denominator must not be zero");
        Self { numer, denom }
    }

    /// Converts ticks to whole nanoseconds, truncating.
    #[inline]
    #[must_use]
    #[expect(
        clippy::cast_possible_truncation,
        reason = "tick counts that overflow u64 nanoseconds are centuries away"
    )]
    pub const fn ticks_to_nanos(self, ticks: u64) -> u64 {
        (ticks as u128 * self.numer as u128 / self.denom as u128) as u64
    }

    /// Converts ticks to seconds.
    #[inline]
    #[must_use]
    pub fn ticks_to_secs(self, ticks: u64) -> f64 {
        ticks as f64 * f64::from(self.numer) / f64::from(self.denom) / NANOS_PER_SEC
    }

    /// Converts seconds to the nearest tick count.
    ///
    /// Negative and NaN inputs map to zero.
    #[must_use]
    #[expect(
        clippy::cast_possible_truncation,
        reason = "float to int casts saturate and timing values are small"
    )]
    pub fn secs_to_ticks(self, secs: f64) -> u64 {
        if secs.is_nan() || secs <= 0.0 {
            return 0;
        }
        (secs * NANOS_PER_SEC * f64::from(self.denom) / f64::from(self.numer)).round() as u64
    }
}

impl fmt::Debug for Timebase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timebase({}/{})", self.numer, self.denom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 24 MHz tick rate, as on Apple silicon.
    const TB_24MHZ: Timebase = Timebase::new(125, 3);

    #[test]
    fn conversions_follow_the_ratio() {
        assert_eq!(TB_24MHZ.ticks_to_nanos(24_000_000), 1_000_000_000, "24M ticks are 1 s");
        assert_eq!(TB_24MHZ.secs_to_ticks(0.5), 12_000_000, "half a second");
        assert!(
            (TB_24MHZ.ticks_to_secs(400_000) - 1.0 / 60.0).abs() < 1e-12,
            "one 60 Hz frame"
        );
    }

    #[test]
    fn invalid_seconds_clamp_to_zero() {
        assert_eq!(Timebase::NANOS.secs_to_ticks(-0.5), 0, "negative");
        assert_eq!(Timebase::NANOS.secs_to_ticks(f64::NAN), 0, "NaN");
    }

    #[test]
    fn signed_difference_has_sign() {
        let a = HostTime(1_000_000_000);
        let b = HostTime(1_016_000_000);
        let tb = Timebase::NANOS;
        assert!((b.signed_secs_since(a, tb) - 0.016).abs() < 1e-12, "later minus earlier");
        assert!((a.signed_secs_since(b, tb) + 0.016).abs() < 1e-12, "earlier minus later");
    }

    #[test]
    fn offsets_saturate() {
        let tb = Timebase::NANOS;
        assert_eq!(HostTime(500).offset_secs(-1.0, tb), HostTime(0), "clamped at zero");
        assert_eq!(HostTime(500).offset_secs(1e-6, tb), HostTime(1_500), "forward");
        assert_eq!(
            HostTime(u64::MAX - 1).offset_secs(1.0, tb),
            HostTime(u64::MAX),
            "clamped at the top"
        );
    }

    #[test]
    fn nanos_until_deadline() {
        let now = HostTime(24_000);
        assert_eq!(now.nanos_until(HostTime(48_000), TB_24MHZ), 1_000_000, "1 ms ahead");
        assert_eq!(now.nanos_until(HostTime(1), TB_24MHZ), 0, "deadline passed");
    }
}

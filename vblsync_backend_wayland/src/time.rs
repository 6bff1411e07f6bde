// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! POSIX host clock matching the compositor's presentation clock.
//!
//! `wp_presentation` announces which POSIX clock its feedback timestamps use.
//! Flip timestamps are only comparable with feedback if the engine reads the
//! same clock, so [`PosixClock`] is built from that announcement.

use rustix::time::{ClockId as PosixClockId, Timespec, clock_gettime};
use tracing::warn;
use vblsync_core::time::{HostTime, Timebase};
use vblsync_core::wait::Clock;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Clock source used for backend timestamps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ClockSource {
    /// `CLOCK_MONOTONIC`, used until the compositor announces its clock.
    #[default]
    Monotonic,
    /// Clock selected from `wp_presentation.clock_id`.
    Presentation(PosixClockId),
}

impl ClockSource {
    /// Maps the raw `clk_id` of a `wp_presentation.clock_id` event.
    ///
    /// Unknown ids fall back to `CLOCK_MONOTONIC`, which every compositor
    /// in practice uses.
    #[must_use]
    pub fn from_raw(clk_id: u32) -> Self {
        let id = match clk_id {
            0 => PosixClockId::Realtime,
            1 => PosixClockId::Monotonic,
            #[cfg(target_os = "linux")]
            4 => PosixClockId::MonotonicRaw,
            #[cfg(target_os = "linux")]
            7 => PosixClockId::Boottime,
            other => {
                warn!(clk_id = other, "unknown presentation clock; using CLOCK_MONOTONIC");
                return Self::Monotonic;
            }
        };
        Self::Presentation(id)
    }

    #[must_use]
    const fn posix_clock_id(self) -> PosixClockId {
        match self {
            Self::Monotonic => PosixClockId::Monotonic,
            Self::Presentation(clock_id) => clock_id,
        }
    }
}

/// A [`Clock`] reading one POSIX clock in nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PosixClock {
    source: ClockSource,
}

impl PosixClock {
    /// Creates a clock reading `source`.
    #[must_use]
    pub const fn new(source: ClockSource) -> Self {
        Self { source }
    }

    /// The clock being read.
    #[must_use]
    pub const fn source(&self) -> ClockSource {
        self.source
    }
}

impl Clock for PosixClock {
    fn now(&self) -> HostTime {
        now_for_clock(self.source)
    }

    fn timebase(&self) -> Timebase {
        timebase()
    }
}

/// Returns the Wayland backend [`Timebase`]: host ticks are nanoseconds.
#[must_use]
pub const fn timebase() -> Timebase {
    Timebase::NANOS
}

/// Returns the current monotonic host time in nanoseconds.
#[must_use]
pub fn now() -> HostTime {
    now_for_clock(ClockSource::Monotonic)
}

pub(crate) fn now_for_clock(clock: ClockSource) -> HostTime {
    let timespec = clock_gettime(clock.posix_clock_id());
    timespec_to_host_time(timespec)
}

fn timespec_to_host_time(timespec: Timespec) -> HostTime {
    let seconds = u64::try_from(timespec.tv_sec).unwrap_or(0);
    let nanos = u64::try_from(timespec.tv_nsec)
        .unwrap_or(0)
        .min(999_999_999);
    protocol_time_to_host(seconds, nanos)
}

/// Converts a split seconds/nanoseconds protocol timestamp to host ticks,
/// saturating at `u64::MAX`.
pub(crate) fn protocol_time_to_host(seconds: u64, nanos: u64) -> HostTime {
    let ticks_u128 = u128::from(seconds)
        .saturating_mul(NANOS_PER_SECOND)
        .saturating_add(u128::from(nanos));
    HostTime(u64::try_from(ticks_u128).unwrap_or(u64::MAX))
}

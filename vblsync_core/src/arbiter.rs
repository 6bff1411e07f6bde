// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cross-validation of onset timestamp candidates.
//!
//! A swap can be timestamped up to three independent ways: the platform's
//! scheduled-swap completion report, the raw completion time corrected by the
//! beam position, and the blanking-interrupt timestamp. The
//! [`TimestampArbiter`] picks one of them in priority order, but only after
//! checking it:
//!
//! - **Ordering**: a candidate must not lie after the moment completion was
//!   observed, nor more than one refresh before the swap was requested.
//! - **Magnitude**: the chosen candidate must agree with every lower-priority
//!   candidate within [`TimingConfig::arbiter_tolerance_secs`]. On
//!   disagreement the lower-priority source is the one disabled.
//!
//! Disabling is permanent for the arbiter's lifetime, which is the surface's
//! session. The `warn!` diagnostic is emitted exactly once per source. If no
//! candidate survives, the raw completion time is used and the result is
//! [`TimestampConfidence::Unverified`].

use tracing::warn;

use crate::config::{TimestampingMode, TimingConfig};
use crate::time::{HostTime, Timebase};
use crate::timing::{TimestampConfidence, TimestampSource};

/// Timestamp candidates gathered for one swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidates {
    /// Completion time reported by the scheduled-swap path.
    pub scheduled: Option<HostTime>,
    /// Raw completion corrected by the beam position.
    pub beam: Option<HostTime>,
    /// Blanking-interrupt timestamp of the swap's blank.
    pub interrupt: Option<HostTime>,
    /// Time completion was observed.
    pub raw: HostTime,
}

impl Candidates {
    /// Candidates consisting of the raw completion time only.
    #[must_use]
    pub const fn raw(raw: HostTime) -> Self {
        Self {
            scheduled: None,
            beam: None,
            interrupt: None,
            raw,
        }
    }

    /// The candidate for `source`, if present.
    #[must_use]
    pub const fn get(&self, source: TimestampSource) -> Option<HostTime> {
        match source {
            TimestampSource::Scheduled => self.scheduled,
            TimestampSource::BeamPosition => self.beam,
            TimestampSource::BlankingInterrupt => self.interrupt,
            TimestampSource::RawCompletion => Some(self.raw),
        }
    }
}

/// Why a source was disabled.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DemotionReason {
    /// The candidate was outside the plausible window by this many seconds
    /// (negative: too early).
    Ordering {
        /// Distance outside the window, in seconds.
        offset_secs: f64,
    },
    /// The candidate disagreed with a higher-priority source.
    Disagreement {
        /// The source it was compared against.
        with: TimestampSource,
        /// Candidate minus that source, in seconds.
        delta_secs: f64,
    },
}

/// A source disabled during one arbitration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Demotion {
    /// The disabled source.
    pub source: TimestampSource,
    /// Why.
    pub reason: DemotionReason,
}

/// The arbiter's decision for one swap.
#[derive(Clone, Debug, PartialEq)]
pub struct Arbitration {
    /// Final onset timestamp.
    pub onset: HostTime,
    /// Source it came from.
    pub source: TimestampSource,
    /// How far it can be trusted.
    pub confidence: TimestampConfidence,
    /// Sources disabled while deciding.
    pub demotions: Vec<Demotion>,
}

const ARBITRATED: [TimestampSource; 3] = [
    TimestampSource::Scheduled,
    TimestampSource::BeamPosition,
    TimestampSource::BlankingInterrupt,
];
const INTERRUPT_FIRST: [TimestampSource; 3] = [
    TimestampSource::BlankingInterrupt,
    TimestampSource::Scheduled,
    TimestampSource::BeamPosition,
];
const BEAM_ONLY: [TimestampSource; 1] = [TimestampSource::BeamPosition];

/// Chooses one trusted onset per swap and disables misbehaving sources.
#[derive(Clone, Debug)]
pub struct TimestampArbiter {
    mode: TimestampingMode,
    tolerance_secs: f64,
    epsilon_secs: f64,
    disabled: [bool; 4],
    diagnostics: u32,
}

impl TimestampArbiter {
    /// Creates an arbiter with every source enabled.
    #[must_use]
    pub fn new(config: &TimingConfig) -> Self {
        Self {
            mode: config.timestamping,
            tolerance_secs: config.arbiter_tolerance_secs,
            epsilon_secs: config.ordering_epsilon_secs,
            disabled: [false; 4],
            diagnostics: 0,
        }
    }

    /// Sources consulted, highest priority first.
    #[must_use]
    pub fn priority(&self) -> &'static [TimestampSource] {
        match self.mode {
            TimestampingMode::RawOnly => &[],
            TimestampingMode::BeamPositionOnly => &BEAM_ONLY,
            TimestampingMode::Arbitrated => &ARBITRATED,
            TimestampingMode::PreferBlankingInterrupt => &INTERRUPT_FIRST,
        }
    }

    /// Whether the source has been disabled for this session.
    #[must_use]
    pub fn is_disabled(&self, source: TimestampSource) -> bool {
        self.disabled[source.index()]
    }

    /// Number of demotion diagnostics emitted so far.
    #[must_use]
    pub fn diagnostics_emitted(&self) -> u32 {
        self.diagnostics
    }

    /// Disables `source` for the rest of the session.
    ///
    /// Returns `true` if it was enabled before; only then is the diagnostic
    /// emitted. The raw completion time can never be disabled.
    pub fn disable(&mut self, source: TimestampSource, reason: DemotionReason) -> bool {
        if source == TimestampSource::RawCompletion || self.disabled[source.index()] {
            return false;
        }
        self.disabled[source.index()] = true;
        self.diagnostics += 1;
        warn!(
            ?source,
            ?reason,
            "timestamp source is implausible; disabled for the rest of the session"
        );
        true
    }

    /// Picks the onset for one swap.
    ///
    /// `not_before` is the earliest plausible onset, normally the request
    /// time minus one refresh interval.
    pub fn arbitrate(
        &mut self,
        candidates: &Candidates,
        not_before: HostTime,
        timebase: Timebase,
    ) -> Arbitration {
        let mut demotions = Vec::new();
        let mut live: Vec<(TimestampSource, HostTime)> = Vec::with_capacity(3);

        for &source in self.priority() {
            let Some(ts) = candidates.get(source) else {
                continue;
            };
            if self.is_disabled(source) {
                continue;
            }
            let early = not_before.signed_secs_since(ts, timebase);
            let late = ts.signed_secs_since(candidates.raw, timebase);
            let offset_secs = if early > self.epsilon_secs {
                -early
            } else if late > self.epsilon_secs {
                late
            } else {
                live.push((source, ts));
                continue;
            };
            let reason = DemotionReason::Ordering { offset_secs };
            if self.disable(source, reason) {
                demotions.push(Demotion { source, reason });
            }
        }

        let Some(&(best, best_ts)) = live.first() else {
            return Arbitration {
                onset: candidates.raw,
                source: TimestampSource::RawCompletion,
                confidence: TimestampConfidence::Unverified,
                demotions,
            };
        };

        let mut corroborated = false;
        for &(source, ts) in &live[1..] {
            let delta_secs = ts.signed_secs_since(best_ts, timebase);
            if delta_secs.abs() > self.tolerance_secs {
                let reason = DemotionReason::Disagreement {
                    with: best,
                    delta_secs,
                };
                if self.disable(source, reason) {
                    demotions.push(Demotion { source, reason });
                }
            } else {
                corroborated = true;
            }
        }

        Arbitration {
            onset: best_ts,
            source: best,
            confidence: if corroborated {
                TimestampConfidence::Verified
            } else {
                TimestampConfidence::Estimated
            },
            demotions,
        }
    }
}

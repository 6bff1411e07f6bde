// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tunable thresholds for calibration, arbitration and deadline checks.
//!
//! The numbers here were tuned empirically on real display hardware. They are
//! plain fields rather than constants so hosts can adjust them for hardware
//! that behaves differently.

/// Which timestamp candidates the arbiter may consult.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TimestampingMode {
    /// Use the raw completion time only, without correction.
    RawOnly,
    /// Use beam-position correction only.
    BeamPositionOnly,
    /// Cross-validate all available sources in priority order.
    #[default]
    Arbitrated,
    /// Like [`Arbitrated`](Self::Arbitrated), but the blanking-interrupt
    /// timestamp outranks every other source.
    PreferBlankingInterrupt,
}

/// Parameters for one refresh-interval calibration run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationParams {
    /// Minimum number of accepted samples.
    pub min_samples: u32,
    /// Give up after this many seconds.
    pub max_duration_secs: f64,
    /// Stop once the standard deviation is at or below this, in seconds.
    pub max_std_dev_secs: f64,
    /// Expected refresh interval, if the platform reports a nominal rate.
    pub hint_secs: Option<f64>,
}

impl CalibrationParams {
    /// Parameters used when a surface is opened.
    #[must_use]
    pub const fn initial() -> Self {
        Self {
            min_samples: 50,
            max_duration_secs: 5.0,
            max_std_dev_secs: 0.000_2,
            hint_secs: None,
        }
    }

    /// Returns these parameters with the given nominal interval hint.
    #[must_use]
    pub const fn with_hint(mut self, hint_secs: f64) -> Self {
        self.hint_secs = Some(hint_secs);
        self
    }
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self::initial()
    }
}

/// Timing thresholds shared by all engine components.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimingConfig {
    /// Shortest plausible refresh interval, in seconds.
    pub min_sample_secs: f64,
    /// Longest plausible refresh interval, in seconds.
    pub max_sample_secs: f64,
    /// Relative band around the hint within which samples are accepted.
    pub hint_tolerance: f64,
    /// Consecutive rejected samples before calibration fails hard.
    pub max_consecutive_rejects: u32,
    /// Pause after each accepted sample, in seconds.
    pub post_sample_pause_secs: f64,
    /// Deadline slack factor when beam-position correction is available.
    pub slack_with_beampos: f64,
    /// Deadline slack factor without beam-position correction.
    pub slack_without_beampos: f64,
    /// Target times further ahead than this are rejected, in seconds.
    pub max_future_secs: f64,
    /// Maximum disagreement between two timestamp sources, in seconds.
    pub arbiter_tolerance_secs: f64,
    /// Slack for ordering checks, in seconds.
    pub ordering_epsilon_secs: f64,
    /// Pause between blanking-interrupt timestamp queries, in seconds.
    pub irq_retry_interval_secs: f64,
    /// Queries before the blanking-interrupt timestamp is given up on.
    pub irq_retry_limit: u32,
    /// Maximum beam-position polls in a spin wait.
    pub spin_poll_limit: u32,
    /// Time budget for stopping a background worker, in seconds.
    pub terminate_timeout_secs: f64,
    /// Which timestamp sources may be used.
    pub timestamping: TimestampingMode,
    /// Calibration run at surface open.
    pub initial_calibration: CalibrationParams,
}

impl TimingConfig {
    /// Thresholds suitable for common desktop displays.
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            min_sample_secs: 0.004,
            max_sample_secs: 0.050,
            hint_tolerance: 0.20,
            max_consecutive_rejects: 10,
            post_sample_pause_secs: 0.001,
            slack_with_beampos: 1.05,
            slack_without_beampos: 1.2,
            max_future_secs: 1000.0,
            arbiter_tolerance_secs: 0.001,
            ordering_epsilon_secs: 0.000_2,
            irq_retry_interval_secs: 0.000_25,
            irq_retry_limit: 40,
            spin_poll_limit: 1_000_000,
            terminate_timeout_secs: 2.0,
            timestamping: TimestampingMode::Arbitrated,
            initial_calibration: CalibrationParams::initial(),
        }
    }

    /// Tighter thresholds for rigs with verified pageflipping hardware.
    ///
    /// Calibration takes more samples and accepts less jitter, and the
    /// arbiter tolerates half the disagreement.
    #[must_use]
    pub const fn strict() -> Self {
        let mut config = Self::standard();
        config.hint_tolerance = 0.10;
        config.arbiter_tolerance_secs = 0.000_5;
        config.initial_calibration = CalibrationParams {
            min_samples: 100,
            max_duration_secs: 10.0,
            max_std_dev_secs: 0.000_1,
            hint_secs: None,
        };
        config
    }

    /// Deadline slack factor for the given beam-position availability.
    #[must_use]
    pub const fn slack(&self, beampos_available: bool) -> f64 {
        if beampos_available {
            self.slack_with_beampos
        } else {
            self.slack_without_beampos
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self::standard()
    }
}

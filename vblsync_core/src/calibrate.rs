// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Refresh-interval calibration.
//!
//! Calibration swaps repeatedly at the next blank, timestamps each
//! completion and measures the interval between consecutive completions.
//! [`SampleFilter`] rejects implausible intervals (scheduler jitter, a sync
//! token that "falls through" without waiting, dropped frames) and
//! [`SampleSet`] keeps a numerically stable running mean and variance of the
//! accepted ones (Welford's method).
//!
//! A run stops when enough samples were accepted and their standard
//! deviation is within tolerance, when its time budget runs out, or, as a
//! hard synchronization failure, after too many consecutive rejections.
//!
//! Blanking geometry detection also lives here: after the interval is known,
//! the beam is polled over a little more than one refresh to find the last
//! scanline of a frame.

use tracing::{debug, info, warn};

use crate::adapter::SwapKind;
use crate::config::{CalibrationParams, TimingConfig};
use crate::error::{FlipError, SyncFailure};
use crate::io::SwapIo;
use crate::surface::SurfaceId;
use crate::time::HostTime;
use crate::timing::{BlankingGeometry, CalibrationResult};
use crate::trace::{CalibrationSampleEvent, Tracer};

/// Accepted refresh-interval samples with running statistics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampleSet {
    samples: Vec<f64>,
    mean: f64,
    m2: f64,
}

impl SampleSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one sample and updates the running mean and variance.
    pub fn push(&mut self, value: f64) {
        self.samples.push(value);
        let n = self.samples.len() as f64;
        let delta = value - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (value - self.mean);
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample was accepted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Running mean, or zero when empty.
    #[must_use]
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Unbiased sample variance, or `None` with fewer than two samples.
    #[must_use]
    pub fn variance(&self) -> Option<f64> {
        let n = self.samples.len();
        (n >= 2).then(|| self.m2 / (n - 1) as f64)
    }

    /// Sample standard deviation; infinite with fewer than two samples.
    #[must_use]
    pub fn std_dev(&self) -> f64 {
        self.variance().map_or(f64::INFINITY, f64::sqrt)
    }

    /// The accepted samples in arrival order.
    #[must_use]
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }
}

/// Plausibility filter for a measured refresh interval.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleFilter {
    /// Shortest plausible interval in seconds.
    pub min_secs: f64,
    /// Longest plausible interval in seconds.
    pub max_secs: f64,
    /// Expected interval, if known.
    pub hint_secs: Option<f64>,
    /// Relative band around the hint.
    pub tolerance: f64,
    /// Also accept twice the hint (native stereo or multisampled surfaces
    /// that swap only every other refresh).
    pub allow_double: bool,
}

impl SampleFilter {
    /// Builds the filter for one calibration run.
    #[must_use]
    pub fn new(config: &TimingConfig, hint_secs: Option<f64>, allow_double: bool) -> Self {
        Self {
            min_secs: config.min_sample_secs,
            max_secs: config.max_sample_secs,
            hint_secs: hint_secs.filter(|h| *h > 0.0),
            tolerance: config.hint_tolerance,
            allow_double,
        }
    }

    /// Whether the interval is plausible.
    #[must_use]
    pub fn accepts(&self, delta_secs: f64) -> bool {
        if !(self.min_secs..=self.max_secs).contains(&delta_secs) {
            return false;
        }
        let Some(hint) = self.hint_secs else {
            return true;
        };
        let within = |center: f64| {
            delta_secs > center * (1.0 - self.tolerance)
                && delta_secs < center * (1.0 + self.tolerance)
        };
        within(hint) || (self.allow_double && within(2.0 * hint))
    }
}

/// Runs one calibration.
///
/// Returns the result together with the accepted samples. On
/// [`SyncFailure::CalibrationFailed`] the caller must reset its estimate.
pub(crate) fn measure_refresh(
    io: &mut SwapIo,
    surface: SurfaceId,
    config: &TimingConfig,
    params: &CalibrationParams,
    allow_double: bool,
    tracer: &mut Tracer<'_>,
) -> Result<(CalibrationResult, SampleSet), FlipError> {
    let tb = io.timebase();
    let filter = SampleFilter::new(config, params.hint_secs, allow_double);
    let mut set = SampleSet::new();
    let mut previous: Option<HostTime> = None;
    let mut rejected = 0_u32;
    let mut pageflip = true;
    let start = io.now();

    loop {
        io.abort.check()?;
        if io.now().signed_secs_since(start, tb) >= params.max_duration_secs {
            break;
        }
        if set.len() >= params.min_samples as usize && set.std_dev() <= params.max_std_dev_secs {
            break;
        }

        let (stamp, _) = io.swap_and_wait()?;
        pageflip &= io.swap_kind() == SwapKind::Pageflip;

        if let Some(prev) = previous {
            let delta_secs = stamp.signed_secs_since(prev, tb);
            let accepted = filter.accepts(delta_secs);
            tracer.calibration_sample(&CalibrationSampleEvent {
                surface,
                delta_secs,
                accepted,
                timestamp: stamp,
            });
            if accepted {
                set.push(delta_secs);
                rejected = 0;
                io.pause(config.post_sample_pause_secs);
            } else {
                rejected += 1;
                debug!(%surface, delta_secs, rejected, "implausible refresh sample rejected");
                if rejected >= config.max_consecutive_rejects {
                    warn!(
                        %surface,
                        rejected,
                        "refresh calibration failed: no stable blanking sync"
                    );
                    return Err(SyncFailure::CalibrationFailed { rejected }.into());
                }
            }
        }
        previous = Some(stamp);
    }

    if set.is_empty() {
        warn!(%surface, "refresh calibration accepted no samples");
        return Err(SyncFailure::NoValidSamples.into());
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "sample counts are bounded by the calibration time budget"
    )]
    let result = CalibrationResult {
        refresh_interval_secs: set.mean(),
        sample_count: set.len() as u32,
        std_dev_secs: set.std_dev(),
        pageflip_confirmed: pageflip,
    };
    info!(
        %surface,
        interval_secs = result.refresh_interval_secs,
        samples = result.sample_count,
        std_dev_secs = result.std_dev_secs,
        pageflip = result.pageflip_confirmed,
        "refresh interval calibrated"
    );
    Ok((result, set))
}

/// Finds the blanking region by polling the beam over a little more than
/// one refresh.
///
/// Blanking starts at the adapter's visible line count and ends at the
/// largest scanline observed. Returns `None` if the beam position or the
/// visible line count is unavailable, or the observed range is implausible.
pub(crate) fn detect_blanking(
    io: &mut SwapIo,
    interval_secs: f64,
    poll_limit: u32,
) -> Option<BlankingGeometry> {
    let visible = io.adapter.visible_lines()?;
    let tb = io.timebase();
    let window = if interval_secs > 0.0 { interval_secs * 1.5 } else { 0.05 };
    let start = io.now();
    let mut max_line = None::<u32>;

    for _ in 0..poll_limit {
        if io.abort.is_aborted() || io.now().signed_secs_since(start, tb) >= window {
            break;
        }
        let line = io.beam()?;
        max_line = Some(max_line.map_or(line, |m| m.max(line)));
        io.spin();
    }

    let end = max_line?;
    if end <= visible {
        debug!(visible, end, "beam never entered the blanking region");
        return None;
    }
    Some(BlankingGeometry {
        start: visible,
        end,
    })
}

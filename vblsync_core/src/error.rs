// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error types for flips, calibration, and platform adapters.
//!
//! Transient timing anomalies (a single implausible sample) and missing
//! adapter capabilities are recovered locally and never surface here unless
//! every fallback is exhausted. Everything that does escalate is a
//! [`FlipError`], and [`FlipError::category`] reports which class of failure
//! it belongs to so callers can decide between degrading and aborting.

use thiserror::Error;

/// Class of failure, used by callers to pick a recovery policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// A capability is absent and no fallback remained.
    UnsupportedFeature,
    /// No usable timing could be obtained, or an impossible timestamp
    /// ordering was observed.
    SyncDisaster,
    /// A threading contract was broken (second outstanding flip, context
    /// bound on another thread, reentrant target switch).
    ConcurrencyViolation,
    /// The caller asked for something malformed.
    InvalidRequest,
    /// The platform layer reported a failure.
    Platform,
    /// The operation was cut short by a termination request.
    Shutdown,
}

/// Why synchronization failed hard.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum SyncFailure {
    /// A flip was requested before the refresh interval was calibrated.
    #[error("refresh interval is not calibrated")]
    Uncalibrated,
    /// Calibration gave up after too many consecutive implausible samples.
    #[error("calibration rejected {rejected} consecutive samples")]
    CalibrationFailed {
        /// Number of consecutive rejected samples.
        rejected: u32,
    },
    /// Calibration ran out of time before accepting any sample.
    #[error("calibration accepted no valid samples")]
    NoValidSamples,
    /// The final onset precedes the swap request although the beam was
    /// outside the blanking region when the swap was issued.
    #[error("onset {early_by_secs:.6}s before the swap request outside blanking")]
    OnsetBeforeRequest {
        /// How far the onset precedes the request, in seconds.
        early_by_secs: f64,
    },
    /// The final onset precedes the previous accepted onset.
    #[error("onset went backwards by {regression_secs:.6}s")]
    TimestampRegression {
        /// How far the onset went backwards, in seconds.
        regression_secs: f64,
    },
}

/// Which threading contract was broken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum ConcurrencyViolation {
    /// A flip was begun while a previous one was still outstanding.
    #[error("an asynchronous flip is already outstanding on this surface")]
    FlipOutstanding,
    /// A render-target switch was entered while one was already in progress
    /// on the same thread.
    #[error("render target switch re-entered")]
    ReentrantTargetSwitch,
    /// A graphics context was bound while another thread owns it.
    #[error("graphics context is bound to another thread")]
    ContextBoundElsewhere,
    /// The surface is owned by a background worker right now.
    #[error("surface is owned by a background worker")]
    SurfaceBusy,
    /// The background worker is not running.
    #[error("background worker is not running")]
    WorkerNotRunning,
    /// A flip result was claimed but no flip was begun.
    #[error("no asynchronous flip is outstanding")]
    NoFlipOutstanding,
}

/// Why a swap request was rejected before any swap was issued.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum RequestError {
    /// The target time lies implausibly far in the future.
    #[error("target time {secs:.3}s in the future exceeds the allowed horizon")]
    TooFarInFuture {
        /// Seconds between now and the requested target.
        secs: f64,
    },
    /// Swapping a single-buffered surface makes no sense.
    #[error("surface is single-buffered")]
    SingleBuffered,
    /// A stereo buffer was selected on a surface without stereo buffers.
    #[error("surface has no stereo buffers")]
    NotStereo,
    /// Field parity and periodicity cannot both be satisfied.
    #[error("field parity conflicts with the periodicity constraint")]
    ConflictingConstraints,
    /// A periodicity constraint with divisor zero.
    #[error("periodicity divisor must be non-zero")]
    ZeroDivisor,
}

/// Error returned by flips, calibration, and worker operations.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum FlipError {
    /// Every fallback for a required capability was exhausted.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// Synchronization failed hard.
    #[error("synchronization failure: {0}")]
    SyncDisaster(#[from] SyncFailure),
    /// A threading contract was broken.
    #[error("concurrency violation: {0}")]
    Concurrency(#[from] ConcurrencyViolation),
    /// The request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
    /// The platform adapter failed.
    #[error("platform error: {0}")]
    Platform(String),
    /// A termination request interrupted the operation.
    #[error("aborted by termination request")]
    Aborted,
    /// The worker did not shut down within its time budget.
    #[error("worker did not terminate in time")]
    TerminateTimedOut,
}

impl FlipError {
    /// Returns the failure class of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Unsupported(_) => ErrorCategory::UnsupportedFeature,
            Self::SyncDisaster(_) => ErrorCategory::SyncDisaster,
            Self::Concurrency(_) => ErrorCategory::ConcurrencyViolation,
            Self::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            Self::Platform(_) => ErrorCategory::Platform,
            Self::Aborted | Self::TerminateTimedOut => ErrorCategory::Shutdown,
        }
    }
}

/// Error reported by a platform adapter or drawing target.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// The capability does not exist on this platform; the caller falls back.
    #[error("capability not supported by this platform")]
    Unsupported,
    /// The capability exists but the call failed.
    #[error("{0}")]
    Failed(String),
}

impl From<AdapterError> for FlipError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Unsupported => Self::Unsupported("platform capability"),
            AdapterError::Failed(msg) => Self::Platform(msg),
        }
    }
}

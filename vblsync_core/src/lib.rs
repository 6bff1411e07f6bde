// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Swap scheduling, refresh calibration and onset timestamping.
//!
//! `vblsync_core` issues double-buffer swaps at precise display refresh
//! boundaries and reports, for every swap, when the new image actually began
//! scanning out and whether the requested deadline was met.
//!
//! # Architecture
//!
//! ```text
//!   SwapRequest ──► FlipEngine::flip() ──► SwapAdapter / DrawingTarget
//!                        │                        │
//!                        │      candidates ◄──────┘
//!                        ▼
//!                 TimestampArbiter ──► FlipResult
//! ```
//!
//! **[`scheduler`]**: [`FlipEngine`](scheduler::FlipEngine), the per-surface
//! orchestrator. Resolves targets, issues exactly one swap per request,
//! gathers timestamp candidates and computes the signed deadline miss.
//!
//! **[`arbiter`]**: cross-validates timestamp candidates in priority order
//! and permanently disables sources that prove implausible.
//!
//! **[`calibrate`]**: measures the refresh interval with outlier rejection
//! and running statistics, and detects the blanking region.
//!
//! **[`adapter`]**: the platform traits ([`SwapAdapter`](adapter::SwapAdapter),
//! [`DrawingTarget`](adapter::DrawingTarget),
//! [`GraphicsContext`](adapter::GraphicsContext)) a backend implements,
//! bundled into a [`PlatformBinding`](adapter::PlatformBinding).
//!
//! **[`wait`]**: [`Clock`](wait::Clock) and
//! [`WaitStrategy`](wait::WaitStrategy) so time can be faked, plus bounded
//! beam polling.
//!
//! **[`context`]**: the process-wide
//! [`PresentationContext`](context::PresentationContext), shared connection
//! lock and thread-bound graphics contexts.
//!
//! **[`timing`]**, **[`config`]**, **[`error`]**, **[`time`]**: data model,
//! tunables, error taxonomy and host time.
//!
//! **[`trace`]**: [`TraceSink`](trace::TraceSink) trait and event types,
//! with a zero-overhead [`Tracer`](trace::Tracer) wrapper.
//!
//! **[`sim`]**: a deterministic simulated display for tests and demos.
//!
//! # Crate features
//!
//! - `trace` (disabled by default): Enables `Tracer` method bodies (one branch
//!   per call site).

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod adapter;
pub mod arbiter;
pub mod calibrate;
pub mod callbacks;
pub mod config;
pub mod context;
pub mod error;
mod io;
pub mod scheduler;
pub mod sim;
pub mod surface;
pub mod time;
pub mod timing;
pub mod trace;
pub mod wait;

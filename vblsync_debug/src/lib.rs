// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Recording, pretty-printing, and Chrome trace export for vblsync
//! diagnostics.
//!
//! This crate provides [`TraceSink`](vblsync_core::trace::TraceSink)
//! implementations for development and post-mortem analysis of flips:
//!
//! - [`pretty::PrettyPrintSink`]: human-readable one-line-per-event output.
//! - [`recorder::RecorderSink`]: compact binary recording with
//!   [`recorder::decode`] for playback.
//! - [`chrome::export`]: writes Chrome Trace Event Format JSON from recorded
//!   bytes.
//!
//! Install a sink with
//! [`FlipEngine::set_trace_sink`](vblsync_core::scheduler::FlipEngine::set_trace_sink).

pub mod chrome;
pub mod pretty;
pub mod recorder;

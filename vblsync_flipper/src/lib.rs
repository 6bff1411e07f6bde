// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Background flips for vblsync surfaces.
//!
//! A [`FlipEngine`](vblsync_core::scheduler::FlipEngine) flips on whatever
//! thread owns it. This crate moves it between threads so a caller can keep
//! rendering while a swap is pending:
//!
//! - [`AsyncFlipper`]: one worker thread per surface running
//!   `Begin`/`End`/`Poll` flips through a [`Mailbox`] state machine.
//! - [`StereoDispatcher`]: a long-running worker alternating left and right
//!   eye images on every vertical blank (frame-sequential stereo).
//! - [`Surface`]: the per-surface facade that creates the worker lazily,
//!   runs flip callbacks and stops background threads on drop.
//!
//! Each worker binds its own graphics context on its own thread; the
//! engine, and with it the platform collaborators, belongs to exactly one
//! thread at a time.

pub mod mailbox;
pub mod stereo;
pub mod surface;
pub mod worker;

pub use mailbox::{FlipperState, Inbox, Mailbox};
pub use stereo::{NoShutter, ShutterSignal, StartError, StereoDispatcher};
pub use surface::Surface;
pub use worker::AsyncFlipper;

// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! On-screen surface identification.
//!
//! [`SurfaceId`] is a lightweight handle identifying one on-screen surface.
//! The host assigns these when it opens a window; the engine treats them as
//! opaque and uses them for presentation-context bookkeeping and thread names.

use core::fmt;

/// Identifies a specific on-screen surface.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SurfaceId(pub u32);

impl fmt::Debug for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SurfaceId({})", self.0)
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Copyright 2026 the Vblsync Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bounded history of recent feedback.

use std::collections::VecDeque;

/// Bounded FIFO that evicts its oldest entry on overflow and supports
/// removal of an arbitrary entry by predicate.
#[derive(Debug, Clone)]
pub(crate) struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    evicted: u64,
}

impl<T> BoundedQueue<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    pub(crate) fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            let _ = self.items.pop_front();
            self.evicted += 1;
        }
        self.items.push_back(item);
    }

    /// Removes and returns the oldest entry matching `pred`.
    pub(crate) fn take_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let index = self.items.iter().position(|item| pred(item))?;
        self.items.remove(index)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn evicted(&self) -> u64 {
        self.evicted
    }
}

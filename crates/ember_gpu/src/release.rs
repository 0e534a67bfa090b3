//! Resources released only after the device is done with them.

use std::collections::VecDeque;

use crate::device::Fence;

/// Resources keyed by the fence that must signal before they can go.
#[derive(Debug)]
pub struct DeferredReleaseQueue<T> {
    entries: VecDeque<(Fence, T)>,
}

impl<T> Default for DeferredReleaseQueue<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<T> DeferredReleaseQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds `resource` until `fence` completes.
    pub fn push(&mut self, fence: Fence, resource: T) {
        self.entries.push_back((fence, resource));
    }

    /// Resources still held.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is held.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns every resource whose fence has completed.
    pub fn drain_completed(&mut self, mut is_complete: impl FnMut(Fence) -> bool) -> Vec<T> {
        let mut released = Vec::new();
        let mut held = VecDeque::with_capacity(self.entries.len());
        for (fence, resource) in self.entries.drain(..) {
            if is_complete(fence) {
                released.push(resource);
            } else {
                held.push_back((fence, resource));
            }
        }
        self.entries = held;
        released
    }
}

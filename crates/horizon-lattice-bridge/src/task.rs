//! Idle queue for work deferred until the engine has nothing else to do.
//!
//! Entries are processed in batches so a steady stream of idle work cannot
//! starve dispatched calls and native timers.

use std::collections::VecDeque;

/// Default number of idle entries processed per pump.
pub const DEFAULT_IDLE_BATCH: usize = 10;

/// FIFO queue of idle entries.
pub(crate) struct IdleQueue<T> {
    entries: VecDeque<T>,
    /// Maximum number of entries handed out per idle cycle.
    batch_size: usize,
}

impl<T> IdleQueue<T> {
    /// Create a new idle queue with a custom batch size.
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// Append an entry.
    pub fn push(&mut self, entry: T) {
        self.entries.push_back(entry);
    }

    /// Check if there are any pending entries.
    pub fn has_pending(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Take up to `batch_size` entries accepted by `keep`.
    ///
    /// Rejected entries are dropped and do not count against the batch.
    pub fn take_batch<F>(&mut self, mut keep: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut batch = Vec::new();
        while batch.len() < self.batch_size {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            if keep(&entry) {
                batch.push(entry);
            }
        }
        batch
    }

    /// Drop entries rejected by `keep`.
    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&T) -> bool,
    {
        self.entries.retain(keep);
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_batch_respects_size() {
        let mut queue = IdleQueue::with_batch_size(3);
        for i in 0..5 {
            queue.push(i);
        }

        assert_eq!(queue.take_batch(|_| true), vec![0, 1, 2]);
        assert!(queue.has_pending());
        assert_eq!(queue.take_batch(|_| true), vec![3, 4]);
        assert!(!queue.has_pending());
    }

    #[test]
    fn test_rejected_entries_do_not_use_batch() {
        let mut queue = IdleQueue::with_batch_size(2);
        for i in 0..6 {
            queue.push(i);
        }

        assert_eq!(queue.take_batch(|n| n % 2 == 1), vec![1, 3]);
        assert_eq!(queue.take_batch(|n| n % 2 == 1), vec![5]);
    }

    #[test]
    fn test_zero_batch_is_clamped() {
        let mut queue = IdleQueue::with_batch_size(0);
        queue.push("a");
        assert_eq!(queue.take_batch(|_| true), vec!["a"]);

        queue.push("b");
        queue.clear();
        assert!(queue.take_batch(|_| true).is_empty());
    }
}

//! Native delay queue: the engine's own timer facility.
//!
//! Each native timer is a one-shot entry that invokes a registered callback
//! when it expires. Repetition is built on top of this by
//! [`TimerScheduler`](crate::TimerScheduler), which re-arms a new native timer
//! after every firing.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use slotmap::{SlotMap, new_key_type};

use crate::registry::CallbackHandle;
use crate::task::IdleQueue;

new_key_type! {
    /// A unique identifier for a native timer.
    pub struct NativeTimerId;
}

/// When a native timer should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeDelay {
    /// Fire once the duration has elapsed.
    After(Duration),
    /// Fire the next time the engine has no other work.
    Idle,
}

/// Internal timer data.
#[derive(Debug)]
struct NativeTimer {
    callback: CallbackHandle,
    /// `None` for idle entries.
    deadline: Option<Instant>,
}

/// An entry in the timer queue (min-heap by fire time).
#[derive(Debug, Clone, Copy)]
struct TimerQueueEntry {
    id: NativeTimerId,
    fire_time: Instant,
    /// Insertion order; timers with equal deadlines fire FIFO.
    seq: u64,
}

impl PartialEq for TimerQueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_time == other.fire_time && self.seq == other.seq
    }
}

impl Eq for TimerQueueEntry {}

impl PartialOrd for TimerQueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerQueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap (BinaryHeap is max-heap by default).
        other
            .fire_time
            .cmp(&self.fire_time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Pending native timers, by deadline and in the idle queue.
pub struct NativeTimerQueue {
    timers: SlotMap<NativeTimerId, NativeTimer>,
    queue: BinaryHeap<TimerQueueEntry>,
    idle: IdleQueue<NativeTimerId>,
    next_seq: u64,
}

impl NativeTimerQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::with_idle_batch(crate::task::DEFAULT_IDLE_BATCH)
    }

    /// Create an empty queue that hands out at most `idle_batch` idle entries
    /// per cycle.
    pub fn with_idle_batch(idle_batch: usize) -> Self {
        Self {
            timers: SlotMap::with_key(),
            queue: BinaryHeap::new(),
            idle: IdleQueue::with_batch_size(idle_batch),
            next_seq: 0,
        }
    }

    /// Schedule `callback` to fire after `delay`, measured from `now`.
    pub fn schedule(&mut self, delay: NativeDelay, callback: CallbackHandle, now: Instant) -> NativeTimerId {
        match delay {
            NativeDelay::After(duration) => {
                let fire_time = now + duration;
                let id = self.timers.insert(NativeTimer {
                    callback,
                    deadline: Some(fire_time),
                });
                let seq = self.next_seq;
                self.next_seq += 1;
                self.queue.push(TimerQueueEntry { id, fire_time, seq });
                tracing::trace!(target: "horizon_lattice_bridge::timer", ?id, ?duration, %callback, "native timer scheduled");
                id
            }
            NativeDelay::Idle => {
                let id = self.timers.insert(NativeTimer {
                    callback,
                    deadline: None,
                });
                self.idle.push(id);
                tracing::trace!(target: "horizon_lattice_bridge::timer", ?id, %callback, "idle callback scheduled");
                id
            }
        }
    }

    /// Cancel a pending timer.
    ///
    /// Returns `true` if the timer was still pending. Stale heap entries are
    /// discarded lazily.
    pub fn cancel(&mut self, id: NativeTimerId) -> bool {
        let Some(timer) = self.timers.remove(id) else {
            return false;
        };
        if timer.deadline.is_none() {
            self.idle.retain(|entry| *entry != id);
        }
        tracing::trace!(target: "horizon_lattice_bridge::timer", ?id, "native timer cancelled");
        true
    }

    /// Check if a timer is still pending.
    pub fn is_pending(&self, id: NativeTimerId) -> bool {
        self.timers.contains_key(id)
    }

    /// The deadline of a pending timer; `None` for idle or cancelled timers.
    pub fn deadline(&self, id: NativeTimerId) -> Option<Instant> {
        self.timers.get(id).and_then(|t| t.deadline)
    }

    fn discard_stale_head(&mut self) {
        while let Some(entry) = self.queue.peek() {
            if self.timers.contains_key(entry.id) {
                break;
            }
            self.queue.pop();
        }
    }

    /// The earliest pending deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale_head();
        self.queue.peek().map(|entry| entry.fire_time)
    }

    /// Get the duration until the next timer fires, if any.
    pub fn time_until_next(&mut self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Remove and return the earliest timer due at `now`.
    ///
    /// The timer is no longer pending once returned; the caller fires it.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(NativeTimerId, CallbackHandle)> {
        self.discard_stale_head();
        let entry = *self.queue.peek()?;
        if entry.fire_time > now {
            return None;
        }
        self.queue.pop();
        let timer = self.timers.remove(entry.id)?;
        Some((entry.id, timer.callback))
    }

    /// Check if any idle entries are pending.
    pub fn has_idle(&self) -> bool {
        self.idle.has_pending()
    }

    /// Take the next batch of idle entries off the idle queue.
    ///
    /// Entries stay pending until [`claim`](Self::claim)ed, so a callback run
    /// earlier in the batch can still cancel a later one.
    pub fn idle_batch(&mut self) -> Vec<NativeTimerId> {
        let timers = &self.timers;
        self.idle.take_batch(|id| timers.contains_key(*id))
    }

    /// Remove a pending timer that is about to fire and return its callback.
    pub fn claim(&mut self, id: NativeTimerId) -> Option<CallbackHandle> {
        self.timers.remove(id).map(|timer| timer.callback)
    }

    /// Get the number of pending timers, including idle entries.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Check if no timers are pending.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Cancel every timer and return the callbacks they referenced.
    pub fn clear(&mut self) -> Vec<CallbackHandle> {
        let callbacks = self.timers.drain().map(|(_, t)| t.callback).collect();
        self.queue.clear();
        self.idle.clear();
        callbacks
    }
}

impl Default for NativeTimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

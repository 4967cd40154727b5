//! Main-thread dispatcher: run work on the engine's owning thread.
//!
//! Any thread can hand a closure to [`MainThreadDispatcher::run_on_owning_thread`].
//! On the owning thread the closure runs immediately. Elsewhere it is queued,
//! the engine is woken, and the caller blocks until the owning thread has run
//! it during a pump.
//!
//! # Example
//!
//! ```
//! use horizon_lattice_bridge::Engine;
//!
//! let engine = Engine::new();
//! let handle = engine.handle();
//!
//! let worker = std::thread::spawn(move || {
//!     handle.run_on_owning_thread(|| Ok(std::thread::current().id()))
//! });
//!
//! engine.run_until(|| worker.is_finished()).unwrap();
//! let owner = worker.join().unwrap().unwrap();
//! assert_eq!(owner, std::thread::current().id());
//! ```
//!
//! # Ordering
//!
//! Queued calls run in FIFO order of arrival. Calls from different threads are
//! ordered only by when they reached the queue.
//!
//! # Deadlocks
//!
//! A worker blocks until the owning thread pumps. If the owning thread stops
//! pumping without shutting the engine down, the worker blocks indefinitely.
//! Shutting the engine down fails every queued call with
//! [`BridgeError::DispatchClosed`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::engine::Wakeup;
use crate::error::{BridgeError, Result};
use crate::invocation::{CompletionSlot, PendingCall};
use crate::protection::{CrossBoundaryError, HostResult};
use crate::thread_check::ThreadAffinity;

/// Queue of work for the owning thread.
pub struct MainThreadDispatcher {
    affinity: ThreadAffinity,
    queue: Mutex<VecDeque<PendingCall>>,
    /// Set under the queue lock; never cleared.
    closed: AtomicBool,
    next_id: AtomicU64,
    wakeup: Arc<Wakeup>,
}

impl MainThreadDispatcher {
    pub(crate) fn new(affinity: ThreadAffinity, wakeup: Arc<Wakeup>) -> Self {
        Self {
            affinity,
            queue: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            wakeup,
        }
    }

    /// Check if the current thread is the engine's owning thread.
    #[inline]
    pub fn is_owning_thread(&self) -> bool {
        self.affinity.is_same_thread()
    }

    /// Check if the engine has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `work` on the owning thread and return its result.
    ///
    /// On the owning thread this calls `work` directly: errors come back as
    /// [`BridgeError::Host`] and panics propagate. From any other thread the
    /// call is queued and this blocks until the owning thread has run it;
    /// errors come back as [`BridgeError::CrossBoundary`] with the same kind
    /// and message.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DispatchClosed`] if the engine is torn down
    /// before the work runs.
    pub fn run_on_owning_thread<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> HostResult<T> + Send + 'static,
    {
        if self.is_closed() {
            return Err(BridgeError::DispatchClosed);
        }
        if self.is_owning_thread() {
            tracing::trace!(target: "horizon_lattice_bridge::dispatcher", "running on owning thread directly");
            return work().map_err(BridgeError::Host);
        }
        self.submit(work)?.wait()
    }

    /// Queue `work` and return the slot its result will arrive in.
    ///
    /// Unlike [`run_on_owning_thread`](Self::run_on_owning_thread) this always
    /// queues, even on the owning thread. Waiting on the slot from the owning
    /// thread without pumping deadlocks.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DispatchClosed`] if the engine is torn down.
    pub fn submit<T, F>(&self, work: F) -> Result<CompletionSlot<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> HostResult<T> + Send + 'static,
    {
        let (call, slot) = PendingCall::with_completion(self.next_id(), work);
        self.enqueue(call)?;
        Ok(slot)
    }

    /// Queue `work` without waiting for it.
    ///
    /// A failure is reported to the engine's background error handler.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DispatchClosed`] if the engine is torn down.
    pub fn post<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() -> HostResult<()> + Send + 'static,
    {
        self.enqueue(PendingCall::detached(self.next_id(), work))
    }

    /// Get the number of queued calls.
    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, mut call: PendingCall) -> Result<()> {
        {
            let mut queue = self.queue.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(BridgeError::DispatchClosed);
            }
            call.mark_queued();
            tracing::trace!(target: "horizon_lattice_bridge::dispatcher", id = call.id(), state = ?call.state(), depth = queue.len() + 1, "call queued");
            queue.push_back(call);
        }
        self.wakeup.notify();
        Ok(())
    }

    /// Run the calls queued at entry, in FIFO order.
    ///
    /// Calls queued while this runs wait for the next pump. Failures of
    /// detached calls are passed to `report`. Returns the number of calls run.
    #[tracing::instrument(skip(self, report), target = "horizon_lattice_bridge::dispatcher", level = "trace")]
    pub(crate) fn process(&self, report: &mut dyn FnMut(CrossBoundaryError)) -> usize {
        self.affinity.debug_assert_same_thread("MainThreadDispatcher::process");
        let budget = self.queue.lock().len();
        let mut processed = 0;
        for _ in 0..budget {
            // The lock is released before the call runs so the work can queue more.
            let Some(call) = self.queue.lock().pop_front() else {
                break;
            };
            if let Some(failure) = call.execute() {
                report(failure);
            }
            processed += 1;
        }
        processed
    }

    /// Refuse new calls and fail every queued one with
    /// [`BridgeError::DispatchClosed`]. Returns the number of calls failed.
    pub(crate) fn close(&self) -> usize {
        let drained: Vec<PendingCall> = {
            let mut queue = self.queue.lock();
            self.closed.store(true, Ordering::Release);
            queue.drain(..).collect()
        };
        let count = drained.len();
        for call in drained {
            call.close();
        }
        count
    }
}

impl std::fmt::Debug for MainThreadDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainThreadDispatcher")
            .field("owner", &self.affinity.thread_id())
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

//! Pending calls: work queued for the owning thread.
//!
//! A [`PendingCall`] wraps a closure submitted from a worker thread. It moves
//! through these states:
//!
//! ```text
//! Submitted -> Queued -> Executing -> Completed(value) | Completed(error)
//! ```
//!
//! The result travels back through a rendezvous channel of capacity one: the
//! owning thread sends exactly once, the submitter receives exactly once. If a
//! call is dropped without running (engine teardown), the submitter observes
//! [`BridgeError::DispatchClosed`] instead of blocking forever.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::{BridgeError, Result};
use crate::protection::{CallbackProtection, CrossBoundaryError, EngineFrame, HostResult};

/// Lifecycle of a dispatched call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Created, not yet in the queue.
    Submitted,
    /// Waiting in the owning thread's queue.
    Queued,
    /// Running on the owning thread.
    Executing,
    /// Finished with a value or an error.
    Completed,
}

/// How the owning thread disposes of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Run the work.
    Execute,
    /// Fail the call because the engine is gone.
    Close,
}

type Job = Box<dyn FnOnce(Disposition) -> Option<CrossBoundaryError> + Send + 'static>;

/// A unit of work owned by the dispatcher until it completes.
pub(crate) struct PendingCall {
    id: u64,
    state: CallState,
    job: Job,
}

impl PendingCall {
    /// Create a call whose result is delivered to the returned slot.
    pub fn with_completion<T, F>(id: u64, work: F) -> (Self, CompletionSlot<T>)
    where
        T: Send + 'static,
        F: FnOnce() -> HostResult<T> + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let job = move |disposition: Disposition| {
            let outcome = match disposition {
                Disposition::Execute => CallbackProtection::protect(EngineFrame::Dispatch(id), work)
                    .map_err(BridgeError::from),
                Disposition::Close => Err(BridgeError::DispatchClosed),
            };
            deliver(&sender, id, outcome);
            None
        };
        let call = Self {
            id,
            state: CallState::Submitted,
            job: Box::new(job),
        };
        (call, CompletionSlot { id, receiver })
    }

    /// Create a fire-and-forget call.
    ///
    /// A failure is handed back from [`PendingCall::execute`] for the engine's
    /// background error handler.
    pub fn detached<F>(id: u64, work: F) -> Self
    where
        F: FnOnce() -> HostResult<()> + Send + 'static,
    {
        let job = move |disposition: Disposition| match disposition {
            Disposition::Execute => CallbackProtection::protect(EngineFrame::Dispatch(id), work).err(),
            Disposition::Close => {
                tracing::debug!(target: "horizon_lattice_bridge::dispatcher", id, "posted call dropped on teardown");
                None
            }
        };
        Self {
            id,
            state: CallState::Submitted,
            job: Box::new(job),
        }
    }

    /// The call's sequence number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The call's current state.
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Mark the call as queued.
    pub fn mark_queued(&mut self) {
        self.state = CallState::Queued;
    }

    /// Run the call on the owning thread.
    ///
    /// Returns an error only for detached calls; errors of waited-on calls go
    /// to the waiting thread.
    pub fn execute(mut self) -> Option<CrossBoundaryError> {
        self.state = CallState::Executing;
        tracing::trace!(target: "horizon_lattice_bridge::dispatcher", id = self.id, state = ?self.state, "executing pending call");
        let failure = (self.job)(Disposition::Execute);
        tracing::trace!(target: "horizon_lattice_bridge::dispatcher", id = self.id, state = ?CallState::Completed, "pending call done");
        failure
    }

    /// Fail the call with [`BridgeError::DispatchClosed`].
    pub fn close(self) {
        let _ = (self.job)(Disposition::Close);
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn deliver<T>(sender: &Sender<Result<T>>, id: u64, outcome: Result<T>) {
    // The slot holds one value and is written once, so this never blocks.
    if sender.try_send(outcome).is_err() {
        tracing::debug!(target: "horizon_lattice_bridge::dispatcher", id, "caller stopped waiting; result discarded");
    }
}

/// The submitter's end of a pending call.
pub struct CompletionSlot<T> {
    id: u64,
    receiver: Receiver<Result<T>>,
}

impl<T> CompletionSlot<T> {
    /// The call's sequence number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the call completes.
    ///
    /// # Errors
    ///
    /// Returns the call's own error, or [`BridgeError::DispatchClosed`] if it
    /// was dropped without running.
    pub fn wait(self) -> Result<T> {
        self.receiver
            .recv()
            .unwrap_or(Err(BridgeError::DispatchClosed))
    }

    /// Block until the call completes or the timeout elapses.
    ///
    /// Returns `Err(self)` on timeout so the caller can keep waiting.
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<Result<T>, Self> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Ok(outcome),
            Err(RecvTimeoutError::Disconnected) => Ok(Err(BridgeError::DispatchClosed)),
            Err(RecvTimeoutError::Timeout) => Err(self),
        }
    }
}

impl<T> fmt::Debug for CompletionSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSlot").field("id", &self.id).finish()
    }
}

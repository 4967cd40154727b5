//! Error types for Horizon Lattice Bridge.

use crate::protection::{CrossBoundaryError, HostError};
use crate::registry::CallbackHandle;

/// The main error type for bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The callback handle is stale or was never registered.
    #[error("unknown callback id: {0}")]
    CallbackNotFound(CallbackHandle),

    /// A protected callback failed; carries both-side backtraces.
    #[error("{0}")]
    CrossBoundary(#[source] Box<CrossBoundaryError>),

    /// The owning thread's engine was torn down before the call could run.
    #[error("engine has been deleted")]
    DispatchClosed,

    /// A host error returned directly, without crossing a thread boundary.
    #[error("{0}")]
    Host(#[source] HostError),

    /// An owning-thread-only operation was invoked from another thread.
    #[error("{operation} must be called from the engine's owning thread")]
    WrongThread {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// A background worker thread could not be spawned.
    #[error("failed to spawn background worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// Timer-related error.
    #[error("Timer error: {0}")]
    Timer(#[from] TimerError),
}

impl BridgeError {
    /// The original host error, whether or not it crossed a thread boundary.
    ///
    /// Returns `None` for errors raised by the bridge itself.
    pub fn host_error(&self) -> Option<&HostError> {
        match self {
            Self::Host(err) => Some(err),
            Self::CrossBoundary(err) => Some(err.host_error()),
            _ => None,
        }
    }

    /// The kind of the original host error, if there is one.
    pub fn kind(&self) -> Option<&str> {
        self.host_error().map(HostError::kind)
    }

    /// Check if this error reports a torn-down engine.
    pub fn is_dispatch_closed(&self) -> bool {
        matches!(self, Self::DispatchClosed)
    }
}

impl From<CrossBoundaryError> for BridgeError {
    fn from(err: CrossBoundaryError) -> Self {
        Self::CrossBoundary(Box::new(err))
    }
}

/// Timer-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    /// The timer has no steps to run.
    #[error("timer has no steps to run")]
    NoSteps,
    /// The step id is stale or the index is out of range.
    #[error("invalid or deleted timer step")]
    InvalidStep,
    /// `resume` was called on a timer that already ran to completion.
    #[error("no procedure to continue: timer is exhausted")]
    NothingToContinue,
}

/// A specialized Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

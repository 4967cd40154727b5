//! Callback protection: host failures never escape an engine callback raw.
//!
//! Every closure the engine invokes runs inside [`CallbackProtection::protect`].
//! An `Err(HostError)` return or a panic is caught and turned into a
//! [`CrossBoundaryError`] carrying:
//!
//! - the original error kind and message, verbatim
//! - the host-side backtrace, captured where the error was created
//! - the engine-side frames that were active when the callback was invoked
//!
//! The error is then handed back to whoever invoked the callback: the engine's
//! background error handler, a timer's cancel policy, or a dispatcher that
//! forwards it to a waiting worker thread.
//!
//! # Engine Frames
//!
//! The engine pushes an [`EngineFrame`] for each thing it is doing (pumping,
//! firing a native timer, running a dispatched call). Frames are tracked per
//! thread, so the snapshot taken by a failing callback is exactly the engine's
//! call stack at the point of invocation.

use std::any::Any;
use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{BridgeError, Result};
use crate::registry::{CallbackHandle, CallbackRegistry};
use crate::timer::NativeTimerId;

/// Result type returned by host closures.
pub type HostResult<T> = std::result::Result<T, HostError>;

thread_local! {
    static ENGINE_FRAMES: RefCell<Vec<EngineFrame>> = const { RefCell::new(Vec::new()) };
    static CALLBACK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// An error raised by host code inside an engine callback.
///
/// The host-side backtrace is captured when the error is created, which for
/// `Err` returns is the point the error was raised.
#[derive(Debug, Clone)]
pub struct HostError {
    kind: Cow<'static, str>,
    message: String,
    backtrace: Arc<Backtrace>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl HostError {
    /// Kind used for generic runtime failures.
    pub const RUNTIME_ERROR: &'static str = "RuntimeError";
    /// Kind used for panics caught inside a protected callback.
    pub const PANIC: &'static str = "Panic";
    /// Kind used when background work is asked to stop.
    pub const STOPPED: &'static str = "Stopped";

    /// Create an error with an explicit kind and message.
    pub fn new(kind: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            backtrace: Arc::new(Backtrace::force_capture()),
            source: None,
        }
    }

    /// Create a generic runtime error.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(Self::RUNTIME_ERROR, message)
    }

    /// Wrap any error type. The kind is the error's type name.
    pub fn from_error<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind: Cow::Borrowed(short_type_name::<E>()),
            message: err.to_string(),
            backtrace: Arc::new(Backtrace::force_capture()),
            source: Some(Arc::new(err)),
        }
    }

    /// Build an error from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Self::new(Self::PANIC, message)
    }

    /// The error kind, e.g. a type name or [`HostError::RUNTIME_ERROR`].
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The original message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Check the error kind.
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// The host-side backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// One frame of the engine-side call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineFrame {
    /// The engine is processing a pump iteration.
    Pump,
    /// A registered callback is being invoked.
    Invoke(CallbackHandle),
    /// A native timer is firing.
    NativeTimer(NativeTimerId),
    /// An idle callback is running.
    Idle(NativeTimerId),
    /// A dispatched call from another thread is running.
    Dispatch(u64),
    /// A timer step at the given position is running.
    TimerStep(usize),
    /// A timer's start step is running.
    TimerStart,
    /// A timer's end-of-sequence callback is running.
    AtEnd,
    /// Any other engine activity.
    Named(&'static str),
}

impl fmt::Display for EngineFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pump => write!(f, "pump"),
            Self::Invoke(handle) => write!(f, "invoke {handle}"),
            Self::NativeTimer(id) => write!(f, "after {id:?}"),
            Self::Idle(id) => write!(f, "after idle {id:?}"),
            Self::Dispatch(id) => write!(f, "dispatched call #{id}"),
            Self::TimerStep(index) => write!(f, "timer step {index}"),
            Self::TimerStart => write!(f, "timer start step"),
            Self::AtEnd => write!(f, "timer at_end"),
            Self::Named(name) => write!(f, "{name}"),
        }
    }
}

/// Pops its frame when dropped, including during unwinding.
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct FrameGuard {
    _private: (),
}

impl FrameGuard {
    fn push(frame: EngineFrame) -> Self {
        ENGINE_FRAMES.with(|frames| frames.borrow_mut().push(frame));
        Self { _private: () }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        ENGINE_FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// A host failure wrapped at the engine boundary.
#[derive(Debug, Clone)]
pub struct CrossBoundaryError {
    error: HostError,
    engine_backtrace: Vec<EngineFrame>,
    origin_thread: Option<String>,
}

impl CrossBoundaryError {
    /// Wrap a host error, snapshotting the current thread's engine frames.
    pub fn capture(error: HostError) -> Self {
        let engine_backtrace =
            ENGINE_FRAMES.with(|frames| frames.borrow().iter().rev().cloned().collect());
        Self {
            error,
            engine_backtrace,
            origin_thread: std::thread::current().name().map(str::to_string),
        }
    }

    /// The original error kind.
    pub fn kind(&self) -> &str {
        self.error.kind()
    }

    /// The original message.
    pub fn message(&self) -> &str {
        self.error.message()
    }

    /// The wrapped host error.
    pub fn host_error(&self) -> &HostError {
        &self.error
    }

    /// Unwrap into the host error.
    pub fn into_host_error(self) -> HostError {
        self.error
    }

    /// The host-side backtrace.
    pub fn host_backtrace(&self) -> &Backtrace {
        self.error.backtrace()
    }

    /// Engine frames at the point of invocation, innermost first.
    pub fn engine_backtrace(&self) -> &[EngineFrame] {
        &self.engine_backtrace
    }

    /// Name of the thread the error was raised on, if it had one.
    pub fn origin_thread(&self) -> Option<&str> {
        self.origin_thread.as_deref()
    }

    /// Render the error with both backtraces.
    pub fn report(&self) -> String {
        let engine: Vec<String> = self
            .engine_backtrace
            .iter()
            .map(|frame| format!("    in {frame}"))
            .collect();
        format!(
            "{}: {}\n\n---< backtrace of host side >-----\n{}\n---< backtrace of engine side >-------\n{}",
            self.kind(),
            self.message(),
            self.host_backtrace(),
            engine.join("\n")
        )
    }
}

impl fmt::Display for CrossBoundaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::error::Error for CrossBoundaryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Entry points for running host code on behalf of the engine.
pub struct CallbackProtection;

impl CallbackProtection {
    /// Run `f` as a protected callback.
    ///
    /// Errors and panics are caught and wrapped; nothing unwinds out of this
    /// call.
    pub fn protect<T, F>(frame: EngineFrame, f: F) -> std::result::Result<T, CrossBoundaryError>
    where
        F: FnOnce() -> HostResult<T>,
    {
        let _frame = FrameGuard::push(frame);
        let _depth = DepthGuard::enter();
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(CrossBoundaryError::capture(err)),
            Err(payload) => Err(CrossBoundaryError::capture(HostError::from_panic(payload))),
        }
    }

    /// Look up a registered callback and invoke it under protection.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::CallbackNotFound`] for a stale or unknown handle,
    /// or [`BridgeError::CrossBoundary`] if the callback failed.
    #[tracing::instrument(skip(registry, args), target = "horizon_lattice_bridge::callback", level = "trace")]
    pub fn invoke_protected(
        registry: &CallbackRegistry,
        handle: CallbackHandle,
        args: &[String],
    ) -> Result<String> {
        let Some(callback) = registry.lookup(handle) else {
            return Err(BridgeError::CallbackNotFound(handle));
        };
        Self::protect(EngineFrame::Invoke(handle), || callback(args)).map_err(BridgeError::from)
    }

    /// Push an engine frame for the lifetime of the returned guard.
    pub fn enter(frame: EngineFrame) -> FrameGuard {
        FrameGuard::push(frame)
    }

    /// Snapshot of the current thread's engine frames, innermost first.
    pub fn current_frames() -> Vec<EngineFrame> {
        ENGINE_FRAMES.with(|frames| frames.borrow().iter().rev().cloned().collect())
    }

    /// Nesting depth of protected callbacks on the current thread.
    pub fn depth() -> usize {
        CALLBACK_DEPTH.with(Cell::get)
    }

    /// Check if the current thread is inside a protected callback.
    pub fn in_callback() -> bool {
        Self::depth() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct DomainError(String);

    impl fmt::Display for DomainError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "domain failure: {}", self.0)
        }
    }

    impl std::error::Error for DomainError {}

    #[test]
    fn test_protect_passes_value_through() {
        let value = CallbackProtection::protect(EngineFrame::Named("test"), || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_protect_wraps_error_with_frames() {
        let _outer = CallbackProtection::enter(EngineFrame::Pump);
        let err = CallbackProtection::protect(EngineFrame::Dispatch(3), || -> HostResult<()> {
            Err(HostError::runtime("boom"))
        })
        .unwrap_err();

        assert_eq!(err.kind(), HostError::RUNTIME_ERROR);
        assert_eq!(err.message(), "boom");
        assert_eq!(
            err.engine_backtrace(),
            &[EngineFrame::Dispatch(3), EngineFrame::Pump]
        );
    }

    #[test]
    fn test_protect_catches_panics() {
        let err = CallbackProtection::protect(EngineFrame::Named("test"), || -> HostResult<()> {
            panic!("exploded");
        })
        .unwrap_err();

        assert_eq!(err.kind(), HostError::PANIC);
        assert_eq!(err.message(), "exploded");
        // Frames and depth unwind cleanly.
        assert!(CallbackProtection::current_frames().is_empty());
        assert_eq!(CallbackProtection::depth(), 0);
    }

    #[test]
    fn test_from_error_uses_type_name() {
        let err = HostError::from_error(DomainError("x".into()));
        assert_eq!(err.kind(), "DomainError");
        assert_eq!(err.message(), "domain failure: x");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_message_is_verbatim() {
        let text = "ünïcødé → ✓";
        let err = CallbackProtection::protect(EngineFrame::Named("test"), || -> HostResult<()> {
            Err(HostError::new("EncodingError", text))
        })
        .unwrap_err();
        assert_eq!(err.message(), text);
    }

    #[test]
    fn test_depth_tracks_nesting() {
        assert!(!CallbackProtection::in_callback());
        let inner_depth = CallbackProtection::protect(EngineFrame::Named("outer"), || {
            CallbackProtection::protect(EngineFrame::Named("inner"), || {
                Ok(CallbackProtection::depth())
            })
            .map_err(CrossBoundaryError::into_host_error)
        })
        .unwrap();
        assert_eq!(inner_depth, 2);
        assert_eq!(CallbackProtection::depth(), 0);
    }

    #[test]
    fn test_invoke_protected_lookup_error() {
        let registry = CallbackRegistry::new();
        let handle = registry.register(|_| Ok("ok".to_string()));
        assert_eq!(
            CallbackProtection::invoke_protected(&registry, handle, &[]).unwrap(),
            "ok"
        );

        registry.unregister(handle);
        let err = CallbackProtection::invoke_protected(&registry, handle, &[]).unwrap_err();
        assert!(matches!(err, BridgeError::CallbackNotFound(h) if h == handle));
    }

    #[test]
    fn test_report_contains_both_sides() {
        let registry = CallbackRegistry::new();
        let handle = registry.register(|_| Err(HostError::new("DomainError", "bad input")));

        let err = CallbackProtection::invoke_protected(&registry, handle, &[]).unwrap_err();
        let BridgeError::CrossBoundary(err) = err else {
            panic!("expected a cross-boundary error, got {err:?}");
        };

        let report = err.report();
        assert!(report.starts_with("DomainError: bad input"));
        assert!(report.contains("---< backtrace of host side >-----"));
        assert!(report.contains("---< backtrace of engine side >-------"));
        assert!(report.contains(&format!("invoke {handle}")));
    }
}

//! Threading bridge for Horizon Lattice.
//!
//! This crate lets a multi-threaded host drive an engine that is bound to the
//! thread that created it:
//!
//! - **Main-Thread Dispatch**: Run work on the engine's owning thread from any thread
//! - **Event Loop**: Pump dispatched calls, native timers and idle work
//! - **Timer Scheduler**: Repeating step sequences with cancel, skip, resume
//! - **Drift Compensation**: Timers that hold their average period under load
//! - **Callback Registry**: Stable handles for closures the engine calls back
//! - **Callback Protection**: Errors and panics captured with host and engine backtraces
//! - **Background Work**: Worker threads that stream results back to the owning thread
//!
//! # Dispatch Example
//!
//! ```
//! use horizon_lattice_bridge::{Engine, HostError};
//!
//! let engine = Engine::new();
//! let handle = engine.handle();
//!
//! let worker = std::thread::spawn(move || {
//!     handle.run_on_owning_thread(|| Err::<(), _>(HostError::new("DomainError", "bad input")))
//! });
//!
//! engine.run_until(|| worker.is_finished()).unwrap();
//! let err = worker.join().unwrap().unwrap_err();
//! assert_eq!(err.kind(), Some("DomainError"));
//! ```
//!
//! # Timer Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::time::Duration;
//! use horizon_lattice_bridge::{Engine, Repeat, TimerBuilder};
//!
//! let engine = Engine::new();
//! let ends = Arc::new(AtomicUsize::new(0));
//! let ends_in = ends.clone();
//!
//! let timer = TimerBuilder::new()
//!     .interval(Duration::from_millis(2))
//!     .repeat(Repeat::Times(4))
//!     .step(|ctx| Ok(ctx.step_index()))
//!     .at_end(move |_| {
//!         ends_in.fetch_add(1, Ordering::SeqCst);
//!         Ok(())
//!     })
//!     .start(engine.handle())
//!     .unwrap();
//!
//! timer.wait().unwrap();
//! assert_eq!(ends.load(Ordering::SeqCst), 1);
//! ```
//!
//! # Callback Example
//!
//! ```
//! use horizon_lattice_bridge::{CallbackProtection, CallbackRegistry};
//!
//! let registry = CallbackRegistry::new();
//! let handle = registry.register(|args| Ok(args.join(",")));
//!
//! let out = CallbackProtection::invoke_protected(&registry, handle, &["a".into(), "b".into()]);
//! assert_eq!(out.unwrap(), "a,b");
//!
//! registry.unregister(handle);
//! assert!(CallbackProtection::invoke_protected(&registry, handle, &[]).is_err());
//! ```

mod background;
mod dispatcher;
mod engine;
mod error;
mod invocation;
pub mod logging;
mod protection;
mod registry;
mod scheduler;
mod task;
pub mod thread_check;
mod timer;

pub use background::{BackgroundConfig, BackgroundTask, BackgroundWork, Control, DEFAULT_POLL_INTERVAL, TaskContext};
pub use dispatcher::MainThreadDispatcher;
pub use engine::{
    BackgroundErrorHandler, DEFAULT_KEEPALIVE_TICK, Engine, EngineBuilder, EngineConfig, EngineHandle, EventLoop,
};
pub use error::{BridgeError, Result, TimerError};
pub use invocation::{CallState, CompletionSlot};
pub use logging::PerfSpan;
pub use protection::{CallbackProtection, CrossBoundaryError, EngineFrame, FrameGuard, HostError, HostResult};
pub use registry::{Callback, CallbackHandle, CallbackRegistry};
pub use scheduler::{
    CancelPolicy, DynamicInterval, EndHook, Interval, Repeat, StartParams, Step, StepContext, StepId, StepRef,
    TimerBuilder, TimerConfig, TimerScheduler, TimerState, TimerStatus,
};
pub use task::DEFAULT_IDLE_BATCH;
pub use thread_check::ThreadAffinity;
pub use timer::{NativeDelay, NativeTimerId, NativeTimerQueue};

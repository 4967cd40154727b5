//! The engine loop: a single-threaded reactor pumped by its owning thread.
//!
//! [`EventLoop`] is the seam the rest of the crate rides on: the dispatcher
//! needs `wake`, the timer scheduler needs the native delay queue, and both
//! need `pump`. [`Engine`] is the in-process implementation.
//!
//! # Pump Order
//!
//! Each pump processes, in order:
//!
//! 1. Queued dispatcher calls, FIFO
//! 2. Due native timers, earliest first, one at a time
//! 3. Up to `idle_batch` idle callbacks
//!
//! A blocking pump that found nothing to do waits for the earliest native
//! deadline, a [`wake`](EventLoop::wake), or the keep-alive tick, then
//! processes whatever became ready.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use horizon_lattice_bridge::{Engine, EventLoop, NativeDelay};
//!
//! let engine = Engine::builder().name("demo").build();
//! let handle = engine.handle();
//!
//! let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
//! let flag = fired.clone();
//! let callback = handle.callbacks().register(move |_| {
//!     flag.store(true, std::sync::atomic::Ordering::SeqCst);
//!     Ok(String::new())
//! });
//! handle
//!     .schedule_native_timer(NativeDelay::After(Duration::from_millis(5)), callback)
//!     .unwrap();
//!
//! engine
//!     .run_until(|| fired.load(std::sync::atomic::Ordering::SeqCst))
//!     .unwrap();
//! ```

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::dispatcher::MainThreadDispatcher;
use crate::error::{BridgeError, Result};
use crate::invocation::CompletionSlot;
use crate::logging::{PerfSpan, span_names};
use crate::protection::{CallbackProtection, EngineFrame, HostResult};
use crate::registry::{CallbackHandle, CallbackRegistry};
use crate::task::DEFAULT_IDLE_BATCH;
use crate::thread_check::ThreadAffinity;
use crate::timer::{NativeDelay, NativeTimerId, NativeTimerQueue};

/// Default keep-alive tick for blocking pumps (about 60 Hz).
pub const DEFAULT_KEEPALIVE_TICK: Duration = Duration::from_millis(16);

/// Handler for callback failures nobody else consumed.
pub type BackgroundErrorHandler = Arc<dyn Fn(&BridgeError) + Send + Sync>;

/// The primitives the bridge needs from an engine loop.
pub trait EventLoop: Send + Sync {
    /// Process one batch of ready work. Owning thread only.
    ///
    /// Returns the number of items processed.
    fn pump(&self, block: bool) -> Result<usize>;

    /// Arm a one-shot native timer that invokes `callback` when it fires.
    fn schedule_native_timer(&self, delay: NativeDelay, callback: CallbackHandle) -> Result<NativeTimerId>;

    /// Disarm a native timer. Returns `true` if it was still pending.
    fn cancel_native_timer(&self, id: NativeTimerId) -> bool;

    /// Force a blocked pump to return promptly. Callable from any thread.
    fn wake(&self);

    /// Queue `work` for the owning thread's next pump. Callable from any
    /// thread.
    fn post(&self, work: Box<dyn FnOnce() -> HostResult<()> + Send>) -> Result<()>;

    /// The callback registry owned by this engine.
    fn callbacks(&self) -> &CallbackRegistry;

    /// Check if the current thread is the engine's owning thread.
    fn is_owning_thread(&self) -> bool;

    /// Check if the engine has been torn down.
    fn is_closed(&self) -> bool;

    /// The longest a blocking pump sleeps without a deadline.
    fn keepalive_tick(&self) -> Duration {
        DEFAULT_KEEPALIVE_TICK
    }
}

/// Configuration for an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name used in log output.
    pub name: String,
    /// Longest a blocking pump sleeps when nothing is scheduled.
    pub keepalive_tick: Duration,
    /// Maximum number of idle callbacks run per pump.
    pub idle_batch: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "horizon-engine".to_string(),
            keepalive_tick: DEFAULT_KEEPALIVE_TICK,
            idle_batch: DEFAULT_IDLE_BATCH,
        }
    }
}

impl EngineConfig {
    /// Create a new configuration with the given name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Builder for creating Engines with custom configuration.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    error_handler: Option<BackgroundErrorHandler>,
}

impl EngineBuilder {
    /// Create a new EngineBuilder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the keep-alive tick for blocking pumps.
    pub fn keepalive_tick(mut self, tick: Duration) -> Self {
        self.config.keepalive_tick = tick;
        self
    }

    /// Set the maximum number of idle callbacks run per pump.
    pub fn idle_batch(mut self, batch: usize) -> Self {
        self.config.idle_batch = batch.max(1);
        self
    }

    /// Replace the default background error handler, which logs.
    pub fn on_background_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&BridgeError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Build the engine, bound to the calling thread.
    pub fn build(self) -> Engine {
        Engine::with_config(self.config, self.error_handler)
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("custom_error_handler", &self.error_handler.is_some())
            .finish()
    }
}

/// Wakes a blocked pump.
///
/// A notification that arrives while nobody is waiting is kept, so the next
/// wait returns immediately.
pub(crate) struct Wakeup {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl Wakeup {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.condvar.notify_all();
    }

    /// Wait for a notification or the deadline. Returns `true` if notified.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut pending = self.pending.lock();
        while !*pending {
            if self.condvar.wait_until(&mut pending, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *pending, false)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PumpStats {
    calls: usize,
    timers: usize,
    idle: usize,
}

impl PumpStats {
    fn total(&self) -> usize {
        self.calls + self.timers + self.idle
    }
}

struct EngineShared {
    config: EngineConfig,
    affinity: ThreadAffinity,
    callbacks: CallbackRegistry,
    dispatcher: MainThreadDispatcher,
    timers: Mutex<NativeTimerQueue>,
    wakeup: Arc<Wakeup>,
    deleted: AtomicBool,
    error_handler: RwLock<Option<BackgroundErrorHandler>>,
}

/// A cloneable, thread-safe reference to an engine.
///
/// Worker threads use this to dispatch work; the owning thread can also pump
/// through it.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// The engine's dispatcher.
    pub fn dispatcher(&self) -> &MainThreadDispatcher {
        &self.shared.dispatcher
    }

    /// Run `work` on the owning thread and return its result.
    ///
    /// See [`MainThreadDispatcher::run_on_owning_thread`].
    pub fn run_on_owning_thread<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> HostResult<T> + Send + 'static,
    {
        self.shared.dispatcher.run_on_owning_thread(work)
    }

    /// Queue `work` and return the slot its result will arrive in.
    pub fn submit<T, F>(&self, work: F) -> Result<CompletionSlot<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> HostResult<T> + Send + 'static,
    {
        self.shared.dispatcher.submit(work)
    }

    /// Queue `work` without waiting for it.
    pub fn post<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() -> HostResult<()> + Send + 'static,
    {
        self.shared.dispatcher.post(work)
    }

    /// Check if the engine has been torn down.
    pub fn is_deleted(&self) -> bool {
        self.shared.deleted.load(Ordering::Acquire)
    }

    /// Get the number of live native timers, including idle entries.
    pub fn pending_native_timers(&self) -> usize {
        self.shared.timers.lock().len()
    }

    /// Get the number of queued dispatcher calls.
    pub fn pending_calls(&self) -> usize {
        self.shared.dispatcher.pending_count()
    }

    /// The deadline of a pending native timer.
    pub fn native_timer_deadline(&self, id: NativeTimerId) -> Option<Instant> {
        self.shared.timers.lock().deadline(id)
    }

    /// Check if a native timer is still pending.
    pub fn is_native_timer_pending(&self, id: NativeTimerId) -> bool {
        self.shared.timers.lock().is_pending(id)
    }

    /// Replace the background error handler.
    pub fn set_background_error_handler<F>(&self, handler: F)
    where
        F: Fn(&BridgeError) + Send + Sync + 'static,
    {
        *self.shared.error_handler.write() = Some(Arc::new(handler));
    }

    /// Restore the default background error handler.
    pub fn clear_background_error_handler(&self) {
        *self.shared.error_handler.write() = None;
    }

    /// Tear the engine down. Owning thread only.
    ///
    /// Fails every queued call with [`BridgeError::DispatchClosed`], cancels
    /// every native timer and clears the callback registry. Later calls are
    /// no-ops.
    pub fn shutdown(&self) -> Result<()> {
        self.shared.affinity.check("shutdown")?;
        if self.shared.deleted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!(target: "horizon_lattice_bridge::engine", name = %self.shared.config.name, "engine shutting down");

        let closed_calls = self.shared.dispatcher.close();
        let cancelled_timers = self.shared.timers.lock().clear().len();
        self.shared.callbacks.clear();
        self.shared.wakeup.notify();

        tracing::info!(
            target: "horizon_lattice_bridge::engine",
            closed_calls,
            cancelled_timers,
            "engine deleted"
        );
        Ok(())
    }

    fn pump_once(&self, block: bool) -> Result<PumpStats> {
        self.pump_pass(block, None)
    }

    /// One pump pass. With a `cutoff`, only native timers due by then fire.
    fn pump_pass(&self, block: bool, cutoff: Option<Instant>) -> Result<PumpStats> {
        self.shared.affinity.check("pump")?;
        if self.is_deleted() {
            return Err(BridgeError::DispatchClosed);
        }
        let _span = PerfSpan::new(span_names::PUMP);
        let _frame = CallbackProtection::enter(EngineFrame::Pump);

        let mut stats = self.process_ready(cutoff);
        if stats.total() == 0 && block && !self.is_deleted() {
            let now = Instant::now();
            let tick = now + self.shared.config.keepalive_tick;
            let deadline = self
                .shared
                .timers
                .lock()
                .next_deadline()
                .map_or(tick, |next| next.min(tick));
            let woken = self.shared.wakeup.wait_until(deadline);
            tracing::trace!(target: "horizon_lattice_bridge::engine", woken, "pump woke");
            stats = self.process_ready(None);
        }
        Ok(stats)
    }

    #[tracing::instrument(skip(self), target = "horizon_lattice_bridge::engine", level = "trace")]
    fn process_ready(&self, cutoff: Option<Instant>) -> PumpStats {
        let mut stats = PumpStats {
            calls: self
                .shared
                .dispatcher
                .process(&mut |failure| self.report(&BridgeError::from(failure))),
            ..Default::default()
        };

        // Timers armed by a firing callback are due after `now` and wait for
        // the next pass.
        let now = cutoff.unwrap_or_else(Instant::now);
        loop {
            let next = self.shared.timers.lock().pop_expired(now);
            let Some((id, callback)) = next else {
                break;
            };
            self.fire(EngineFrame::NativeTimer(id), callback);
            stats.timers += 1;
        }

        let batch = self.shared.timers.lock().idle_batch();
        for id in batch {
            // An earlier idle callback may have cancelled this one.
            let claimed = self.shared.timers.lock().claim(id);
            if let Some(callback) = claimed {
                self.fire(EngineFrame::Idle(id), callback);
                stats.idle += 1;
            }
        }

        if stats.total() > 0 {
            tracing::trace!(
                target: "horizon_lattice_bridge::engine",
                calls = stats.calls,
                timers = stats.timers,
                idle = stats.idle,
                "pump processed"
            );
        }
        stats
    }

    fn fire(&self, frame: EngineFrame, callback: CallbackHandle) {
        let _frame = CallbackProtection::enter(frame);
        match CallbackProtection::invoke_protected(&self.shared.callbacks, callback, &[]) {
            Ok(_) => {}
            Err(err) => self.report(&err),
        }
    }

    fn report(&self, err: &BridgeError) {
        let handler = self.shared.error_handler.read().clone();
        match handler {
            Some(handler) => handler(err),
            None => default_background_error(&self.shared.config.name, err),
        }
    }
}

fn default_background_error(engine: &str, err: &BridgeError) {
    match err {
        BridgeError::CrossBoundary(err) => {
            tracing::error!(target: "horizon_lattice_bridge::engine", engine, kind = err.kind(), "background error\n{}", err.report());
        }
        other => {
            tracing::error!(target: "horizon_lattice_bridge::engine", engine, error = %other, "background error");
        }
    }
}

impl EventLoop for EngineHandle {
    fn pump(&self, block: bool) -> Result<usize> {
        self.pump_once(block).map(|stats| stats.total())
    }

    fn schedule_native_timer(&self, delay: NativeDelay, callback: CallbackHandle) -> Result<NativeTimerId> {
        if self.is_deleted() {
            return Err(BridgeError::DispatchClosed);
        }
        let id = self
            .shared
            .timers
            .lock()
            .schedule(delay, callback, Instant::now());
        if !self.is_owning_thread() {
            self.shared.wakeup.notify();
        }
        Ok(id)
    }

    fn cancel_native_timer(&self, id: NativeTimerId) -> bool {
        self.shared.timers.lock().cancel(id)
    }

    fn wake(&self) {
        self.shared.wakeup.notify();
    }

    fn post(&self, work: Box<dyn FnOnce() -> HostResult<()> + Send>) -> Result<()> {
        self.shared.dispatcher.post(work)
    }

    fn callbacks(&self) -> &CallbackRegistry {
        &self.shared.callbacks
    }

    fn is_owning_thread(&self) -> bool {
        self.shared.affinity.is_same_thread()
    }

    fn is_closed(&self) -> bool {
        self.is_deleted()
    }

    fn keepalive_tick(&self) -> Duration {
        self.shared.config.keepalive_tick
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("name", &self.shared.config.name)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

/// The in-process engine, owned by the thread that created it.
///
/// `Engine` is neither `Send` nor `Sync`; hand [`Engine::handle`] to other
/// threads instead. Dropping the engine shuts it down.
pub struct Engine {
    handle: EngineHandle,
    _not_send: PhantomData<*const ()>,
}

impl Engine {
    /// Create an engine with default configuration, bound to this thread.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default(), None)
    }

    /// Create a builder for a custom engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    fn with_config(config: EngineConfig, error_handler: Option<BackgroundErrorHandler>) -> Self {
        let affinity = ThreadAffinity::current();
        let wakeup = Arc::new(Wakeup::new());
        tracing::debug!(target: "horizon_lattice_bridge::engine", name = %config.name, owner = ?affinity.thread_id(), "engine created");

        let shared = EngineShared {
            timers: Mutex::new(NativeTimerQueue::with_idle_batch(config.idle_batch)),
            dispatcher: MainThreadDispatcher::new(affinity, wakeup.clone()),
            callbacks: CallbackRegistry::new(),
            config,
            affinity,
            wakeup,
            deleted: AtomicBool::new(false),
            error_handler: RwLock::new(error_handler),
        };
        Self {
            handle: EngineHandle {
                shared: Arc::new(shared),
            },
            _not_send: PhantomData,
        }
    }

    /// A thread-safe handle to this engine.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Process one batch of ready work.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DispatchClosed`] after shutdown.
    pub fn pump(&self, block: bool) -> Result<usize> {
        self.handle.pump(block)
    }

    /// Pump without blocking until no dispatched calls or due timers remain.
    ///
    /// Only native timers that were due when the update began fire; a timer
    /// re-armed during the update, even with a zero delay, waits for the next
    /// pump. Idle work runs too, but a pass that only ran idle callbacks ends
    /// the update.
    pub fn update(&self) -> Result<usize> {
        let cutoff = Instant::now();
        let mut processed = 0;
        loop {
            let stats = self.handle.pump_pass(false, Some(cutoff))?;
            processed += stats.total();
            if stats.calls + stats.timers == 0 {
                return Ok(processed);
            }
        }
    }

    /// Pump until `done` returns `true` or the engine is shut down.
    pub fn run_until<F>(&self, mut done: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        let _span = PerfSpan::new(span_names::RUN_LOOP);
        while !done() {
            if self.handle.is_deleted() {
                return Ok(());
            }
            self.handle.pump(true)?;
        }
        Ok(())
    }

    /// Tear the engine down. See [`EngineHandle::shutdown`].
    pub fn shutdown(&self) {
        // `Engine` never leaves its owning thread, so the affinity check holds.
        let _ = self.handle.shutdown();
    }

    /// Check if the engine has been torn down.
    pub fn is_deleted(&self) -> bool {
        self.handle.is_deleted()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("handle", &self.handle).finish()
    }
}

// Engine is bound to its thread; the handle travels.
static_assertions::assert_not_impl_any!(Engine: Send, Sync);
static_assertions::assert_impl_all!(EngineHandle: Send, Sync, Clone);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protection::HostError;
    use std::sync::atomic::AtomicUsize;

    fn counter_callback(handle: &EngineHandle, counter: &Arc<AtomicUsize>) -> CallbackHandle {
        let counter = counter.clone();
        handle.callbacks().register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(String::new())
        })
    }

    #[test]
    fn test_pump_fires_due_timers() {
        let engine = Engine::new();
        let handle = engine.handle();
        let counter = Arc::new(AtomicUsize::new(0));
        let callback = counter_callback(&handle, &counter);

        handle
            .schedule_native_timer(NativeDelay::After(Duration::ZERO), callback)
            .unwrap();
        handle
            .schedule_native_timer(NativeDelay::After(Duration::from_secs(60)), callback)
            .unwrap();

        assert_eq!(engine.pump(false).unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(handle.pending_native_timers(), 1);
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let engine = Engine::new();
        let handle = engine.handle();
        let counter = Arc::new(AtomicUsize::new(0));
        let callback = counter_callback(&handle, &counter);

        let id = handle
            .schedule_native_timer(NativeDelay::After(Duration::ZERO), callback)
            .unwrap();
        assert!(handle.cancel_native_timer(id));
        assert!(!handle.cancel_native_timer(id));

        assert_eq!(engine.update().unwrap(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_idle_callbacks_run_after_timers() {
        let engine = Engine::builder().idle_batch(2).build();
        let handle = engine.handle();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["idle-1", "idle-2", "idle-3"] {
            let order = order.clone();
            let callback = handle.callbacks().register(move |_| {
                order.lock().push(label);
                Ok(String::new())
            });
            handle.schedule_native_timer(NativeDelay::Idle, callback).unwrap();
        }
        let timer_order = order.clone();
        let callback = handle.callbacks().register(move |_| {
            timer_order.lock().push("timer");
            Ok(String::new())
        });
        handle
            .schedule_native_timer(NativeDelay::After(Duration::ZERO), callback)
            .unwrap();

        assert_eq!(engine.pump(false).unwrap(), 3);
        assert_eq!(*order.lock(), vec!["timer", "idle-1", "idle-2"]);
        assert_eq!(engine.pump(false).unwrap(), 1);
    }

    #[test]
    fn test_background_errors_are_reported() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let engine = Engine::builder()
            .on_background_error(move |err| {
                sink.lock().push((err.kind().map(str::to_string), err.to_string()));
            })
            .build();
        let handle = engine.handle();

        let callback = handle
            .callbacks()
            .register(|_| Err(HostError::new("DomainError", "timer broke")));
        handle
            .schedule_native_timer(NativeDelay::After(Duration::ZERO), callback)
            .unwrap();
        let stale = handle.callbacks().register(|_| Ok(String::new()));
        handle.callbacks().unregister(stale);
        handle
            .schedule_native_timer(NativeDelay::After(Duration::ZERO), stale)
            .unwrap();

        engine.pump(false).unwrap();
        let errors = errors.lock();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].0.as_deref(), Some("DomainError"));
        assert!(errors[1].1.starts_with("unknown callback id"));
    }

    #[test]
    fn test_update_leaves_rearmed_timers_for_next_pump() {
        use crate::scheduler::{Repeat, TimerScheduler};

        let engine = Engine::new();
        let timer = TimerScheduler::started(engine.handle(), Duration::ZERO, Repeat::Forever, |ctx| Ok(ctx.fired()))
            .unwrap();

        let started = Instant::now();
        engine.update().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(timer.return_value(), Some(1));
        assert!(timer.is_running());

        engine.update().unwrap();
        assert_eq!(timer.return_value(), Some(2));
        timer.cancel();
    }

    #[test]
    fn test_pump_off_thread_is_rejected() {
        let engine = Engine::new();
        let handle = engine.handle();

        let result = std::thread::spawn(move || handle.pump(false)).join().unwrap();
        assert!(matches!(
            result,
            Err(BridgeError::WrongThread { operation: "pump" })
        ));
    }

    #[test]
    fn test_blocking_pump_wakes_for_dispatch() {
        let engine = Engine::builder()
            .keepalive_tick(Duration::from_secs(5))
            .build();
        let handle = engine.handle();
        let done = Arc::new(AtomicBool::new(false));

        let flag = done.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.run_on_owning_thread(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(7)
            })
        });

        let started = Instant::now();
        engine.run_until(|| done.load(Ordering::SeqCst)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(worker.join().unwrap().unwrap(), 7);
    }

    #[test]
    fn test_shutdown_tears_everything_down() {
        let engine = Engine::new();
        let handle = engine.handle();
        let counter = Arc::new(AtomicUsize::new(0));
        let callback = counter_callback(&handle, &counter);
        handle
            .schedule_native_timer(NativeDelay::After(Duration::from_secs(60)), callback)
            .unwrap();
        let slot = handle.submit(|| Ok(())).unwrap();

        engine.shutdown();
        assert!(handle.is_deleted());
        assert!(slot.wait().unwrap_err().is_dispatch_closed());
        assert_eq!(handle.pending_native_timers(), 0);
        assert!(handle.callbacks().is_empty());
        assert!(engine.pump(false).unwrap_err().is_dispatch_closed());
        assert!(
            handle
                .schedule_native_timer(NativeDelay::Idle, callback)
                .unwrap_err()
                .is_dispatch_closed()
        );

        // Idempotent.
        engine.shutdown();
    }

    #[test]
    fn test_drop_shuts_down() {
        let engine = Engine::new();
        let handle = engine.handle();
        drop(engine);
        assert!(handle.is_deleted());
        assert!(
            handle
                .run_on_owning_thread(|| Ok(()))
                .unwrap_err()
                .is_dispatch_closed()
        );
    }
}

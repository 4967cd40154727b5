//! Background work: a dedicated worker thread that reports to the owning thread.
//!
//! A [`BackgroundWork`] runs a closure on its own thread. The closure streams
//! values back with [`TaskContext::yield_value`] and can exchange messages
//! with the owning thread. The owning thread drains everything the worker
//! sent from a native timer, so `on_progress`, `on_message` and `on_done` all
//! run on the owning thread during a pump.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use horizon_lattice_bridge::{BackgroundWork, Engine};
//! use parking_lot::Mutex;
//!
//! let engine = Engine::new();
//! let results = Arc::new(Mutex::new(Vec::new()));
//! let sink = results.clone();
//!
//! let task = BackgroundWork::<i32>::new(|task| {
//!     for n in [1, 2, 3] {
//!         task.yield_value(n * 10)?;
//!     }
//!     Ok(())
//! })
//! .on_progress(move |value| sink.lock().push(value))
//! .start(engine.handle())
//! .unwrap();
//!
//! task.wait().unwrap();
//! assert_eq!(*results.lock(), vec![10, 20, 30]);
//! ```
//!
//! # Control Messages
//!
//! [`BackgroundTask::pause`], [`resume`](BackgroundTask::resume) and
//! [`stop`](BackgroundTask::stop) send [`Control`] messages the worker
//! observes when it calls [`TaskContext::check_pause`] or
//! [`TaskContext::check_message`]. A stop surfaces in the worker as an error
//! of kind [`HostError::STOPPED`]; returning it with `?` ends the work
//! cleanly. Any other error is reported to the engine's background error
//! handler, and `on_done` still runs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use parking_lot::{Condvar, Mutex};

use crate::engine::EventLoop;
use crate::error::{BridgeError, Result};
use crate::logging::{PerfSpan, span_names};
use crate::protection::{CallbackProtection, CrossBoundaryError, EngineFrame, HostError, HostResult};
use crate::registry::CallbackHandle;
use crate::timer::{NativeDelay, NativeTimerId};

/// Default interval between polls of the worker's output (about 60 Hz).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(16);

type WorkFn<R, M> = Box<dyn FnOnce(&mut TaskContext<R, M>) -> HostResult<()> + Send + 'static>;
type ProgressFn<R> = Box<dyn FnMut(R) + Send + 'static>;
type MessageFn<M> = Box<dyn FnMut(M) + Send + 'static>;
type DoneFn = Box<dyn FnOnce() + Send + 'static>;

/// A message from the owning thread to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control<M> {
    /// Block at the next [`TaskContext::check_pause`].
    Pause,
    /// Release a paused worker.
    Resume,
    /// Ask the worker to finish.
    Stop,
    /// An application message.
    Message(M),
}

/// What a worker sends back.
enum Output<R, M> {
    Progress(R),
    Message(M),
    Failed(CrossBoundaryError),
    Done,
}

/// Configuration for a [`BackgroundWork`].
#[derive(Debug, Clone)]
pub struct BackgroundConfig {
    /// Name for the worker thread.
    pub name: String,
    /// Stack size for the worker thread in bytes. `None` uses the default.
    pub stack_size: Option<usize>,
    /// How often the owning thread drains the worker's output.
    pub poll_interval: Duration,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            name: "horizon-background".to_string(),
            stack_size: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// The worker's side of a background task.
pub struct TaskContext<R, M = ()> {
    output: Sender<Output<R, M>>,
    control: Receiver<Control<M>>,
    paused: bool,
    /// Application messages seen while draining for control messages.
    held: VecDeque<M>,
}

fn stopped() -> HostError {
    HostError::new(HostError::STOPPED, "background work stopped")
}

impl<R, M> TaskContext<R, M> {
    /// Send a result to `on_progress`.
    ///
    /// # Errors
    ///
    /// Fails with kind [`HostError::STOPPED`] once the engine is gone.
    pub fn yield_value(&self, value: R) -> HostResult<()> {
        self.output.send(Output::Progress(value)).map_err(|_| stopped())
    }

    /// Send a message to `on_message`.
    pub fn send_message(&self, message: M) -> HostResult<()> {
        self.output.send(Output::Message(message)).map_err(|_| stopped())
    }

    /// Take the next message without blocking.
    ///
    /// Pause and resume update the pause state and are returned as well.
    ///
    /// # Errors
    ///
    /// Fails with kind [`HostError::STOPPED`] when a stop was requested.
    pub fn check_message(&mut self) -> HostResult<Option<Control<M>>> {
        if let Some(message) = self.held.pop_front() {
            return Ok(Some(Control::Message(message)));
        }
        match self.control.try_recv() {
            Ok(control) => self.handle_control(control).map(Some),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    /// Block until the next message arrives.
    ///
    /// # Errors
    ///
    /// Fails with kind [`HostError::STOPPED`] when a stop was requested or the
    /// task handle was dropped.
    pub fn wait_message(&mut self) -> HostResult<Control<M>> {
        if let Some(message) = self.held.pop_front() {
            return Ok(Control::Message(message));
        }
        let control = self.control.recv().map_err(|_| stopped())?;
        self.handle_control(control)
    }

    /// Apply pending control messages, then block while paused.
    ///
    /// Application messages received here are kept for
    /// [`check_message`](Self::check_message).
    ///
    /// # Errors
    ///
    /// Fails with kind [`HostError::STOPPED`] when a stop was requested.
    pub fn check_pause(&mut self) -> HostResult<()> {
        loop {
            match self.control.try_recv() {
                Ok(control) => self.hold(control)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.paused = false;
                    break;
                }
            }
        }
        while self.paused {
            let control = self.control.recv().map_err(|_| stopped())?;
            self.hold(control)?;
        }
        Ok(())
    }

    /// Check if the worker is paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    fn hold(&mut self, control: Control<M>) -> HostResult<()> {
        if let Control::Message(message) = self.handle_control(control)? {
            self.held.push_back(message);
        }
        Ok(())
    }

    fn handle_control(&mut self, control: Control<M>) -> HostResult<Control<M>> {
        match control {
            Control::Pause => self.paused = true,
            Control::Resume => self.paused = false,
            Control::Stop => return Err(stopped()),
            Control::Message(_) => {}
        }
        Ok(control)
    }
}

/// Work to run on a dedicated thread, with owning-thread callbacks.
pub struct BackgroundWork<R, M = ()> {
    config: BackgroundConfig,
    work: WorkFn<R, M>,
    on_progress: Option<ProgressFn<R>>,
    on_message: Option<MessageFn<M>>,
    on_done: Option<DoneFn>,
}

impl<R: Send + 'static, M: Send + 'static> BackgroundWork<R, M> {
    /// Create background work from a closure run on the worker thread.
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce(&mut TaskContext<R, M>) -> HostResult<()> + Send + 'static,
    {
        Self {
            config: BackgroundConfig::default(),
            work: Box::new(work),
            on_progress: None,
            on_message: None,
            on_done: None,
        }
    }

    /// Set the worker thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the stack size for the worker thread.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    /// Set how often the owning thread drains the worker's output.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Called on the owning thread for every yielded value.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: FnMut(R) + Send + 'static,
    {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Called on the owning thread for every message the worker sends.
    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: FnMut(M) + Send + 'static,
    {
        self.on_message = Some(Box::new(callback));
        self
    }

    /// Called once on the owning thread after everything else was delivered.
    pub fn on_done<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_done = Some(Box::new(callback));
        self
    }

    /// Spawn the worker and start polling on `engine`.
    pub fn start<E: EventLoop + 'static>(self, engine: E) -> Result<BackgroundTask<M>> {
        self.start_shared(Arc::new(engine))
    }

    /// Spawn the worker and start polling on a shared engine.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DispatchClosed`] if the engine is gone, or
    /// [`BridgeError::Spawn`] if the thread cannot be created.
    pub fn start_shared(self, engine: Arc<dyn EventLoop>) -> Result<BackgroundTask<M>> {
        let (output_tx, output_rx) = unbounded();
        let (control_tx, control_rx) = unbounded();
        let shared = Arc::new(WorkShared {
            engine: engine.clone(),
            done: Mutex::new(false),
            finished: Condvar::new(),
        });

        let poller = Arc::new(Mutex::new(Poller {
            output: output_rx,
            on_progress: self.on_progress,
            on_message: self.on_message,
            on_done: self.on_done,
            interval: self.config.poll_interval,
            callback: None,
            native: None,
        }));
        let callback = {
            let poller = poller.clone();
            let shared = shared.clone();
            engine.callbacks().register(move |_args| {
                // A pump from inside a callback re-enters here; the outer poll
                // has already re-armed.
                let Some(mut poller) = poller.try_lock() else {
                    return Ok(String::new());
                };
                poller.poll(&shared).map(|()| String::new())
            })
        };
        {
            let mut poller = poller.lock();
            poller.callback = Some(callback);
            match engine.schedule_native_timer(NativeDelay::After(Duration::ZERO), callback) {
                Ok(id) => poller.native = Some(id),
                Err(err) => {
                    drop(poller);
                    engine.callbacks().unregister(callback);
                    return Err(err);
                }
            }
        }

        let mut builder = thread::Builder::new().name(self.config.name.clone());
        if let Some(stack_size) = self.config.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let work = self.work;
        let spawned = builder.spawn(move || {
            let mut task = TaskContext {
                output: output_tx,
                control: control_rx,
                paused: false,
                held: VecDeque::new(),
            };
            let result = CallbackProtection::protect(EngineFrame::Named("background work"), || work(&mut task));
            match result {
                Ok(()) => tracing::debug!(target: "horizon_lattice_bridge::background", "background work finished"),
                Err(err) if err.host_error().is_kind(HostError::STOPPED) => {
                    tracing::debug!(target: "horizon_lattice_bridge::background", "background work stopped");
                }
                Err(err) => {
                    tracing::debug!(target: "horizon_lattice_bridge::background", kind = err.kind(), "background work failed");
                    let _ = task.output.send(Output::Failed(err));
                }
            }
            let _ = task.output.send(Output::Done);
        });

        let worker = match spawned {
            Ok(worker) => worker,
            Err(err) => {
                if let Some(id) = poller.lock().native.take() {
                    engine.cancel_native_timer(id);
                }
                engine.callbacks().unregister(callback);
                return Err(BridgeError::Spawn(err));
            }
        };
        tracing::debug!(target: "horizon_lattice_bridge::background", name = %self.config.name, %callback, "background work started");

        Ok(BackgroundTask {
            control: control_tx,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl<R, M> std::fmt::Debug for BackgroundWork<R, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundWork")
            .field("config", &self.config)
            .field("has_on_progress", &self.on_progress.is_some())
            .field("has_on_message", &self.on_message.is_some())
            .field("has_on_done", &self.on_done.is_some())
            .finish()
    }
}

struct WorkShared {
    engine: Arc<dyn EventLoop>,
    /// Set after `on_done` has run.
    done: Mutex<bool>,
    finished: Condvar,
}

/// Owning-thread state: drains the worker's output.
struct Poller<R, M> {
    output: Receiver<Output<R, M>>,
    on_progress: Option<ProgressFn<R>>,
    on_message: Option<MessageFn<M>>,
    on_done: Option<DoneFn>,
    interval: Duration,
    callback: Option<CallbackHandle>,
    native: Option<NativeTimerId>,
}

impl<R, M> Poller<R, M> {
    fn poll(&mut self, shared: &WorkShared) -> HostResult<()> {
        let Some(callback) = self.callback else {
            return Ok(());
        };
        // Re-armed first so a panicking callback does not stop delivery.
        self.native = shared
            .engine
            .schedule_native_timer(NativeDelay::After(self.interval), callback)
            .ok();

        let mut failure = None;
        loop {
            match self.output.try_recv() {
                Ok(Output::Progress(value)) => {
                    if let Some(on_progress) = self.on_progress.as_mut() {
                        on_progress(value);
                    }
                }
                Ok(Output::Message(message)) => {
                    if let Some(on_message) = self.on_message.as_mut() {
                        on_message(message);
                    }
                }
                Ok(Output::Failed(err)) => failure = Some(err),
                Ok(Output::Done) | Err(TryRecvError::Disconnected) => {
                    self.finish(shared, callback);
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        failure.map_or(Ok(()), |err| Err(err.into_host_error()))
    }

    fn finish(&mut self, shared: &WorkShared, callback: CallbackHandle) {
        if let Some(id) = self.native.take() {
            shared.engine.cancel_native_timer(id);
        }
        self.callback = None;
        shared.engine.callbacks().unregister(callback);
        if let Some(on_done) = self.on_done.take() {
            on_done();
        }
        *shared.done.lock() = true;
        shared.finished.notify_all();
        tracing::trace!(target: "horizon_lattice_bridge::background", %callback, "background output drained");
    }
}

/// A running background task.
///
/// Dropping the handle does not stop the worker; its output is still
/// delivered.
pub struct BackgroundTask<M = ()> {
    control: Sender<Control<M>>,
    shared: Arc<WorkShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Send + 'static> BackgroundTask<M> {
    /// Send a message to the worker.
    ///
    /// Messages sent after the worker finished are dropped.
    pub fn send_message(&self, message: M) -> &Self {
        self.send(Control::Message(message))
    }

    /// Ask the worker to block at its next pause check.
    pub fn pause(&self) -> &Self {
        self.send(Control::Pause)
    }

    /// Release a paused worker.
    pub fn resume(&self) -> &Self {
        self.send(Control::Resume)
    }

    /// Ask the worker to finish.
    pub fn stop(&self) -> &Self {
        self.send(Control::Stop)
    }

    fn send(&self, control: Control<M>) -> &Self {
        if self.control.send(control).is_err() {
            tracing::trace!(target: "horizon_lattice_bridge::background", "control message dropped; worker has exited");
        }
        self
    }

    /// Check if everything was delivered and `on_done` has run.
    pub fn is_done(&self) -> bool {
        *self.shared.done.lock()
    }

    /// Block until `on_done` has run.
    ///
    /// On the owning thread this pumps the engine while waiting.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DispatchClosed`] if the engine is torn down
    /// first.
    pub fn wait(&self) -> Result<()> {
        let _span = PerfSpan::new(span_names::BACKGROUND_WAIT);
        let engine = &self.shared.engine;
        if engine.is_owning_thread() {
            while !self.is_done() {
                if engine.is_closed() {
                    return Err(BridgeError::DispatchClosed);
                }
                engine.pump(true)?;
            }
        } else {
            let mut done = self.shared.done.lock();
            while !*done {
                if engine.is_closed() {
                    return Err(BridgeError::DispatchClosed);
                }
                self.shared.finished.wait_for(&mut done, engine.keepalive_tick());
            }
        }
        self.join();
        Ok(())
    }

    /// Wait for the worker thread to exit.
    ///
    /// Returns `true` if the worker was joined, `false` if it was already
    /// joined or panicked outside the work closure.
    pub fn join(&self) -> bool {
        let worker = self.worker.lock().take();
        worker.is_some_and(|worker| worker.join().is_ok())
    }
}

impl<M> std::fmt::Debug for BackgroundTask<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("done", &*self.shared.done.lock())
            .finish()
    }
}

static_assertions::assert_impl_all!(BackgroundTask<String>: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (TaskContext<u32, &'static str>, Sender<Control<&'static str>>, Receiver<Output<u32, &'static str>>) {
        let (output_tx, output_rx) = unbounded();
        let (control_tx, control_rx) = unbounded();
        let task = TaskContext {
            output: output_tx,
            control: control_rx,
            paused: false,
            held: VecDeque::new(),
        };
        (task, control_tx, output_rx)
    }

    #[test]
    fn test_check_message_tracks_pause_state() {
        let (mut task, control, _output) = context();
        assert_eq!(task.check_message().unwrap(), None);

        control.send(Control::Pause).unwrap();
        assert_eq!(task.check_message().unwrap(), Some(Control::Pause));
        assert!(task.is_paused());

        control.send(Control::Resume).unwrap();
        assert_eq!(task.check_message().unwrap(), Some(Control::Resume));
        assert!(!task.is_paused());
    }

    #[test]
    fn test_stop_is_a_stopped_error() {
        let (mut task, control, _output) = context();
        control.send(Control::Stop).unwrap();
        let err = task.check_message().unwrap_err();
        assert!(err.is_kind(HostError::STOPPED));
    }

    #[test]
    fn test_check_pause_keeps_application_messages() {
        let (mut task, control, _output) = context();
        control.send(Control::Message("first")).unwrap();
        control.send(Control::Pause).unwrap();
        control.send(Control::Message("second")).unwrap();
        control.send(Control::Resume).unwrap();

        task.check_pause().unwrap();
        assert!(!task.is_paused());
        assert_eq!(task.check_message().unwrap(), Some(Control::Message("first")));
        assert_eq!(task.wait_message().unwrap(), Control::Message("second"));
    }

    #[test]
    fn test_check_pause_blocks_until_resumed() {
        let (mut task, control, _output) = context();
        control.send(Control::Pause).unwrap();

        let resumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            control.send(Control::Resume).unwrap();
            control
        });
        let started = std::time::Instant::now();
        task.check_pause().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(15));
        drop(resumer.join().unwrap());
    }

    #[test]
    fn test_yield_after_receiver_dropped_is_stopped() {
        let (task, _control, output) = context();
        task.yield_value(1).unwrap();
        drop(output);
        assert!(task.yield_value(2).unwrap_err().is_kind(HostError::STOPPED));
    }
}

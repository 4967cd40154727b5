//! Timer scheduler: repeating callback sequences on the engine's delay queue.
//!
//! A [`TimerScheduler`] owns an ordered list of steps, a repeat count and an
//! interval. Each firing runs the step at the current position, records its
//! return value and arms the next native timer. A full pass over the steps
//! consumes one repeat; when no repeats remain the timer is exhausted and its
//! `at_end` hook runs.
//!
//! ```text
//! Idle --start--> Running --cancel--> Idle --resume--> Running
//!                    |
//!                    +--last repeat--> Exhausted
//! ```
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use horizon_lattice_bridge::{Engine, Repeat, TimerBuilder};
//!
//! let engine = Engine::new();
//! let timer = TimerBuilder::new()
//!     .interval(Duration::from_millis(5))
//!     .repeat(Repeat::Times(3))
//!     .step(|ctx| Ok(ctx.fired()))
//!     .start(engine.handle())
//!     .unwrap();
//!
//! assert_eq!(timer.wait().unwrap(), Some(3));
//! ```
//!
//! # Drift Compensation
//!
//! A standard timer arms each firing `interval` after the previous step
//! finished, so step run time and pump latency accumulate. A drift-compensated
//! timer arms each firing `interval` after the previous firing's intended
//! time, clamped to zero, so the average period tracks the interval.
//!
//! # Threading
//!
//! Timer state is behind a lock, so any thread may call into a timer, but
//! steps and the `at_end` hook always run on the engine's owning thread. A
//! cancel from another thread takes effect at once and posts `at_end` to the
//! owning thread. No lock is held while a step runs: a step may cancel, skip,
//! reset or edit its own timer.
//!
//! # Step Failures
//!
//! A failure whose kind matches the timer's [`CancelPolicy`] cancels the
//! timer. Any other failure is passed to the engine's background error
//! handler, and the timer still advances to the next step and re-arms as if
//! the step had succeeded. A failing step records no return value.

use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use slotmap::{SlotMap, new_key_type};

use crate::engine::EventLoop;
use crate::error::{BridgeError, Result, TimerError};
use crate::logging::{PerfSpan, span_names};
use crate::protection::{CallbackProtection, EngineFrame, HostError, HostResult};
use crate::registry::CallbackHandle;
use crate::timer::{NativeDelay, NativeTimerId};

new_key_type! {
    /// A unique identifier for a timer step.
    pub struct StepId;
}

/// A timer step. Its return value becomes the timer's return value.
pub type Step<T> = Box<dyn for<'a> FnMut(&mut StepContext<'a, T>) -> HostResult<T> + Send + 'static>;

/// Hook run when a timer is cancelled or exhausted.
pub type EndHook<T> = Box<dyn FnMut(&TimerScheduler<T>) -> HostResult<()> + Send + 'static>;

/// Computes the next interval from the timer's status.
///
/// Runs with the timer locked and must not call back into the timer.
pub type DynamicInterval = Arc<dyn Fn(&TimerStatus) -> Duration + Send + Sync + 'static>;

/// How long to wait between firings.
#[derive(Clone)]
pub enum Interval {
    /// A fixed delay.
    Fixed(Duration),
    /// Defer each firing until the engine is idle.
    Idle,
    /// Compute each delay when the next firing is armed.
    Dynamic(DynamicInterval),
}

impl Interval {
    /// A fixed delay in milliseconds.
    pub fn millis(ms: u64) -> Self {
        Self::Fixed(Duration::from_millis(ms))
    }

    /// A delay computed before every firing.
    pub fn dynamic<F>(compute: F) -> Self
    where
        F: Fn(&TimerStatus) -> Duration + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(compute))
    }

    /// The fixed delay, if this is one.
    pub fn as_fixed(&self) -> Option<Duration> {
        match self {
            Self::Fixed(d) => Some(*d),
            _ => None,
        }
    }

    /// Check if this defers to the idle queue.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl From<Duration> for Interval {
    fn from(duration: Duration) -> Self {
        Self::Fixed(duration)
    }
}

impl fmt::Debug for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Self::Idle => write!(f, "Idle"),
            Self::Dynamic(_) => write!(f, "Dynamic(..)"),
        }
    }
}

/// How many passes over the steps a timer makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// A finite number of passes.
    Times(u32),
    /// Repeat until cancelled.
    Forever,
}

impl From<u32> for Repeat {
    fn from(times: u32) -> Self {
        Self::Times(times)
    }
}

/// Which step failures cancel the timer instead of propagating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelPolicy {
    /// Always propagate; the timer keeps running.
    Never,
    /// Cancel on any failure.
    Any,
    /// Cancel when the error kind is in the list.
    Kinds(Vec<Cow<'static, str>>),
}

impl CancelPolicy {
    /// Cancel on the given error kinds.
    pub fn kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Cow<'static, str>>,
    {
        Self::Kinds(kinds.into_iter().map(Into::into).collect())
    }

    /// Check if `err` should cancel the timer.
    pub fn matches(&self, err: &HostError) -> bool {
        match self {
            Self::Never => false,
            Self::Any => true,
            Self::Kinds(kinds) => kinds.iter().any(|kind| err.is_kind(kind)),
        }
    }
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self::kinds([HostError::RUNTIME_ERROR, HostError::PANIC])
    }
}

/// Refers to a step by id or by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRef {
    /// A step id returned by [`TimerScheduler::add_step`].
    Id(StepId),
    /// A position in the step sequence.
    Index(usize),
}

impl From<StepId> for StepRef {
    fn from(id: StepId) -> Self {
        Self::Id(id)
    }
}

impl From<usize> for StepRef {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// Lifecycle state of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Not scheduled: never started, or cancelled.
    Idle,
    /// Scheduled or firing.
    Running,
    /// Ran out of repeats.
    Exhausted,
}

/// A snapshot of a timer's state.
#[derive(Debug, Clone)]
pub struct TimerStatus {
    /// Whether the timer is running.
    pub running: bool,
    /// The lifecycle state.
    pub state: TimerState,
    /// The configured interval.
    pub interval: Interval,
    /// Position of the next step to run.
    pub step_index: usize,
    /// Number of steps.
    pub step_count: usize,
    /// Passes left, counting the current one.
    pub remaining: Repeat,
    /// Steps run since the last start.
    pub fired: u64,
    /// The failure cancellation policy.
    pub cancel_on_exception: CancelPolicy,
    /// Whether intervals are drift compensated.
    pub drift_compensated: bool,
}

/// What a running step can see of its timer.
pub struct StepContext<'a, T> {
    timer: &'a TimerScheduler<T>,
    previous: Option<T>,
    step_index: usize,
    fired: u64,
}

impl<'a, T> StepContext<'a, T> {
    /// The timer running this step.
    pub fn timer(&self) -> &'a TimerScheduler<T> {
        self.timer
    }

    /// The value returned by the previous step.
    pub fn previous(&self) -> Option<&T> {
        self.previous.as_ref()
    }

    /// Take the value returned by the previous step.
    pub fn take_previous(&mut self) -> Option<T> {
        self.previous.take()
    }

    /// Position of this step in the sequence.
    pub fn step_index(&self) -> usize {
        self.step_index
    }

    /// Steps run since the last start, including this one.
    pub fn fired(&self) -> u64 {
        self.fired
    }
}

/// An optional first step with its own delay, run once per start.
pub struct StartParams<T> {
    /// Delay before the start step. `None` uses the interval.
    pub delay: Option<Duration>,
    /// The start step. It does not consume a repeat.
    pub step: Option<Step<T>>,
}

impl<T> StartParams<T> {
    /// Empty start parameters.
    pub fn new() -> Self {
        Self {
            delay: None,
            step: None,
        }
    }

    /// Set the delay before the start step.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set the start step.
    pub fn step<F>(mut self, step: F) -> Self
    where
        F: for<'a> FnMut(&mut StepContext<'a, T>) -> HostResult<T> + Send + 'static,
    {
        self.step = Some(Box::new(step));
        self
    }
}

impl<T> Default for StartParams<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for StartParams<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartParams")
            .field("delay", &self.delay)
            .field("has_step", &self.step.is_some())
            .finish()
    }
}

/// Configuration for a [`TimerScheduler`].
pub struct TimerConfig<T> {
    /// Delay between firings.
    pub interval: Interval,
    /// Number of passes over the steps.
    pub repeat: Repeat,
    /// The step sequence.
    pub steps: Vec<Step<T>>,
    /// Which step failures cancel the timer.
    pub cancel_on_exception: CancelPolicy,
    /// Hook run on cancel or exhaustion.
    pub at_end: Option<EndHook<T>>,
    /// Optional start step and delay.
    pub start_params: StartParams<T>,
    /// Compensate for drift between firings.
    pub drift_compensated: bool,
}

impl<T> Default for TimerConfig<T> {
    fn default() -> Self {
        Self {
            interval: Interval::Fixed(Duration::ZERO),
            repeat: Repeat::Times(1),
            steps: Vec::new(),
            cancel_on_exception: CancelPolicy::default(),
            at_end: None,
            start_params: StartParams::new(),
            drift_compensated: false,
        }
    }
}

impl<T> fmt::Debug for TimerConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerConfig")
            .field("interval", &self.interval)
            .field("repeat", &self.repeat)
            .field("steps", &self.steps.len())
            .field("cancel_on_exception", &self.cancel_on_exception)
            .field("has_at_end", &self.at_end.is_some())
            .field("start_params", &self.start_params)
            .field("drift_compensated", &self.drift_compensated)
            .finish()
    }
}

/// Builder for creating TimerSchedulers with custom configuration.
pub struct TimerBuilder<T> {
    config: TimerConfig<T>,
}

impl<T> Default for TimerBuilder<T> {
    fn default() -> Self {
        Self {
            config: TimerConfig::default(),
        }
    }
}

impl<T> fmt::Debug for TimerBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerBuilder").field("config", &self.config).finish()
    }
}

impl<T: Send + 'static> TimerBuilder<T> {
    /// Create a new TimerBuilder with default settings.
    pub fn new() -> Self {
        Self {
            config: TimerConfig::default(),
        }
    }

    /// Set the interval between firings.
    pub fn interval(mut self, interval: impl Into<Interval>) -> Self {
        self.config.interval = interval.into();
        self
    }

    /// Set the number of passes over the steps.
    pub fn repeat(mut self, repeat: impl Into<Repeat>) -> Self {
        self.config.repeat = repeat.into();
        self
    }

    /// Append a step.
    pub fn step<F>(mut self, step: F) -> Self
    where
        F: for<'a> FnMut(&mut StepContext<'a, T>) -> HostResult<T> + Send + 'static,
    {
        self.config.steps.push(Box::new(step));
        self
    }

    /// Append boxed steps.
    pub fn steps(mut self, steps: impl IntoIterator<Item = Step<T>>) -> Self {
        self.config.steps.extend(steps);
        self
    }

    /// Set which step failures cancel the timer.
    pub fn cancel_on_exception(mut self, policy: CancelPolicy) -> Self {
        self.config.cancel_on_exception = policy;
        self
    }

    /// Set the hook run on cancel or exhaustion.
    pub fn at_end<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&TimerScheduler<T>) -> HostResult<()> + Send + 'static,
    {
        self.config.at_end = Some(Box::new(hook));
        self
    }

    /// Set the start step and delay.
    pub fn start_params(mut self, params: StartParams<T>) -> Self {
        self.config.start_params = params;
        self
    }

    /// Compensate for drift between firings.
    pub fn drift_compensated(mut self, enabled: bool) -> Self {
        self.config.drift_compensated = enabled;
        self
    }

    /// Build an idle timer on `engine`.
    pub fn build<E: EventLoop + 'static>(self, engine: E) -> TimerScheduler<T> {
        self.build_shared(Arc::new(engine))
    }

    /// Build an idle timer on a shared engine.
    pub fn build_shared(self, engine: Arc<dyn EventLoop>) -> TimerScheduler<T> {
        TimerScheduler::from_config(engine, self.config)
    }

    /// Build and start the timer.
    pub fn start<E: EventLoop + 'static>(self, engine: E) -> Result<TimerScheduler<T>> {
        let timer = self.build(engine);
        timer.start()?;
        Ok(timer)
    }
}

/// How the next native timer is armed.
#[derive(Debug, Clone)]
enum Arm {
    /// From now, honouring the start delay.
    Fresh,
    /// From now, with an optional one-off interval.
    Resume(Option<Interval>),
    /// After a firing.
    Next,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Start,
    Step(StepId),
}

struct TimerInner<T> {
    interval: Interval,
    repeat: Repeat,
    remaining: Repeat,
    steps: SlotMap<StepId, Option<Step<T>>>,
    order: Vec<StepId>,
    index: usize,
    /// Set when the position is moved during a firing.
    touched: bool,
    state: TimerState,
    /// Outside a firing, `Some` iff the timer is running.
    native: Option<NativeTimerId>,
    callback: Option<CallbackHandle>,
    /// Bumped by every cancel, skip and start; a firing that sees a new epoch
    /// does not re-arm.
    epoch: u64,
    fired: u64,
    return_value: Option<T>,
    at_end: Option<EndHook<T>>,
    cancel_policy: CancelPolicy,
    drift: bool,
    /// Intended fire time of the pending firing.
    intended: Option<Instant>,
    start: StartParams<T>,
    pending_start: bool,
    /// An `at_end` hook is queued for the owning thread.
    ending: bool,
}

impl<T> TimerInner<T> {
    fn status(&self) -> TimerStatus {
        TimerStatus {
            running: self.state == TimerState::Running,
            state: self.state,
            interval: self.interval.clone(),
            step_index: self.index,
            step_count: self.order.len(),
            remaining: self.remaining,
            fired: self.fired,
            cancel_on_exception: self.cancel_policy.clone(),
            drift_compensated: self.drift,
        }
    }

    /// Wrap past the last step, consuming a repeat. Returns `true` when no
    /// repeats remain.
    fn wrap_if_needed(&mut self) -> bool {
        if self.index < self.order.len() {
            return false;
        }
        self.index = 0;
        match &mut self.remaining {
            Repeat::Forever => false,
            Repeat::Times(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
        }
    }

    fn resolve(&self, step: StepRef) -> Option<usize> {
        match step {
            StepRef::Id(id) => self.order.iter().position(|s| *s == id),
            StepRef::Index(index) => (index < self.order.len()).then_some(index),
        }
    }

    fn next_delay(&mut self, arm: &Arm) -> NativeDelay {
        let interval = match arm {
            Arm::Resume(Some(interval)) => interval.clone(),
            Arm::Fresh if self.pending_start => self
                .start
                .delay
                .map_or_else(|| self.interval.clone(), Interval::Fixed),
            _ => self.interval.clone(),
        };
        let delay = match interval {
            Interval::Fixed(d) => NativeDelay::After(d),
            Interval::Idle => NativeDelay::Idle,
            Interval::Dynamic(compute) => NativeDelay::After(compute(&self.status())),
        };
        if !self.drift {
            return delay;
        }
        let NativeDelay::After(d) = delay else {
            self.intended = None;
            return delay;
        };
        let now = Instant::now();
        let target = match (arm, self.intended) {
            (Arm::Next, Some(previous)) => previous + d,
            _ => now + d,
        };
        self.intended = Some(target);
        NativeDelay::After(target.saturating_duration_since(now))
    }
}

struct TimerShared<T> {
    engine: Arc<dyn EventLoop>,
    inner: Mutex<TimerInner<T>>,
    finished: Condvar,
}

impl<T> Drop for TimerShared<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(id) = inner.native.take() {
            self.engine.cancel_native_timer(id);
        }
        if let Some(callback) = inner.callback.take() {
            self.engine.callbacks().unregister(callback);
        }
    }
}

/// A sequence of steps fired by the engine's timer facility.
///
/// Cloning yields another handle to the same timer. Dropping the last handle
/// cancels the timer without running `at_end`.
pub struct TimerScheduler<T> {
    shared: Arc<TimerShared<T>>,
}

impl<T> Clone for TimerScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

// Timers are shared between the owning thread and workers.
static_assertions::assert_impl_all!(TimerScheduler<u32>: Send, Sync, Clone);

impl<T: Send + 'static> TimerScheduler<T> {
    /// Create an idle single-step timer.
    pub fn new<E, F>(engine: E, interval: impl Into<Interval>, repeat: impl Into<Repeat>, step: F) -> Self
    where
        E: EventLoop + 'static,
        F: for<'a> FnMut(&mut StepContext<'a, T>) -> HostResult<T> + Send + 'static,
    {
        TimerBuilder::new()
            .interval(interval)
            .repeat(repeat)
            .step(step)
            .build(engine)
    }

    /// Create and start a single-step timer.
    pub fn started<E, F>(engine: E, interval: impl Into<Interval>, repeat: impl Into<Repeat>, step: F) -> Result<Self>
    where
        E: EventLoop + 'static,
        F: for<'a> FnMut(&mut StepContext<'a, T>) -> HostResult<T> + Send + 'static,
    {
        let timer = Self::new(engine, interval, repeat, step);
        timer.start()?;
        Ok(timer)
    }

    /// Create an idle, drift-compensated single-step timer.
    pub fn drift_compensated<E, F>(engine: E, interval: impl Into<Interval>, repeat: impl Into<Repeat>, step: F) -> Self
    where
        E: EventLoop + 'static,
        F: for<'a> FnMut(&mut StepContext<'a, T>) -> HostResult<T> + Send + 'static,
    {
        TimerBuilder::new()
            .interval(interval)
            .repeat(repeat)
            .step(step)
            .drift_compensated(true)
            .build(engine)
    }

    /// Create a builder.
    pub fn builder() -> TimerBuilder<T> {
        TimerBuilder::new()
    }

    fn from_config(engine: Arc<dyn EventLoop>, config: TimerConfig<T>) -> Self {
        let mut steps = SlotMap::with_key();
        let order = config
            .steps
            .into_iter()
            .map(|step| steps.insert(Some(step)))
            .collect();
        let inner = TimerInner {
            interval: config.interval,
            repeat: config.repeat,
            remaining: config.repeat,
            steps,
            order,
            index: 0,
            touched: false,
            state: TimerState::Idle,
            native: None,
            callback: None,
            epoch: 0,
            fired: 0,
            return_value: None,
            at_end: config.at_end,
            cancel_policy: config.cancel_on_exception,
            drift: config.drift_compensated,
            intended: None,
            start: config.start_params,
            pending_start: false,
            ending: false,
        };
        Self {
            shared: Arc::new(TimerShared {
                engine,
                inner: Mutex::new(inner),
                finished: Condvar::new(),
            }),
        }
    }

    /// Start the timer from the first step.
    ///
    /// Does nothing if the timer is already running.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::NoSteps`] if there is nothing to run, or
    /// [`BridgeError::DispatchClosed`] if the engine is gone.
    pub fn start(&self) -> Result<&Self> {
        let mut inner = self.shared.inner.lock();
        if inner.state == TimerState::Running {
            return Ok(self);
        }
        if inner.order.is_empty() && inner.start.step.is_none() {
            return Err(TimerError::NoSteps.into());
        }
        inner.remaining = inner.repeat;
        inner.index = 0;
        inner.fired = 0;
        inner.return_value = None;
        inner.intended = None;
        inner.pending_start = inner.start.step.is_some();
        inner.state = TimerState::Running;
        inner.epoch += 1;
        tracing::debug!(target: "horizon_lattice_bridge::scheduler", interval = ?inner.interval, repeat = ?inner.repeat, steps = inner.order.len(), "timer started");

        if inner.remaining == Repeat::Times(0) {
            drop(inner);
            self.finish(TimerState::Exhausted);
            return Ok(self);
        }
        self.arm(&mut inner, Arm::Fresh)?;
        Ok(self)
    }

    /// Replace the start parameters and start.
    pub fn start_with(&self, params: StartParams<T>) -> Result<&Self> {
        self.set_start_params(params);
        self.start()
    }

    /// Stop the timer and run `at_end`.
    ///
    /// Cancelling a timer that is not running is a no-op.
    pub fn cancel(&self) -> &Self {
        self.finish(TimerState::Idle);
        self
    }

    /// Alias for [`cancel`](Self::cancel).
    pub fn stop(&self) -> &Self {
        self.cancel()
    }

    /// Cancel, then start again from the stored configuration.
    pub fn restart(&self) -> Result<&Self> {
        self.restart_with(None, None)
    }

    /// Cancel, optionally replace the interval and steps, then start again.
    pub fn restart_with(&self, interval: Option<Interval>, steps: Option<Vec<Step<T>>>) -> Result<&Self> {
        self.cancel();
        {
            let mut inner = self.shared.inner.lock();
            if let Some(interval) = interval {
                inner.interval = interval;
            }
            if let Some(steps) = steps {
                inner.steps.clear();
                let order: Vec<StepId> = steps
                    .into_iter()
                    .map(|step| inner.steps.insert(Some(step)))
                    .collect();
                inner.order = order;
            }
        }
        self.start()
    }

    /// Resume from the current position without resetting it.
    ///
    /// `interval` overrides the wait before the next step only. Does nothing
    /// if the timer is already running.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::NothingToContinue`] if the timer is exhausted and
    /// [`TimerError::NoSteps`] if it has no steps.
    pub fn resume(&self, interval: Option<Interval>) -> Result<&Self> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            TimerState::Running => return Ok(self),
            TimerState::Exhausted => return Err(TimerError::NothingToContinue.into()),
            TimerState::Idle => {}
        }
        if inner.order.is_empty() {
            return Err(TimerError::NoSteps.into());
        }
        inner.state = TimerState::Running;
        inner.epoch += 1;
        inner.intended = None;
        tracing::debug!(target: "horizon_lattice_bridge::scheduler", step_index = inner.index, "timer resumed");
        self.arm(&mut inner, Arm::Resume(interval))?;
        Ok(self)
    }

    /// Abandon the current wait and move on to the next step.
    ///
    /// The next step is armed with the normal interval from now. Does nothing
    /// if the timer is not running.
    pub fn skip(&self) -> Result<&Self> {
        let mut inner = self.shared.inner.lock();
        if inner.state != TimerState::Running {
            return Ok(self);
        }
        if let Some(id) = inner.native.take() {
            self.shared.engine.cancel_native_timer(id);
        }
        inner.epoch += 1;
        inner.intended = None;
        let exhausted = if inner.pending_start {
            inner.pending_start = false;
            inner.order.is_empty()
        } else {
            inner.index += 1;
            inner.wrap_if_needed()
        };
        tracing::trace!(target: "horizon_lattice_bridge::scheduler", step_index = inner.index, exhausted, "timer skipped");
        if exhausted {
            drop(inner);
            self.finish(TimerState::Exhausted);
            return Ok(self);
        }
        self.arm(&mut inner, Arm::Fresh)?;
        Ok(self)
    }

    /// Move back to the first step without stopping.
    pub fn reset(&self) -> &Self {
        let mut inner = self.shared.inner.lock();
        inner.index = 0;
        inner.touched = true;
        self
    }

    /// Append a step.
    pub fn add_step<F>(&self, step: F) -> StepId
    where
        F: for<'a> FnMut(&mut StepContext<'a, T>) -> HostResult<T> + Send + 'static,
    {
        let mut inner = self.shared.inner.lock();
        let id = inner.steps.insert(Some(Box::new(step)));
        inner.order.push(id);
        id
    }

    /// Remove a step.
    ///
    /// Removing the last remaining step cancels the timer.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::InvalidStep`] for a stale id or out-of-range index.
    pub fn delete_step(&self, step: impl Into<StepRef>) -> Result<&Self> {
        let emptied = {
            let mut inner = self.shared.inner.lock();
            let pos = inner
                .resolve(step.into())
                .ok_or(BridgeError::from(TimerError::InvalidStep))?;
            let id = inner.order.remove(pos);
            inner.steps.remove(id);
            if pos < inner.index {
                inner.index -= 1;
            } else if pos == inner.index {
                inner.touched = true;
            }
            inner.order.is_empty()
        };
        if emptied {
            self.cancel();
        }
        Ok(self)
    }

    /// Get the step ids in order.
    pub fn step_ids(&self) -> Vec<StepId> {
        self.shared.inner.lock().order.clone()
    }

    /// Get the number of steps.
    pub fn step_count(&self) -> usize {
        self.shared.inner.lock().order.len()
    }

    /// Set the interval. Takes effect when the next firing is armed.
    pub fn set_interval(&self, interval: impl Into<Interval>) -> &Self {
        self.shared.inner.lock().interval = interval.into();
        self
    }

    /// The configured interval.
    pub fn interval(&self) -> Interval {
        self.shared.inner.lock().interval.clone()
    }

    /// Set the number of passes used by the next start.
    pub fn set_repeat(&self, repeat: impl Into<Repeat>) -> &Self {
        self.shared.inner.lock().repeat = repeat.into();
        self
    }

    /// Passes left, counting the current one.
    pub fn remaining(&self) -> Repeat {
        self.shared.inner.lock().remaining
    }

    /// Set which step failures cancel the timer.
    pub fn set_cancel_on_exception(&self, policy: CancelPolicy) -> &Self {
        self.shared.inner.lock().cancel_policy = policy;
        self
    }

    /// Which step failures cancel the timer.
    pub fn cancel_on_exception(&self) -> CancelPolicy {
        self.shared.inner.lock().cancel_policy.clone()
    }

    /// Set the hook run on cancel or exhaustion.
    pub fn set_at_end<F>(&self, hook: F) -> &Self
    where
        F: FnMut(&TimerScheduler<T>) -> HostResult<()> + Send + 'static,
    {
        self.shared.inner.lock().at_end = Some(Box::new(hook));
        self
    }

    /// Replace the start parameters used by the next start.
    pub fn set_start_params(&self, params: StartParams<T>) -> &Self {
        self.shared.inner.lock().start = params;
        self
    }

    /// The configured start delay.
    pub fn start_delay(&self) -> Option<Duration> {
        self.shared.inner.lock().start.delay
    }

    /// Check if a start step is configured.
    pub fn has_start_step(&self) -> bool {
        self.shared.inner.lock().start.step.is_some()
    }

    /// Check if the timer is running.
    pub fn is_running(&self) -> bool {
        self.state() == TimerState::Running
    }

    /// The lifecycle state.
    pub fn state(&self) -> TimerState {
        self.shared.inner.lock().state
    }

    /// A snapshot of the timer's state.
    pub fn status(&self) -> TimerStatus {
        self.shared.inner.lock().status()
    }

    /// The pending native timer, if one is armed.
    pub fn native_timer(&self) -> Option<NativeTimerId> {
        self.shared.inner.lock().native
    }

    fn arm(&self, inner: &mut TimerInner<T>, arm: Arm) -> Result<()> {
        let delay = inner.next_delay(&arm);
        let callback = match inner.callback {
            Some(callback) => callback,
            None => {
                let callback = self.register_fire_callback();
                inner.callback = Some(callback);
                callback
            }
        };
        match self.shared.engine.schedule_native_timer(delay, callback) {
            Ok(id) => {
                inner.native = Some(id);
                tracing::trace!(target: "horizon_lattice_bridge::scheduler", ?delay, step_index = inner.index, "timer armed");
                Ok(())
            }
            Err(err) => {
                inner.state = TimerState::Idle;
                inner.epoch += 1;
                self.shared.finished.notify_all();
                Err(err)
            }
        }
    }

    fn register_fire_callback(&self) -> CallbackHandle {
        let weak: Weak<TimerShared<T>> = Arc::downgrade(&self.shared);
        self.shared.engine.callbacks().register(move |_args| {
            let Some(shared) = weak.upgrade() else {
                return Ok(String::new());
            };
            TimerScheduler { shared }.fire().map(|()| String::new())
        })
    }

    /// Run the step at the current position and arm the next firing.
    ///
    /// A failure outside the cancel policy is returned to the engine after
    /// the timer has advanced and re-armed.
    #[tracing::instrument(skip(self), target = "horizon_lattice_bridge::scheduler", level = "trace")]
    fn fire(&self) -> HostResult<()> {
        let (slot, index, mut step, epoch, previous, fired) = {
            let mut inner = self.shared.inner.lock();
            inner.native = None;
            if inner.state != TimerState::Running {
                return Ok(());
            }
            inner.touched = false;
            let (slot, step) = if inner.pending_start {
                inner.pending_start = false;
                (Slot::Start, inner.start.step.take())
            } else {
                if inner.order.is_empty() || inner.wrap_if_needed() {
                    drop(inner);
                    self.finish(TimerState::Exhausted);
                    return Ok(());
                }
                let id = inner.order[inner.index];
                (Slot::Step(id), inner.steps.get_mut(id).and_then(Option::take))
            };
            inner.fired += 1;
            let previous = inner.return_value.take();
            (slot, inner.index, step, inner.epoch, previous, inner.fired)
        };

        let frame = match slot {
            Slot::Start => EngineFrame::TimerStart,
            Slot::Step(_) => EngineFrame::TimerStep(index),
        };
        let mut ctx = StepContext {
            timer: self,
            previous,
            step_index: index,
            fired,
        };
        let outcome = step
            .as_mut()
            .map(|step| CallbackProtection::protect(frame, || step(&mut ctx)));
        let previous = ctx.previous;

        let mut inner = self.shared.inner.lock();
        if let Some(step) = step {
            match slot {
                Slot::Start => {
                    if inner.start.step.is_none() {
                        inner.start.step = Some(step);
                    }
                }
                Slot::Step(id) => {
                    if let Some(entry) = inner.steps.get_mut(id) {
                        *entry = Some(step);
                    }
                }
            }
        }

        let mut propagate = None;
        match outcome {
            Some(Ok(value)) => inner.return_value = Some(value),
            Some(Err(err)) => {
                inner.return_value = previous;
                if inner.cancel_policy.matches(err.host_error()) {
                    tracing::debug!(target: "horizon_lattice_bridge::scheduler", kind = err.kind(), step_index = index, "step failed; cancelling timer");
                    let current = inner.epoch == epoch;
                    drop(inner);
                    if current {
                        self.finish(TimerState::Idle);
                    }
                    return Ok(());
                }
                tracing::debug!(target: "horizon_lattice_bridge::scheduler", kind = err.kind(), step_index = index, "step failed; propagating");
                propagate = Some(err);
            }
            None => inner.return_value = previous,
        }

        if inner.epoch == epoch && inner.state == TimerState::Running {
            let exhausted = match slot {
                Slot::Start => inner.order.is_empty(),
                Slot::Step(_) => {
                    if !inner.touched {
                        inner.index += 1;
                    }
                    inner.wrap_if_needed()
                }
            };
            inner.touched = false;
            if exhausted {
                drop(inner);
                self.finish(TimerState::Exhausted);
            } else if let Err(err) = self.arm(&mut inner, Arm::Next) {
                tracing::warn!(target: "horizon_lattice_bridge::scheduler", error = %err, "timer could not be re-armed");
            }
        }

        propagate.map_or(Ok(()), |err| Err(err.into_host_error()))
    }

    /// Leave the running state, release the native timer and run `at_end`.
    ///
    /// Off the owning thread the state changes here and the hook is posted to
    /// the owning thread; [`wait`](Self::wait) returns after it has run.
    fn finish(&self, state: TimerState) {
        let hook = {
            let mut inner = self.shared.inner.lock();
            if inner.state != TimerState::Running {
                return;
            }
            if let Some(id) = inner.native.take() {
                self.shared.engine.cancel_native_timer(id);
            }
            inner.state = state;
            inner.epoch += 1;
            inner.intended = None;
            tracing::debug!(target: "horizon_lattice_bridge::scheduler", ?state, fired = inner.fired, "timer finished");
            let hook = inner.at_end.take();
            if hook.is_some() && !self.shared.engine.is_owning_thread() {
                inner.ending = true;
            }
            hook
        };

        let Some(hook) = hook else {
            self.shared.finished.notify_all();
            return;
        };
        if self.shared.engine.is_owning_thread() {
            self.run_end_hook(hook);
            return;
        }

        // Shared so a refused post can hand the hook back.
        let slot = Arc::new(Mutex::new(Some(hook)));
        let queued = slot.clone();
        let timer = self.clone();
        let posted = self.shared.engine.post(Box::new(move || {
            if let Some(hook) = queued.lock().take() {
                timer.run_end_hook(hook);
            }
            Ok(())
        }));
        if let Err(err) = posted {
            tracing::debug!(target: "horizon_lattice_bridge::scheduler", error = %err, "at_end not run; engine is closed");
            let mut inner = self.shared.inner.lock();
            if inner.at_end.is_none() {
                inner.at_end = slot.lock().take();
            }
            inner.ending = false;
            self.shared.finished.notify_all();
        }
    }

    fn run_end_hook(&self, mut hook: EndHook<T>) {
        let result = CallbackProtection::protect(EngineFrame::AtEnd, || hook(self));
        {
            let mut inner = self.shared.inner.lock();
            if inner.at_end.is_none() {
                inner.at_end = Some(hook);
            }
            inner.ending = false;
        }
        if let Err(err) = result {
            tracing::error!(target: "horizon_lattice_bridge::scheduler", kind = err.kind(), "at_end failed\n{}", err.report());
        }
        self.shared.finished.notify_all();
    }
}

impl<T: Clone + Send + 'static> TimerScheduler<T> {
    /// The value returned by the most recent step.
    pub fn return_value(&self) -> Option<T> {
        self.shared.inner.lock().return_value.clone()
    }

    /// Block until the timer stops running and its `at_end` hook has run,
    /// then return the most recent step's value.
    ///
    /// On the owning thread this pumps the engine while waiting. Elsewhere it
    /// blocks until the owning thread finishes the timer.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DispatchClosed`] if the engine is torn down while
    /// the timer is running.
    pub fn wait(&self) -> Result<Option<T>> {
        let _span = PerfSpan::new(span_names::TIMER_WAIT);
        let engine = &self.shared.engine;
        if engine.is_owning_thread() {
            loop {
                {
                    let inner = self.shared.inner.lock();
                    if inner.state != TimerState::Running && !inner.ending {
                        return Ok(inner.return_value.clone());
                    }
                }
                if engine.is_closed() {
                    return Err(BridgeError::DispatchClosed);
                }
                engine.pump(true)?;
            }
        }

        let mut inner = self.shared.inner.lock();
        while inner.state == TimerState::Running || inner.ending {
            if engine.is_closed() {
                return Err(BridgeError::DispatchClosed);
            }
            self.shared
                .finished
                .wait_for(&mut inner, engine.keepalive_tick());
        }
        Ok(inner.return_value.clone())
    }
}

impl<T> fmt::Debug for TimerScheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("TimerScheduler")
            .field("state", &inner.state)
            .field("interval", &inner.interval)
            .field("step_index", &inner.index)
            .field("steps", &inner.order.len())
            .field("remaining", &inner.remaining)
            .finish()
    }
}

//! Logging facilities for Horizon Lattice Bridge.
//!
//! The bridge uses the `tracing` crate for instrumentation and never installs
//! a subscriber itself. To see logs, install one in your application:
//!
//! ```ignore
//! fn main() {
//!     tracing_subscriber::fmt()
//!         .with_env_filter("horizon_lattice_bridge::dispatcher=trace")
//!         .init();
//! }
//! ```
//!
//! Pump timings are recorded under [`span_names::PUMP`] through [`PerfSpan`].

/// Span names used throughout the bridge for tracing.
pub mod span_names {
    /// Engine pump span.
    pub const PUMP: &str = "horizon_lattice_bridge::pump";
    /// Blocking run loop span.
    pub const RUN_LOOP: &str = "horizon_lattice_bridge::run_loop";
    /// Timer wait span.
    pub const TIMER_WAIT: &str = "horizon_lattice_bridge::timer_wait";
    /// Background task wait span.
    pub const BACKGROUND_WAIT: &str = "horizon_lattice_bridge::background_wait";
}

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Engine lifecycle and pump target.
    pub const ENGINE: &str = "horizon_lattice_bridge::engine";
    /// Cross-thread dispatch target.
    pub const DISPATCHER: &str = "horizon_lattice_bridge::dispatcher";
    /// Native delay queue target.
    pub const TIMER: &str = "horizon_lattice_bridge::timer";
    /// Timer scheduler target.
    pub const SCHEDULER: &str = "horizon_lattice_bridge::scheduler";
    /// Background work target.
    pub const BACKGROUND: &str = "horizon_lattice_bridge::background";
    /// Callback registry and protection target.
    pub const CALLBACK: &str = "horizon_lattice_bridge::callback";
    /// Performance spans target.
    pub const PERF: &str = "horizon_lattice_bridge::perf";
}

/// A guard that records a performance span while it is alive.
///
/// ```
/// use horizon_lattice_bridge::logging::{PerfSpan, span_names};
///
/// {
///     let _span = PerfSpan::new(span_names::PUMP);
///     // ... timed work ...
/// }
/// ```
pub struct PerfSpan {
    #[allow(dead_code)]
    span: tracing::span::EnteredSpan,
}

impl PerfSpan {
    /// Create a new performance span.
    ///
    /// The span will be active until the guard is dropped.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!(target: "horizon_lattice_bridge::perf", "perf", operation = name);
        Self {
            span: span.entered(),
        }
    }
}

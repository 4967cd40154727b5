//! Owning-thread verification for the engine.
//!
//! An engine is bound to the thread that created it. Anything that pumps the
//! engine or touches its native timers must run there; everything else goes
//! through the [`MainThreadDispatcher`](crate::MainThreadDispatcher).
//!
//! ```
//! use horizon_lattice_bridge::thread_check::ThreadAffinity;
//!
//! let affinity = ThreadAffinity::current();
//! assert!(affinity.is_same_thread());
//! assert!(affinity.check("pump").is_ok());
//!
//! std::thread::spawn(move || {
//!     assert!(affinity.check("pump").is_err());
//! })
//! .join()
//! .unwrap();
//! ```

use std::thread::ThreadId;

use crate::error::{BridgeError, Result};

/// Records which thread an object belongs to.
#[derive(Debug, Clone, Copy)]
pub struct ThreadAffinity {
    thread_id: ThreadId,
}

impl Default for ThreadAffinity {
    fn default() -> Self {
        Self::current()
    }
}

impl ThreadAffinity {
    /// Bind to the current thread.
    #[inline]
    pub fn current() -> Self {
        Self {
            thread_id: std::thread::current().id(),
        }
    }

    /// Get the thread ID this affinity is bound to.
    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Check if the current thread matches this affinity.
    #[inline]
    pub fn is_same_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Return [`BridgeError::WrongThread`] when called off the owning thread.
    #[inline]
    pub fn check(&self, operation: &'static str) -> Result<()> {
        if self.is_same_thread() {
            Ok(())
        } else {
            tracing::debug!(
                target: "horizon_lattice_bridge::engine",
                operation,
                owner = ?self.thread_id,
                "owning-thread operation attempted from another thread"
            );
            Err(BridgeError::WrongThread { operation })
        }
    }

    /// Assert that we are on the owning thread.
    ///
    /// # Panics
    ///
    /// Panics with a descriptive message if called from a different thread.
    #[inline]
    pub fn assert_same_thread(&self, operation: &str) {
        if !self.is_same_thread() {
            self.panic_wrong_thread(operation);
        }
    }

    /// Debug-only assertion that we are on the owning thread.
    #[inline]
    pub fn debug_assert_same_thread(&self, operation: &str) {
        #[cfg(debug_assertions)]
        self.assert_same_thread(operation);
        #[cfg(not(debug_assertions))]
        let _ = operation;
    }

    #[cold]
    #[inline(never)]
    fn panic_wrong_thread(&self, operation: &str) -> ! {
        let current = std::thread::current();
        let current_name = current.name().unwrap_or("<unnamed>");
        let current_id = current.id();

        panic!(
            "\n\
            ══════════════════════════════════════════════════════════════════════\n\
            ENGINE THREAD VIOLATION\n\
            ══════════════════════════════════════════════════════════════════════\n\
            \n\
            `{operation}` must run on the engine's owning thread.\n\
            \n\
            Engine owner: {:?}\n\
            Current thread: \"{current_name}\" (ID: {current_id:?})\n\
            \n\
            Use MainThreadDispatcher::run_on_owning_thread or post to hand\n\
            the work to the owning thread.\n\
            ══════════════════════════════════════════════════════════════════════",
            self.thread_id
        )
    }
}

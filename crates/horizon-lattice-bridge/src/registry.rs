//! Callback registry mapping engine-visible handles to host closures.
//!
//! The engine never holds a host closure directly. It holds a
//! [`CallbackHandle`], and every invocation goes back through the registry
//! (see [`crate::protection::CallbackProtection::invoke_protected`]).
//!
//! Handles are generational slot keys: a slot may be reused after its entry is
//! removed, but the new entry gets a new generation, so a stale handle never
//! resolves to a different closure.
//!
//! # Example
//!
//! ```
//! use horizon_lattice_bridge::CallbackRegistry;
//!
//! let registry = CallbackRegistry::new();
//! let handle = registry.register(|args| Ok(args.join(" ")));
//!
//! assert!(registry.contains(handle));
//! registry.unregister(handle);
//! assert!(!registry.contains(handle));
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use slotmap::{Key, SlotMap, new_key_type};

use crate::protection::HostResult;

new_key_type! {
    /// An opaque identifier for a registered callback.
    ///
    /// Two handles are equal only if they name the same registration.
    pub struct CallbackHandle;
}

impl fmt::Display for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb{:?}", self.data())
    }
}

/// A registered closure as the engine sees it: string arguments in, string
/// result out.
pub type Callback = Arc<dyn Fn(&[String]) -> HostResult<String> + Send + Sync>;

/// Table of registered callbacks.
///
/// Registration may happen from any thread. Lookups clone the closure out of
/// the table, so the lock is never held while a callback runs.
pub struct CallbackRegistry {
    callbacks: Mutex<SlotMap<CallbackHandle, Callback>>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(SlotMap::with_key()),
        }
    }

    /// Store a closure and return a fresh handle for it.
    pub fn register<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&[String]) -> HostResult<String> + Send + Sync + 'static,
    {
        let handle = self.callbacks.lock().insert(Arc::new(callback));
        tracing::trace!(target: "horizon_lattice_bridge::callback", %handle, "callback registered");
        handle
    }

    /// Remove a callback.
    ///
    /// Removing a handle that is already gone is not an error. Returns `true`
    /// if an entry was removed.
    pub fn unregister(&self, handle: CallbackHandle) -> bool {
        // Dropped after the lock is released: a closure may own something that
        // unregisters itself.
        let removed = self.callbacks.lock().remove(handle);
        if removed.is_some() {
            tracing::trace!(target: "horizon_lattice_bridge::callback", %handle, "callback unregistered");
        }
        removed.is_some()
    }

    /// Check if a handle names a live registration.
    pub fn contains(&self, handle: CallbackHandle) -> bool {
        self.callbacks.lock().contains_key(handle)
    }

    /// Look up the closure behind a handle.
    pub fn lookup(&self, handle: CallbackHandle) -> Option<Callback> {
        self.callbacks.lock().get(handle).cloned()
    }

    /// Get the number of registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Check if no callbacks are registered.
    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }

    /// Remove every registration. Used on engine teardown.
    pub fn clear(&self) {
        let drained: Vec<Callback> = self.callbacks.lock().drain().map(|(_, cb)| cb).collect();
        drop(drained);
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_register_and_lookup() {
        let registry = CallbackRegistry::new();
        let handle = registry.register(|args| Ok(format!("got {}", args.len())));

        let callback = registry.lookup(handle).expect("callback should exist");
        let result = callback(&["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(result, "got 2");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = CallbackRegistry::new();
        let handle = registry.register(|_| Ok(String::new()));

        assert!(registry.unregister(handle));
        assert!(!registry.unregister(handle));
        assert!(registry.lookup(handle).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reused_slot_does_not_resolve_stale_handle() {
        let registry = CallbackRegistry::new();
        let old = registry.register(|_| Ok("old".to_string()));
        registry.unregister(old);

        let new = registry.register(|_| Ok("new".to_string()));
        assert_ne!(old, new);
        assert!(registry.lookup(old).is_none());
        assert_eq!(registry.lookup(new).unwrap()(&[]).unwrap(), "new");
    }

    #[test]
    fn test_handles_are_unique() {
        let registry = CallbackRegistry::new();
        let a = registry.register(|_| Ok(String::new()));
        let b = registry.register(|_| Ok(String::new()));
        assert_ne!(a, b);
        assert_ne!(a.to_string(), b.to_string());
        assert!(a.to_string().starts_with("cb"));
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(CallbackRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let calls = calls.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .map(|_| {
                            let calls = calls.clone();
                            registry.register(move |_| {
                                calls.fetch_add(1, Ordering::SeqCst);
                                Ok(String::new())
                            })
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let all: Vec<CallbackHandle> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(registry.len(), 40);
        for handle in all {
            registry.lookup(handle).unwrap()(&[]).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 40);
    }
}

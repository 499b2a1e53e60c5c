//! The process-wide list of live isolation contexts.
//!
//! The global resolution round scans contexts in registration order, so the registry is an
//! ordered `Vec` rather than a map. Entries are `Weak`: the lifecycle entry of a module owns
//! its context, the registry only observes it.
//!
//! The registry also owns the resolution **epoch**. Every membership change and every module
//! a context publishes bumps it, which invalidates memoized misses everywhere without having
//! to visit each context.
//!
//! Write paths compare entries by address and never upgrade them, so a context being dropped
//! concurrently cannot run its teardown while the write lock is held.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock, Weak,
};

use crate::loader::context::IsolationContext;

/// Ordered, lock-protected list of live contexts.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    contexts: RwLock<Vec<Weak<IsolationContext>>>,
    epoch: AtomicU64,
}

impl ContextRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a context.
    ///
    /// # Panics
    /// Inserting a context that is already registered is a loader bug and aborts the
    /// operation.
    pub fn insert(&self, context: &Arc<IsolationContext>) {
        let mut contexts = write_lock!(self.contexts);
        if contexts
            .iter()
            .any(|entry| entry.as_ptr() == Arc::as_ptr(context))
        {
            drop(contexts);
            invariant_violation!("context {} registered twice", context.name());
        }

        contexts.retain(|entry| entry.strong_count() > 0);
        contexts.push(Arc::downgrade(context));
        self.bump_epoch();
    }

    /// Removes a context. Returns `true` if it was present.
    pub fn remove(&self, context: &IsolationContext) -> bool {
        let mut contexts = write_lock!(self.contexts);
        let removed = contexts
            .iter()
            .any(|entry| std::ptr::eq(entry.as_ptr(), context));
        contexts.retain(|entry| entry.strong_count() > 0 && !std::ptr::eq(entry.as_ptr(), context));
        if removed {
            self.bump_epoch();
        }
        removed
    }

    /// Live contexts in registration order.
    ///
    /// The lock is released before returning, so callers may query the contexts freely.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<IsolationContext>> {
        read_lock!(self.contexts)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Finds a live context by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<IsolationContext>> {
        read_lock!(self.contexts)
            .iter()
            .filter_map(Weak::upgrade)
            .find(|context| context.name() == name)
    }

    /// Returns `true` if `context` is registered.
    #[must_use]
    pub fn contains(&self, context: &IsolationContext) -> bool {
        read_lock!(self.contexts)
            .iter()
            .any(|entry| std::ptr::eq(entry.as_ptr(), context))
    }

    /// Number of registered, still allocated contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        read_lock!(self.contexts)
            .iter()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// Returns `true` if no contexts are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current resolution epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Advances the resolution epoch.
    pub fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

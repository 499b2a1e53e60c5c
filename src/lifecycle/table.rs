//! Explicit callback tables.
//!
//! A mod publishes its lifecycle entry points by filling a [`LifecycleTable`] when it is
//! activated. Callbacks are keyed by name and the [`ValueKind`]s of their parameters, so a
//! broadcast with a given argument list only reaches callbacks written for that shape.

use std::{collections::HashMap, fmt, sync::Arc};

use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    metadata::value::{Value, ValueKind},
    Result,
};

/// A mod callback.
pub type Callback = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Lifecycle events the runtime broadcasts itself. Callbacks for them take no arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, EnumIter)]
pub enum LifecycleEvent {
    /// Sent to a module right after it registered
    Load,
    /// Broadcast once after a batch of modules was registered
    Initialize,
    /// Sent to a module before its hooks are removed and its context disposed
    Unload,
}

impl LifecycleEvent {
    /// The callback name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// Name and parameter kinds of a callback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallbackKey {
    /// Callback name
    pub name: String,
    /// Parameter kinds, in order
    pub params: Vec<ValueKind>,
}

impl CallbackKey {
    /// Creates a key.
    pub fn new(name: impl Into<String>, params: Vec<ValueKind>) -> Self {
        CallbackKey {
            name: name.into(),
            params,
        }
    }
}

impl fmt::Display for CallbackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, kind) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{kind}")?;
        }
        f.write_str(")")
    }
}

/// Callbacks a module exposes.
#[derive(Clone, Default)]
pub struct LifecycleTable {
    callbacks: HashMap<CallbackKey, Callback>,
}

impl LifecycleTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a callback named `name` taking `params`. Replaces an existing callback with the
    /// same name and parameters.
    #[must_use]
    pub fn on<F>(mut self, name: &str, params: Vec<ValueKind>, callback: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.insert(CallbackKey::new(name, params), Arc::new(callback));
        self
    }

    /// Adds a callback for a runtime lifecycle event.
    #[must_use]
    pub fn on_event<F>(self, event: LifecycleEvent, callback: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.on(event.name(), Vec::new(), move |_| {
            callback()?;
            Ok(Value::Void)
        })
    }

    /// Adds a prepared callback.
    pub fn insert(&mut self, key: CallbackKey, callback: Callback) {
        self.callbacks.insert(key, callback);
    }

    /// The callback for exactly this name and parameter list.
    #[must_use]
    pub fn lookup(&self, key: &CallbackKey) -> Option<Callback> {
        self.callbacks.get(key).cloned()
    }

    /// Returns `true` if any callback has this name.
    #[must_use]
    pub fn has_name(&self, name: &str) -> bool {
        self.callbacks.keys().any(|key| key.name == name)
    }

    /// Number of callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Returns `true` if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl fmt::Debug for LifecycleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.callbacks.keys().map(ToString::to_string).collect();
        keys.sort();
        f.debug_struct("LifecycleTable")
            .field("callbacks", &keys)
            .finish()
    }
}

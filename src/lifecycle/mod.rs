//! Module registration and lifecycle dispatch.
//!
//! The [`LifecycleManager`] keeps the ordered list of registered modules. Each entry owns the
//! module's [`IsolationContext`] and its [`LifecycleTable`]. Broadcasting a callback name
//! visits every module in registration order, looks up a callback matching the argument
//! kinds, and runs it. The lookup result, including "this module has no such callback", is
//! cached per module so repeated broadcasts do not search the table again.
//!
//! Registration order carries no guarantee about dependencies: a module may see its
//! `Initialize` before or after a dependency's. Only code availability is guaranteed, by the
//! loader.
//!
//! # Unregistration
//!
//! Unregistering a module runs its `Unload` callback, removes every hook it installed and
//! disposes its context, in that order. The entry leaves the list first, so a concurrent
//! unregistration of the same module is a no-op.

pub mod batch;
pub mod table;

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use dashmap::DashMap;

use crate::{
    detour::DetourTable,
    loader::{context::IsolationContext, LoadedUnit},
    metadata::{
        diagnostics::{DiagnosticCategory, Diagnostics},
        identity::{ModuleMetadata, ModuleVersion},
        value::{kinds_of, Value},
    },
    Error, Result,
};

use table::{Callback, CallbackKey, LifecycleEvent, LifecycleTable};

/// Builds the lifecycle table of a module once its entry point is loaded.
///
/// This is where a host maps loaded code to callable entry points, for example by looking up
/// exported functions of the code unit. Mods without code get `None` for `entry`.
pub trait ModuleActivator: Send + Sync {
    /// Returns the module's callbacks.
    ///
    /// # Errors
    /// An error rejects the module; its context is disposed.
    fn activate(&self, metadata: &ModuleMetadata, entry: Option<&LoadedUnit>)
        -> Result<LifecycleTable>;
}

/// An activator that gives every module an empty table.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullActivator;

impl ModuleActivator for NullActivator {
    fn activate(&self, _: &ModuleMetadata, _: Option<&LoadedUnit>) -> Result<LifecycleTable> {
        Ok(LifecycleTable::new())
    }
}

/// An activator backed by tables prepared per module name.
#[derive(Default)]
pub struct TableActivator {
    tables: DashMap<String, Arc<dyn Fn() -> LifecycleTable + Send + Sync>>,
}

impl TableActivator {
    /// Creates an activator without tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `factory` to build the table of the module named `name`.
    #[must_use]
    pub fn with<F>(self, name: &str, factory: F) -> Self
    where
        F: Fn() -> LifecycleTable + Send + Sync + 'static,
    {
        self.tables.insert(name.to_string(), Arc::new(factory));
        self
    }
}

impl ModuleActivator for TableActivator {
    fn activate(&self, metadata: &ModuleMetadata, _: Option<&LoadedUnit>) -> Result<LifecycleTable> {
        let factory = self
            .tables
            .get(&metadata.name)
            .map(|entry| entry.value().clone());
        Ok(factory.map(|factory| factory()).unwrap_or_default())
    }
}

/// Identifies a registered module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleHandle {
    id: u64,
    name: String,
}

impl ModuleHandle {
    /// Module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registration id, unique per manager.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Outcome of a broadcast.
#[derive(Debug, Default)]
pub struct InvokeReport {
    /// Modules whose callback ran successfully, with the returned value
    pub invoked: Vec<(String, Value)>,
    /// Modules without a matching callback
    pub skipped: Vec<String>,
    /// Callback failures
    pub failures: Vec<Error>,
}

impl InvokeReport {
    /// Number of modules that had a matching callback.
    #[must_use]
    pub fn matched(&self) -> usize {
        self.invoked.len() + self.failures.len()
    }

    /// Returns `true` if no callback failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

struct ModuleEntry {
    handle: ModuleHandle,
    metadata: ModuleMetadata,
    context: Option<Arc<IsolationContext>>,
    table: LifecycleTable,
    lookups: DashMap<CallbackKey, Option<Callback>>,
}

/// Ordered list of registered modules.
pub struct LifecycleManager {
    modules: RwLock<Vec<Arc<ModuleEntry>>>,
    next_id: AtomicU64,
    table_lookups: AtomicUsize,
    detours: Arc<DetourTable>,
    diagnostics: Arc<Diagnostics>,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("modules", &self.names())
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Creates a manager that removes hooks from `detours` on unregistration.
    #[must_use]
    pub fn new(detours: Arc<DetourTable>, diagnostics: Arc<Diagnostics>) -> Self {
        LifecycleManager {
            modules: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            table_lookups: AtomicUsize::new(0),
            detours,
            diagnostics,
        }
    }

    /// Appends a module.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateModule`] if a module of the same name is registered.
    pub fn register(
        &self,
        metadata: ModuleMetadata,
        context: Option<Arc<IsolationContext>>,
        table: LifecycleTable,
    ) -> Result<ModuleHandle> {
        let mut modules = write_lock!(self.modules);
        if modules.iter().any(|m| m.metadata.name == metadata.name) {
            return Err(Error::DuplicateModule(metadata.name));
        }

        let handle = ModuleHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: metadata.name.clone(),
        };
        log::info!(
            target: "dotmod::lifecycle",
            "Registered {} {} ({} callbacks)",
            handle.name,
            metadata.version,
            table.len()
        );
        modules.push(Arc::new(ModuleEntry {
            handle: handle.clone(),
            metadata,
            context,
            table,
            lookups: DashMap::new(),
        }));
        Ok(handle)
    }

    fn entry(&self, handle: &ModuleHandle) -> Option<Arc<ModuleEntry>> {
        read_lock!(self.modules)
            .iter()
            .find(|m| m.handle == *handle)
            .cloned()
    }

    fn callback(&self, entry: &ModuleEntry, key: &CallbackKey) -> Option<Callback> {
        if let Some(cached) = entry.lookups.get(key) {
            return cached.clone();
        }
        self.table_lookups.fetch_add(1, Ordering::Relaxed);
        let found = entry.table.lookup(key);
        entry.lookups.insert(key.clone(), found.clone());
        found
    }

    fn run(entry: &ModuleEntry, key: &CallbackKey, callback: &Callback, args: &[Value]) -> Result<Value> {
        callback(args).map_err(|error| Error::CallbackFailed {
            module: entry.handle.name.clone(),
            callback: key.to_string(),
            message: error.to_string(),
        })
    }

    /// Calls `name` on every module that has a callback for the kinds of `args`.
    pub fn invoke(&self, name: &str, args: &[Value]) -> InvokeReport {
        let key = CallbackKey::new(name, kinds_of(args));
        let modules: Vec<Arc<ModuleEntry>> = read_lock!(self.modules).clone();

        let mut report = InvokeReport::default();
        for entry in modules {
            let Some(callback) = self.callback(&entry, &key) else {
                report.skipped.push(entry.handle.name.clone());
                continue;
            };
            match Self::run(&entry, &key, &callback, args) {
                Ok(value) => report.invoked.push((entry.handle.name.clone(), value)),
                Err(error) => {
                    log::error!(target: "dotmod::lifecycle", "{}", error);
                    self.diagnostics.error(
                        Some(&entry.handle.name),
                        DiagnosticCategory::Lifecycle,
                        error.to_string(),
                    );
                    report.failures.push(error);
                }
            }
        }
        report
    }

    /// Calls `name` on one module. `None` if the module is gone or has no such callback.
    pub fn invoke_on(&self, handle: &ModuleHandle, name: &str, args: &[Value]) -> Option<Result<Value>> {
        let entry = self.entry(handle)?;
        let key = CallbackKey::new(name, kinds_of(args));
        let callback = self.callback(&entry, &key)?;
        Some(Self::run(&entry, &key, &callback, args))
    }

    /// Unregisters a module: `Unload`, hook removal, context disposal. Returns `false` if the
    /// module was not registered.
    pub fn unregister(&self, handle: &ModuleHandle) -> bool {
        let entry = {
            let mut modules = write_lock!(self.modules);
            let Some(index) = modules.iter().position(|m| m.handle == *handle) else {
                return false;
            };
            modules.remove(index)
        };

        let key = CallbackKey::new(LifecycleEvent::Unload.name(), Vec::new());
        if let Some(callback) = self.callback(&entry, &key) {
            if let Err(error) = Self::run(&entry, &key, &callback, &[]) {
                log::error!(target: "dotmod::lifecycle", "{}", error);
                self.diagnostics.error(
                    Some(&entry.handle.name),
                    DiagnosticCategory::Lifecycle,
                    error.to_string(),
                );
            }
        }

        self.detours.remove_owned_by(&entry.handle.name);
        if let Some(context) = &entry.context {
            context.dispose();
        }

        log::info!(target: "dotmod::lifecycle", "Unregistered {}", entry.handle);
        true
    }

    /// Unregisters every module, last registered first. Returns how many were removed.
    pub fn unregister_all(&self) -> usize {
        let handles = self.handles();
        handles
            .iter()
            .rev()
            .filter(|handle| self.unregister(handle))
            .count()
    }

    /// Handles in registration order.
    #[must_use]
    pub fn handles(&self) -> Vec<ModuleHandle> {
        read_lock!(self.modules)
            .iter()
            .map(|m| m.handle.clone())
            .collect()
    }

    /// Names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        read_lock!(self.modules)
            .iter()
            .map(|m| m.handle.name.clone())
            .collect()
    }

    /// The handle of a registered module.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<ModuleHandle> {
        read_lock!(self.modules)
            .iter()
            .find(|m| m.handle.name == name)
            .map(|m| m.handle.clone())
    }

    /// Version of a registered module.
    #[must_use]
    pub fn version_of(&self, name: &str) -> Option<ModuleVersion> {
        read_lock!(self.modules)
            .iter()
            .find(|m| m.handle.name == name)
            .map(|m| m.metadata.version)
    }

    /// Metadata of a registered module.
    #[must_use]
    pub fn metadata(&self, handle: &ModuleHandle) -> Option<ModuleMetadata> {
        self.entry(handle).map(|entry| entry.metadata.clone())
    }

    /// Isolation context of a registered module.
    #[must_use]
    pub fn context(&self, handle: &ModuleHandle) -> Option<Arc<IsolationContext>> {
        self.entry(handle).and_then(|entry| entry.context.clone())
    }

    /// Isolation context of a registered module, by name.
    #[must_use]
    pub fn context_by_name(&self, name: &str) -> Option<Arc<IsolationContext>> {
        read_lock!(self.modules)
            .iter()
            .find(|m| m.handle.name == name)
            .and_then(|m| m.context.clone())
    }

    /// Registered modules that declare a dependency, required or optional, on `name`.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<Arc<IsolationContext>> {
        read_lock!(self.modules)
            .iter()
            .filter(|m| m.metadata.all_dependencies().any(|(dep, _)| dep.name == name))
            .filter_map(|m| m.context.clone())
            .collect()
    }

    /// Number of times a callback table was actually searched.
    #[must_use]
    pub fn table_lookup_count(&self) -> usize {
        self.table_lookups.load(Ordering::Relaxed)
    }

    /// Number of registered modules.
    #[must_use]
    pub fn len(&self) -> usize {
        read_lock!(self.modules).len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        read_lock!(self.modules).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        detour::{hook::Replacement, MethodDescriptor},
        metadata::{
            identity::PackageSource,
            signature::{MethodSignature, TypeSig},
            value::ValueKind,
        },
    };
    use std::sync::Mutex;

    fn manager() -> LifecycleManager {
        LifecycleManager::new(Arc::new(DetourTable::new()), Arc::new(Diagnostics::new()))
    }

    fn meta(name: &str) -> ModuleMetadata {
        ModuleMetadata::new(
            name,
            ModuleVersion::new(1, 0, 0),
            PackageSource::Directory(name.into()),
        )
    }

    #[test]
    fn test_invoke_skips_and_collects_failures() {
        let manager = manager();
        manager
            .register(
                meta("A"),
                None,
                LifecycleTable::new().on("Score", vec![ValueKind::I32], |args| {
                    Ok(Value::I32(args[0].as_i32().unwrap_or_default() * 2))
                }),
            )
            .unwrap();
        manager.register(meta("B"), None, LifecycleTable::new()).unwrap();
        manager
            .register(
                meta("C"),
                None,
                LifecycleTable::new().on("Score", vec![ValueKind::I32], |_| {
                    Err(Error::Error("boom".into()))
                }),
            )
            .unwrap();

        let report = manager.invoke("Score", &[Value::I32(21)]);
        assert_eq!(report.invoked, vec![("A".to_string(), Value::I32(42))]);
        assert_eq!(report.skipped, vec!["B".to_string()]);
        assert_eq!(report.matched(), 2);
        assert!(matches!(
            &report.failures[0],
            Error::CallbackFailed { module, .. } if module == "C"
        ));

        // Different argument kinds do not match
        assert_eq!(manager.invoke("Score", &[Value::from("x")]).matched(), 0);
    }

    #[test]
    fn test_lookup_results_are_cached() {
        let manager = manager();
        manager.register(meta("A"), None, LifecycleTable::new()).unwrap();
        manager
            .register(
                meta("B"),
                None,
                LifecycleTable::new().on_event(LifecycleEvent::Initialize, || Ok(())),
            )
            .unwrap();

        for _ in 0..5 {
            manager.invoke("Initialize", &[]);
        }
        assert_eq!(manager.table_lookup_count(), 2);
        manager.invoke("Tick", &[]);
        assert_eq!(manager.table_lookup_count(), 4);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let manager = manager();
        manager.register(meta("A"), None, LifecycleTable::new()).unwrap();
        assert!(matches!(
            manager.register(meta("A"), None, LifecycleTable::new()),
            Err(Error::DuplicateModule(_))
        ));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_unregister_order() {
        let detours = Arc::new(DetourTable::new());
        let manager = LifecycleManager::new(detours.clone(), Arc::new(Diagnostics::new()));

        let target = MethodDescriptor::new(
            "Game.World",
            "Update",
            MethodSignature::static_method(TypeSig::Void, vec![]),
        );
        detours.declare_bound(target.clone(), |_| Ok(Value::Void));

        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = log.clone();
        let hooks = detours.clone();
        let observed = target.clone();
        let handle = manager
            .register(
                meta("A"),
                None,
                LifecycleTable::new().on_event(LifecycleEvent::Unload, move || {
                    // Hooks are still installed while Unload runs
                    seen.lock().unwrap().push(hooks.hook_count(&observed));
                    Ok(())
                }),
            )
            .unwrap();
        detours
            .install(
                &target,
                Replacement::direct(target.signature.clone(), |_| Ok(Value::Void)),
                Some("A"),
            )
            .unwrap();

        assert!(manager.unregister(&handle));
        assert!(!manager.unregister(&handle));
        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert_eq!(detours.hook_count(&target), 0);
        assert!(manager.is_empty());
        assert!(manager.invoke_on(&handle, "Unload", &[]).is_none());
    }

    #[test]
    fn test_unregister_all_reverse() {
        let manager = manager();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["A", "B", "C"] {
            let order = order.clone();
            manager
                .register(
                    meta(name),
                    None,
                    LifecycleTable::new().on_event(LifecycleEvent::Unload, move || {
                        order.lock().unwrap().push(name);
                        Ok(())
                    }),
                )
                .unwrap();
        }
        assert_eq!(manager.unregister_all(), 3);
        assert_eq!(*order.lock().unwrap(), vec!["C", "B", "A"]);
    }
}

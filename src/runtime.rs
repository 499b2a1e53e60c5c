//! The runtime object tying the subsystems together.
//!
//! A [`ModRuntime`] is constructed explicitly through a [`RuntimeBuilder`] and owns every
//! piece of process-wide state: the context registry, the detour table, the lifecycle
//! manager and the diagnostics. Nothing is kept in statics, so several runtimes can coexist
//! (tests do this all the time) and tearing one down releases everything it loaded.
//!
//! # Registration
//!
//! [`ModRuntime::register_module`] runs the whole pipeline for one mod:
//!
//! 1. Open the mod's package and create its isolation context
//! 2. Link the context with the contexts of declared dependencies and dependents
//! 3. Load, relink and hand over the entry point, if the mod has one
//! 4. Build the lifecycle table through the [`ModuleActivator`]
//! 5. Register with the lifecycle manager and send `Load`
//!
//! Any failure before step 5 disposes the context again, records a diagnostic and yields
//! `None`; other mods are unaffected. A failing `Load` callback is reported but leaves the
//! module registered, the mod decides how loud that failure is.
//!
//! # Examples
//!
//! ```rust
//! use dotmod::prelude::*;
//!
//! let runtime = RuntimeBuilder::new()
//!     .with_config(RuntimeConfig::for_host("Game", "Game.Patched"))
//!     .build()?;
//!
//! let assets_only = ModuleMetadata::new(
//!     "Textures",
//!     ModuleVersion::new(1, 0, 0),
//!     PackageSource::Embedded(EmbeddedPackage::new("Textures")),
//! );
//! let handle = runtime.register_module(assets_only).expect("registered");
//! assert_eq!(runtime.modules(), vec![handle.clone()]);
//! assert!(runtime.unregister_module(&handle));
//! # Ok::<(), dotmod::Error>(())
//! ```

use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    detour::{
        hook::{HookHandle, Replacement},
        patch::PatchSet,
        DetourTable, MethodDescriptor,
    },
    lifecycle::{
        batch,
        table::{LifecycleEvent, LifecycleTable},
        InvokeReport, LifecycleManager, ModuleActivator, ModuleHandle, NullActivator,
    },
    loader::{
        context::IsolationContext, CodeLoader, HostModules, InProcessLoader, LoadedUnit,
        LoaderEnvironment, NativeResolver,
    },
    metadata::{
        diagnostics::{DiagnosticCategory, Diagnostics},
        identity::ModuleMetadata,
        surface::ModuleSurface,
        value::Value,
    },
    relink::{cache::RelinkDiskCache, map::RelinkMap},
    Error, Result,
};

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Simple name of the unpatched host binary mods were compiled against
    pub host_module: Option<String>,
    /// Simple name of the patched host binary references are redirected to
    pub patched_host_module: Option<String>,
    /// Additional module, type and member renames
    pub relink_map: RelinkMap,
    /// Static call-site patches applied to every relinked module
    pub patches: PatchSet,
    /// Directory for relinked modules reused across runs
    pub cache_dir: Option<PathBuf>,
    /// Skip mods whose required dependencies are missing or too old
    pub strict_dependencies: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host_module: None,
            patched_host_module: None,
            relink_map: RelinkMap::new(),
            patches: PatchSet::new(),
            cache_dir: None,
            strict_dependencies: true,
        }
    }
}

impl RuntimeConfig {
    /// Redirects references from `original` to `patched`, strict dependency checks.
    #[must_use]
    pub fn for_host(original: &str, patched: &str) -> Self {
        Self {
            host_module: Some(original.to_string()),
            patched_host_module: Some(patched.to_string()),
            ..Self::default()
        }
    }

    /// No host redirection, and mods with unsatisfied dependencies are still registered.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            strict_dependencies: false,
            ..Self::default()
        }
    }

    /// Sets the on-disk relink cache.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Sets the additional relink map.
    #[must_use]
    pub fn with_relink_map(mut self, map: RelinkMap) -> Self {
        self.relink_map = map;
        self
    }

    /// Sets the static call-site patches.
    #[must_use]
    pub fn with_patches(mut self, patches: PatchSet) -> Self {
        self.patches = patches;
        self
    }

    /// The relink map actually used: [`RuntimeConfig::relink_map`] plus the host redirect,
    /// unless the map already renames the host module itself.
    #[must_use]
    pub fn effective_relink_map(&self) -> RelinkMap {
        let map = self.relink_map.clone();
        match (&self.host_module, &self.patched_host_module) {
            (Some(original), Some(patched))
                if original != patched && map.map_module(original).is_none() =>
            {
                map.with_module(original.clone(), patched.clone())
            }
            _ => map,
        }
    }
}

/// Builds a [`ModRuntime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    code_loader: Option<Arc<dyn CodeLoader>>,
    native: Option<Arc<dyn NativeResolver>>,
    activator: Option<Arc<dyn ModuleActivator>>,
    detours: Option<Arc<DetourTable>>,
}

impl RuntimeBuilder {
    /// Starts with the default configuration, an [`InProcessLoader`], no host modules and a
    /// [`NullActivator`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the host's code loader.
    #[must_use]
    pub fn with_code_loader(mut self, loader: Arc<dyn CodeLoader>) -> Self {
        self.code_loader = Some(loader);
        self
    }

    /// Sets the fallback for host modules.
    #[must_use]
    pub fn with_native_resolver(mut self, native: Arc<dyn NativeResolver>) -> Self {
        self.native = Some(native);
        self
    }

    /// Sets the activator that builds lifecycle tables.
    #[must_use]
    pub fn with_activator(mut self, activator: Arc<dyn ModuleActivator>) -> Self {
        self.activator = Some(activator);
        self
    }

    /// Uses a detour table the host already declared its methods in.
    #[must_use]
    pub fn with_detours(mut self, detours: Arc<DetourTable>) -> Self {
        self.detours = Some(detours);
        self
    }

    /// Creates the runtime.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the cache directory cannot be created.
    pub fn build(self) -> Result<ModRuntime> {
        let disk_cache = match &self.config.cache_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Some(RelinkDiskCache::new(dir.clone()))
            }
            None => None,
        };

        let env = Arc::new(LoaderEnvironment::new(
            self.code_loader
                .unwrap_or_else(|| Arc::new(InProcessLoader::new())),
            self.native.unwrap_or_else(|| Arc::new(HostModules::new())),
            self.config.effective_relink_map(),
            self.config.patches.clone(),
            disk_cache,
        ));
        let detours = self.detours.unwrap_or_default();
        let lifecycle = LifecycleManager::new(detours.clone(), env.diagnostics.clone());

        log::debug!(
            target: "dotmod::loader",
            "Runtime ready (host {:?} -> {:?}, {} patches, cache {:?})",
            self.config.host_module,
            self.config.patched_host_module,
            self.config.patches.len(),
            self.config.cache_dir
        );

        Ok(ModRuntime {
            config: self.config,
            env,
            detours,
            lifecycle,
            activator: self.activator.unwrap_or_else(|| Arc::new(NullActivator)),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// Outcome of [`ModRuntime::load_all`].
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Registered modules, in registration order
    pub registered: Vec<ModuleHandle>,
    /// Modules left out before registration, with the reason
    pub skipped: Vec<(String, Error)>,
    /// Modules that were attempted but failed to register
    pub failed: Vec<String>,
    /// Dependency problems tolerated in permissive mode
    pub warnings: Vec<Error>,
    /// A dependency cycle among the registered modules
    pub cycle: Option<Vec<String>>,
    /// Result of the `Initialize` broadcast
    pub initialize: InvokeReport,
}

/// The mod runtime.
pub struct ModRuntime {
    config: RuntimeConfig,
    env: Arc<LoaderEnvironment>,
    detours: Arc<DetourTable>,
    lifecycle: LifecycleManager,
    activator: Arc<dyn ModuleActivator>,
    shut_down: AtomicBool,
}

impl fmt::Debug for ModRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModRuntime")
            .field("modules", &self.lifecycle.names())
            .field("contexts", &self.env.registry.len())
            .field("detours", &self.detours)
            .finish_non_exhaustive()
    }
}

impl ModRuntime {
    /// The configuration the runtime was built with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Recoverable failures recorded so far.
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.env.diagnostics
    }

    /// The detour table.
    #[must_use]
    pub fn detours(&self) -> &Arc<DetourTable> {
        &self.detours
    }

    /// Loader services, including the context registry.
    #[must_use]
    pub fn environment(&self) -> &Arc<LoaderEnvironment> {
        &self.env
    }

    /// The lifecycle manager.
    #[must_use]
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Registered modules, in registration order.
    #[must_use]
    pub fn modules(&self) -> Vec<ModuleHandle> {
        self.lifecycle.handles()
    }

    /// The isolation context of a registered module.
    #[must_use]
    pub fn context(&self, handle: &ModuleHandle) -> Option<Arc<IsolationContext>> {
        self.lifecycle.context(handle)
    }

    /// Registers a mod, building its lifecycle table with the configured activator.
    #[must_use]
    pub fn register_module(&self, metadata: ModuleMetadata) -> Option<ModuleHandle> {
        self.register(metadata, None)
    }

    /// Registers a mod with a prepared lifecycle table.
    #[must_use]
    pub fn register_module_with(
        &self,
        metadata: ModuleMetadata,
        table: LifecycleTable,
    ) -> Option<ModuleHandle> {
        self.register(metadata, Some(table))
    }

    fn report(&self, module: &str, category: DiagnosticCategory, error: &Error) {
        log::error!(target: "dotmod::lifecycle", "{}: {}", module, error);
        self.env
            .diagnostics
            .error(Some(module), category, error.to_string());
    }

    fn register(&self, metadata: ModuleMetadata, table: Option<LifecycleTable>) -> Option<ModuleHandle> {
        let name = metadata.name.clone();
        if self.shut_down.load(Ordering::Acquire) {
            log::warn!(target: "dotmod::lifecycle", "Runtime shut down, ignoring {}", name);
            return None;
        }
        if self.lifecycle.find(&name).is_some() {
            self.report(&name, DiagnosticCategory::Dependency, &Error::DuplicateModule(name.clone()));
            return None;
        }

        let context = match IsolationContext::create(&metadata, &self.env) {
            Ok(context) => context,
            Err(error) => {
                self.report(&name, DiagnosticCategory::Package, &error);
                return None;
            }
        };

        self.link_dependencies(&metadata, &context);

        let entry = match &metadata.entry_point {
            Some(path) => match context.load_entry_point() {
                Some(unit) => Some(unit),
                None => {
                    context.dispose();
                    self.report(
                        &name,
                        DiagnosticCategory::Package,
                        &Error::Error(format!("entry point {path} could not be loaded")),
                    );
                    return None;
                }
            },
            None => None,
        };

        let table = match table {
            Some(table) => table,
            None => match self.activator.activate(&metadata, entry.as_deref()) {
                Ok(table) => table,
                Err(error) => {
                    context.dispose();
                    self.report(&name, DiagnosticCategory::Lifecycle, &error);
                    return None;
                }
            },
        };

        let handle = match self.lifecycle.register(metadata, Some(context.clone()), table) {
            Ok(handle) => handle,
            Err(error) => {
                context.dispose();
                self.report(&name, DiagnosticCategory::Lifecycle, &error);
                return None;
            }
        };
        // The lifecycle entry is the owner from here on.
        drop(context);

        if let Some(Err(error)) =
            self.lifecycle
                .invoke_on(&handle, LifecycleEvent::Load.name(), &[])
        {
            self.report(&name, DiagnosticCategory::Lifecycle, &error);
        }
        Some(handle)
    }

    /// Links `context` to the contexts of its declared dependencies, and the contexts of
    /// modules depending on it to `context`.
    fn link_dependencies(&self, metadata: &ModuleMetadata, context: &Arc<IsolationContext>) {
        for (dependency, _) in metadata.all_dependencies() {
            if let Some(provider) = self.lifecycle.context_by_name(&dependency.name) {
                context.add_dependency(&provider);
            }
        }
        for dependent in self.lifecycle.dependents_of(&metadata.name) {
            dependent.add_dependency(context);
        }
    }

    /// Unregisters a module: `Unload`, hook removal, context disposal.
    pub fn unregister_module(&self, handle: &ModuleHandle) -> bool {
        self.lifecycle.unregister(handle)
    }

    /// Loads a module from the package of a registered mod.
    #[must_use]
    pub fn load_assembly_from_mod_path(
        &self,
        handle: &ModuleHandle,
        path: &str,
        name: Option<&str>,
    ) -> Option<Arc<LoadedUnit>> {
        self.lifecycle
            .context(handle)?
            .load_from_package_path(path, name)
    }

    /// Resolves a simple module name from a registered mod's point of view.
    #[must_use]
    pub fn resolve(&self, handle: &ModuleHandle, name: &str) -> Option<Arc<ModuleSurface>> {
        self.lifecycle.context(handle)?.resolve(name)
    }

    /// Supplies code for `name` on behalf of a registered mod.
    #[must_use]
    pub fn load_dependency(&self, handle: &ModuleHandle, name: &str) -> Option<Arc<LoadedUnit>> {
        self.lifecycle.context(handle)?.load_dependency(name)
    }

    /// Installs a hook, owned by `owner` if given.
    ///
    /// # Errors
    /// See [`DetourTable::install`]. Failures are also recorded as diagnostics.
    pub fn install_hook(
        &self,
        target: &MethodDescriptor,
        replacement: Replacement,
        owner: Option<&ModuleHandle>,
    ) -> Result<HookHandle> {
        let owner = owner.map(ModuleHandle::name);
        self.detours
            .install(target, replacement, owner)
            .inspect_err(|error| {
                self.env
                    .diagnostics
                    .error(owner, DiagnosticCategory::Hook, error.to_string());
            })
    }

    /// Removes a hook. Unknown hooks are a no-op returning `false`.
    pub fn remove_hook(&self, handle: &HookHandle) -> bool {
        self.detours.remove(handle)
    }

    /// Calls a host method through its hooks.
    ///
    /// # Errors
    /// See [`DetourTable::call`].
    pub fn call_host(&self, target: &MethodDescriptor, args: &[Value]) -> Result<Value> {
        self.detours.call(target, args)
    }

    /// Broadcasts a callback to every registered module.
    pub fn invoke_lifecycle_method(&self, name: &str, args: &[Value]) -> InvokeReport {
        self.lifecycle.invoke(name, args)
    }

    /// Registers a batch of mods in dependency order, then broadcasts `Initialize` once.
    pub fn load_all(&self, batch: Vec<ModuleMetadata>) -> LoadReport {
        let plan = batch::plan(
            batch,
            |name| self.lifecycle.version_of(name),
            self.config.strict_dependencies,
        );

        let mut report = LoadReport {
            skipped: plan.skipped,
            warnings: plan.warnings,
            cycle: plan.cycle,
            ..LoadReport::default()
        };

        for (name, reason) in &report.skipped {
            log::warn!(target: "dotmod::lifecycle", "Skipping {}: {}", name, reason);
            self.env
                .diagnostics
                .error(Some(name), DiagnosticCategory::Dependency, reason.to_string());
        }
        for warning in &report.warnings {
            log::warn!(target: "dotmod::lifecycle", "{}", warning);
            self.env
                .diagnostics
                .warning(None, DiagnosticCategory::Dependency, warning.to_string());
        }
        if let Some(cycle) = &report.cycle {
            log::info!(
                target: "dotmod::lifecycle",
                "Dependency cycle: {}",
                cycle.join(" -> ")
            );
        }

        for metadata in plan.order {
            let name = metadata.name.clone();
            match self.register_module(metadata) {
                Some(handle) => report.registered.push(handle),
                None => report.failed.push(name),
            }
        }

        report.initialize = self.invoke_lifecycle_method(LifecycleEvent::Initialize.name(), &[]);
        log::info!(
            target: "dotmod::lifecycle",
            "Loaded {} modules ({} skipped, {} failed)",
            report.registered.len(),
            report.skipped.len(),
            report.failed.len()
        );
        report
    }

    /// Unregisters every module, last registered first. Later registrations are refused.
    /// Returns how many modules were unregistered.
    pub fn shutdown(&self) -> usize {
        self.shut_down.store(true, Ordering::Release);
        self.lifecycle.unregister_all()
    }
}

impl Drop for ModRuntime {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relink::map::{MemberKey, MemberTarget};

    #[test]
    fn test_effective_relink_map() {
        let config = RuntimeConfig::for_host("Game", "Game.Patched");
        assert_eq!(
            config.effective_relink_map().map_module("Game"),
            Some("Game.Patched")
        );

        let custom = RuntimeConfig::for_host("Game", "Game.Patched")
            .with_relink_map(RelinkMap::new().with_module("Game", "Game.Other"));
        assert_eq!(
            custom.effective_relink_map().map_module("Game"),
            Some("Game.Other")
        );

        let map = RelinkMap::new().with_member(
            MemberKey::new("A", "B"),
            MemberTarget::same_module("A", "C"),
        );
        let plain = RuntimeConfig::default().with_relink_map(map.clone());
        assert_eq!(plain.effective_relink_map(), map);
    }

    #[test]
    fn test_presets() {
        assert!(RuntimeConfig::default().strict_dependencies);
        assert!(!RuntimeConfig::permissive().strict_dependencies);
        assert_eq!(
            RuntimeConfig::default().with_cache_dir("cache").cache_dir,
            Some(PathBuf::from("cache"))
        );
    }
}

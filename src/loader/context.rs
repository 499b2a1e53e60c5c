//! Per-mod isolation contexts.
//!
//! An [`IsolationContext`] owns everything the loader did on behalf of one mod: the code units
//! it loaded, the surfaces it parsed, where each package path led, the relinked images it can
//! reuse, and the lookups it has already answered. It is either **Active** or **Disposed**;
//! disposal is terminal, releases every unit to the [`crate::loader::CodeLoader`] and is safe
//! to race with itself and with lookups.
//!
//! # Loading
//!
//! [`IsolationContext::load_from_package_path`] is idempotent per normalized path. Loads are
//! serialized by a reentrant instance lock: relinking a module may resolve further names in
//! this context on the same thread, which must not deadlock. While a module is being loaded
//! its name maps to a pending slot. Its provisional surface is visible to the loading thread
//! only, so modules referencing each other verify and other threads wait or see nothing. A
//! failed load is remembered permanently for both its path and its simple name.
//!
//! Every result is published under the state lock after checking the disposed flag. Disposal
//! sets the flag before draining that state, so nothing published by a racing load or lookup
//! outlives it.
//!
//! # Locking
//!
//! Loads take the instance lock. Metadata parses only try for it, so resolution never waits
//! on a context another thread is loading; an unserialized parse publishes its surface only
//! if none exists yet. Disposal never takes it. Code lookups through
//! [`IsolationContext::load_dependency`] wait for it and are never issued while a load is in
//! progress.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, RwLock, Weak,
    },
};

use parking_lot::ReentrantMutex;

use crate::{
    loader::{
        cache::{LookupCache, MissCache},
        package::{extension, normalize_path, open_reader, parent_dir, PackageReader},
        resolver::{self, Code, InFlightGuard, Metadata},
        LoadedUnit, LoaderEnvironment,
    },
    metadata::{
        diagnostics::DiagnosticCategory,
        identity::ModuleMetadata,
        image::{ImageFlags, ModuleImage},
        surface::ModuleSurface,
    },
    relink::{checksum, Relinker, SymbolResolver},
    Error, Result,
};

/// Extension assumed for colocated modules of a mod without entry point.
const DEFAULT_MODULE_EXTENSION: &str = ".dll";

/// Process-unique identity of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn next() -> ContextId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric id.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A relinked module a context can load again without relinking.
#[derive(Debug, Clone)]
pub struct RelinkCacheEntry {
    /// SHA-1 of the original bytes
    pub input_checksum: [u8; 20],
    /// The relinked image
    pub image: Arc<ModuleImage>,
    /// Serialized relinked image
    pub bytes: Arc<[u8]>,
    /// Exported surface of the relinked image
    pub surface: Arc<ModuleSurface>,
}

#[derive(Debug, Clone)]
enum UnitSlot {
    Pending,
    Loaded(Arc<LoadedUnit>),
    Failed,
}

#[derive(Debug, Default)]
struct ContextState {
    units: HashMap<String, UnitSlot>,
    surfaces: HashMap<String, Arc<ModuleSurface>>,
    paths: HashMap<String, Option<Arc<LoadedUnit>>>,
    relink_cache: HashMap<String, RelinkCacheEntry>,
}

/// The loaded-code arena of one mod.
pub struct IsolationContext {
    id: ContextId,
    name: String,
    env: Arc<LoaderEnvironment>,
    reader: Option<Arc<dyn PackageReader>>,
    entry_point: Option<String>,
    load_lock: ReentrantMutex<()>,
    state: RwLock<ContextState>,
    dependencies: RwLock<Vec<Weak<IsolationContext>>>,
    disposed: AtomicBool,
    local_load: LookupCache<Arc<LoadedUnit>>,
    local_resolve: LookupCache<Arc<ModuleSurface>>,
    global_load_misses: MissCache,
    global_resolve_misses: MissCache,
    global_scans: AtomicUsize,
    relinks: AtomicUsize,
}

impl fmt::Debug for IsolationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl IsolationContext {
    /// Creates an unregistered context.
    ///
    /// `reader` is `None` for mods without files; `entry_point` is the package path of the
    /// mod's main module and decides where colocated dependencies are looked up.
    #[must_use]
    pub fn new(
        name: &str,
        reader: Option<Arc<dyn PackageReader>>,
        entry_point: Option<&str>,
        env: Arc<LoaderEnvironment>,
    ) -> Arc<IsolationContext> {
        Arc::new(IsolationContext {
            id: ContextId::next(),
            name: name.to_string(),
            env,
            reader,
            entry_point: entry_point.and_then(|path| normalize_path(path).ok()),
            load_lock: ReentrantMutex::new(()),
            state: RwLock::new(ContextState::default()),
            dependencies: RwLock::new(Vec::new()),
            disposed: AtomicBool::new(false),
            local_load: LookupCache::new(),
            local_resolve: LookupCache::new(),
            global_load_misses: MissCache::new(),
            global_resolve_misses: MissCache::new(),
            global_scans: AtomicUsize::new(0),
            relinks: AtomicUsize::new(0),
        })
    }

    /// Creates the context for a mod, opens its package and registers the context.
    ///
    /// # Errors
    /// Returns an error if the package cannot be opened.
    pub fn create(
        metadata: &ModuleMetadata,
        env: &Arc<LoaderEnvironment>,
    ) -> Result<Arc<IsolationContext>> {
        let reader = open_reader(&metadata.source)?;
        let context = Self::new(
            &metadata.name,
            Some(reader),
            metadata.entry_point.as_deref(),
            env.clone(),
        );
        env.registry.insert(&context);
        Ok(context)
    }

    /// Process-unique id.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Name of the owning mod.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized package path of the mod's main module.
    #[must_use]
    pub fn entry_point(&self) -> Option<&str> {
        self.entry_point.as_deref()
    }

    /// Returns `true` once [`IsolationContext::dispose`] has started.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of global scans this context has run.
    #[must_use]
    pub fn global_scan_count(&self) -> usize {
        self.global_scans.load(Ordering::Acquire)
    }

    /// Number of modules this context actually relinked, excluding cache hits.
    #[must_use]
    pub fn relink_count(&self) -> usize {
        self.relinks.load(Ordering::Acquire)
    }

    /// Every unit this context has loaded.
    #[must_use]
    pub fn loaded_units(&self) -> Vec<Arc<LoadedUnit>> {
        read_lock!(self.state)
            .units
            .values()
            .filter_map(|slot| match slot {
                UnitSlot::Loaded(unit) => Some(unit.clone()),
                _ => None,
            })
            .collect()
    }

    /// A unit this context loaded itself, by simple name.
    #[must_use]
    pub fn unit(&self, name: &str) -> Option<Arc<LoadedUnit>> {
        self.own_unit(name).flatten()
    }

    /// Relink cache entry for a simple name.
    #[must_use]
    pub fn relink_cache_entry(&self, name: &str) -> Option<RelinkCacheEntry> {
        read_lock!(self.state).relink_cache.get(name).cloned()
    }

    /// Number of memoized lookups across all four caches.
    #[must_use]
    pub fn cached_lookup_count(&self) -> usize {
        self.local_load.len()
            + self.local_resolve.len()
            + self.global_load_misses.len()
            + self.global_resolve_misses.len()
    }

    /// Live dependency contexts, declared and promoted, in link order.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Arc<IsolationContext>> {
        read_lock!(self.dependencies)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|context| !context.is_disposed())
            .collect()
    }

    /// Returns `true` if a context named `name` is a live dependency.
    #[must_use]
    pub fn has_dependency(&self, name: &str) -> bool {
        self.dependencies().iter().any(|c| c.name() == name)
    }

    /// Links `other` as a dependency. Returns `false` if it already was one, is this context,
    /// or either side is disposed.
    pub fn add_dependency(&self, other: &Arc<IsolationContext>) -> bool {
        if other.id == self.id || other.is_disposed() {
            return false;
        }

        let mut dependencies = write_lock!(self.dependencies);
        if self.is_disposed() {
            return false;
        }
        dependencies.retain(|weak| weak.strong_count() > 0);
        if dependencies
            .iter()
            .any(|weak| weak.as_ptr() == Arc::as_ptr(other))
        {
            return false;
        }
        dependencies.push(Arc::downgrade(other));
        true
    }

    /// Where does `name` live? Returns its exported surface.
    ///
    /// Checks this context's modules and package, its dependencies, every registered
    /// context, then the host's own modules. Results are memoized.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Arc<ModuleSurface>> {
        resolver::lookup::<Metadata>(self, name)
    }

    /// Supplies code for `name` when the host's code loader asks for a dependency.
    ///
    /// Same search order as [`IsolationContext::resolve`], but units are loaded. Host modules
    /// yield `None` without an error: the host loads those itself.
    #[must_use]
    pub fn load_dependency(&self, name: &str) -> Option<Arc<LoadedUnit>> {
        resolver::lookup::<Code>(self, name)
    }

    /// Loads the module at `path` inside the mod's package.
    ///
    /// `name` overrides the module's simple name. Returns the existing unit when the path or
    /// the simple name was loaded before, and `None` for anything that failed now or earlier.
    #[must_use]
    pub fn load_from_package_path(&self, path: &str, name: Option<&str>) -> Option<Arc<LoadedUnit>> {
        if self.is_disposed() {
            return None;
        }

        let path = match normalize_path(path) {
            Ok(path) => path,
            Err(error) => {
                self.report_failure(name.unwrap_or(path), &error);
                return None;
            }
        };

        let _load = self.load_lock.lock();
        if self.is_disposed() {
            return None;
        }
        if let Some(outcome) = read_lock!(self.state).paths.get(&path) {
            return outcome.clone();
        }

        match self.load_locked(&path, name) {
            Ok(unit) => unit,
            Err(error) => {
                self.publish(|state| state.paths.insert(path.clone(), None));
                self.report_failure(name.unwrap_or(&path), &error);
                None
            }
        }
    }

    /// Loads the mod's entry point module, if it has one.
    #[must_use]
    pub fn load_entry_point(&self) -> Option<Arc<LoadedUnit>> {
        let entry_point = self.entry_point.clone()?;
        self.load_from_package_path(&entry_point, None)
    }

    /// Tears the context down. Exactly one caller performs the teardown and gets `true`.
    ///
    /// The context leaves the registry, every loaded unit is released to the code loader and
    /// every cache is cleared. Safe to call concurrently and repeatedly, and from any thread
    /// while a load is in progress: that load unloads its own unit instead of publishing it.
    pub fn dispose(&self) -> bool {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.env.registry.remove(self);

        let released = self.release_units();
        write_lock!(self.dependencies).clear();
        self.clear_caches();

        log::info!(
            target: "dotmod::loader",
            "Disposed context {} ({} units released)",
            self.name,
            released
        );
        true
    }

    fn release_units(&self) -> usize {
        let units: Vec<Arc<LoadedUnit>> = {
            let mut state = write_lock!(self.state);
            state.surfaces.clear();
            state.paths.clear();
            state.relink_cache.clear();
            state
                .units
                .drain()
                .filter_map(|(_, slot)| match slot {
                    UnitSlot::Loaded(unit) => Some(unit),
                    _ => None,
                })
                .collect()
        };

        for unit in &units {
            self.env.code_loader.unload(&self.name, unit.handle);
        }
        units.len()
    }

    /// Runs `f` on the state unless the context is disposed.
    fn publish<T>(&self, f: impl FnOnce(&mut ContextState) -> T) -> Option<T> {
        let mut state = write_lock!(self.state);
        if self.is_disposed() {
            return None;
        }
        Some(f(&mut state))
    }

    /// Drops memoized lookups written after disposal cleared them.
    pub(crate) fn forget_if_disposed(&self) {
        if self.is_disposed() {
            self.clear_caches();
        }
    }

    fn clear_caches(&self) {
        self.local_load.clear();
        self.local_resolve.clear();
        self.global_load_misses.clear();
        self.global_resolve_misses.clear();
    }

    fn report_failure(&self, what: &str, error: &Error) {
        log::error!(
            target: "dotmod::loader",
            "{} failed to load {}: {}",
            self.name,
            what,
            error
        );
        self.env.diagnostics.error(
            Some(&self.name),
            DiagnosticCategory::Package,
            format!("failed to load {what}: {error}"),
        );
    }

    fn read_package(&self, path: &str) -> Result<Vec<u8>> {
        let Some(reader) = &self.reader else {
            return Err(Error::Error(format!("{} has no package", self.name)));
        };
        Ok(reader.open(path)?.data().to_vec())
    }

    /// The body of a load, run under the instance lock.
    fn load_locked(&self, path: &str, name: Option<&str>) -> Result<Option<Arc<LoadedUnit>>> {
        let bytes = self.read_package(path)?;
        let image = Relinker::parse(&bytes, name)?;
        let name = image.name.clone();

        // `Some(outcome)` settles the load without relinking
        let settled = self.publish(|state| match state.units.get(&name) {
            Some(UnitSlot::Loaded(unit)) => {
                let unit = unit.clone();
                state.paths.insert(path.to_string(), Some(unit.clone()));
                Some(Some(unit))
            }
            // Reentrant load of a module already in progress on this thread
            Some(UnitSlot::Pending) => Some(None),
            Some(UnitSlot::Failed) => {
                state.paths.insert(path.to_string(), None);
                Some(None)
            }
            None => {
                state.units.insert(name.clone(), UnitSlot::Pending);
                None
            }
        });
        match settled {
            None => return Ok(None),
            Some(Some(outcome)) => return Ok(outcome),
            Some(None) => {}
        }

        let outcome = {
            let _in_flight = InFlightGuard::enter(self.id, &name, Arc::new(image.surface()));
            self.relink_cached(&name, &bytes, image).and_then(|entry| {
                let handle = self
                    .env
                    .code_loader
                    .load(&self.name, &entry.image, &entry.bytes)?;
                Ok((entry, handle))
            })
        };

        let (entry, handle) = match outcome {
            Ok(loaded) => loaded,
            Err(error) => {
                self.publish(|state| state.units.insert(name.clone(), UnitSlot::Failed));
                return Err(error);
            }
        };

        let unit = Arc::new(LoadedUnit {
            handle,
            name: name.clone(),
            context: self.name.clone(),
            path: path.to_string(),
            surface: entry.surface.clone(),
            image: entry.image.clone(),
            input_checksum: entry.input_checksum,
            checksum: checksum(&entry.bytes),
        });

        let published = self.publish(|state| {
            state.units.insert(name.clone(), UnitSlot::Loaded(unit.clone()));
            state.surfaces.insert(name.clone(), unit.surface.clone());
            state.paths.insert(path.to_string(), Some(unit.clone()));
        });
        if published.is_none() {
            self.env.code_loader.unload(&self.name, handle);
            return Ok(None);
        }
        self.env.registry.bump_epoch();

        log::info!(
            target: "dotmod::loader",
            "{} loaded {} from {}",
            self.name,
            name,
            path
        );
        Ok(Some(unit))
    }

    /// Relinks `image`, reusing the in-memory or on-disk relink cache when the input matches.
    fn relink_cached(&self, name: &str, bytes: &[u8], image: ModuleImage) -> Result<RelinkCacheEntry> {
        let input_checksum = checksum(bytes);
        if let Some(entry) = read_lock!(self.state).relink_cache.get(name) {
            if entry.input_checksum == input_checksum {
                return Ok(entry.clone());
            }
        }

        let env = &self.env;
        let cached = env.disk_cache.as_ref().and_then(|cache| {
            let data = cache.load(&self.name, name, &input_checksum, env.fingerprint())?;
            match ModuleImage::parse(&data) {
                Ok(image) if image.flags.contains(ImageFlags::RELINKED) && image.name == name => {
                    Some((image, data))
                }
                _ => None,
            }
        });

        let (image, relinked) = match cached {
            Some((image, data)) => {
                log::debug!(
                    target: "dotmod::relink",
                    "{} reused cached relink of {}",
                    self.name,
                    name
                );
                (image, data)
            }
            None => {
                let relinked = Relinker::new(&env.relink_map, &env.patches).relink(
                    image,
                    input_checksum,
                    self,
                )?;
                self.relinks.fetch_add(1, Ordering::AcqRel);
                if let Some(cache) = &env.disk_cache {
                    if let Err(error) = cache.store(
                        &self.name,
                        name,
                        &input_checksum,
                        env.fingerprint(),
                        &relinked.bytes,
                    ) {
                        log::warn!(
                            target: "dotmod::relink",
                            "Could not cache relinked {}: {}",
                            name,
                            error
                        );
                    }
                }
                (relinked.image, relinked.bytes)
            }
        };

        let entry = RelinkCacheEntry {
            input_checksum,
            surface: Arc::new(image.surface()),
            image: Arc::new(image),
            bytes: Arc::from(relinked),
        };
        self.publish(|state| state.relink_cache.insert(name.to_string(), entry.clone()));
        Ok(entry)
    }

    pub(crate) fn env(&self) -> &LoaderEnvironment {
        &self.env
    }

    pub(crate) fn local_load_cache(&self) -> &LookupCache<Arc<LoadedUnit>> {
        &self.local_load
    }

    pub(crate) fn local_resolve_cache(&self) -> &LookupCache<Arc<ModuleSurface>> {
        &self.local_resolve
    }

    pub(crate) fn global_load_misses(&self) -> &MissCache {
        &self.global_load_misses
    }

    pub(crate) fn global_resolve_misses(&self) -> &MissCache {
        &self.global_resolve_misses
    }

    pub(crate) fn note_global_scan(&self) {
        self.global_scans.fetch_add(1, Ordering::AcqRel);
    }

    /// `Some(Some(unit))` when loaded, `Some(None)` when pending or failed, `None` if unknown.
    pub(crate) fn own_unit(&self, name: &str) -> Option<Option<Arc<LoadedUnit>>> {
        if self.is_disposed() {
            return Some(None);
        }
        read_lock!(self.state).units.get(name).map(|slot| match slot {
            UnitSlot::Loaded(unit) => Some(unit.clone()),
            UnitSlot::Pending | UnitSlot::Failed => None,
        })
    }

    /// Returns `true` while a load of `name` is in progress.
    pub(crate) fn is_pending(&self, name: &str) -> bool {
        matches!(read_lock!(self.state).units.get(name), Some(UnitSlot::Pending))
    }

    /// A published surface: a loaded module or a parsed package file.
    pub(crate) fn own_surface(&self, name: &str) -> Option<Arc<ModuleSurface>> {
        if self.is_disposed() {
            return None;
        }
        read_lock!(self.state).surfaces.get(name).cloned()
    }

    /// Package path a module named `name` would have next to the entry point.
    pub(crate) fn colocated_path(&self, name: &str) -> Option<String> {
        let (dir, ext) = match &self.entry_point {
            Some(entry) => {
                let ext = extension(entry);
                (
                    parent_dir(entry),
                    if ext.is_empty() {
                        DEFAULT_MODULE_EXTENSION
                    } else {
                        ext
                    },
                )
            }
            None => ("", DEFAULT_MODULE_EXTENSION),
        };
        normalize_path(&format!("{dir}/{name}{ext}")).ok()
    }

    pub(crate) fn package_contains(&self, path: &str) -> bool {
        self.reader
            .as_ref()
            .is_some_and(|reader| reader.contains(path))
    }

    /// Parses and relinks a colocated package file for metadata only, without loading code.
    pub(crate) fn parse_from_package(&self, name: &str) -> Option<Arc<ModuleSurface>> {
        if self.is_disposed() || resolver::in_flight_surface(self.id, name).is_some() {
            return None;
        }

        let path = self.colocated_path(name)?;
        if !self.package_contains(&path) {
            return None;
        }

        // Serialized with loads when uncontended
        let _load = self.load_lock.try_lock();
        {
            let state = read_lock!(self.state);
            if let Some(surface) = state.surfaces.get(name) {
                return Some(surface.clone());
            }
            // Pending elsewhere or failed
            if state.units.contains_key(name) {
                return None;
            }
        }

        let bytes = self.read_package(&path).ok()?;
        let image = match Relinker::parse(&bytes, Some(name)) {
            Ok(image) => image,
            Err(error) => {
                log::debug!(target: "dotmod::loader", "{}: {} unparsable: {}", self.name, path, error);
                return None;
            }
        };

        let relinked = {
            let _in_flight = InFlightGuard::enter(self.id, name, Arc::new(image.surface()));
            self.relink_cached(name, &bytes, image)
        };

        match relinked {
            Ok(entry) => {
                let surface = self.publish(|state| {
                    state
                        .surfaces
                        .entry(name.to_string())
                        .or_insert(entry.surface)
                        .clone()
                })?;
                self.env.registry.bump_epoch();
                Some(surface)
            }
            Err(error) => {
                log::debug!(
                    target: "dotmod::loader",
                    "{}: {} does not relink: {}",
                    self.name,
                    path,
                    error
                );
                None
            }
        }
    }
}

impl SymbolResolver for IsolationContext {
    fn resolve_module(&self, name: &str) -> Option<Arc<ModuleSurface>> {
        self.resolve(name)
    }
}

impl Drop for IsolationContext {
    fn drop(&mut self) {
        if *self.disposed.get_mut() {
            return;
        }
        // Dropped without dispose: the registry entry is already dead, only units remain.
        if let Ok(state) = self.state.get_mut() {
            for (_, slot) in state.units.drain() {
                if let UnitSlot::Loaded(unit) = slot {
                    self.env.code_loader.unload(&self.name, unit.handle);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{
        builders::{caller_module, leaf_module},
        environment, embedded_context,
    };

    #[test]
    fn test_load_is_idempotent_per_path() {
        let (env, loader) = environment();
        let ctx = embedded_context(
            &env,
            "Foo",
            &[("Code/Foo.dll", leaf_module("Foo", "Foo.Plugin"))],
            Some("Code/Foo.dll"),
        );

        let first = ctx.load_from_package_path("Code/Foo.dll", None).unwrap();
        let second = ctx.load_from_package_path(r".\Code\x\..\Foo.dll", None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.load_count(), 1);
        assert_eq!(first.path, "Code/Foo.dll");
        assert!(ctx.relink_cache_entry("Foo").is_some());
    }

    #[test]
    fn test_failed_load_is_not_retried() {
        let (env, loader) = environment();
        let ctx = embedded_context(
            &env,
            "Foo",
            &[("Foo.dll", caller_module("Foo", "Missing", "Missing.Api", "Run"))],
            Some("Foo.dll"),
        );

        assert!(ctx.load_from_package_path("Foo.dll", None).is_none());
        assert!(ctx.load_from_package_path("Foo.dll", None).is_none());
        assert_eq!(loader.load_count(), 0);
        // Relinking was attempted exactly once
        assert_eq!(env.diagnostics.for_module("Foo").len(), 2);
        assert!(ctx.unit("Foo").is_none());
    }

    #[test]
    fn test_missing_file_and_bad_path() {
        let (env, _) = environment();
        let ctx = embedded_context(&env, "Foo", &[], None);
        assert!(ctx.load_from_package_path("Nope.dll", None).is_none());
        assert!(ctx.load_from_package_path("../escape.dll", None).is_none());
        assert!(env.diagnostics.has_errors());
    }

    #[test]
    fn test_name_override() {
        let (env, _) = environment();
        let ctx = embedded_context(
            &env,
            "Foo",
            &[("Foo.dll", leaf_module("Foo", "Foo.Plugin"))],
            None,
        );
        let unit = ctx.load_from_package_path("Foo.dll", Some("Foo.Renamed")).unwrap();
        assert_eq!(unit.name, "Foo.Renamed");
        assert!(ctx.unit("Foo.Renamed").is_some());
    }

    #[test]
    fn test_colocated_path() {
        let (env, _) = environment();
        let ctx = embedded_context(&env, "Foo", &[], Some(r"Code\Foo.mod"));
        assert_eq!(ctx.colocated_path("Bar").as_deref(), Some("Code/Bar.mod"));

        let bare = embedded_context(&env, "Bare", &[], None);
        assert_eq!(bare.colocated_path("Bar").as_deref(), Some("Bar.dll"));
    }

    #[test]
    fn test_dispose_releases_everything() {
        let (env, loader) = environment();
        let ctx = embedded_context(
            &env,
            "Foo",
            &[("Foo.dll", leaf_module("Foo", "Foo.Plugin"))],
            Some("Foo.dll"),
        );
        ctx.load_entry_point().unwrap();
        assert_eq!(loader.live_count(), 1);
        assert!(env.registry.contains(&ctx));

        assert!(ctx.dispose());
        assert!(!ctx.dispose());
        assert!(ctx.is_disposed());
        assert_eq!(loader.live_count(), 0);
        assert!(!env.registry.contains(&ctx));
        assert!(ctx.loaded_units().is_empty());
        assert_eq!(ctx.cached_lookup_count(), 0);

        // Nothing can be loaded into a disposed context
        assert!(ctx.load_entry_point().is_none());
        assert!(ctx.resolve("Foo").is_none());
    }

    #[test]
    fn test_nothing_is_published_after_dispose() {
        let (env, _) = environment();
        let ctx = embedded_context(&env, "Foo", &[], None);
        assert_eq!(ctx.publish(|state| state.paths.len()), Some(0));

        ctx.dispose();
        assert!(ctx
            .publish(|state| state.paths.insert("Foo.dll".into(), None))
            .is_none());
        assert!(read_lock!(ctx.state).paths.is_empty());
        assert!(!ctx.add_dependency(&embedded_context(&env, "Bar", &[], None)));
    }

    #[test]
    fn test_late_memo_writes_are_forgotten() {
        let (env, _) = environment();
        let ctx = embedded_context(&env, "Foo", &[], None);
        ctx.global_resolve_misses().record("Late", 0);
        ctx.forget_if_disposed();
        assert_eq!(ctx.cached_lookup_count(), 1);

        ctx.dispose();
        // A lookup that started before disposal finishes its write
        ctx.global_resolve_misses().record("Later", 0);
        ctx.forget_if_disposed();
        assert_eq!(ctx.cached_lookup_count(), 0);
    }

    #[test]
    fn test_self_referencing_colocated_module() {
        let (env, loader) = environment();
        let ctx = embedded_context(
            &env,
            "Foo",
            &[
                ("Code/Foo.dll", leaf_module("Foo", "Foo.Plugin")),
                ("Code/Lib.dll", caller_module("Lib", "Lib", "Lib.Plugin", "Load")),
            ],
            Some("Code/Foo.dll"),
        );
        ctx.load_entry_point().unwrap();

        assert!(ctx.resolve("Lib").is_some());
        assert!(ctx.relink_cache_entry("Lib").is_some());
        assert!(!ctx.is_pending("Lib"));
        let unit = ctx.load_dependency("Lib").unwrap();
        assert_eq!(unit.path, "Code/Lib.dll");
        assert_eq!(loader.live_count(), 2);
        // The metadata parse was reused
        assert_eq!(ctx.relink_count(), 2);
    }

    #[test]
    fn test_drop_without_dispose_unloads() {
        let (env, loader) = environment();
        let ctx = embedded_context(
            &env,
            "Foo",
            &[("Foo.dll", leaf_module("Foo", "Foo.Plugin"))],
            Some("Foo.dll"),
        );
        ctx.load_entry_point().unwrap();
        drop(ctx);
        assert_eq!(loader.live_count(), 0);
        assert!(env.registry.is_empty());
    }
}

//! Loading mod code into isolation contexts.
//!
//! Every mod gets one [`context::IsolationContext`]. The context reads compiled modules from
//! the mod's package, relinks them against the patched host and hands the result to the
//! host's [`CodeLoader`]. When a module references a name the context does not own, the
//! resolver looks it up first in the context's own package and declared dependencies, then
//! across every registered context, and finally in the host's own modules.
//!
//! # Architecture
//!
//! - [`crate::loader::context`] - Per-mod state machine: load, resolve, dispose
//! - [`crate::loader::registry`] - Process-wide list of live contexts
//! - [`crate::loader::package`] - Directory, archive and embedded package readers
//! - `resolver` - Two-round lookup with memoized results
//! - `cache` - Memo entries used by the resolver
//!
//! Shared services (registry, code loader, relink configuration, diagnostics) travel together
//! in a [`LoaderEnvironment`] so a context never reaches for global state.
//!
//! # Ownership
//!
//! Contexts own their loaded units. Everything that crosses a context boundary, the registry
//! entries and promoted dependency links, is a `Weak` reference, so dropping or disposing a
//! context never depends on another context letting go first.

mod cache;
pub mod context;
pub mod package;
pub mod registry;
mod resolver;

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use dashmap::DashMap;

use crate::{
    detour::patch::PatchSet,
    metadata::{diagnostics::Diagnostics, image::ModuleImage, surface::ModuleSurface},
    relink::{cache::RelinkDiskCache, fingerprint, map::RelinkMap},
    Result,
};

use registry::ContextRegistry;

/// A module that passed relinking and was accepted by the [`CodeLoader`].
#[derive(Debug)]
pub struct LoadedUnit {
    /// Handle returned by the code loader
    pub handle: u64,
    /// Simple module name
    pub name: String,
    /// Name of the owning context
    pub context: String,
    /// Normalized package path the module was read from
    pub path: String,
    /// Exported surface after relinking
    pub surface: Arc<ModuleSurface>,
    /// The relinked image
    pub image: Arc<ModuleImage>,
    /// SHA-1 of the original bytes
    pub input_checksum: [u8; 20],
    /// SHA-1 of the relinked bytes
    pub checksum: [u8; 20],
}

/// The host's mechanism for turning relinked modules into executable code.
pub trait CodeLoader: Send + Sync {
    /// Loads a relinked module on behalf of `context` and returns a handle for it.
    ///
    /// # Errors
    /// Any error rejects the module; the context records the failure.
    fn load(&self, context: &str, image: &ModuleImage, bytes: &[u8]) -> Result<u64>;

    /// Releases a previously loaded module.
    fn unload(&self, context: &str, handle: u64);
}

/// A [`CodeLoader`] that keeps loaded modules as bookkeeping entries only.
///
/// Suitable for hosts that execute nothing themselves (tools, tests) and for inspecting what
/// the loader did: every load and unload is counted.
#[derive(Debug, Default)]
pub struct InProcessLoader {
    next_handle: AtomicU64,
    loads: AtomicUsize,
    live: DashMap<u64, (String, String)>,
}

impl InProcessLoader {
    /// Creates a loader with nothing loaded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of successful loads.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Acquire)
    }

    /// Number of loaded and not yet unloaded modules.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Number of live modules owned by `context`.
    #[must_use]
    pub fn live_count_of(&self, context: &str) -> usize {
        self.live
            .iter()
            .filter(|entry| entry.value().0 == context)
            .count()
    }

    /// Returns `true` if `handle` is loaded.
    #[must_use]
    pub fn is_live(&self, handle: u64) -> bool {
        self.live.contains_key(&handle)
    }
}

impl CodeLoader for InProcessLoader {
    fn load(&self, context: &str, image: &ModuleImage, _bytes: &[u8]) -> Result<u64> {
        let handle = self.next_handle.fetch_add(1, Ordering::AcqRel) + 1;
        self.live
            .insert(handle, (context.to_string(), image.name.clone()));
        self.loads.fetch_add(1, Ordering::AcqRel);
        Ok(handle)
    }

    fn unload(&self, context: &str, handle: u64) {
        if self.live.remove(&handle).is_none() {
            log::warn!(
                target: "dotmod::loader",
                "Context {} unloaded unknown handle {}",
                context,
                handle
            );
        }
    }
}

/// The process default resolution for names no mod provides: the patched host binary and
/// framework libraries.
pub trait NativeResolver: Send + Sync {
    /// Returns the surface of a host module.
    fn resolve(&self, name: &str) -> Option<Arc<ModuleSurface>>;
}

/// A [`NativeResolver`] over an explicit table of host module surfaces.
#[derive(Debug, Default)]
pub struct HostModules {
    modules: DashMap<String, Arc<ModuleSurface>>,
}

impl HostModules {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module surface, replacing any module of the same name.
    pub fn add(&self, surface: ModuleSurface) {
        self.modules.insert(surface.name.clone(), Arc::new(surface));
    }

    /// Adds the exported surface of a host image.
    #[must_use]
    pub fn with_image(self, image: &ModuleImage) -> Self {
        self.add(image.surface());
        self
    }

    /// Adds a module surface.
    #[must_use]
    pub fn with_surface(self, surface: ModuleSurface) -> Self {
        self.add(surface);
        self
    }

    /// Number of host modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` if no host modules are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl NativeResolver for HostModules {
    fn resolve(&self, name: &str) -> Option<Arc<ModuleSurface>> {
        self.modules.get(name).map(|entry| entry.value().clone())
    }
}

/// Services shared by every isolation context of one runtime.
pub struct LoaderEnvironment {
    /// Live contexts
    pub registry: ContextRegistry,
    /// Recoverable failures
    pub diagnostics: Arc<Diagnostics>,
    /// Turns relinked modules into code
    pub code_loader: Arc<dyn CodeLoader>,
    /// Host module fallback
    pub native: Arc<dyn NativeResolver>,
    /// Renames applied by the relinker
    pub relink_map: RelinkMap,
    /// Static call-site patches applied by the relinker
    pub patches: PatchSet,
    /// Optional on-disk store of relinked modules
    pub disk_cache: Option<RelinkDiskCache>,
    fingerprint: [u8; 20],
}

impl LoaderEnvironment {
    /// Bundles the loader services.
    #[must_use]
    pub fn new(
        code_loader: Arc<dyn CodeLoader>,
        native: Arc<dyn NativeResolver>,
        relink_map: RelinkMap,
        patches: PatchSet,
        disk_cache: Option<RelinkDiskCache>,
    ) -> Self {
        LoaderEnvironment {
            registry: ContextRegistry::new(),
            diagnostics: Arc::new(Diagnostics::new()),
            fingerprint: fingerprint(&relink_map, &patches),
            code_loader,
            native,
            relink_map,
            patches,
            disk_cache,
        }
    }

    /// Fingerprint of the relink map and patch set, the on-disk cache key.
    #[must_use]
    pub fn fingerprint(&self) -> &[u8; 20] {
        &self.fingerprint
    }
}

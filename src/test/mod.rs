//! Fixtures shared by the unit tests: loader environments, embedded packages and small
//! module images.

pub mod builders;

use std::sync::Arc;

use crate::{
    detour::patch::PatchSet,
    loader::{
        context::IsolationContext, package::EmbeddedPackage, HostModules, InProcessLoader,
        LoaderEnvironment,
    },
    metadata::identity::{ModuleMetadata, ModuleVersion, PackageSource},
    relink::map::RelinkMap,
};

/// An environment without host modules, relink map or disk cache, and its code loader.
pub fn environment() -> (Arc<LoaderEnvironment>, Arc<InProcessLoader>) {
    environment_with(Arc::new(HostModules::new()), RelinkMap::new())
}

/// An environment over the given host modules and relink map.
pub fn environment_with(
    host: Arc<HostModules>,
    map: RelinkMap,
) -> (Arc<LoaderEnvironment>, Arc<InProcessLoader>) {
    let loader = Arc::new(InProcessLoader::new());
    let env = Arc::new(LoaderEnvironment::new(
        loader.clone(),
        host,
        map,
        PatchSet::new(),
        None,
    ));
    (env, loader)
}

/// Metadata of a mod whose package holds `files`.
pub fn embedded_metadata(name: &str, files: &[(&str, Vec<u8>)], entry: Option<&str>) -> ModuleMetadata {
    let mut package = EmbeddedPackage::new(name);
    for (path, bytes) in files {
        package = package.with_file(path, bytes.clone()).unwrap();
    }
    let metadata = ModuleMetadata::new(
        name,
        ModuleVersion::new(1, 0, 0),
        PackageSource::Embedded(package),
    );
    match entry {
        Some(entry) => metadata.with_entry_point(entry),
        None => metadata,
    }
}

/// A registered context for a mod whose package holds `files`.
pub fn embedded_context(
    env: &Arc<LoaderEnvironment>,
    name: &str,
    files: &[(&str, Vec<u8>)],
    entry: Option<&str>,
) -> Arc<IsolationContext> {
    IsolationContext::create(&embedded_metadata(name, files, entry), env).unwrap()
}

//! Ordering a batch of discovered modules before registration.
//!
//! Modules whose required dependencies cannot be satisfied are dropped first, repeatedly,
//! because dropping one may leave a dependent without its dependency. The survivors are
//! ordered with [`ModuleDependencyGraph::load_order`] so every dependency registers before
//! its dependents, except inside a cycle where the batch order decides.

use std::collections::{HashMap, HashSet};

use crate::{
    metadata::{
        dependencies::ModuleDependencyGraph,
        identity::{ModuleDependency, ModuleMetadata, ModuleVersion},
    },
    Error,
};

/// Outcome of planning a batch.
#[derive(Debug, Default)]
pub struct BatchPlan {
    /// Modules to register, in order
    pub order: Vec<ModuleMetadata>,
    /// Modules left out, with the reason
    pub skipped: Vec<(String, Error)>,
    /// Dependency problems tolerated in permissive mode
    pub warnings: Vec<Error>,
    /// A dependency cycle among the ordered modules, if any
    pub cycle: Option<Vec<String>>,
}

fn unsatisfied(
    module: &str,
    dependency: &ModuleDependency,
    version: Option<ModuleVersion>,
) -> Option<Error> {
    let reason = match version {
        None => "not found".to_string(),
        Some(found) if !found.satisfies(&dependency.min_version) => {
            format!("found incompatible version {found}")
        }
        Some(_) => return None,
    };
    Some(Error::DependencyNotSatisfied {
        module: module.to_string(),
        dependency: dependency.to_string(),
        reason,
    })
}

/// Plans the registration of `batch`.
///
/// `registered` reports the version of an already registered module. With `strict` set,
/// modules with unsatisfied required dependencies are skipped; otherwise they are kept and
/// the problem is reported as a warning.
pub fn plan<F>(batch: Vec<ModuleMetadata>, registered: F, strict: bool) -> BatchPlan
where
    F: Fn(&str) -> Option<ModuleVersion>,
{
    let mut plan = BatchPlan::default();

    let mut candidates: Vec<ModuleMetadata> = Vec::with_capacity(batch.len());
    let mut seen = HashSet::new();
    for metadata in batch {
        if registered(&metadata.name).is_some() || !seen.insert(metadata.name.clone()) {
            let name = metadata.name.clone();
            plan.skipped.push((name.clone(), Error::DuplicateModule(name)));
        } else {
            candidates.push(metadata);
        }
    }

    let version_of = |viable: &HashMap<String, ModuleVersion>, name: &str| {
        viable.get(name).copied().or_else(|| registered(name))
    };

    let mut viable: HashMap<String, ModuleVersion> = candidates
        .iter()
        .map(|m| (m.name.clone(), m.version))
        .collect();

    loop {
        let mut dropped = Vec::new();
        for metadata in candidates.iter().filter(|m| viable.contains_key(&m.name)) {
            let problem = metadata
                .dependencies
                .iter()
                .find_map(|dep| unsatisfied(&metadata.name, dep, version_of(&viable, &dep.name)));
            if let Some(problem) = problem {
                dropped.push((metadata.name.clone(), problem));
            }
        }

        if !strict {
            plan.warnings
                .extend(dropped.into_iter().map(|(_, problem)| problem));
            break;
        }
        if dropped.is_empty() {
            break;
        }
        for (name, problem) in dropped {
            viable.remove(&name);
            plan.skipped.push((name, problem));
        }
    }

    let graph = ModuleDependencyGraph::new();
    for metadata in candidates.iter().filter(|m| viable.contains_key(&m.name)) {
        graph.add_module(&metadata.name);
        for (dep, _) in metadata.all_dependencies() {
            if viable.contains_key(&dep.name) {
                graph.add_dependency(&metadata.name, &dep.name);
            }
        }
    }
    plan.cycle = graph.find_cycle();

    let mut by_name: HashMap<String, ModuleMetadata> = candidates
        .into_iter()
        .filter(|m| viable.contains_key(&m.name))
        .map(|m| (m.name.clone(), m))
        .collect();
    plan.order = graph
        .load_order()
        .into_iter()
        .flatten()
        .filter_map(|name| by_name.remove(&name))
        .collect();
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::identity::PackageSource;

    fn module(name: &str, version: ModuleVersion) -> ModuleMetadata {
        ModuleMetadata::new(
            name,
            version,
            PackageSource::Directory(format!("mods/{name}").into()),
        )
    }

    fn v(major: u16, minor: u16) -> ModuleVersion {
        ModuleVersion::new(major, minor, 0)
    }

    fn names(plan: &BatchPlan) -> Vec<&str> {
        plan.order.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn test_dependencies_first() {
        let batch = vec![
            module("App", v(1, 0)).with_dependency("Core", v(1, 0)),
            module("Core", v(1, 2)),
        ];
        let plan = plan(batch, |_| None, true);
        assert_eq!(names(&plan), vec!["Core", "App"]);
        assert!(plan.skipped.is_empty());
        assert!(plan.cycle.is_none());
    }

    #[test]
    fn test_missing_dependency_cascades() {
        let batch = vec![
            module("Top", v(1, 0)).with_dependency("Mid", v(1, 0)),
            module("Mid", v(1, 0)).with_dependency("Gone", v(1, 0)),
            module("Free", v(1, 0)),
        ];
        let plan = plan(batch, |_| None, true);
        assert_eq!(names(&plan), vec!["Free"]);
        let skipped: Vec<&str> = plan.skipped.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(skipped, vec!["Mid", "Top"]);
        assert!(matches!(
            &plan.skipped[0].1,
            Error::DependencyNotSatisfied { reason, .. } if reason == "not found"
        ));
    }

    #[test]
    fn test_version_checks_and_registered_modules() {
        let batch = vec![
            module("Old", v(1, 0)).with_dependency("Core", v(1, 5)),
            module("Major", v(1, 0)).with_dependency("Core", v(2, 0)),
            module("Fine", v(1, 0)).with_dependency("Core", v(1, 1)),
        ];
        let registered = |name: &str| (name == "Core").then(|| v(1, 3));
        let plan = plan(batch, registered, true);
        assert_eq!(names(&plan), vec!["Fine"]);
        assert_eq!(plan.skipped.len(), 2);
    }

    #[test]
    fn test_permissive_keeps_modules() {
        let batch = vec![module("Lonely", v(1, 0)).with_dependency("Gone", v(1, 0))];
        let plan = plan(batch, |_| None, false);
        assert_eq!(names(&plan), vec!["Lonely"]);
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn test_cycles_and_duplicates() {
        let batch = vec![
            module("A", v(1, 0)).with_dependency("B", v(1, 0)),
            module("B", v(1, 0)).with_dependency("A", v(1, 0)),
            module("A", v(2, 0)),
            module("Optional", v(1, 0)).with_optional_dependency("A", v(1, 0)),
        ];
        let plan = plan(batch, |_| None, true);
        assert_eq!(names(&plan), vec!["A", "B", "Optional"]);
        assert!(plan.cycle.is_some());
        assert!(matches!(&plan.skipped[0].1, Error::DuplicateModule(name) if name == "A"));
    }
}

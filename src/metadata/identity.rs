//! Mod identity: versions, dependency declarations and package locations.
//!
//! A [`ModuleMetadata`] record is produced by whatever reads the mod's manifest before the
//! loader runs. The loader only consumes it: the name keys the isolation context, the
//! dependency list drives load ordering and context linking, and the [`PackageSource`] tells
//! the context where to read compiled modules from.
//!
//! # Version Compatibility
//!
//! A dependency `name >= min` is satisfied by a module of the same name whose version has the
//! same major component and compares greater or equal. This mirrors how assembly versions
//! are treated for binding: a new major version is assumed to break its API.
//!
//! # Examples
//!
//! ```rust
//! use dotmod::metadata::identity::{ModuleMetadata, ModuleVersion, PackageSource};
//!
//! let meta = ModuleMetadata::new(
//!     "Foo",
//!     ModuleVersion::parse("1.2")?,
//!     PackageSource::Directory("mods/Foo".into()),
//! )
//! .with_dependency("Core", ModuleVersion::new(1, 0, 0))
//! .with_entry_point("Foo.dll");
//!
//! assert_eq!(meta.version.to_string(), "1.2.0");
//! assert!(ModuleVersion::new(1, 4, 0).satisfies(&meta.dependencies[0].min_version));
//! # Ok::<(), dotmod::Error>(())
//! ```

use std::{fmt, path::PathBuf};

use crate::{loader::package::EmbeddedPackage, Result};

/// A `major.minor.patch` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ModuleVersion {
    /// Breaking changes
    pub major: u16,
    /// Backwards compatible additions
    pub minor: u16,
    /// Fixes
    pub patch: u16,
}

impl ModuleVersion {
    /// Creates a version from its components.
    #[must_use]
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        ModuleVersion {
            major,
            minor,
            patch,
        }
    }

    /// Parses `major[.minor[.patch]]`; missing components are zero.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for empty input, more than three components, or a
    /// component that is not a `u16`.
    pub fn parse(version_str: &str) -> Result<Self> {
        let trimmed = version_str.trim();
        if trimmed.is_empty() {
            return Err(malformed_error!("Empty version string"));
        }

        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() > 3 {
            return Err(malformed_error!("Invalid version format: {}", version_str));
        }

        let mut components = [0u16; 3];
        for (i, part) in parts.iter().enumerate() {
            components[i] = part
                .parse::<u16>()
                .map_err(|_| malformed_error!("Invalid version component: {}", part))?;
        }

        Ok(Self::new(components[0], components[1], components[2]))
    }

    /// Returns `true` if this version can stand in for a dependency requiring `required`.
    #[must_use]
    pub fn satisfies(&self, required: &ModuleVersion) -> bool {
        self.major == required.major && *self >= *required
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A declared dependency on another mod.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleDependency {
    /// Name of the required mod
    pub name: String,
    /// Lowest acceptable version
    pub min_version: ModuleVersion,
}

impl ModuleDependency {
    /// Creates a dependency declaration.
    #[must_use]
    pub fn new(name: impl Into<String>, min_version: ModuleVersion) -> Self {
        ModuleDependency {
            name: name.into(),
            min_version,
        }
    }
}

impl fmt::Display for ModuleDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} >= {}", self.name, self.min_version)
    }
}

/// Where a mod's files live. Exactly one location per mod.
#[derive(Debug, Clone)]
pub enum PackageSource {
    /// An unpacked directory on disk
    Directory(PathBuf),
    /// A zip archive on disk
    Archive(PathBuf),
    /// Files shipped inside the host process
    Embedded(EmbeddedPackage),
}

impl PackageSource {
    /// Short human readable description for diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            PackageSource::Directory(path) => format!("directory {}", path.display()),
            PackageSource::Archive(path) => format!("archive {}", path.display()),
            PackageSource::Embedded(package) => format!("embedded package {}", package.name()),
        }
    }
}

/// Identity record for one mod.
///
/// Immutable once registered. Runtime state such as the owning isolation context is kept by
/// the lifecycle manager, not here.
#[derive(Debug, Clone)]
pub struct ModuleMetadata {
    /// Unique mod name
    pub name: String,
    /// Mod version
    pub version: ModuleVersion,
    /// Mods that must be present
    pub dependencies: Vec<ModuleDependency>,
    /// Mods that are linked if present, ignored otherwise
    pub optional_dependencies: Vec<ModuleDependency>,
    /// Package location
    pub source: PackageSource,
    /// Path of the primary compiled module inside the package, if the mod has code
    pub entry_point: Option<String>,
}

impl ModuleMetadata {
    /// Creates a record without dependencies or entry point.
    #[must_use]
    pub fn new(name: impl Into<String>, version: ModuleVersion, source: PackageSource) -> Self {
        ModuleMetadata {
            name: name.into(),
            version,
            dependencies: Vec::new(),
            optional_dependencies: Vec::new(),
            source,
            entry_point: None,
        }
    }

    /// Adds a required dependency.
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>, min_version: ModuleVersion) -> Self {
        self.dependencies
            .push(ModuleDependency::new(name, min_version));
        self
    }

    /// Adds an optional dependency.
    #[must_use]
    pub fn with_optional_dependency(
        mut self,
        name: impl Into<String>,
        min_version: ModuleVersion,
    ) -> Self {
        self.optional_dependencies
            .push(ModuleDependency::new(name, min_version));
        self
    }

    /// Sets the primary compiled module.
    #[must_use]
    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = Some(entry_point.into());
        self
    }

    /// Iterates required then optional dependencies.
    pub fn all_dependencies(&self) -> impl Iterator<Item = (&ModuleDependency, bool)> {
        self.dependencies
            .iter()
            .map(|dep| (dep, false))
            .chain(self.optional_dependencies.iter().map(|dep| (dep, true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_version_parse() {
        assert_eq!(
            ModuleVersion::parse("1.2.3").unwrap(),
            ModuleVersion::new(1, 2, 3)
        );
        assert_eq!(
            ModuleVersion::parse(" 2 ").unwrap(),
            ModuleVersion::new(2, 0, 0)
        );
        assert_eq!(
            ModuleVersion::parse("1.4").unwrap(),
            ModuleVersion::new(1, 4, 0)
        );
    }

    #[test]
    fn test_version_parse_errors() {
        for input in ["", "1.2.3.4", "a.b", "1.-2", "70000"] {
            assert!(
                matches!(ModuleVersion::parse(input), Err(Error::Malformed { .. })),
                "accepted {input:?}"
            );
        }
    }

    #[test]
    fn test_version_satisfies() {
        let required = ModuleVersion::new(1, 2, 0);
        assert!(ModuleVersion::new(1, 2, 0).satisfies(&required));
        assert!(ModuleVersion::new(1, 3, 1).satisfies(&required));
        assert!(!ModuleVersion::new(1, 1, 9).satisfies(&required));
        assert!(!ModuleVersion::new(2, 0, 0).satisfies(&required));
    }

    #[test]
    fn test_metadata_builder() {
        let meta = ModuleMetadata::new(
            "Foo",
            ModuleVersion::new(1, 0, 0),
            PackageSource::Archive("Foo.zip".into()),
        )
        .with_dependency("Core", ModuleVersion::new(1, 0, 0))
        .with_optional_dependency("Extras", ModuleVersion::new(0, 1, 0))
        .with_entry_point("Foo.dll");

        let deps: Vec<(String, bool)> = meta
            .all_dependencies()
            .map(|(dep, optional)| (dep.name.clone(), optional))
            .collect();
        assert_eq!(
            deps,
            vec![("Core".to_string(), false), ("Extras".to_string(), true)]
        );
        assert_eq!(meta.entry_point.as_deref(), Some("Foo.dll"));
        assert_eq!(meta.source.describe(), "archive Foo.zip");
        assert_eq!(meta.dependencies[0].to_string(), "Core >= 1.0.0");
    }
}

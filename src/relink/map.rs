//! Rename tables applied while relinking.
//!
//! The patched host binary renames some of the original binary's modules, types and members.
//! A [`RelinkMap`] records those renames so mods compiled against the original binary can be
//! retargeted without recompilation. Three levels exist, applied in this order:
//!
//! 1. **Modules**: an `AssemblyRef` named `from` is renamed to `to`
//! 2. **Types**: a `TypeRef` or signature class named `from` is renamed to `to`
//! 3. **Members**: a `MemberRef` to `(type, member)` is redirected to a different module,
//!    type and member name, keeping its signature
//!
//! Member redirects are keyed by the type name as originally compiled, before type renames.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};

/// A member as it appears in a compiled reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberKey {
    /// Full name of the declaring type
    pub type_name: String,
    /// Member name
    pub member: String,
}

impl MemberKey {
    /// Creates a key.
    pub fn new(type_name: impl Into<String>, member: impl Into<String>) -> Self {
        MemberKey {
            type_name: type_name.into(),
            member: member.into(),
        }
    }
}

/// Where a redirected member lives after relinking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberTarget {
    /// Module to reference, or `None` to keep the reference's current module
    pub module: Option<String>,
    /// Full name of the new declaring type
    pub type_name: String,
    /// New member name
    pub member: String,
}

impl MemberTarget {
    /// A target in the same module as the original reference.
    pub fn same_module(type_name: impl Into<String>, member: impl Into<String>) -> Self {
        MemberTarget {
            module: None,
            type_name: type_name.into(),
            member: member.into(),
        }
    }

    /// A target in another module.
    pub fn in_module(
        module: impl Into<String>,
        type_name: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        MemberTarget {
            module: Some(module.into()),
            type_name: type_name.into(),
            member: member.into(),
        }
    }
}

/// Module, type and member renames from the original host binary to the patched one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelinkMap {
    modules: BTreeMap<String, String>,
    types: BTreeMap<String, String>,
    members: BTreeMap<MemberKey, MemberTarget>,
}

impl RelinkMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The usual starting point: references to `original` go to `patched`.
    #[must_use]
    pub fn host(original: &str, patched: &str) -> Self {
        Self::new().with_module(original, patched)
    }

    /// Adds a module rename.
    #[must_use]
    pub fn with_module(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.modules.insert(from.into(), to.into());
        self
    }

    /// Adds a type rename.
    #[must_use]
    pub fn with_type(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.types.insert(from.into(), to.into());
        self
    }

    /// Adds a member redirect.
    #[must_use]
    pub fn with_member(mut self, from: MemberKey, to: MemberTarget) -> Self {
        self.members.insert(from, to);
        self
    }

    /// New name for a module, if renamed.
    #[must_use]
    pub fn map_module(&self, name: &str) -> Option<&str> {
        self.modules.get(name).map(String::as_str)
    }

    /// New name for a type, if renamed.
    #[must_use]
    pub fn map_type(&self, name: &str) -> Option<&str> {
        self.types.get(name).map(String::as_str)
    }

    /// Redirect target for a member, if any.
    #[must_use]
    pub fn map_member(&self, type_name: &str, member: &str) -> Option<&MemberTarget> {
        self.members.get(&MemberKey::new(type_name, member))
    }

    /// Returns `true` if the map renames nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty() && self.types.is_empty() && self.members.is_empty()
    }

    /// SHA-1 over the map contents, stable across runs.
    ///
    /// Part of the on-disk relink cache key: a cached module is only reused if it was relinked
    /// with an identical map.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 20] {
        let mut hasher = Sha1::new();
        for (from, to) in &self.modules {
            hasher.update(b"M\0");
            hasher.update(from.as_bytes());
            hasher.update(b"\0");
            hasher.update(to.as_bytes());
            hasher.update(b"\0");
        }
        for (from, to) in &self.types {
            hasher.update(b"T\0");
            hasher.update(from.as_bytes());
            hasher.update(b"\0");
            hasher.update(to.as_bytes());
            hasher.update(b"\0");
        }
        for (from, to) in &self.members {
            hasher.update(b"R\0");
            for part in [
                from.type_name.as_str(),
                from.member.as_str(),
                to.module.as_deref().unwrap_or(""),
                to.type_name.as_str(),
                to.member.as_str(),
            ] {
                hasher.update(part.as_bytes());
                hasher.update(b"\0");
            }
        }

        let mut out = [0u8; 20];
        out.copy_from_slice(&hasher.finalize());
        out
    }
}

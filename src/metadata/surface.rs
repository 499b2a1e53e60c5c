//! Exported reference surfaces of loaded or parsed modules.
//!
//! A [`ModuleSurface`] is what the resolver hands back for a simple name: the public types
//! and methods a module exposes. The relinker verifies every outgoing `TypeRef` and
//! `MemberRef` against the surface of the module it points at, so a surface is all that is
//! needed to link against another mod without touching its code unit.

use std::collections::BTreeMap;

use crate::metadata::{
    identity::ModuleVersion, image::TypeFlags, signature::MethodSignature,
};

/// A public method of an exported type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSurface {
    /// Method name
    pub name: String,
    /// Method signature
    pub signature: MethodSignature,
}

/// A public type and its public methods.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypeSurface {
    /// Type attributes
    pub flags: TypeFlags,
    /// Public methods, in definition order
    pub methods: Vec<MethodSurface>,
}

impl TypeSurface {
    /// Creates an empty type surface.
    #[must_use]
    pub fn new(flags: TypeFlags) -> Self {
        TypeSurface {
            flags,
            methods: Vec::new(),
        }
    }

    /// Adds a method.
    pub fn add_method(&mut self, name: &str, signature: MethodSignature) {
        self.methods.push(MethodSurface {
            name: name.to_string(),
            signature,
        });
    }

    /// Returns `true` if a method with this name and signature is exported.
    #[must_use]
    pub fn has_method(&self, name: &str, signature: &MethodSignature) -> bool {
        self.methods
            .iter()
            .any(|m| m.name == name && &m.signature == signature)
    }
}

/// The exported surface of one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSurface {
    /// Simple module name
    pub name: String,
    /// Module version
    pub version: ModuleVersion,
    types: BTreeMap<String, TypeSurface>,
}

impl ModuleSurface {
    /// Creates a surface with no types.
    #[must_use]
    pub fn new(name: &str, version: ModuleVersion) -> Self {
        ModuleSurface {
            name: name.to_string(),
            version,
            types: BTreeMap::new(),
        }
    }

    /// Adds or replaces an exported type.
    pub fn add_type(&mut self, name: &str, surface: TypeSurface) {
        self.types.insert(name.to_string(), surface);
    }

    /// Returns an exported type.
    #[must_use]
    pub fn get_type(&self, name: &str) -> Option<&TypeSurface> {
        self.types.get(name)
    }

    /// Returns `true` if the type is exported.
    #[must_use]
    pub fn has_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Returns `true` if `type_name` exports a method with this name and signature.
    #[must_use]
    pub fn has_method(&self, type_name: &str, name: &str, signature: &MethodSignature) -> bool {
        self.types
            .get(type_name)
            .is_some_and(|ty| ty.has_method(name, signature))
    }

    /// Iterates exported types in name order.
    pub fn types(&self) -> impl Iterator<Item = (&str, &TypeSurface)> {
        self.types.iter().map(|(name, ty)| (name.as_str(), ty))
    }

    /// Number of exported types.
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.types.len()
    }
}

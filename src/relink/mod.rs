//! Binary relinking of mod modules against the patched host.
//!
//! Mods are compiled against the original host binary. At runtime the host is a patched copy
//! with different module and member names, so every mod module passes through the
//! [`Relinker`] before it is handed to the code loader:
//!
//! 1. Parse the image
//! 2. Retarget `AssemblyRef` rows through the [`map::RelinkMap`] module renames
//! 3. Rename `TypeRef` rows and class names inside every signature
//! 4. Redirect `MemberRef` rows through member renames, adding new scope rows when needed
//! 5. Apply static call-site patches ([`crate::detour::patch::PatchSet`])
//! 6. Verify every used reference against the surface of the module it points at
//! 7. Mark the image `RELINKED`, serialize and checksum it
//!
//! Verification is what turns a stale mod into a clean, reported failure instead of a crash
//! deep inside the game: a missing member is found here, not on first call.
//!
//! # Examples
//!
//! ```rust
//! use std::{collections::HashMap, sync::Arc};
//! use dotmod::metadata::{
//!     identity::ModuleVersion,
//!     image::{MethodFlags, ModuleImageBuilder, TypeFlags},
//!     signature::{MethodSignature, TypeSig},
//!     surface::ModuleSurface,
//! };
//! use dotmod::detour::patch::PatchSet;
//! use dotmod::relink::{map::RelinkMap, Relinker, SymbolResolver};
//!
//! struct Known(HashMap<String, Arc<ModuleSurface>>);
//! impl SymbolResolver for Known {
//!     fn resolve_module(&self, name: &str) -> Option<Arc<ModuleSurface>> {
//!         self.0.get(name).cloned()
//!     }
//! }
//!
//! let mut builder = ModuleImageBuilder::new("Foo", ModuleVersion::new(1, 0, 0));
//! builder.type_def("Foo.Plugin", TypeFlags::PUBLIC);
//! let bytes = builder.build().write()?;
//!
//! let map = RelinkMap::host("Game", "Game.Patched");
//! let patches = PatchSet::new();
//! let relinked = Relinker::new(&map, &patches).relink_bytes(&bytes, None, &Known(HashMap::new()))?;
//! assert!(relinked.surface.has_type("Foo.Plugin"));
//! # Ok::<(), dotmod::Error>(())
//! ```

pub mod cache;
pub mod map;

use std::{collections::HashMap, sync::Arc};

use sha1::{Digest, Sha1};

use crate::{
    assembly::decode,
    detour::patch::{PatchReport, PatchSet},
    metadata::{
        image::{ImageFlags, ModuleImage},
        surface::ModuleSurface,
        token::{TableId, Token},
    },
    relink::map::RelinkMap,
    Error, Result,
};

/// Looks up the exported surface of a module by simple name during verification.
///
/// The isolation context implements this on top of the dependency resolver. References to
/// the module being relinked, by row scope 0 or by its own name, are checked against the
/// image itself and never reach the resolver.
pub trait SymbolResolver {
    /// Returns the surface of `name`, or `None` if no strategy finds it.
    fn resolve_module(&self, name: &str) -> Option<Arc<ModuleSurface>>;
}

/// SHA-1 of a byte buffer.
#[must_use]
pub fn checksum(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Sha1::digest(data));
    out
}

/// Lowercase hex rendering of a checksum.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Combined fingerprint of a relink map and patch set.
#[must_use]
pub fn fingerprint(map: &RelinkMap, patches: &PatchSet) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(map.fingerprint());
    hasher.update(patches.fingerprint());

    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// A module ready for the code loader.
#[derive(Debug, Clone)]
pub struct RelinkedModule {
    /// The rewritten image
    pub image: ModuleImage,
    /// Serialized form of `image`
    pub bytes: Vec<u8>,
    /// Exported surface
    pub surface: Arc<ModuleSurface>,
    /// SHA-1 of the bytes that went in
    pub input_checksum: [u8; 20],
    /// SHA-1 of `bytes`
    pub checksum: [u8; 20],
    /// Call sites rewritten by static patches
    pub patches: PatchReport,
}

/// Rewrites module images to reference the patched host.
pub struct Relinker<'a> {
    map: &'a RelinkMap,
    patches: &'a PatchSet,
}

impl<'a> Relinker<'a> {
    /// Creates a relinker over the given rename map and patch set.
    #[must_use]
    pub fn new(map: &'a RelinkMap, patches: &'a PatchSet) -> Self {
        Relinker { map, patches }
    }

    /// Parses `bytes`, optionally forcing the module's simple name.
    ///
    /// # Errors
    /// Propagates [`ModuleImage::parse`] errors.
    pub fn parse(bytes: &[u8], name_override: Option<&str>) -> Result<ModuleImage> {
        let mut image = ModuleImage::parse(bytes)?;
        if let Some(name) = name_override {
            image.name = name.to_string();
        }
        Ok(image)
    }

    /// Parses and relinks in one step.
    ///
    /// # Errors
    /// See [`Relinker::parse`] and [`Relinker::relink`].
    pub fn relink_bytes(
        &self,
        bytes: &[u8],
        name_override: Option<&str>,
        resolver: &dyn SymbolResolver,
    ) -> Result<RelinkedModule> {
        let image = Self::parse(bytes, name_override)?;
        self.relink(image, checksum(bytes), resolver)
    }

    /// Relinks an already parsed image.
    ///
    /// # Errors
    /// Returns [`Error::UnresolvedModule`], [`Error::UnresolvedType`] or
    /// [`Error::UnresolvedMember`] when verification fails, and [`Error::Malformed`] when a
    /// method body cannot be decoded.
    pub fn relink(
        &self,
        mut image: ModuleImage,
        input_checksum: [u8; 20],
        resolver: &dyn SymbolResolver,
    ) -> Result<RelinkedModule> {
        self.retarget_modules(&mut image);
        let original_types = self.rename_types(&mut image);
        self.redirect_members(&mut image, &original_types);
        let patches = self.patches.apply(&mut image)?;
        verify_references(&image, resolver)?;

        image.flags |= ImageFlags::RELINKED;
        let bytes = image.write()?;
        let surface = Arc::new(image.surface());

        log::debug!(
            target: "dotmod::relink",
            "Relinked {} ({} call sites patched)",
            image.name,
            patches.count()
        );

        Ok(RelinkedModule {
            checksum: checksum(&bytes),
            image,
            bytes,
            surface,
            input_checksum,
            patches,
        })
    }

    fn retarget_modules(&self, image: &mut ModuleImage) {
        for row in &mut image.assembly_refs {
            if let Some(target) = self.map.map_module(&row.name) {
                log::trace!(target: "dotmod::relink", "{}: {} -> {}", image.name, row.name, target);
                row.name = target.to_string();
            }
        }
    }

    /// Renames types and returns each `TypeRef` row's name as originally compiled.
    fn rename_types(&self, image: &mut ModuleImage) -> Vec<String> {
        let original = image.type_refs.iter().map(|row| row.name.clone()).collect();

        for row in &mut image.type_refs {
            if let Some(target) = self.map.map_type(&row.name) {
                row.name = target.to_string();
            }
        }

        let rename = |name: &str| self.map.map_type(name).map(str::to_string);
        for row in &mut image.member_refs {
            row.signature.rename_classes(rename);
        }
        for row in &mut image.method_defs {
            row.signature.rename_classes(rename);
        }

        original
    }

    fn redirect_members(&self, image: &mut ModuleImage, original_types: &[String]) {
        for index in 0..image.member_refs.len() {
            let row = &image.member_refs[index];
            let parent_index = (row.parent as usize).wrapping_sub(1);
            let Some(type_name) = original_types.get(parent_index) else {
                continue;
            };
            let Some(target) = self.map.map_member(type_name, &row.name) else {
                continue;
            };

            let current_scope = image.type_refs[parent_index].scope;
            let scope = match &target.module {
                Some(module) if module == &image.name => 0,
                Some(module) => {
                    let version = image
                        .assembly_ref(current_scope)
                        .map(|row| row.version)
                        .unwrap_or_default();
                    image.find_or_add_assembly_ref(module, version)
                }
                None => current_scope,
            };
            let target_type = self
                .map
                .map_type(&target.type_name)
                .unwrap_or(&target.type_name)
                .to_string();
            let parent = image.find_or_add_type_ref(scope, &target_type);

            let row = &mut image.member_refs[index];
            row.parent = parent;
            row.name = target.member.clone();
        }
    }
}

/// `TypeRef` rids and `MemberRef` tokens used by method bodies, in first-use order.
///
/// Rows nothing uses are not verified: a member redirect can leave a stale `TypeRef` behind.
fn used_references(image: &ModuleImage) -> Result<(Vec<u32>, Vec<Token>)> {
    let mut types = Vec::new();
    let mut members = Vec::new();
    for method in &image.method_defs {
        for token in decode(&method.body)?.iter().filter_map(|i| i.token()) {
            match token.table_id() {
                Some(TableId::MemberRef) if !members.contains(&token) => {
                    members.push(token);
                    if let Some(row) = image.member_ref(token) {
                        if !types.contains(&row.parent) {
                            types.push(row.parent);
                        }
                    }
                }
                Some(TableId::TypeRef) if !types.contains(&token.row()) => {
                    types.push(token.row());
                }
                _ => {}
            }
        }
    }
    Ok((types, members))
}

fn verify_references(image: &ModuleImage, resolver: &dyn SymbolResolver) -> Result<()> {
    let (types, members) = used_references(image)?;

    let mut surfaces: HashMap<String, Arc<ModuleSurface>> = HashMap::new();
    let mut surface_of = |module: &str| -> Result<Arc<ModuleSurface>> {
        if let Some(surface) = surfaces.get(module) {
            return Ok(surface.clone());
        }
        let surface = resolver
            .resolve_module(module)
            .ok_or_else(|| Error::UnresolvedModule(module.to_string()))?;
        surfaces.insert(module.to_string(), surface.clone());
        Ok(surface)
    };

    for rid in types {
        let Some(row) = image.type_ref(rid) else {
            return Err(Error::InvalidToken(Token::from_parts(TableId::TypeRef, rid)));
        };
        let module = image.scope_name(row.scope).unwrap_or_default();
        let found = if row.scope == 0 || module == image.name {
            image.find_type_def(&row.name).is_some()
        } else {
            surface_of(module)?.has_type(&row.name)
        };
        if !found {
            return Err(Error::UnresolvedType {
                module: module.to_string(),
                type_name: row.name.clone(),
            });
        }
    }

    for token in members {
        let Some((row, parent)) = image
            .member_ref(token)
            .and_then(|row| image.type_ref(row.parent).map(|parent| (row, parent)))
        else {
            return Err(Error::InvalidToken(token));
        };

        let module = image.scope_name(parent.scope).unwrap_or_default();
        let found = if parent.scope == 0 || module == image.name {
            image
                .find_method_def(&parent.name, &row.name, &row.signature)
                .is_some()
        } else {
            surface_of(module)?.has_method(&parent.name, &row.name, &row.signature)
        };
        if !found {
            return Err(Error::UnresolvedMember {
                module: module.to_string(),
                type_name: parent.name.clone(),
                member: row.name.clone(),
                signature: row.signature.to_string(),
            });
        }
    }

    Ok(())
}

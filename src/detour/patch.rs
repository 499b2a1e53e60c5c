//! Static IL call-site patches.
//!
//! Some host behaviour cannot be changed by a runtime detour, for example a call inlined into
//! a hot loop or a constructor that must return a different subtype. A [`CallSitePatch`]
//! instead rewrites `call`, `callvirt` and `newobj` instructions inside matching methods of a
//! module so they reference a replacement member. Patches run inside the relinker, after the
//! rename maps and before verification, so a patch that points at a missing member is caught
//! like any other unresolved reference.
//!
//! # Examples
//!
//! ```rust
//! use dotmod::detour::patch::{CallSitePatch, MemberPattern, PatchSet};
//!
//! let patches = PatchSet::new().with_patch(
//!     CallSitePatch::new(
//!         "safe-save",
//!         MemberPattern::new("Game", "Game.SaveData", "Write"),
//!         MemberPattern::new("Game", "Game.SaveData", "WriteAtomic"),
//!     )
//!     .in_type("Game.Level"),
//! );
//! assert_eq!(patches.len(), 1);
//! ```

use sha1::{Digest, Sha1};

use crate::{
    assembly::{method_references, opcodes, rewrite_token},
    metadata::{
        identity::ModuleVersion,
        image::ModuleImage,
        signature::MethodSignature,
        token::{TableId, Token},
    },
    Result,
};

/// Identifies a member by module, declaring type, name and optionally signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberPattern {
    /// Simple name of the module declaring the member
    pub module: String,
    /// Full name of the declaring type
    pub type_name: String,
    /// Member name
    pub member: String,
    /// Required signature; `None` matches any overload
    pub signature: Option<MethodSignature>,
}

impl MemberPattern {
    /// A pattern matching every overload of `module::type_name::member`.
    pub fn new(
        module: impl Into<String>,
        type_name: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        MemberPattern {
            module: module.into(),
            type_name: type_name.into(),
            member: member.into(),
            signature: None,
        }
    }

    /// Restricts the pattern to a single signature.
    #[must_use]
    pub fn with_signature(mut self, signature: MethodSignature) -> Self {
        self.signature = Some(signature);
        self
    }

    fn matches(&self, member: &ReferencedMember) -> bool {
        self.module == member.module
            && self.type_name == member.type_name
            && self.member == member.member
            && self
                .signature
                .as_ref()
                .map_or(true, |sig| sig == &member.signature)
    }
}

impl std::fmt::Display for MemberPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]{}::{}", self.module, self.type_name, self.member)?;
        if let Some(signature) = &self.signature {
            write!(f, " {signature}")?;
        }
        Ok(())
    }
}

/// One static call-site rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSitePatch {
    /// Name used in logs and reports
    pub name: String,
    /// Only patch methods of this type
    pub in_type: Option<String>,
    /// Only patch methods with this name
    pub in_method: Option<String>,
    /// The member whose call sites are rewritten
    pub target: MemberPattern,
    /// The member call sites are redirected to. Without a signature the target's is kept.
    pub replacement: MemberPattern,
}

impl CallSitePatch {
    /// Creates a patch that applies to every method.
    pub fn new(name: impl Into<String>, target: MemberPattern, replacement: MemberPattern) -> Self {
        CallSitePatch {
            name: name.into(),
            in_type: None,
            in_method: None,
            target,
            replacement,
        }
    }

    /// Restricts the patch to methods of `type_name`.
    #[must_use]
    pub fn in_type(mut self, type_name: impl Into<String>) -> Self {
        self.in_type = Some(type_name.into());
        self
    }

    /// Restricts the patch to methods named `method`.
    #[must_use]
    pub fn in_method(mut self, method: impl Into<String>) -> Self {
        self.in_method = Some(method.into());
        self
    }

    fn applies_to(&self, type_name: &str, method: &str) -> bool {
        self.in_type.as_deref().map_or(true, |t| t == type_name)
            && self.in_method.as_deref().map_or(true, |m| m == method)
    }
}

/// A call site that was rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedSite {
    /// Name of the patch that matched
    pub patch: String,
    /// `Type::Method` containing the call site
    pub method: String,
    /// Offset of the instruction within the body
    pub offset: usize,
}

/// Outcome of applying a [`PatchSet`] to one image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    /// Every rewritten call site, in method and offset order
    pub sites: Vec<PatchedSite>,
}

impl PatchReport {
    /// Number of rewritten call sites.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sites.len()
    }
}

/// An ordered collection of call-site patches. The first matching patch wins per site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    patches: Vec<CallSitePatch>,
}

struct ReferencedMember {
    module: String,
    type_name: String,
    member: String,
    signature: MethodSignature,
}

struct PendingEdit {
    method: usize,
    offset: usize,
    operand_offset: usize,
    patch: usize,
    signature: MethodSignature,
}

/// Describes what a call token points at, in terms of module, type and member names.
fn describe_reference(image: &ModuleImage, token: Token) -> Option<ReferencedMember> {
    match token.table_id()? {
        TableId::MemberRef => {
            let row = image.member_ref(token)?;
            let parent = image.type_ref(row.parent)?;
            Some(ReferencedMember {
                module: image.scope_name(parent.scope)?.to_string(),
                type_name: parent.name.clone(),
                member: row.name.clone(),
                signature: row.signature.clone(),
            })
        }
        TableId::MethodDef => {
            let row = image.method_defs.get(token.row().checked_sub(1)? as usize)?;
            let owner = image.type_defs.get(row.owner.checked_sub(1)? as usize)?;
            Some(ReferencedMember {
                module: image.name.clone(),
                type_name: owner.name.clone(),
                member: row.name.clone(),
                signature: row.signature.clone(),
            })
        }
        _ => None,
    }
}

fn is_patchable_call(opcode: u16) -> bool {
    [opcodes::CALL, opcodes::CALLVIRT, opcodes::NEWOBJ]
        .iter()
        .any(|&op| u16::from(op) == opcode)
}

/// Token for `replacement` as seen from `image`, adding reference rows when needed.
fn replacement_token(
    image: &mut ModuleImage,
    replacement: &MemberPattern,
    signature: &MethodSignature,
) -> Token {
    let scope = if replacement.module == image.name {
        if let Some(token) =
            image.find_method_def(&replacement.type_name, &replacement.member, signature)
        {
            return token;
        }
        0
    } else {
        image.find_or_add_assembly_ref(&replacement.module, ModuleVersion::default())
    };

    let parent = image.find_or_add_type_ref(scope, &replacement.type_name);
    image.find_or_add_member_ref(parent, &replacement.member, signature)
}

impl PatchSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a patch.
    #[must_use]
    pub fn with_patch(mut self, patch: CallSitePatch) -> Self {
        self.patches.push(patch);
        self
    }

    /// Appends a patch in place.
    pub fn push(&mut self, patch: CallSitePatch) {
        self.patches.push(patch);
    }

    /// Number of patches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// Returns `true` if the set has no patches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Iterates the patches in application order.
    pub fn iter(&self) -> impl Iterator<Item = &CallSitePatch> {
        self.patches.iter()
    }

    /// SHA-1 over every patch, stable across runs.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 20] {
        let mut hasher = Sha1::new();
        for patch in &self.patches {
            let rendered = format!(
                "{}\0{}\0{}\0{}\0{}\0",
                patch.name,
                patch.in_type.as_deref().unwrap_or(""),
                patch.in_method.as_deref().unwrap_or(""),
                patch.target,
                patch.replacement
            );
            hasher.update(rendered.as_bytes());
        }

        let mut out = [0u8; 20];
        out.copy_from_slice(&hasher.finalize());
        out
    }

    /// Rewrites matching call sites in every method body of `image`.
    ///
    /// Replacement members in other modules get new `AssemblyRef`, `TypeRef` and `MemberRef`
    /// rows as needed; existing rows are never mutated, so unrelated call sites sharing a row
    /// keep their target.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a body in a method that a patch applies to
    /// cannot be decoded.
    pub fn apply(&self, image: &mut ModuleImage) -> Result<PatchReport> {
        let mut report = PatchReport::default();
        if self.patches.is_empty() {
            return Ok(report);
        }

        let mut edits = Vec::new();
        for (index, method) in image.method_defs.iter().enumerate() {
            let Some(owner) = method
                .owner
                .checked_sub(1)
                .and_then(|rid| image.type_defs.get(rid as usize))
            else {
                continue;
            };

            let applicable: Vec<usize> = self
                .patches
                .iter()
                .enumerate()
                .filter(|(_, patch)| patch.applies_to(&owner.name, &method.name))
                .map(|(i, _)| i)
                .collect();
            if applicable.is_empty() {
                continue;
            }

            for site in method_references(&method.body)? {
                if !is_patchable_call(site.opcode) {
                    continue;
                }
                let Some(referenced) = describe_reference(image, site.token) else {
                    continue;
                };
                if let Some(&patch) = applicable
                    .iter()
                    .find(|&&i| self.patches[i].target.matches(&referenced))
                {
                    edits.push(PendingEdit {
                        method: index,
                        offset: site.offset,
                        operand_offset: site.operand_offset,
                        patch,
                        signature: referenced.signature,
                    });
                }
            }
        }

        for edit in edits {
            let patch = &self.patches[edit.patch];
            let signature = patch
                .replacement
                .signature
                .clone()
                .unwrap_or(edit.signature);
            let token = replacement_token(image, &patch.replacement, &signature);

            let method = &mut image.method_defs[edit.method];
            rewrite_token(&mut method.body, edit.operand_offset, token)?;

            let owner = method
                .owner
                .checked_sub(1)
                .and_then(|rid| image.type_defs.get(rid as usize))
                .map_or("", |row| row.name.as_str());
            let method_name = format!("{}::{}", owner, method.name);
            log::debug!(
                target: "dotmod::relink",
                "Patch '{}' rewrote call at {}+{:#x} to {}",
                patch.name,
                method_name,
                edit.offset,
                patch.replacement
            );
            report.sites.push(PatchedSite {
                patch: patch.name.clone(),
                method: method_name,
                offset: edit.offset,
            });
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::encoder::IlBuilder,
        metadata::{
            image::{MethodFlags, ModuleImageBuilder, TypeFlags},
            signature::TypeSig,
        },
    };

    fn void_sig() -> MethodSignature {
        MethodSignature::static_method(TypeSig::Void, vec![])
    }

    /// A module whose `Level.Save` and `Menu.Save` both call `Game.SaveData::Write`.
    fn image_with_calls() -> ModuleImage {
        let mut builder = ModuleImageBuilder::new("Mod", ModuleVersion::new(1, 0, 0));
        let game = builder.assembly_ref("Game", ModuleVersion::new(1, 0, 0));
        let save_data = builder.type_ref(game, "Game.SaveData");
        let write = builder.member_ref(save_data, "Write", void_sig());
        let flush = builder.member_ref(save_data, "Flush", void_sig());

        let level = builder.type_def("Game.Level", TypeFlags::PUBLIC);
        let menu = builder.type_def("Game.Menu", TypeFlags::PUBLIC);
        builder.method(
            level,
            "Save",
            MethodFlags::PUBLIC | MethodFlags::STATIC,
            void_sig(),
            IlBuilder::new().call(write).call(flush).ret().build(),
        );
        builder.method(
            menu,
            "Save",
            MethodFlags::PUBLIC | MethodFlags::STATIC,
            void_sig(),
            IlBuilder::new().ldftn(write).pop().call(write).ret().build(),
        );
        builder.build()
    }

    fn call_targets(image: &ModuleImage, method: usize) -> Vec<String> {
        method_references(&image.method_defs[method].body)
            .unwrap()
            .into_iter()
            .map(|site| {
                let member = describe_reference(image, site.token).unwrap();
                format!("{}::{}::{}", member.module, member.type_name, member.member)
            })
            .collect()
    }

    #[test]
    fn test_patch_scoped_to_type() {
        let mut image = image_with_calls();
        let patches = PatchSet::new().with_patch(
            CallSitePatch::new(
                "atomic",
                MemberPattern::new("Game", "Game.SaveData", "Write"),
                MemberPattern::new("Game", "Game.SaveData", "WriteAtomic"),
            )
            .in_type("Game.Level"),
        );

        let report = patches.apply(&mut image).unwrap();
        assert_eq!(report.count(), 1);
        assert_eq!(report.sites[0].method, "Game.Level::Save");
        assert_eq!(
            call_targets(&image, 0),
            vec!["Game::Game.SaveData::WriteAtomic", "Game::Game.SaveData::Flush"]
        );
        // Other type untouched
        assert_eq!(
            call_targets(&image, 1),
            vec!["Game::Game.SaveData::Write", "Game::Game.SaveData::Write"]
        );
        // Existing MemberRef rows are never mutated
        assert_eq!(image.member_refs[0].name, "Write");
    }

    #[test]
    fn test_patch_skips_non_call_opcodes() {
        let mut image = image_with_calls();
        let patches = PatchSet::new().with_patch(CallSitePatch::new(
            "redirect",
            MemberPattern::new("Game", "Game.SaveData", "Write"),
            MemberPattern::new("Helpers", "Helpers.Save", "Write"),
        ));

        let report = patches.apply(&mut image).unwrap();
        assert_eq!(report.count(), 2);
        // ldftn keeps its target, the call is redirected into a new scope
        assert_eq!(
            call_targets(&image, 1),
            vec!["Game::Game.SaveData::Write", "Helpers::Helpers.Save::Write"]
        );
        assert!(image.referenced_modules().any(|m| m == "Helpers"));
    }

    #[test]
    fn test_patch_into_own_method_def() {
        let mut image = image_with_calls();
        let patches = PatchSet::new().with_patch(CallSitePatch::new(
            "local",
            MemberPattern::new("Game", "Game.SaveData", "Flush"),
            MemberPattern::new("Mod", "Game.Menu", "Save"),
        ));

        patches.apply(&mut image).unwrap();
        let site = method_references(&image.method_defs[0].body).unwrap()[1];
        assert_eq!(site.token, Token(0x0600_0002));
    }

    #[test]
    fn test_signature_restricted_pattern() {
        let mut image = image_with_calls();
        let patches = PatchSet::new().with_patch(CallSitePatch::new(
            "no-match",
            MemberPattern::new("Game", "Game.SaveData", "Write")
                .with_signature(MethodSignature::static_method(TypeSig::I4, vec![])),
            MemberPattern::new("Game", "Game.SaveData", "Other"),
        ));

        let before = image.clone();
        assert_eq!(patches.apply(&mut image).unwrap().count(), 0);
        assert_eq!(image, before);
    }

    #[test]
    fn test_fingerprint_changes_with_patches() {
        let empty = PatchSet::new();
        let one = PatchSet::new().with_patch(CallSitePatch::new(
            "a",
            MemberPattern::new("G", "T", "M"),
            MemberPattern::new("G", "T", "N"),
        ));
        assert_ne!(empty.fingerprint(), one.fingerprint());
        assert_eq!(one.fingerprint(), one.clone().fingerprint());
    }
}

//! The compiled module image format.
//!
//! A module image is the unit of compiled code a mod ships: a small header followed by five
//! metadata tables. References to other modules go through the `AssemblyRef`, `TypeRef` and
//! `MemberRef` tables, which is exactly the surface the relinker rewrites. Method bodies
//! are raw CIL whose call instructions address `MemberRef` or `MethodDef` rows by
//! [`crate::metadata::token::Token`].
//!
//! # Layout
//!
//! ```text
//! "DMOD" | format u16 | flags u16 | name | version (3 x u16)
//! AssemblyRef: count, { name, version }
//! TypeRef:     count, { scope (0 = this module, else AssemblyRef rid), full name }
//! MemberRef:   count, { parent TypeRef rid, name, signature blob }
//! TypeDef:     count, { full name, flags u32 }
//! MethodDef:   count, { owner TypeDef rid, name, flags u16, signature blob, body }
//! ```
//!
//! Counts, rids and blob lengths are compressed unsigned integers, strings are 7-bit length
//! prefixed UTF-8. Rids are 1-based; every rid is validated during parsing so later stages
//! can index the tables without re-checking.
//!
//! # Examples
//!
//! ```rust
//! use dotmod::metadata::{
//!     identity::ModuleVersion,
//!     image::{MethodFlags, ModuleImage, ModuleImageBuilder, TypeFlags},
//!     signature::{MethodSignature, TypeSig},
//! };
//!
//! let mut builder = ModuleImageBuilder::new("Foo", ModuleVersion::new(1, 0, 0));
//! let ty = builder.type_def("Foo.Plugin", TypeFlags::PUBLIC);
//! builder.method(ty, "Load", MethodFlags::PUBLIC | MethodFlags::STATIC,
//!     MethodSignature::static_method(TypeSig::Void, vec![]), vec![0x2A]);
//! let bytes = builder.build().write()?;
//!
//! let image = ModuleImage::parse(&bytes)?;
//! assert_eq!(image.name, "Foo");
//! assert!(image.surface().has_type("Foo.Plugin"));
//! # Ok::<(), dotmod::Error>(())
//! ```

use bitflags::bitflags;

use crate::{
    file::{parser::Parser, writer::Writer},
    metadata::{
        identity::ModuleVersion,
        signature::MethodSignature,
        surface::{ModuleSurface, TypeSurface},
        token::{TableId, Token},
    },
    Result,
};

/// Magic bytes at the start of every module image.
pub const IMAGE_MAGIC: [u8; 4] = *b"DMOD";
/// The only supported format version.
pub const IMAGE_FORMAT_VERSION: u16 = 1;

bitflags! {
    /// Image-level flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ImageFlags: u16 {
        /// The image has been produced by the relinker
        const RELINKED = 0x0001;
    }
}

bitflags! {
    /// Type attributes, a subset of ECMA-335 II.23.1.15.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeFlags: u32 {
        /// Visible outside the module
        const PUBLIC = 0x0000_0001;
        /// Interface type
        const INTERFACE = 0x0000_0020;
        /// Cannot be instantiated
        const ABSTRACT = 0x0000_0080;
        /// Cannot be derived from
        const SEALED = 0x0000_0100;
    }
}

bitflags! {
    /// Method attributes, a subset of ECMA-335 II.23.1.10.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodFlags: u16 {
        /// Private member access
        const PRIVATE = 0x0001;
        /// Public member access
        const PUBLIC = 0x0006;
        /// No implicit `this`
        const STATIC = 0x0010;
        /// Virtual dispatch
        const VIRTUAL = 0x0040;
        /// Name has special meaning to the runtime
        const SPECIAL_NAME = 0x0800;
    }
}

impl MethodFlags {
    const ACCESS_MASK: u16 = 0x0007;

    /// Returns `true` if the member access field is `Public`.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.bits() & Self::ACCESS_MASK == Self::PUBLIC.bits()
    }
}

/// A reference to another module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyRefRow {
    /// Simple name of the referenced module
    pub name: String,
    /// Version the module was compiled against
    pub version: ModuleVersion,
}

/// A reference to a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRefRow {
    /// `0` for a type of this module, otherwise an `AssemblyRef` rid
    pub scope: u32,
    /// Full type name, including namespace
    pub name: String,
}

/// A reference to a method of a referenced type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRefRow {
    /// `TypeRef` rid of the declaring type
    pub parent: u32,
    /// Member name
    pub name: String,
    /// Member signature
    pub signature: MethodSignature,
}

/// A type defined by this module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDefRow {
    /// Full type name
    pub name: String,
    /// Attributes
    pub flags: TypeFlags,
}

/// A method defined by this module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDefRow {
    /// `TypeDef` rid of the declaring type
    pub owner: u32,
    /// Method name
    pub name: String,
    /// Attributes
    pub flags: MethodFlags,
    /// Method signature
    pub signature: MethodSignature,
    /// CIL body
    pub body: Vec<u8>,
}

/// A parsed module image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImage {
    /// Image flags
    pub flags: ImageFlags,
    /// Simple module name
    pub name: String,
    /// Module version
    pub version: ModuleVersion,
    /// `AssemblyRef` table
    pub assembly_refs: Vec<AssemblyRefRow>,
    /// `TypeRef` table
    pub type_refs: Vec<TypeRefRow>,
    /// `MemberRef` table
    pub member_refs: Vec<MemberRefRow>,
    /// `TypeDef` table
    pub type_defs: Vec<TypeDefRow>,
    /// `MethodDef` table
    pub method_defs: Vec<MethodDefRow>,
}

fn read_count(parser: &mut Parser, table: &str) -> Result<usize> {
    let count = parser.read_compressed_uint()? as usize;
    // Every row occupies at least one byte.
    if count > parser.remaining() {
        return Err(malformed_error!(
            "{} table declares {} rows but only {} bytes remain",
            table,
            count,
            parser.remaining()
        ));
    }
    Ok(count)
}

fn read_rid(parser: &mut Parser, max: usize, allow_null: bool, what: &str) -> Result<u32> {
    let rid = parser.read_compressed_uint()?;
    if (rid == 0 && !allow_null) || rid as usize > max {
        return Err(malformed_error!(
            "{} rid {} out of range (table has {} rows)",
            what,
            rid,
            max
        ));
    }
    Ok(rid)
}

fn read_version(parser: &mut Parser) -> Result<ModuleVersion> {
    Ok(ModuleVersion::new(
        parser.read_le::<u16>()?,
        parser.read_le::<u16>()?,
        parser.read_le::<u16>()?,
    ))
}

fn write_version(writer: &mut Writer, version: ModuleVersion) {
    writer.write_le(version.major);
    writer.write_le(version.minor);
    writer.write_le(version.patch);
}

fn read_blob<'a>(parser: &mut Parser<'a>) -> Result<&'a [u8]> {
    let length = parser.read_compressed_uint()? as usize;
    parser.read_bytes(length)
}

fn write_blob(writer: &mut Writer, blob: &[u8]) -> Result<()> {
    let length = u32::try_from(blob.len())
        .map_err(|_| malformed_error!("Blob of {} bytes is too large", blob.len()))?;
    writer.write_compressed_uint(length)?;
    writer.write_bytes(blob);
    Ok(())
}

fn write_count(writer: &mut Writer, count: usize) -> Result<()> {
    let count =
        u32::try_from(count).map_err(|_| malformed_error!("Table of {} rows is too large", count))?;
    writer.write_compressed_uint(count)
}

impl ModuleImage {
    /// Parses a module image.
    ///
    /// # Errors
    /// Returns [`crate::Error::Empty`] for empty input, [`crate::Error::NotSupported`] for an
    /// unknown format version, and [`crate::Error::Malformed`] or
    /// [`crate::Error::OutOfBounds`] for any structural damage.
    pub fn parse(data: &[u8]) -> Result<ModuleImage> {
        if data.is_empty() {
            return Err(crate::Error::Empty);
        }

        let mut parser = Parser::new(data);
        let magic = parser.read_bytes(4).map_err(|_| malformed_error!("Truncated image header"))?;
        if magic != IMAGE_MAGIC {
            return Err(malformed_error!("Invalid image magic {:02x?}", magic));
        }

        let format = parser.read_le::<u16>()?;
        if format != IMAGE_FORMAT_VERSION {
            return Err(crate::Error::NotSupported);
        }

        let flags = ImageFlags::from_bits_truncate(parser.read_le::<u16>()?);
        let name = parser.read_prefixed_string_utf8()?;
        if name.is_empty() {
            return Err(malformed_error!("Module name cannot be empty"));
        }
        let version = read_version(&mut parser)?;

        let count = read_count(&mut parser, "AssemblyRef")?;
        let mut assembly_refs = Vec::with_capacity(count);
        for _ in 0..count {
            assembly_refs.push(AssemblyRefRow {
                name: parser.read_prefixed_string_utf8()?,
                version: read_version(&mut parser)?,
            });
        }

        let count = read_count(&mut parser, "TypeRef")?;
        let mut type_refs = Vec::with_capacity(count);
        for _ in 0..count {
            type_refs.push(TypeRefRow {
                scope: read_rid(&mut parser, assembly_refs.len(), true, "TypeRef scope")?,
                name: parser.read_prefixed_string_utf8()?,
            });
        }

        let count = read_count(&mut parser, "MemberRef")?;
        let mut member_refs = Vec::with_capacity(count);
        for _ in 0..count {
            member_refs.push(MemberRefRow {
                parent: read_rid(&mut parser, type_refs.len(), false, "MemberRef parent")?,
                name: parser.read_prefixed_string_utf8()?,
                signature: MethodSignature::parse(read_blob(&mut parser)?)?,
            });
        }

        let count = read_count(&mut parser, "TypeDef")?;
        let mut type_defs = Vec::with_capacity(count);
        for _ in 0..count {
            type_defs.push(TypeDefRow {
                name: parser.read_prefixed_string_utf8()?,
                flags: TypeFlags::from_bits_truncate(parser.read_le::<u32>()?),
            });
        }

        let count = read_count(&mut parser, "MethodDef")?;
        let mut method_defs = Vec::with_capacity(count);
        for _ in 0..count {
            method_defs.push(MethodDefRow {
                owner: read_rid(&mut parser, type_defs.len(), false, "MethodDef owner")?,
                name: parser.read_prefixed_string_utf8()?,
                flags: MethodFlags::from_bits_truncate(parser.read_le::<u16>()?),
                signature: MethodSignature::parse(read_blob(&mut parser)?)?,
                body: read_blob(&mut parser)?.to_vec(),
            });
        }

        if parser.has_more_data() {
            return Err(malformed_error!(
                "{} trailing bytes after MethodDef table",
                parser.remaining()
            ));
        }

        Ok(ModuleImage {
            flags,
            name,
            version,
            assembly_refs,
            type_refs,
            member_refs,
            type_defs,
            method_defs,
        })
    }

    /// Serializes the image.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a table, string or blob exceeds what the format
    /// can encode.
    pub fn write(&self) -> Result<Vec<u8>> {
        let mut writer = Writer::new();
        writer.write_bytes(&IMAGE_MAGIC);
        writer.write_le(IMAGE_FORMAT_VERSION);
        writer.write_le(self.flags.bits());
        writer.write_prefixed_string_utf8(&self.name)?;
        write_version(&mut writer, self.version);

        write_count(&mut writer, self.assembly_refs.len())?;
        for row in &self.assembly_refs {
            writer.write_prefixed_string_utf8(&row.name)?;
            write_version(&mut writer, row.version);
        }

        write_count(&mut writer, self.type_refs.len())?;
        for row in &self.type_refs {
            writer.write_compressed_uint(row.scope)?;
            writer.write_prefixed_string_utf8(&row.name)?;
        }

        write_count(&mut writer, self.member_refs.len())?;
        for row in &self.member_refs {
            writer.write_compressed_uint(row.parent)?;
            writer.write_prefixed_string_utf8(&row.name)?;
            write_blob(&mut writer, &row.signature.encode()?)?;
        }

        write_count(&mut writer, self.type_defs.len())?;
        for row in &self.type_defs {
            writer.write_prefixed_string_utf8(&row.name)?;
            writer.write_le(row.flags.bits());
        }

        write_count(&mut writer, self.method_defs.len())?;
        for row in &self.method_defs {
            writer.write_compressed_uint(row.owner)?;
            writer.write_prefixed_string_utf8(&row.name)?;
            writer.write_le(row.flags.bits());
            write_blob(&mut writer, &row.signature.encode()?)?;
            write_blob(&mut writer, &row.body)?;
        }

        Ok(writer.into_inner())
    }

    /// Returns the exported surface: public types and their public methods.
    #[must_use]
    pub fn surface(&self) -> ModuleSurface {
        let mut surface = ModuleSurface::new(&self.name, self.version);
        for (index, type_def) in self.type_defs.iter().enumerate() {
            if !type_def.flags.contains(TypeFlags::PUBLIC) {
                continue;
            }

            let rid = index as u32 + 1;
            let mut type_surface = TypeSurface::new(type_def.flags);
            for method in self.method_defs.iter().filter(|m| m.owner == rid) {
                if method.flags.is_public() {
                    type_surface.add_method(&method.name, method.signature.clone());
                }
            }
            surface.add_type(&type_def.name, type_surface);
        }
        surface
    }

    /// Returns the `AssemblyRef` row for `rid`.
    #[must_use]
    pub fn assembly_ref(&self, rid: u32) -> Option<&AssemblyRefRow> {
        rid.checked_sub(1)
            .and_then(|index| self.assembly_refs.get(index as usize))
    }

    /// Returns the `TypeRef` row for `rid`.
    #[must_use]
    pub fn type_ref(&self, rid: u32) -> Option<&TypeRefRow> {
        rid.checked_sub(1)
            .and_then(|index| self.type_refs.get(index as usize))
    }

    /// Returns the `MemberRef` row addressed by `token`.
    #[must_use]
    pub fn member_ref(&self, token: Token) -> Option<&MemberRefRow> {
        if token.table_id() != Some(TableId::MemberRef) {
            return None;
        }
        token
            .row()
            .checked_sub(1)
            .and_then(|index| self.member_refs.get(index as usize))
    }

    /// Name of the module a `TypeRef` scope points at. Scope `0` is this module.
    #[must_use]
    pub fn scope_name(&self, scope: u32) -> Option<&str> {
        if scope == 0 {
            return Some(&self.name);
        }
        self.assembly_ref(scope).map(|row| row.name.as_str())
    }

    /// Finds a `TypeDef` by full name, returning its rid.
    #[must_use]
    pub fn find_type_def(&self, name: &str) -> Option<u32> {
        self.type_defs
            .iter()
            .position(|row| row.name == name)
            .map(|index| index as u32 + 1)
    }

    /// Finds a `MethodDef` by owner type, name and signature, returning its token.
    #[must_use]
    pub fn find_method_def(
        &self,
        type_name: &str,
        name: &str,
        signature: &MethodSignature,
    ) -> Option<Token> {
        let owner = self.find_type_def(type_name)?;
        self.method_defs
            .iter()
            .position(|row| row.owner == owner && row.name == name && &row.signature == signature)
            .map(|index| Token::from_parts(TableId::MethodDef, index as u32 + 1))
    }

    /// Returns the rid of an `AssemblyRef` with this name, adding one if needed.
    pub fn find_or_add_assembly_ref(&mut self, name: &str, version: ModuleVersion) -> u32 {
        if let Some(index) = self.assembly_refs.iter().position(|row| row.name == name) {
            return index as u32 + 1;
        }
        self.assembly_refs.push(AssemblyRefRow {
            name: name.to_string(),
            version,
        });
        self.assembly_refs.len() as u32
    }

    /// Returns the rid of a `TypeRef` with this scope and name, adding one if needed.
    pub fn find_or_add_type_ref(&mut self, scope: u32, name: &str) -> u32 {
        if let Some(index) = self
            .type_refs
            .iter()
            .position(|row| row.scope == scope && row.name == name)
        {
            return index as u32 + 1;
        }
        self.type_refs.push(TypeRefRow {
            scope,
            name: name.to_string(),
        });
        self.type_refs.len() as u32
    }

    /// Returns the token of a matching `MemberRef`, adding one if needed.
    pub fn find_or_add_member_ref(
        &mut self,
        parent: u32,
        name: &str,
        signature: &MethodSignature,
    ) -> Token {
        let index = match self.member_refs.iter().position(|row| {
            row.parent == parent && row.name == name && &row.signature == signature
        }) {
            Some(index) => index,
            None => {
                self.member_refs.push(MemberRefRow {
                    parent,
                    name: name.to_string(),
                    signature: signature.clone(),
                });
                self.member_refs.len() - 1
            }
        };
        Token::from_parts(TableId::MemberRef, index as u32 + 1)
    }

    /// Simple names of every module this image references, in table order.
    pub fn referenced_modules(&self) -> impl Iterator<Item = &str> {
        self.assembly_refs.iter().map(|row| row.name.as_str())
    }
}

/// Incremental construction of a [`ModuleImage`].
///
/// Used by hosts to describe their own modules and by tests to produce fixtures.
#[derive(Debug)]
pub struct ModuleImageBuilder {
    image: ModuleImage,
}

impl ModuleImageBuilder {
    /// Starts an empty image.
    #[must_use]
    pub fn new(name: &str, version: ModuleVersion) -> Self {
        ModuleImageBuilder {
            image: ModuleImage {
                flags: ImageFlags::empty(),
                name: name.to_string(),
                version,
                assembly_refs: Vec::new(),
                type_refs: Vec::new(),
                member_refs: Vec::new(),
                type_defs: Vec::new(),
                method_defs: Vec::new(),
            },
        }
    }

    /// Adds (or reuses) a reference to another module and returns its rid.
    pub fn assembly_ref(&mut self, name: &str, version: ModuleVersion) -> u32 {
        self.image.find_or_add_assembly_ref(name, version)
    }

    /// Adds (or reuses) a type reference and returns its rid.
    pub fn type_ref(&mut self, scope: u32, name: &str) -> u32 {
        self.image.find_or_add_type_ref(scope, name)
    }

    /// Adds (or reuses) a member reference and returns its token.
    pub fn member_ref(&mut self, parent: u32, name: &str, signature: MethodSignature) -> Token {
        self.image.find_or_add_member_ref(parent, name, &signature)
    }

    /// Adds a type definition and returns its rid.
    pub fn type_def(&mut self, name: &str, flags: TypeFlags) -> u32 {
        self.image.type_defs.push(TypeDefRow {
            name: name.to_string(),
            flags,
        });
        self.image.type_defs.len() as u32
    }

    /// Adds a method definition and returns its token.
    pub fn method(
        &mut self,
        owner: u32,
        name: &str,
        flags: MethodFlags,
        signature: MethodSignature,
        body: Vec<u8>,
    ) -> Token {
        self.image.method_defs.push(MethodDefRow {
            owner,
            name: name.to_string(),
            flags,
            signature,
            body,
        });
        Token::from_parts(TableId::MethodDef, self.image.method_defs.len() as u32)
    }

    /// Finishes the image.
    #[must_use]
    pub fn build(self) -> ModuleImage {
        self.image
    }
}

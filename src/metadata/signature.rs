//! Method signature blobs.
//!
//! Signatures follow the ECMA-335 II.23.2.1 `MethodDefSig` layout with one simplification:
//! class types carry their full name inline (`CLASS <prefixed name>`) instead of a coded
//! TypeDefOrRef index. That keeps a signature meaningful on its own, so two modules can be
//! compared for member identity without cross-referencing either one's tables.
//!
//! ```text
//! conv (u8) | param count (compressed) | ret type | param types...
//! ```
//!
//! # Examples
//!
//! ```rust
//! use dotmod::metadata::signature::{MethodSignature, TypeSig};
//!
//! let sig = MethodSignature::instance(TypeSig::Void, vec![TypeSig::I4, TypeSig::String]);
//! let blob = sig.encode()?;
//! assert_eq!(MethodSignature::parse(&blob)?, sig);
//! assert_eq!(sig.to_string(), "instance void (int32, string)");
//! # Ok::<(), dotmod::Error>(())
//! ```

use std::fmt;

use crate::{
    file::{parser::Parser, writer::Writer},
    metadata::value::ValueKind,
    Result,
};

/// Calling convention flag: the method takes an implicit `this`.
pub const CALLCONV_HASTHIS: u8 = 0x20;
/// Calling convention for static methods.
pub const CALLCONV_DEFAULT: u8 = 0x00;

#[allow(missing_docs)]
pub mod element_type {
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0A;
    pub const U8: u8 = 0x0B;
    pub const R4: u8 = 0x0C;
    pub const R8: u8 = 0x0D;
    pub const STRING: u8 = 0x0E;
    pub const CLASS: u8 = 0x12;
    pub const OBJECT: u8 = 0x1C;
}

/// A type appearing in a signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum TypeSig {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    String,
    Object,
    /// A class type, by full name
    Class(String),
}

impl TypeSig {
    fn read(parser: &mut Parser) -> Result<TypeSig> {
        let code = parser.read_le::<u8>()?;
        Ok(match code {
            element_type::VOID => TypeSig::Void,
            element_type::BOOLEAN => TypeSig::Boolean,
            element_type::CHAR => TypeSig::Char,
            element_type::I1 => TypeSig::I1,
            element_type::U1 => TypeSig::U1,
            element_type::I2 => TypeSig::I2,
            element_type::U2 => TypeSig::U2,
            element_type::I4 => TypeSig::I4,
            element_type::U4 => TypeSig::U4,
            element_type::I8 => TypeSig::I8,
            element_type::U8 => TypeSig::U8,
            element_type::R4 => TypeSig::R4,
            element_type::R8 => TypeSig::R8,
            element_type::STRING => TypeSig::String,
            element_type::OBJECT => TypeSig::Object,
            element_type::CLASS => TypeSig::Class(parser.read_prefixed_string_utf8()?),
            _ => {
                return Err(malformed_error!(
                    "Unsupported element type {:#04x} at offset {}",
                    code,
                    parser.pos() - 1
                ))
            }
        })
    }

    fn write(&self, writer: &mut Writer) -> Result<()> {
        let code = match self {
            TypeSig::Void => element_type::VOID,
            TypeSig::Boolean => element_type::BOOLEAN,
            TypeSig::Char => element_type::CHAR,
            TypeSig::I1 => element_type::I1,
            TypeSig::U1 => element_type::U1,
            TypeSig::I2 => element_type::I2,
            TypeSig::U2 => element_type::U2,
            TypeSig::I4 => element_type::I4,
            TypeSig::U4 => element_type::U4,
            TypeSig::I8 => element_type::I8,
            TypeSig::U8 => element_type::U8,
            TypeSig::R4 => element_type::R4,
            TypeSig::R8 => element_type::R8,
            TypeSig::String => element_type::STRING,
            TypeSig::Object => element_type::OBJECT,
            TypeSig::Class(name) => {
                writer.write_le(element_type::CLASS);
                return writer.write_prefixed_string_utf8(name);
            }
        };
        writer.write_le(code);
        Ok(())
    }

    /// The runtime value kind used to pass this type through hooks and callbacks.
    #[must_use]
    pub fn value_kind(&self) -> ValueKind {
        match self {
            TypeSig::Void => ValueKind::Void,
            TypeSig::Boolean => ValueKind::Bool,
            TypeSig::Char
            | TypeSig::I1
            | TypeSig::U1
            | TypeSig::I2
            | TypeSig::U2
            | TypeSig::I4
            | TypeSig::U4 => ValueKind::I32,
            TypeSig::I8 | TypeSig::U8 => ValueKind::I64,
            TypeSig::R4 | TypeSig::R8 => ValueKind::F64,
            TypeSig::String => ValueKind::Str,
            TypeSig::Object | TypeSig::Class(_) => ValueKind::Object,
        }
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeSig::Void => "void",
            TypeSig::Boolean => "bool",
            TypeSig::Char => "char",
            TypeSig::I1 => "int8",
            TypeSig::U1 => "uint8",
            TypeSig::I2 => "int16",
            TypeSig::U2 => "uint16",
            TypeSig::I4 => "int32",
            TypeSig::U4 => "uint32",
            TypeSig::I8 => "int64",
            TypeSig::U8 => "uint64",
            TypeSig::R4 => "float32",
            TypeSig::R8 => "float64",
            TypeSig::String => "string",
            TypeSig::Object => "object",
            TypeSig::Class(name) => return write!(f, "class {name}"),
        };
        f.write_str(name)
    }
}

/// A decoded method signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    /// Instance method with implicit `this`
    pub has_this: bool,
    /// Return type
    pub ret: TypeSig,
    /// Parameter types, excluding `this`
    pub params: Vec<TypeSig>,
}

impl MethodSignature {
    /// A static method signature.
    #[must_use]
    pub fn static_method(ret: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSignature {
            has_this: false,
            ret,
            params,
        }
    }

    /// An instance method signature.
    #[must_use]
    pub fn instance(ret: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSignature {
            has_this: true,
            ret,
            params,
        }
    }

    /// Decodes a signature blob.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unknown calling conventions, unsupported
    /// element types or trailing bytes, and [`crate::Error::OutOfBounds`] for truncated blobs.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let mut parser = Parser::new(blob);
        let conv = parser.read_le::<u8>()?;
        if conv & !CALLCONV_HASTHIS != CALLCONV_DEFAULT {
            return Err(malformed_error!("Unsupported calling convention {:#04x}", conv));
        }

        let count = parser.read_compressed_uint()? as usize;
        if count > parser.remaining() {
            return Err(malformed_error!(
                "Signature declares {} parameters but only {} bytes remain",
                count,
                parser.remaining()
            ));
        }

        let ret = TypeSig::read(&mut parser)?;
        let mut params = Vec::with_capacity(count);
        for _ in 0..count {
            let param = TypeSig::read(&mut parser)?;
            if param == TypeSig::Void {
                return Err(malformed_error!("void is not a valid parameter type"));
            }
            params.push(param);
        }

        if parser.has_more_data() {
            return Err(malformed_error!(
                "{} trailing bytes after method signature",
                parser.remaining()
            ));
        }

        Ok(MethodSignature {
            has_this: conv & CALLCONV_HASTHIS != 0,
            ret,
            params,
        })
    }

    /// Encodes the signature as a blob.
    ///
    /// # Errors
    /// Returns an error if a class name or parameter count cannot be encoded.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = Writer::new();
        self.write(&mut writer)?;
        Ok(writer.into_inner())
    }

    /// Appends the encoded signature to `writer`.
    ///
    /// # Errors
    /// Returns an error if a class name or parameter count cannot be encoded.
    pub fn write(&self, writer: &mut Writer) -> Result<()> {
        writer.write_le(if self.has_this {
            CALLCONV_HASTHIS
        } else {
            CALLCONV_DEFAULT
        });
        writer.write_compressed_uint(u32::try_from(self.params.len()).map_err(|_| {
            malformed_error!("Too many parameters: {}", self.params.len())
        })?)?;
        self.ret.write(writer)?;
        for param in &self.params {
            param.write(writer)?;
        }
        Ok(())
    }

    /// Applies `rename` to every class name in the signature, returning `true` if anything changed.
    pub fn rename_classes<F>(&mut self, mut rename: F) -> bool
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut changed = false;
        for ty in std::iter::once(&mut self.ret).chain(self.params.iter_mut()) {
            if let TypeSig::Class(name) = ty {
                if let Some(new_name) = rename(name) {
                    *name = new_name;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Value kinds of the explicit parameters, in order.
    #[must_use]
    pub fn param_kinds(&self) -> Vec<ValueKind> {
        self.params.iter().map(TypeSig::value_kind).collect()
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_this {
            f.write_str("instance ")?;
        }
        write!(f, "{} (", self.ret)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_parse_static_signature() {
        // static int32 (string, bool)
        let blob = [0x00, 0x02, 0x08, 0x0E, 0x02];
        let sig = MethodSignature::parse(&blob).unwrap();
        assert!(!sig.has_this);
        assert_eq!(sig.ret, TypeSig::I4);
        assert_eq!(sig.params, vec![TypeSig::String, TypeSig::Boolean]);
        assert_eq!(sig.encode().unwrap(), blob);
    }

    #[test]
    fn test_parse_class_types() {
        let sig = MethodSignature::instance(
            TypeSig::Class("Game.Player".into()),
            vec![TypeSig::Class("Game.World".into())],
        );
        let blob = sig.encode().unwrap();
        assert_eq!(blob[0], CALLCONV_HASTHIS);
        assert_eq!(blob[2], element_type::CLASS);

        let parsed = MethodSignature::parse(&blob).unwrap();
        assert_eq!(parsed, sig);
        assert_eq!(
            parsed.to_string(),
            "instance class Game.Player (class Game.World)"
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        // Unknown calling convention
        assert!(matches!(
            MethodSignature::parse(&[0x05, 0x00, 0x01]),
            Err(Error::Malformed { .. })
        ));
        // Unknown element type
        assert!(matches!(
            MethodSignature::parse(&[0x00, 0x00, 0x55]),
            Err(Error::Malformed { .. })
        ));
        // void parameter
        assert!(MethodSignature::parse(&[0x00, 0x01, 0x01, 0x01]).is_err());
        // trailing bytes
        assert!(MethodSignature::parse(&[0x00, 0x00, 0x01, 0x01]).is_err());
        // truncated
        assert!(MethodSignature::parse(&[0x00, 0x02, 0x01, 0x08]).is_err());
        assert!(MethodSignature::parse(&[]).is_err());
    }

    #[test]
    fn test_rename_classes() {
        let mut sig = MethodSignature::static_method(
            TypeSig::Class("Old.Type".into()),
            vec![TypeSig::I4, TypeSig::Class("Other".into())],
        );

        let changed = sig.rename_classes(|name| (name == "Old.Type").then(|| "New.Type".into()));
        assert!(changed);
        assert_eq!(sig.ret, TypeSig::Class("New.Type".into()));
        assert_eq!(sig.params[1], TypeSig::Class("Other".into()));

        assert!(!sig.rename_classes(|_| None));
    }

    #[test]
    fn test_value_kinds() {
        let sig = MethodSignature::static_method(
            TypeSig::Void,
            vec![TypeSig::U2, TypeSig::I8, TypeSig::R4, TypeSig::Class("A".into())],
        );
        assert_eq!(
            sig.param_kinds(),
            vec![
                ValueKind::I32,
                ValueKind::I64,
                ValueKind::F64,
                ValueKind::Object
            ]
        );
        assert_eq!(sig.ret.value_kind(), ValueKind::Void);
    }
}

//! Metadata tokens addressing rows in a module image.
//!
//! A token packs a table identifier into its high byte and a 1-based row index into the low
//! 24 bits, following the ECMA-335 layout. IL instructions such as `call` and `newobj`
//! carry tokens as their 4-byte operand, which is what the relinker rewrites.
//!
//! # Examples
//!
//! ```rust
//! use dotmod::metadata::token::{TableId, Token};
//!
//! let token = Token::from_parts(TableId::MemberRef, 3);
//! assert_eq!(token.value(), 0x0A00_0003);
//! assert_eq!(token.table_id(), Some(TableId::MemberRef));
//! assert_eq!(token.row(), 3);
//! ```

use std::fmt;

use strum::{Display, EnumIter, FromRepr};

/// Tables of the module image format that can be addressed by a [`Token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Display, EnumIter)]
#[repr(u8)]
pub enum TableId {
    /// References to types, scoped to this module or to an assembly reference
    TypeRef = 0x01,
    /// Types defined by this module
    TypeDef = 0x02,
    /// Methods defined by this module
    MethodDef = 0x06,
    /// References to members of (possibly external) types
    MemberRef = 0x0A,
    /// References to other modules
    AssemblyRef = 0x23,
}

/// A metadata token: table id in the high byte, row in the low 24 bits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

impl Token {
    /// Creates a token from its raw value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a token from a table and a 1-based row.
    #[must_use]
    pub fn from_parts(table: TableId, row: u32) -> Self {
        Token((u32::from(table as u8) << 24) | (row & 0x00FF_FFFF))
    }

    /// Returns the raw token value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Returns the table byte.
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Returns the table as a known [`TableId`], if it is one.
    #[must_use]
    pub fn table_id(&self) -> Option<TableId> {
        TableId::from_repr(self.table())
    }

    /// Returns the 1-based row index.
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns `true` for the null token.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_parts() {
        let token = Token::from_parts(TableId::MethodDef, 1);
        assert_eq!(token.value(), 0x0600_0001);
        assert_eq!(token.table(), 0x06);
        assert_eq!(token.row(), 1);
        assert_eq!(token.table_id(), Some(TableId::MethodDef));
    }

    #[test]
    fn test_token_unknown_table() {
        let token = Token(0x7000_0001);
        assert_eq!(token.table_id(), None);
        assert_eq!(token.row(), 1);
    }

    #[test]
    fn test_token_row_is_masked() {
        let token = Token::from_parts(TableId::TypeRef, 0x0100_0002);
        assert_eq!(token.table_id(), Some(TableId::TypeRef));
        assert_eq!(token.row(), 2);
    }

    #[test]
    fn test_token_null_and_display() {
        assert!(Token(0).is_null());
        assert!(!Token(0x0A00_0001).is_null());
        assert_eq!(format!("{}", Token(0x0A00_0001)), "0x0a000001");
        assert_eq!(
            format!("{:?}", Token(0x0200_0005)),
            "Token(0x02000005, table: 0x02, row: 5)"
        );
    }
}

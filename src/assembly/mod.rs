//! CIL instruction decoding and emission for method bodies.
//!
//! The loader never executes CIL. It only needs to walk method bodies precisely enough to
//! find instructions whose operand is a metadata token, so static call-site patches and the
//! relinker can rewrite those tokens in place. Walking requires knowing every opcode's operand
//! size, so the decoder covers the full instruction set even though only method-referencing
//! instructions are acted on.
//!
//! # Key Components
//!
//! - [`crate::assembly::decode`] - Decode a body into [`crate::assembly::Instruction`]s
//! - [`crate::assembly::method_references`] - Token operands of `call`, `callvirt`, `newobj`, `jmp`, `ldftn`, `ldvirtftn`
//! - [`crate::assembly::rewrite_token`] - Overwrite the token operand of one instruction
//! - [`crate::assembly::encoder::IlBuilder`] - Emit small bodies
//!
//! # Examples
//!
//! ```rust
//! use dotmod::assembly::{decode, encoder::IlBuilder, Operand};
//! use dotmod::metadata::token::Token;
//!
//! let body = IlBuilder::new().ldarg(0).call(Token(0x0A00_0001)).ret().build();
//! let instructions = decode(&body)?;
//! assert_eq!(instructions.len(), 3);
//! assert_eq!(instructions[1].operand, Operand::Token(Token(0x0A00_0001)));
//! # Ok::<(), dotmod::Error>(())
//! ```

mod decoder;
pub mod encoder;
pub mod opcodes;

pub use decoder::{decode, method_references, rewrite_token, MethodReference};

use crate::metadata::token::Token;

/// How an opcode's operand is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand present
    None,
    /// Signed 8-bit integer
    Int8,
    /// Unsigned 8-bit integer (short variable index, alignment)
    UInt8,
    /// Unsigned 16-bit integer (long variable index)
    UInt16,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// 32-bit floating point
    Float32,
    /// 64-bit floating point
    Float64,
    /// Metadata token
    Token,
    /// Signed 8-bit branch displacement
    BranchShort,
    /// Signed 32-bit branch displacement
    Branch,
    /// Jump table: u32 count followed by count i32 displacements
    Switch,
}

/// A decoded operand.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Operand {
    None,
    Int8(i8),
    UInt8(u8),
    UInt16(u16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Token(Token),
    /// Branch displacement relative to the next instruction
    Branch(i32),
    Switch(Vec<i32>),
}

/// A single decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Offset of the first opcode byte within the body
    pub offset: usize,
    /// The opcode; prefixed opcodes are `0xFE00 | second byte`
    pub opcode: u16,
    /// Offset of the operand within the body
    pub operand_offset: usize,
    /// Total encoded length
    pub len: usize,
    /// The operand
    pub operand: Operand,
}

impl Instruction {
    /// Returns the token operand, if the instruction has one.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self.operand {
            Operand::Token(token) => Some(token),
            _ => None,
        }
    }
}

//! CIL opcode byte values and their operand encodings (ECMA-335 Partition III).
//!
//! Only the opcodes the loader emits or inspects by name get a constant; the full instruction
//! set is covered by [`operand_type`] and [`fe_operand_type`], which is all the decoder needs
//! to walk a method body instruction by instruction.
#![allow(missing_docs)]

use crate::assembly::OperandType;

pub const NOP: u8 = 0x00;
pub const LDARG_0: u8 = 0x02;
pub const LDARG_1: u8 = 0x03;
pub const LDARG_2: u8 = 0x04;
pub const LDARG_3: u8 = 0x05;
pub const LDARG_S: u8 = 0x0E;
pub const LDNULL: u8 = 0x14;
pub const LDC_I4_0: u8 = 0x16;
pub const LDC_I4_S: u8 = 0x1F;
pub const LDC_I4: u8 = 0x20;
pub const LDC_I8: u8 = 0x21;
pub const LDC_R8: u8 = 0x23;
pub const POP: u8 = 0x26;
pub const JMP: u8 = 0x27;
pub const CALL: u8 = 0x28;
pub const RET: u8 = 0x2A;
pub const BR_S: u8 = 0x2B;
pub const BR: u8 = 0x38;
pub const SWITCH: u8 = 0x45;
pub const CALLVIRT: u8 = 0x6F;
pub const LDSTR: u8 = 0x72;
pub const NEWOBJ: u8 = 0x73;

pub const FE_PREFIX: u8 = 0xFE;
pub const FE_LDFTN: u8 = 0x06;
pub const FE_LDVIRTFTN: u8 = 0x07;
pub const FE_LDARG: u8 = 0x09;

/// Operand encoding of a single-byte opcode, or `None` if the byte is not a defined opcode.
///
/// `0xFE` is the two-byte prefix and is reported as undefined here.
#[must_use]
pub const fn operand_type(opcode: u8) -> Option<OperandType> {
    Some(match opcode {
        0x00..=0x0D | 0x14..=0x1E | 0x25 | 0x26 | 0x2A => OperandType::None,
        0x0E..=0x13 => OperandType::UInt8,
        0x1F => OperandType::Int8,
        0x20 => OperandType::Int32,
        0x21 => OperandType::Int64,
        0x22 => OperandType::Float32,
        0x23 => OperandType::Float64,
        0x27..=0x29 => OperandType::Token,
        0x2B..=0x37 | 0xDE => OperandType::BranchShort,
        0x38..=0x44 | 0xDD => OperandType::Branch,
        0x45 => OperandType::Switch,
        0x46..=0x6E => OperandType::None,
        0x6F..=0x75 => OperandType::Token,
        0x76 | 0x7A => OperandType::None,
        0x79 | 0x7B..=0x81 => OperandType::Token,
        0x82..=0x8B | 0x8E => OperandType::None,
        0x8C | 0x8D | 0x8F => OperandType::Token,
        0x90..=0xA2 => OperandType::None,
        0xA3..=0xA5 => OperandType::Token,
        0xB3..=0xBA | 0xC3 => OperandType::None,
        0xC2 | 0xC6 | 0xD0 => OperandType::Token,
        0xD1..=0xDC | 0xDF | 0xE0 => OperandType::None,
        _ => return None,
    })
}

/// Operand encoding of the second byte of a `0xFE`-prefixed opcode.
#[must_use]
pub const fn fe_operand_type(opcode: u8) -> Option<OperandType> {
    Some(match opcode {
        0x00..=0x05 | 0x0F | 0x11 | 0x13 | 0x14 | 0x17 | 0x18 | 0x1A | 0x1D | 0x1E => {
            OperandType::None
        }
        0x06 | 0x07 | 0x15 | 0x16 | 0x1C => OperandType::Token,
        0x09..=0x0E => OperandType::UInt16,
        0x12 | 0x19 => OperandType::UInt8,
        _ => return None,
    })
}

/// Returns `true` for the opcodes whose token operand names a method to invoke or reference.
#[must_use]
pub const fn is_method_reference(opcode: u16) -> bool {
    matches!(opcode, 0x27 | 0x28 | 0x6F | 0x73 | 0xFE06 | 0xFE07)
}

//! Linear CIL decoder.
//!
//! Bodies are decoded front to back. Any undefined opcode or truncated operand aborts with
//! [`crate::Error::Malformed`]: a body that cannot be walked reliably cannot be patched
//! safely either, so the relinker treats such a module as malformed input.

use crate::{
    assembly::{
        opcodes::{fe_operand_type, is_method_reference, operand_type, FE_PREFIX},
        Instruction, Operand, OperandType,
    },
    file::{io::write_le_at, parser::Parser},
    metadata::token::Token,
    Result,
};

/// A method-referencing token operand found in a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodReference {
    /// Offset of the instruction
    pub offset: usize,
    /// Offset of the 4-byte token operand
    pub operand_offset: usize,
    /// The opcode (`0xFE06` for `ldftn`)
    pub opcode: u16,
    /// The referenced member
    pub token: Token,
}

fn read_operand(parser: &mut Parser, kind: OperandType) -> Result<Operand> {
    Ok(match kind {
        OperandType::None => Operand::None,
        OperandType::Int8 => Operand::Int8(parser.read_le::<i8>()?),
        OperandType::UInt8 => Operand::UInt8(parser.read_le::<u8>()?),
        OperandType::UInt16 => Operand::UInt16(parser.read_le::<u16>()?),
        OperandType::Int32 => Operand::Int32(parser.read_le::<i32>()?),
        OperandType::Int64 => Operand::Int64(parser.read_le::<i64>()?),
        OperandType::Float32 => Operand::Float32(parser.read_le::<f32>()?),
        OperandType::Float64 => Operand::Float64(parser.read_le::<f64>()?),
        OperandType::Token => Operand::Token(Token(parser.read_le::<u32>()?)),
        OperandType::BranchShort => Operand::Branch(i32::from(parser.read_le::<i8>()?)),
        OperandType::Branch => Operand::Branch(parser.read_le::<i32>()?),
        OperandType::Switch => {
            let count = parser.read_le::<u32>()? as usize;
            if count.saturating_mul(4) > parser.remaining() {
                return Err(malformed_error!(
                    "switch with {} targets exceeds remaining body of {} bytes",
                    count,
                    parser.remaining()
                ));
            }
            let mut targets = Vec::with_capacity(count);
            for _ in 0..count {
                targets.push(parser.read_le::<i32>()?);
            }
            Operand::Switch(targets)
        }
    })
}

/// Decodes every instruction of a method body.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for undefined opcodes or operands running past the end
/// of the body.
pub fn decode(body: &[u8]) -> Result<Vec<Instruction>> {
    let mut parser = Parser::new(body);
    let mut instructions = Vec::new();

    while parser.has_more_data() {
        let offset = parser.pos();
        let first = parser.read_le::<u8>()?;
        let (opcode, kind) = if first == FE_PREFIX {
            let second = parser
                .read_le::<u8>()
                .map_err(|_| malformed_error!("Truncated two-byte opcode at offset {}", offset))?;
            let Some(kind) = fe_operand_type(second) else {
                return Err(malformed_error!(
                    "Undefined opcode 0xFE {:#04x} at offset {}",
                    second,
                    offset
                ));
            };
            (0xFE00 | u16::from(second), kind)
        } else {
            let Some(kind) = operand_type(first) else {
                return Err(malformed_error!(
                    "Undefined opcode {:#04x} at offset {}",
                    first,
                    offset
                ));
            };
            (u16::from(first), kind)
        };

        let operand_offset = parser.pos();
        let operand = read_operand(&mut parser, kind).map_err(|_| {
            malformed_error!(
                "Truncated operand for opcode {:#06x} at offset {}",
                opcode,
                offset
            )
        })?;

        instructions.push(Instruction {
            offset,
            opcode,
            operand_offset,
            len: parser.pos() - offset,
            operand,
        });
    }

    Ok(instructions)
}

/// Collects every method-referencing token operand in a body, in order.
///
/// # Errors
/// Propagates decoding errors from [`decode`].
pub fn method_references(body: &[u8]) -> Result<Vec<MethodReference>> {
    Ok(decode(body)?
        .into_iter()
        .filter(|instruction| is_method_reference(instruction.opcode))
        .filter_map(|instruction| {
            instruction.token().map(|token| MethodReference {
                offset: instruction.offset,
                operand_offset: instruction.operand_offset,
                opcode: instruction.opcode,
                token,
            })
        })
        .collect())
}

/// Overwrites the 4-byte token operand at `operand_offset`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the operand does not fit in the body.
pub fn rewrite_token(body: &mut [u8], operand_offset: usize, token: Token) -> Result<()> {
    let mut offset = operand_offset;
    write_le_at::<u32>(body, &mut offset, token.value())
}

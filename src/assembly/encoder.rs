//! Minimal CIL emitter.
//!
//! Hosts use this to describe stub bodies for their own modules and to build trampolines in
//! tests. It writes opcodes and operands only; branch fixups and stack tracking are not
//! needed for the straight-line bodies the loader produces.

use crate::{assembly::opcodes, metadata::token::Token};

/// Builder for straight-line CIL bodies.
#[derive(Debug, Default, Clone)]
pub struct IlBuilder {
    body: Vec<u8>,
}

impl IlBuilder {
    /// Starts an empty body.
    #[must_use]
    pub fn new() -> Self {
        IlBuilder { body: Vec::new() }
    }

    fn op_token(mut self, opcode: u8, token: Token) -> Self {
        self.body.push(opcode);
        self.body.extend_from_slice(&token.value().to_le_bytes());
        self
    }

    /// `nop`
    #[must_use]
    pub fn nop(mut self) -> Self {
        self.body.push(opcodes::NOP);
        self
    }

    /// `ldarg.N`, `ldarg.s` or `ldarg`, whichever is shortest.
    #[must_use]
    pub fn ldarg(mut self, index: u16) -> Self {
        match index {
            0..=3 => self.body.push(opcodes::LDARG_0 + index as u8),
            4..=255 => {
                self.body.push(opcodes::LDARG_S);
                self.body.push(index as u8);
            }
            _ => {
                self.body.push(opcodes::FE_PREFIX);
                self.body.push(opcodes::FE_LDARG);
                self.body.extend_from_slice(&index.to_le_bytes());
            }
        }
        self
    }

    /// `ldc.i4` in its shortest form.
    #[must_use]
    pub fn ldc_i4(mut self, value: i32) -> Self {
        match value {
            0..=8 => self.body.push(opcodes::LDC_I4_0 + value as u8),
            -128..=127 => {
                self.body.push(opcodes::LDC_I4_S);
                self.body.push(value as i8 as u8);
            }
            _ => {
                self.body.push(opcodes::LDC_I4);
                self.body.extend_from_slice(&value.to_le_bytes());
            }
        }
        self
    }

    /// `ldstr token`
    #[must_use]
    pub fn ldstr(self, token: Token) -> Self {
        self.op_token(opcodes::LDSTR, token)
    }

    /// `call token`
    #[must_use]
    pub fn call(self, token: Token) -> Self {
        self.op_token(opcodes::CALL, token)
    }

    /// `callvirt token`
    #[must_use]
    pub fn callvirt(self, token: Token) -> Self {
        self.op_token(opcodes::CALLVIRT, token)
    }

    /// `newobj token`
    #[must_use]
    pub fn newobj(self, token: Token) -> Self {
        self.op_token(opcodes::NEWOBJ, token)
    }

    /// `ldftn token`
    #[must_use]
    pub fn ldftn(mut self, token: Token) -> Self {
        self.body.push(opcodes::FE_PREFIX);
        self.op_token(opcodes::FE_LDFTN, token)
    }

    /// `pop`
    #[must_use]
    pub fn pop(mut self) -> Self {
        self.body.push(opcodes::POP);
        self
    }

    /// `ret`
    #[must_use]
    pub fn ret(mut self) -> Self {
        self.body.push(opcodes::RET);
        self
    }

    /// Finishes the body.
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{decode, Operand};

    #[test]
    fn test_shortest_forms() {
        let body = IlBuilder::new()
            .ldarg(1)
            .ldarg(7)
            .ldarg(300)
            .ldc_i4(5)
            .ldc_i4(-3)
            .ldc_i4(1000)
            .build();
        assert_eq!(
            body,
            vec![
                0x03, 0x0E, 0x07, 0xFE, 0x09, 0x2C, 0x01, 0x1B, 0x1F, 0xFD, 0x20, 0xE8, 0x03,
                0x00, 0x00
            ]
        );

        let operands: Vec<Operand> = decode(&body).unwrap().into_iter().map(|i| i.operand).collect();
        assert_eq!(operands[2], Operand::UInt16(300));
        assert_eq!(operands[4], Operand::Int8(-3));
        assert_eq!(operands[5], Operand::Int32(1000));
    }
}

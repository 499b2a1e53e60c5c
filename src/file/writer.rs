//! Growable little-endian writer, the encoding counterpart of [`crate::file::parser::Parser`].
//!
//! Used to serialize module images after relinking and to build signature blobs.

use crate::{file::io::CilIO, Result};

/// An append-only byte buffer with metadata encoding helpers.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    data: Vec<u8>,
}

impl Writer {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Writer { data: Vec::new() }
    }

    /// Appends `value` in little-endian order.
    pub fn write_le<T: CilIO>(&mut self, value: T) {
        self.data.extend_from_slice(value.to_le_bytes().as_ref());
    }

    /// Appends raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Appends an ECMA-335 II.23.2 compressed unsigned integer.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for values above `0x1FFF_FFFF`, which the
    /// encoding cannot represent.
    pub fn write_compressed_uint(&mut self, value: u32) -> Result<()> {
        match value {
            0..=0x7F => self.data.push(value as u8),
            0x80..=0x3FFF => {
                self.data.push(((value >> 8) as u8) | 0x80);
                self.data.push(value as u8);
            }
            0x4000..=0x1FFF_FFFF => {
                self.data.push(((value >> 24) as u8) | 0xC0);
                self.data.push((value >> 16) as u8);
                self.data.push((value >> 8) as u8);
                self.data.push(value as u8);
            }
            _ => {
                return Err(malformed_error!(
                    "Value {:#x} is too large for a compressed uint",
                    value
                ))
            }
        }
        Ok(())
    }

    /// Appends a 7-bit encoded integer.
    pub fn write_7bit_encoded_int(&mut self, mut value: u32) {
        while value >= 0x80 {
            self.data.push((value as u8) | 0x80);
            value >>= 7;
        }
        self.data.push(value as u8);
    }

    /// Appends a 7-bit length prefix followed by the UTF-8 bytes of `value`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the string is longer than `u32::MAX` bytes.
    pub fn write_prefixed_string_utf8(&mut self, value: &str) -> Result<()> {
        let length = u32::try_from(value.len())
            .map_err(|_| malformed_error!("String of {} bytes is too long", value.len()))?;
        self.write_7bit_encoded_int(length);
        self.data.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Consumes the writer and returns the buffer.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

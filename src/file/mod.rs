//! Byte-level access to module images and package files.
//!
//! This module hides where bytes come from. A [`crate::file::Backend`] is either a memory
//! mapped file on disk ([`crate::file::physical::Physical`]) or an owned buffer
//! ([`crate::file::memory::Memory`]), which covers archive entries and embedded packages. The
//! [`crate::file::parser::Parser`] and [`crate::file::writer::Writer`] types decode and
//! encode the binary module format on top of either.
//!
//! # Key Components
//!
//! - [`crate::file::Backend`] - Source-agnostic read access
//! - [`crate::file::parser::Parser`] - Bounds-checked decoding cursor
//! - [`crate::file::writer::Writer`] - Encoding buffer
//! - [`crate::file::io`] - Primitive little-endian helpers
//!
//! # Thread Safety
//!
//! Backends are `Send + Sync` so package files can be handed between the loading thread and
//! resolver threads without copying.

pub mod io;
pub mod memory;
pub mod parser;
pub mod physical;
pub mod writer;

use std::path::Path;

use crate::Result;

/// Backend trait for byte sources.
///
/// Abstracts over on-disk and in-memory data, so packages can be read the same way whether
/// they live in a directory, inside an archive, or inside the host process.
pub trait Backend: Send + Sync {
    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize {
        self.data().len()
    }

    /// Returns `true` if the backend holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opens `path` as a memory mapped backend.
///
/// # Errors
/// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped.
pub fn open_physical(path: &Path) -> Result<Box<dyn Backend>> {
    Ok(Box::new(physical::Physical::new(path)?))
}

/// Wraps an owned buffer as a backend.
#[must_use]
pub fn from_mem(data: Vec<u8>) -> Box<dyn Backend> {
    Box::new(memory::Memory::new(data))
}

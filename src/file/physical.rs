//! Memory mapped file backend for package files on disk.

use super::Backend;
use crate::Result;

use memmap2::Mmap;
use std::{fs, path::Path};

/// A read-only memory mapping of one package file.
#[derive(Debug)]
pub struct Physical {
    data: Option<Mmap>,
}

impl Physical {
    /// Maps the file at `path`.
    ///
    /// Zero-length files are not mapped; they behave as an empty backend.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped.
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let file = fs::File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Physical { data: None });
        }

        // The mapping is read-only and package files are not rewritten while a mod is loaded.
        let mmap = unsafe { Mmap::map(&file) }?;
        Ok(Physical { data: Some(mmap) })
    }
}

impl Backend for Physical {
    fn data(&self) -> &[u8] {
        match &self.data {
            Some(mmap) => mmap.as_ref(),
            None => &[],
        }
    }
}

//! On-disk cache of relinked modules.
//!
//! Relinking is deterministic in its inputs: the original bytes, the rename map and the patch
//! set. The cache stores each relinked module as `<mod>+<name>.dll` and records those inputs
//! in a sidecar `<mod>+<name>.sum`. `+` never survives sanitizing, so distinct pairs such as
//! `a.b`/`c` and `a`/`b.c` never share a file:
//!
//! ```text
//! <sha1 of the original bytes>
//! <sha1 fingerprint of map and patches>
//! ```
//!
//! A lookup only succeeds when both lines match, so changing a mod or updating the host map
//! invalidates the entry. A store removes the old `.sum` first, moves the new module into
//! place with a rename and writes the new `.sum` last, so an interrupted store leaves an entry
//! that never validates rather than a torn one that does.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::{file, relink::to_hex, Result};

/// A directory of relinked modules keyed by owning mod and simple name.
#[derive(Debug, Clone)]
pub struct RelinkDiskCache {
    dir: PathBuf,
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl RelinkDiskCache {
    /// Uses `dir` as cache root. The directory is created on first store.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        RelinkDiskCache { dir: dir.into() }
    }

    /// The cache root.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, owner: &str, name: &str) -> (PathBuf, PathBuf) {
        let stem = format!("{}+{}", sanitize(owner), sanitize(name));
        (
            self.dir.join(format!("{stem}.dll")),
            self.dir.join(format!("{stem}.sum")),
        )
    }

    /// Returns the cached relinked bytes if they were produced from the same inputs.
    ///
    /// Any I/O problem is treated as a miss.
    #[must_use]
    pub fn load(
        &self,
        owner: &str,
        name: &str,
        input_checksum: &[u8; 20],
        fingerprint: &[u8; 20],
    ) -> Option<Vec<u8>> {
        let (module_path, sum_path) = self.paths(owner, name);
        let sum = fs::read_to_string(&sum_path).ok()?;
        let mut lines = sum.lines();
        if lines.next()? != to_hex(input_checksum) || lines.next()? != to_hex(fingerprint) {
            log::debug!(
                target: "dotmod::relink",
                "Stale relink cache entry {}",
                sum_path.display()
            );
            return None;
        }

        match file::open_physical(&module_path) {
            Ok(backend) if !backend.is_empty() => Some(backend.data().to_vec()),
            Ok(_) => None,
            Err(error) => {
                log::debug!(
                    target: "dotmod::relink",
                    "Relink cache entry {} unreadable: {}",
                    module_path.display(),
                    error
                );
                None
            }
        }
    }

    /// Stores relinked bytes together with the inputs they were produced from.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the directory or either file cannot be written.
    pub fn store(
        &self,
        owner: &str,
        name: &str,
        input_checksum: &[u8; 20],
        fingerprint: &[u8; 20],
        bytes: &[u8],
    ) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let (module_path, sum_path) = self.paths(owner, name);
        match fs::remove_file(&sum_path) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => return Err(error.into()),
            _ => {}
        }

        let staging = module_path.with_extension("dll.tmp");
        fs::write(&staging, bytes)?;
        if let Err(error) = fs::rename(&staging, &module_path) {
            let _ = fs::remove_file(&staging);
            return Err(error.into());
        }
        fs::write(
            &sum_path,
            format!("{}\n{}\n", to_hex(input_checksum), to_hex(fingerprint)),
        )?;
        Ok(())
    }
}

//! Package readers: where a mod's compiled modules are read from.
//!
//! A mod ships as an unpacked directory, a zip archive, or a set of files embedded in the
//! host process. Each is wrapped by a [`PackageReader`] that hands out a
//! [`crate::file::Backend`] per package-relative path. Paths are always normalized with
//! [`normalize_path`] first, so `Code\Foo.dll`, `./Code/Foo.dll` and `Code/x/../Foo.dll` all
//! name the same file and share one cache slot in the isolation context.

use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::Read,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use zip::ZipArchive;

use crate::{
    file::{self, Backend},
    metadata::identity::PackageSource,
    Result,
};

/// Normalizes a package-relative path.
///
/// Separators become `/`, empty and `.` segments are dropped and `..` folds into its parent.
/// Matching is case-sensitive.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if the path is empty or `..` climbs above the package
/// root.
///
/// # Examples
///
/// ```rust
/// use dotmod::loader::package::normalize_path;
///
/// assert_eq!(normalize_path(r".\Code\x\..\Foo.dll")?, "Code/Foo.dll");
/// assert!(normalize_path("../outside.dll").is_err());
/// # Ok::<(), dotmod::Error>(())
/// ```
pub fn normalize_path(path: &str) -> Result<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(malformed_error!("Path '{}' escapes the package root", path));
                }
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return Err(malformed_error!("Path '{}' names no file", path));
    }
    Ok(segments.join("/"))
}

/// Directory part of a normalized path, without trailing separator. Empty for the root.
#[must_use]
pub fn parent_dir(path: &str) -> &str {
    path.rfind('/').map_or("", |index| &path[..index])
}

/// Extension of a normalized path including the dot, or an empty string.
#[must_use]
pub fn extension(path: &str) -> &str {
    let file_name = &path[path.rfind('/').map_or(0, |index| index + 1)..];
    file_name.rfind('.').map_or("", |index| &file_name[index..])
}

/// Files shipped inside the host process under a package name.
///
/// Cloning is cheap; clones share the file table.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedPackage {
    name: String,
    files: Arc<BTreeMap<String, Arc<[u8]>>>,
}

impl EmbeddedPackage {
    /// Creates an empty package.
    pub fn new(name: impl Into<String>) -> Self {
        EmbeddedPackage {
            name: name.into(),
            files: Arc::new(BTreeMap::new()),
        }
    }

    /// Adds a file.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `path` does not normalize.
    pub fn with_file(mut self, path: &str, bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let path = normalize_path(path)?;
        Arc::make_mut(&mut self.files).insert(path, Arc::from(bytes.into()));
        Ok(self)
    }

    /// Package name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes of a file by normalized path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(AsRef::as_ref)
    }

    /// Normalized paths of every file, sorted.
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }
}

/// Read access to the files of one mod package.
///
/// All paths passed in are already normalized.
pub trait PackageReader: Send + Sync {
    /// Human readable location for logs and diagnostics.
    fn describe(&self) -> String;

    /// Returns `true` if the package contains `path`.
    fn contains(&self, path: &str) -> bool;

    /// Opens `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] or [`crate::Error::ArchiveError`] when the file is
    /// missing or unreadable.
    fn open(&self, path: &str) -> Result<Box<dyn Backend>>;
}

/// An unpacked mod directory. Files are memory mapped.
#[derive(Debug)]
pub struct DirectoryReader {
    root: PathBuf,
}

impl DirectoryReader {
    /// Reads from `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryReader { root: root.into() }
    }
}

impl PackageReader for DirectoryReader {
    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }

    fn contains(&self, path: &str) -> bool {
        self.root.join(path).is_file()
    }

    fn open(&self, path: &str) -> Result<Box<dyn Backend>> {
        file::open_physical(&self.root.join(path))
    }
}

/// A zipped mod package.
///
/// The central directory is read once on open; entry names are normalized so archives built
/// on Windows resolve the same way.
pub struct ArchiveReader {
    path: PathBuf,
    entries: HashMap<String, usize>,
    archive: Mutex<ZipArchive<File>>,
}

impl ArchiveReader {
    /// Opens the archive at `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened and
    /// [`crate::Error::ArchiveError`] if it is not a valid zip archive.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut archive = ZipArchive::new(File::open(&path)?)?;

        let mut entries = HashMap::with_capacity(archive.len());
        for index in 0..archive.len() {
            let entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            if let Ok(name) = normalize_path(entry.name()) {
                entries.insert(name, index);
            }
        }

        Ok(ArchiveReader {
            path,
            entries,
            archive: Mutex::new(archive),
        })
    }
}

impl PackageReader for ArchiveReader {
    fn describe(&self) -> String {
        format!("archive {}", self.path.display())
    }

    fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    fn open(&self, path: &str) -> Result<Box<dyn Backend>> {
        let Some(&index) = self.entries.get(path) else {
            return Err(zip::result::ZipError::FileNotFound.into());
        };

        let mut archive = lock!(self.archive);
        let mut entry = archive.by_index(index)?;
        let mut data = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or_default());
        entry.read_to_end(&mut data)?;
        Ok(file::from_mem(data))
    }
}

/// Files embedded in the host process.
#[derive(Debug)]
pub struct EmbeddedReader {
    package: EmbeddedPackage,
}

impl EmbeddedReader {
    /// Reads from `package`.
    #[must_use]
    pub fn new(package: EmbeddedPackage) -> Self {
        EmbeddedReader { package }
    }
}

impl PackageReader for EmbeddedReader {
    fn describe(&self) -> String {
        format!("embedded package {}", self.package.name())
    }

    fn contains(&self, path: &str) -> bool {
        self.package.get(path).is_some()
    }

    fn open(&self, path: &str) -> Result<Box<dyn Backend>> {
        match self.package.get(path) {
            Some(bytes) => Ok(file::from_mem(bytes.to_vec())),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found in embedded package {}", path, self.package.name()),
            )
            .into()),
        }
    }
}

/// Opens the reader matching a mod's package source.
///
/// # Errors
/// Fails if an archive cannot be opened; directory and embedded sources always succeed.
pub fn open_reader(source: &PackageSource) -> Result<Arc<dyn PackageReader>> {
    Ok(match source {
        PackageSource::Directory(root) => Arc::new(DirectoryReader::new(root.clone())),
        PackageSource::Archive(path) => Arc::new(ArchiveReader::open(path.clone())?),
        PackageSource::Embedded(package) => Arc::new(EmbeddedReader::new(package.clone())),
    })
}

//! Module metadata: identities, the compiled image format and exported surfaces.
//!
//! # Architecture
//!
//! - [`crate::metadata::identity`] - Mod records ([`crate::metadata::identity::ModuleMetadata`]) and versions
//! - [`crate::metadata::image`] - Parsing and writing compiled module images
//! - [`crate::metadata::signature`] - Method signature blobs
//! - [`crate::metadata::surface`] - Public types and methods a module exports
//! - [`crate::metadata::token`] - Row addressing inside an image
//! - [`crate::metadata::value`] - Values crossing the host/mod call boundary
//! - [`crate::metadata::dependencies`] - Load ordering between mods
//! - [`crate::metadata::diagnostics`] - Recoverable failure reporting

pub mod dependencies;
pub mod diagnostics;
pub mod identity;
pub mod image;
pub mod signature;
pub mod surface;
pub mod token;
pub mod value;

// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
// - 'file/physical.rs' uses mmap to map a file into memory

//! # dotmod
//!
//! The core of a runtime mod loader for managed-code hosts. Mods are compiled against the
//! unpatched host binary; `dotmod` relinks them against the patched host, loads each mod into
//! its own isolation context, resolves references between mods, installs detours on host
//! methods and dispatches lifecycle callbacks.
//!
//! ## Features
//!
//! - **Binary relinking** - Rewrite module, type and member references of compiled modules,
//!   apply static call-site patches, and cache the results on disk keyed by checksum
//! - **Isolation contexts** - One loading context per mod with idempotent loads and safe,
//!   concurrent disposal
//! - **Cross-mod resolution** - Local then global lookup with dependency promotion and
//!   memoized misses
//! - **Detours** - Stackable hooks with an `orig` continuation, deferred installation and
//!   exact undo
//! - **Lifecycle dispatch** - Explicit callback tables, dependency-ordered batch loading
//!
//! ## Quick Start
//!
//! ```rust
//! use dotmod::prelude::*;
//!
//! let detours = std::sync::Arc::new(DetourTable::new());
//! let greet = MethodDescriptor::new(
//!     "Game.Player",
//!     "Greet",
//!     MethodSignature::static_method(TypeSig::String, vec![TypeSig::String]),
//! );
//! detours.declare_bound(greet.clone(), |args: &[Value]| {
//!     Ok(Value::Str(format!("hello {}", args[0].as_str().unwrap_or_default())))
//! });
//!
//! let runtime = RuntimeBuilder::new()
//!     .with_config(RuntimeConfig::for_host("Game", "Game.Patched"))
//!     .with_detours(detours)
//!     .build()?;
//!
//! let hook = runtime.install_hook(
//!     &greet,
//!     Replacement::with_orig(greet.signature.clone(), |orig, args| {
//!         let inner = orig.call(args)?;
//!         Ok(Value::Str(format!("{}!", inner.as_str().unwrap_or_default())))
//!     }),
//!     None,
//! )?;
//! assert_eq!(runtime.call_host(&greet, &[Value::from("bob")])?, Value::from("hello bob!"));
//!
//! assert!(runtime.remove_hook(&hook));
//! assert_eq!(runtime.call_host(&greet, &[Value::from("bob")])?, Value::from("hello bob"));
//! # Ok::<(), dotmod::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`metadata`] - Module identities, the compiled image format, exported surfaces
//! - [`assembly`] - Instruction decoding for call-site rewriting
//! - [`relink`] - Reference rewriting and the on-disk relink cache
//! - [`loader`] - Packages, isolation contexts, the registry and the resolver
//! - [`detour`] - Host method hooks and static call-site patches
//! - [`lifecycle`] - Callback tables, registration and batch ordering
//! - [`runtime`] - [`ModRuntime`], the object owning all of the above
//!
//! ## Logging
//!
//! All diagnostics go through the [`log`] facade under the targets `dotmod::relink`,
//! `dotmod::loader`, `dotmod::detour` and `dotmod::lifecycle`. Recoverable failures are also
//! collected in [`metadata::diagnostics::Diagnostics`], available from
//! [`ModRuntime::diagnostics`].

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

pub mod assembly;
pub mod detour;
pub mod file;
pub mod lifecycle;
pub mod loader;
pub mod metadata;
pub mod prelude;
pub mod relink;
pub mod runtime;

/// `dotmod` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `dotmod` Error type
///
/// Most loader operations do not return errors to the caller: a module that cannot be loaded
/// or resolved yields `None` and the failure is recorded as a diagnostic. Errors are returned
/// where the caller has to react, such as hook installation or reading a package.
///
/// # Examples
///
/// ```rust
/// use dotmod::{Error, metadata::identity::ModuleVersion};
///
/// match ModuleVersion::parse("1.x") {
///     Ok(version) => println!("version {version}"),
///     Err(Error::Malformed { message, .. }) => println!("malformed: {message}"),
///     Err(e) => println!("error: {e}"),
/// }
/// ```
pub use error::Error;

pub use runtime::{LoadReport, ModRuntime, RuntimeBuilder, RuntimeConfig};

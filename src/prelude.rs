//! # dotmod Prelude
//!
//! The types a host needs to build a runtime, describe mods, declare host methods and install
//! hooks, for glob import.
//!
//! ```rust
//! use dotmod::prelude::*;
//!
//! let runtime = RuntimeBuilder::new().with_config(RuntimeConfig::permissive()).build()?;
//! assert!(runtime.modules().is_empty());
//! # Ok::<(), dotmod::Error>(())
//! ```

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dotmod operations
pub use crate::Error;

/// The result type used throughout dotmod
pub use crate::Result;

// ================================================================================================
// Runtime
// ================================================================================================

/// The runtime, its builder, configuration and batch report
pub use crate::runtime::{LoadReport, ModRuntime, RuntimeBuilder, RuntimeConfig};

// ================================================================================================
// Mod Descriptions
// ================================================================================================

/// Mod identity, versions and package locations
pub use crate::metadata::identity::{
    ModuleDependency, ModuleMetadata, ModuleVersion, PackageSource,
};

/// In-memory packages
pub use crate::loader::package::EmbeddedPackage;

/// Recoverable failure reporting
pub use crate::metadata::diagnostics::{
    Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics,
};

// ================================================================================================
// Loading
// ================================================================================================

/// Host integration points and loaded code
pub use crate::loader::{
    context::IsolationContext, CodeLoader, HostModules, InProcessLoader, LoadedUnit,
    NativeResolver,
};

/// Exported module surfaces
pub use crate::metadata::surface::ModuleSurface;

/// Relinking configuration
pub use crate::relink::map::{MemberKey, MemberTarget, RelinkMap};

// ================================================================================================
// Detours
// ================================================================================================

/// Host method table and hook types
pub use crate::detour::{
    hook::{HookHandle, Orig, Replacement},
    patch::{CallSitePatch, MemberPattern, PatchSet},
    DetourTable, MethodDescriptor,
};

/// Signatures and call values
pub use crate::metadata::{
    signature::{MethodSignature, TypeSig},
    value::{Value, ValueKind},
};

// ================================================================================================
// Lifecycle
// ================================================================================================

/// Callback tables and module registration
pub use crate::lifecycle::{
    table::{LifecycleEvent, LifecycleTable},
    InvokeReport, ModuleActivator, ModuleHandle, NullActivator, TableActivator,
};

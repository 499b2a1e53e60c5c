//! Diagnostics collected while mods are registered, relinked and resolved.
//!
//! Most loader failures are recoverable and surface to callers as `None`. The reason is kept
//! here, so a host can tell the user which dependency or symbol a broken mod was missing
//! while the remaining mods keep loading.
//!
//! # Thread Safety
//!
//! [`Diagnostics`] is backed by `boxcar::Vec`, an append-only vector that supports pushes
//! from many threads through a shared reference without locking.
//!
//! # Examples
//!
//! ```rust
//! use dotmod::metadata::diagnostics::{DiagnosticCategory, Diagnostics};
//!
//! let diagnostics = Diagnostics::new();
//! diagnostics.error(Some("Foo"), DiagnosticCategory::Dependency, "missing dependency Core >= 1.0.0");
//!
//! assert!(diagnostics.has_errors());
//! assert_eq!(diagnostics.for_module("Foo").len(), 1);
//! ```

use std::fmt;

use strum::Display;

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DiagnosticSeverity {
    /// Informational, nothing went wrong
    #[strum(serialize = "INFO")]
    Info,
    /// Something was skipped or degraded
    #[strum(serialize = "WARN")]
    Warning,
    /// A mod or one of its parts failed to load
    #[strum(serialize = "ERROR")]
    Error,
}

/// Which stage produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DiagnosticCategory {
    /// Reading package files
    Package,
    /// Parsing or rewriting module images
    Relink,
    /// Resolving simple names across contexts
    Resolution,
    /// Declared mod dependencies
    Dependency,
    /// Installing or removing detours
    Hook,
    /// Lifecycle callbacks
    Lifecycle,
}

/// A single recorded event.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// How severe the event is
    pub severity: DiagnosticSeverity,
    /// Which stage produced it
    pub category: DiagnosticCategory,
    /// The mod it concerns, if any
    pub module: Option<String>,
    /// Human readable description
    pub message: String,
}

impl Diagnostic {
    /// Creates a diagnostic.
    pub fn new(
        severity: DiagnosticSeverity,
        category: DiagnosticCategory,
        module: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Diagnostic {
            severity,
            category,
            module: module.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.category)?;
        if let Some(module) = &self.module {
            write!(f, " ({module})")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Thread-safe, append-only diagnostic log.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: boxcar::Vec<Diagnostic>,
}

impl Diagnostics {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: boxcar::Vec::new(),
        }
    }

    /// Records an informational entry.
    pub fn info(&self, module: Option<&str>, category: DiagnosticCategory, message: impl Into<String>) {
        self.push(Diagnostic::new(DiagnosticSeverity::Info, category, module, message));
    }

    /// Records a warning.
    pub fn warning(
        &self,
        module: Option<&str>,
        category: DiagnosticCategory,
        message: impl Into<String>,
    ) {
        self.push(Diagnostic::new(
            DiagnosticSeverity::Warning,
            category,
            module,
            message,
        ));
    }

    /// Records an error.
    pub fn error(&self, module: Option<&str>, category: DiagnosticCategory, message: impl Into<String>) {
        self.push(Diagnostic::new(DiagnosticSeverity::Error, category, module, message));
    }

    /// Appends a prepared diagnostic.
    pub fn push(&self, diagnostic: Diagnostic) {
        self.entries.push(diagnostic);
    }

    /// Returns `true` if any error was recorded.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, d)| d.severity == DiagnosticSeverity::Error)
    }

    /// Number of recorded entries.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.count()
    }

    /// Number of errors.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, d)| d.severity == DiagnosticSeverity::Error)
            .count()
    }

    /// All entries concerning `module`, in insertion order.
    #[must_use]
    pub fn for_module(&self, module: &str) -> Vec<Diagnostic> {
        self.entries
            .iter()
            .filter(|(_, d)| d.module.as_deref() == Some(module))
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Iterates all entries.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().map(|(_, d)| d)
    }
}

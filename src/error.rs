use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds {
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Most failures inside the loader are recoverable: the public runtime surface converts them
/// into `None` and records a [`crate::metadata::diagnostics::Diagnostic`]. The variants below are
/// what the lower layers (image parsing, relinking, hook installation) report to their callers.
///
/// # Error Categories
///
/// ## Image Parsing Errors
/// - [`Error::Malformed`] - Corrupted or invalid module image structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond the end of a buffer
/// - [`Error::NotSupported`] - Unsupported image format version
/// - [`Error::Empty`] - Empty input provided
///
/// ## I/O and External Errors
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::ArchiveError`] - Zip archive errors from the `zip` crate
///
/// ## Relinking and Resolution Errors
/// - [`Error::UnresolvedModule`] - A referenced module could not be found anywhere
/// - [`Error::UnresolvedType`] - A referenced type does not exist in its module
/// - [`Error::UnresolvedMember`] - A referenced member does not exist with the expected signature
/// - [`Error::InvalidToken`] - A metadata token points at a missing row
///
/// ## Hook Errors
/// - [`Error::HookTargetNotFound`] - The detour target is not a known host method
/// - [`Error::HookSignatureMismatch`] - The replacement is not signature compatible
/// - [`Error::MethodNotBound`] - A declared method was called before it had a body
///
/// ## Lifecycle and Context Errors
/// - [`Error::ContextDisposed`] - Operation attempted on a disposed isolation context
/// - [`Error::CallbackFailed`] - A lifecycle callback reported failure
/// - [`Error::DuplicateModule`] - A module name was registered twice
/// - [`Error::DependencyNotSatisfied`] - A required dependency is missing or too old
/// - [`Error::GraphError`] - Dependency graph analysis error
///
/// # Examples
///
/// ```rust
/// use dotmod::{Error, metadata::image::ModuleImage};
///
/// match ModuleImage::parse(&[0x00, 0x01]) {
///     Ok(image) => println!("Parsed {}", image.name),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("Malformed image: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The module image is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected for
    /// debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing or writing a buffer.
    #[error("Out of Bound read would have occurred! - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// This image format version is not supported.
    #[error("This file type is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    ///
    /// Wraps standard I/O errors that can occur while reading packages or the on-disk
    /// relink cache.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Error from the `zip` crate while reading an archive package.
    #[error("{0}")]
    ArchiveError(#[from] zip::result::ZipError),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// A module referenced by name could not be resolved by any strategy.
    #[error("Module '{0}' could not be resolved")]
    UnresolvedModule(String),

    /// A referenced type is not defined by the module it is scoped to.
    #[error("Type '{type_name}' not found in module '{module}'")]
    UnresolvedType {
        /// The module the reference was scoped to
        module: String,
        /// The full name of the missing type
        type_name: String,
    },

    /// A referenced member is not defined with a matching signature.
    #[error("Member '{type_name}::{member}' with signature {signature} not found in module '{module}'")]
    UnresolvedMember {
        /// The module the reference was scoped to
        module: String,
        /// The full name of the declaring type
        type_name: String,
        /// The member name
        member: String,
        /// Rendered signature that was searched for
        signature: String,
    },

    /// A metadata token does not point at an existing row.
    #[error("Invalid token - {0}")]
    InvalidToken(Token),

    /// The hook target is not a declared host method.
    #[error("Hook target not found - {0}")]
    HookTargetNotFound(String),

    /// The replacement does not have a signature compatible with the target.
    #[error("Hook signature mismatch on {target}: expected {expected}, got {actual}")]
    HookSignatureMismatch {
        /// The rendered target descriptor
        target: String,
        /// Signature of the target method
        expected: String,
        /// Signature declared by the replacement
        actual: String,
    },

    /// A host method was invoked before an implementation was bound to it.
    #[error("Method {0} has no bound implementation")]
    MethodNotBound(String),

    /// A value of the wrong kind was passed to a method.
    #[error("Argument mismatch calling {method}: {message}")]
    ArgumentMismatch {
        /// The rendered method descriptor
        method: String,
        /// What did not match
        message: String,
    },

    /// The isolation context was disposed before or during the operation.
    #[error("Isolation context '{0}' has been disposed")]
    ContextDisposed(String),

    /// A lifecycle callback returned an error.
    #[error("Callback '{callback}' of module '{module}' failed: {message}")]
    CallbackFailed {
        /// The module whose callback failed
        module: String,
        /// The callback name
        callback: String,
        /// Failure reported by the callback
        message: String,
    },

    /// A module with this name is already registered.
    #[error("Module '{0}' is already registered")]
    DuplicateModule(String),

    /// A required dependency is missing or has an incompatible version.
    #[error("Module '{module}' requires {dependency}: {reason}")]
    DependencyNotSatisfied {
        /// The module declaring the dependency
        module: String,
        /// The rendered dependency declaration
        dependency: String,
        /// Why it is not satisfied
        reason: String,
    },

    /// Dependency graph error.
    ///
    /// Errors related to dependency graph analysis and module load ordering.
    #[error("{0}")]
    GraphError(String),
}

//! Unified error handling for graphforge
//!
//! Every failure in the engine is a [`ForgeError`]. Errors are grouped into
//! categories that drive the caller's decision:
//! - Unsupported: this backend cannot lower the operation sequence; a
//!   scheduler may assign the sequence to another backend and try again
//! - Internal: an upstream guarantee was broken; the compile or the
//!   in-flight `execute` must be abandoned
//! - User: the caller handed in something malformed (I/O buffers, options)
//! - Io: file or configuration loading failed

use std::fmt;

use crate::ir::{ModelIndex, OperandId, SubgraphIndex};

/// Unified error type for graphforge
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    // ========== Unsupported-configuration conditions ==========
    /// A backend does not implement this operation/attribute combination
    #[error("{backend} backend: {op} is not supported: {reason}")]
    Unsupported {
        backend: String,
        op: String,
        reason: String,
    },

    /// A value the backend needs at compile time is only known at run time
    #[error("{backend} backend: {op} requires operand {operand} to be constant")]
    NonConstantOperand {
        backend: String,
        op: String,
        operand: OperandId,
    },

    // ========== Internal-invariant violations ==========
    /// An upstream guarantee (rank, type, non-null data) does not hold
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// The graph failed structural validation
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// An operand id does not resolve to a live operand
    #[error("Operand not found: {0}")]
    OperandNotFound(OperandId),

    /// A backend tensor was requested before it was registered
    #[error("{backend} backend: no tensor bound for operand {operand}")]
    TensorNotBound { backend: String, operand: OperandId },

    /// A kernel failed while running
    #[error("Kernel failed: {0}")]
    KernelFailed(String),

    /// The same (model, subgraph) key was registered twice
    #[error("Executor already registered for model {model}, subgraph {subgraph}")]
    DuplicateExecutor {
        model: ModelIndex,
        subgraph: SubgraphIndex,
    },

    /// No executor registered for the key
    #[error("No executor for model {model}, subgraph {subgraph}")]
    ExecutorNotFound {
        model: ModelIndex,
        subgraph: SubgraphIndex,
    },

    /// Lock poisoned (a kernel panicked while holding a buffer)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),

    // ========== Caller errors ==========
    /// Malformed I/O description
    #[error("Invalid I/O description: {0}")]
    InvalidIo(String),

    /// A caller buffer does not match the operand's byte size
    #[error("{direction} {index}: expected {expected} bytes, got {actual}")]
    IoSizeMismatch {
        direction: &'static str,
        index: usize,
        expected: usize,
        actual: usize,
    },

    /// Backend id not known to the compiler
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// Invalid compiler or executor options
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== I/O Errors ==========
    /// File I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Options file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl ForgeError {
    /// Shorthand for a backend-qualified unsupported-configuration error.
    pub fn unsupported(backend: &str, op: &str, reason: impl Into<String>) -> Self {
        ForgeError::Unsupported {
            backend: backend.to_string(),
            op: op.to_string(),
            reason: reason.into(),
        }
    }

    /// Categorize the error for handling decisions.
    ///
    /// `NonConstantOperand` reports as `Unsupported` because the backend
    /// cannot express the operation as given, but unlike `Unsupported` it is
    /// not [recoverable](Self::is_recoverable): a reassignment does not make
    /// the operand constant.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ForgeError::Unsupported { .. } | ForgeError::NonConstantOperand { .. } => {
                ErrorCategory::Unsupported
            }

            ForgeError::InvariantViolation(_)
            | ForgeError::InvalidGraph(_)
            | ForgeError::OperandNotFound(_)
            | ForgeError::TensorNotBound { .. }
            | ForgeError::KernelFailed(_)
            | ForgeError::DuplicateExecutor { .. }
            | ForgeError::ExecutorNotFound { .. }
            | ForgeError::LockPoisoned(_) => ErrorCategory::Internal,

            ForgeError::InvalidIo(_)
            | ForgeError::IoSizeMismatch { .. }
            | ForgeError::UnknownBackend(_)
            | ForgeError::InvalidConfiguration(_) => ErrorCategory::User,

            ForgeError::IoError(_) | ForgeError::ConfigParse(_) => ErrorCategory::Io,
        }
    }

    /// True when another backend may still be able to compile the sequence.
    ///
    /// Nothing in the engine retries on its own; this only informs the
    /// scheduler that owns the fallback policy.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ForgeError::Unsupported { .. })
    }

    /// Check if this is a user-facing error (actionable by users)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug upstream)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Backend cannot handle this configuration (recoverable by fallback)
    Unsupported,
    /// Invariant violation - indicates a bug
    Internal,
    /// User error - invalid input or configuration
    User,
    /// File or config loading issue
    Io,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Unsupported => write!(f, "Unsupported"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Io => write!(f, "Io"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ForgeError::LockPoisoned(err.to_string())
    }
}

/// Helper type alias for Results using ForgeError
pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

/// Create an invariant-violation error with context
///
/// # Examples
/// ```ignore
/// return Err(invariant!("rank {} does not match buffer rank {}", a, b));
/// ```
#[macro_export]
macro_rules! invariant {
    ($msg:expr) => {
        $crate::error::ForgeError::InvariantViolation($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::InvariantViolation(format!($fmt, $($arg)*))
    };
}

/// Return an invariant violation unless the condition holds.
#[macro_export]
macro_rules! ensure_invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            return Err($crate::invariant!($($arg)+));
        }
    };
}

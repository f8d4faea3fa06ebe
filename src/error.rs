//! Error types for ratiosim.
//!
//! All errors are strongly typed using thiserror, split by the subsystem
//! that detects them: trace construction and evaluation, and sample storage
//! (in-memory collections as well as the chunked disk store).

use std::path::PathBuf;

use thiserror::Error;

use crate::value::DType;

/// Errors raised while building or evaluating a simulation trace.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        reason: String,
    },

    #[error("Missing simulation targets: {}", .missing.join(", "))]
    MissingTargets {
        missing: Vec<String>,
    },

    #[error("Site function for {names:?} returned {actual} values, expected {expected}")]
    ArityMismatch {
        names: Vec<String>,
        expected: usize,
        actual: usize,
    },

    #[error("Lazy value '{name}' belongs to a different trace")]
    ForeignLazyValue {
        name: String,
    },
}

impl TraceError {
    /// Creates an invalid-argument error.
    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

/// Errors raised by sample stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Inconsistent lengths in samples: {}", format_lengths(.lengths))]
    InconsistentLength {
        lengths: Vec<(String, usize)>,
    },

    #[error("Schema mismatch for '{variable}': {reason}")]
    SchemaMismatch {
        variable: String,
        reason: String,
    },

    #[error("New length {requested} is shorter than current store length {current}; pass allow_shrink to truncate")]
    ShrinkRejected {
        current: usize,
        requested: usize,
    },

    #[error("Variable '{variable}' has dtype {actual}, expected {expected}")]
    DtypeMismatch {
        variable: String,
        expected: DType,
        actual: DType,
    },

    #[error("Variable '{variable}' has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        variable: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Index {index} out of range for length {len}")]
    IndexOutOfRange {
        index: usize,
        len: usize,
    },

    #[error("Unknown variable: {name}")]
    UnknownVariable {
        name: String,
    },

    #[error("Sample batch is missing variable '{name}'")]
    MissingVariable {
        name: String,
    },

    #[error("Store is not initialized")]
    NotInitialized,

    #[error("Corrupted store file {path:?}: {reason}")]
    Corrupted {
        path: PathBuf,
        reason: String,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Lock error: {message}")]
    Lock {
        message: String,
    },
}

fn format_lengths(lengths: &[(String, usize)]) -> String {
    lengths
        .iter()
        .map(|(name, n)| format!("{name}={n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl StoreError {
    /// Creates a storage error from a message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

/// Top-level error type for ratiosim.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl SimError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a trace error.
    #[must_use]
    pub const fn is_trace(&self) -> bool {
        matches!(self, Self::Trace(_))
    }

    /// Returns true if this is a store error.
    #[must_use]
    pub const fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the requested targets were not produced.
    ///
    /// This aborts a single draw; callers may redraw.
    #[must_use]
    pub const fn is_missing_targets(&self) -> bool {
        matches!(self, Self::Trace(TraceError::MissingTargets { .. }))
    }

    /// Returns true for errors that should abort a run at startup
    /// (schema disagreement or a rejected shrink of a persisted store).
    #[must_use]
    pub const fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::SchemaMismatch { .. } | StoreError::ShrinkRejected { .. })
        )
    }
}

/// Result type alias for ratiosim operations.
pub type SimResult<T> = Result<T, SimError>;

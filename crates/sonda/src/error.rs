//! Result and error types for Sonda.

use thiserror::Error;

/// Result type for Sonda operations
pub type SondaResult<T> = Result<T, SondaError>;

/// Errors that can occur in Sonda
///
/// Every error is local to a single code unit: a failure instrumenting or
/// analyzing one unit never aborts processing of the others.
#[derive(Debug, Error)]
pub enum SondaError {
    /// Structurally invalid code unit; instrumentation or analysis aborts
    /// without emitting anything for this unit.
    #[error("malformed code unit '{unit}': {message}")]
    MalformedUnit {
        /// Name of the offending unit
        unit: String,
        /// What was wrong with it
        message: String,
    },

    /// Execution data does not correspond to the structural model being
    /// analyzed (stale instrumentation, wrong class bytes, truncated dump).
    #[error("execution data mismatch for '{unit}': {message}")]
    DataMismatch {
        /// Name of the offending unit
        unit: String,
        /// Which check failed
        message: String,
    },

    /// An instruction form the instrumenter does not know how to probe;
    /// the unit is left untouched, never partially instrumented.
    #[error("unsupported construct in '{unit}': {message}")]
    UnsupportedConstruct {
        /// Name of the offending unit
        unit: String,
        /// The construct that was encountered
        message: String,
    },

    /// A unit source had no unit under the requested name
    #[error("code unit not found: {name}")]
    UnitNotFound {
        /// Requested unit name
        name: String,
    },

    /// Underlying I/O failure while reading or writing unit bytes
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure encoding or decoding a serialized unit or execution store
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SondaError {
    /// Shorthand for a [`SondaError::MalformedUnit`]
    pub fn malformed(unit: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedUnit {
            unit: unit.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`SondaError::DataMismatch`]
    pub fn mismatch(unit: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DataMismatch {
            unit: unit.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`SondaError::UnsupportedConstruct`]
    pub fn unsupported(unit: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnsupportedConstruct {
            unit: unit.into(),
            message: message.into(),
        }
    }
}

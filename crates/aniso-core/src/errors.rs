//! Error types for the aniso engine.
//!
//! Two channels exist and must not be conflated:
//! - Host-side failures (`EngineError`) returned eagerly through `Result`.
//! - Device-side fatal conditions (`DeviceFault`) signalled through the
//!   sticky on-device flag and discovered only on readback.

use thiserror::Error;

/// Unified error type for host-side engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Device/memory allocation could not satisfy the requested sizes.
    /// No partial state is retained; the caller must not proceed.
    #[error("Allocation failure in {context}: {message}")]
    Allocation { context: String, message: String },

    /// GPU-related errors (CUDA init, PTX loading, kernel launch).
    #[error("GPU error in {context}: {message}")]
    Gpu { context: String, message: String },

    /// Configuration validation errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input validation errors (mismatched matrix sizes, bad boundary).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Lifecycle contract violations (evaluate before initialize,
    /// re-initialize without clear).
    #[error("State error: {0}")]
    State(String),

    /// I/O errors (PTX files, signature files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors (telemetry snapshots).
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Creates an allocation error with context.
    pub fn allocation(context: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Allocation {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Creates a GPU error with context.
    pub fn gpu(context: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Gpu {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        EngineError::Config(message.into())
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }

    /// Creates a lifecycle state error.
    pub fn state(message: impl Into<String>) -> Self {
        EngineError::State(message.into())
    }
}

/// Result type alias for aniso operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Fatal condition codes written by accelerator threads into the sticky
/// device flag. The accelerator never clears the flag; once set, the
/// step's extended-body contributions are invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeviceFault {
    /// Code 2: a per-pair orientation matrix was degenerate and could not
    /// be inverted. Reported, never retried.
    BadMatrixInversion,
    /// Reserved nonzero code this build does not know.
    Unknown(i32),
}

impl DeviceFault {
    /// Decodes the raw flag value. Zero means no fault.
    pub fn from_flag(raw: i32) -> Option<Self> {
        match raw {
            0 => None,
            2 => Some(DeviceFault::BadMatrixInversion),
            other => Some(DeviceFault::Unknown(other)),
        }
    }

    /// User-facing diagnostic for step-control logic.
    pub fn diagnostic(&self) -> String {
        match self {
            DeviceFault::BadMatrixInversion => {
                "unstable matrix inversion in force computation; \
                 extended-body results for this step are invalid"
                    .to_string()
            }
            DeviceFault::Unknown(code) => {
                format!("unknown device fault code {code}; results for this step are suspect")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let alloc = EngineError::allocation("pair tables", "out of device memory");
        assert!(matches!(alloc, EngineError::Allocation { .. }));

        let state = EngineError::state("compute() before initialize()");
        assert!(matches!(state, EngineError::State(_)));
    }

    #[test]
    fn test_fault_decode() {
        assert_eq!(DeviceFault::from_flag(0), None);
        assert_eq!(
            DeviceFault::from_flag(2),
            Some(DeviceFault::BadMatrixInversion)
        );
        assert_eq!(DeviceFault::from_flag(7), Some(DeviceFault::Unknown(7)));
    }

    #[test]
    fn test_fault_diagnostic_names_inversion() {
        let msg = DeviceFault::BadMatrixInversion.diagnostic();
        assert!(msg.contains("matrix inversion"));
    }
}

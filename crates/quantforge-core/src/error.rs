//! Error types for quantforge.
//!
//! Every fatal condition carries enough context for the operator to act on it;
//! [`QuantError::remediation`] turns an error into the concrete next step.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main error type for the quantforge library.
#[derive(Debug, Error)]
pub enum QuantError {
    // Configuration errors
    #[error("Unknown quantization type: {name}")]
    UnknownQuantType { name: String },

    #[error("Quantization type {quant} requires an importance matrix, but none was configured")]
    MissingImatrix { quant: String },

    #[error("Unsupported calibration file {path:?}: expected a .dat or .txt file")]
    UnsupportedCalibration { path: PathBuf },

    #[error("Invalid model path {path:?}: {message}")]
    InvalidModelPath { path: PathBuf, message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // Resource exhaustion
    #[error(
        "Not enough free disk space: need {:.2} GB, {:.2} GB available",
        *required as f64 * 1e-9,
        *available as f64 * 1e-9
    )]
    InsufficientDiskSpace { required: u64, available: u64 },

    #[error("No operator response within {0:?}")]
    RemediationTimedOut(std::time::Duration),

    // External processes
    #[error("Failed to start {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("{program} exited with status {}", status.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()))]
    ProcessFailure { program: String, status: Option<i32> },

    #[error("Operation cancelled")]
    Cancelled,

    // Registry errors
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Model registry returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Missing credential: {what}")]
    MissingCredential { what: String },

    // File system errors
    #[error("IO error while {context} at {path:?}: {source}")]
    Io {
        context: String,
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for quantforge operations.
pub type Result<T> = std::result::Result<T, QuantError>;

impl From<std::io::Error> for QuantError {
    fn from(err: std::io::Error) -> Self {
        QuantError::Io {
            context: "performing file operation".to_string(),
            path: None,
            source: err,
        }
    }
}

impl From<serde_json::Error> for QuantError {
    fn from(err: serde_json::Error) -> Self {
        QuantError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for QuantError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => QuantError::Upstream {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => QuantError::Network {
                message: err.to_string(),
            },
        }
    }
}

impl QuantError {
    /// Create an IO error with a description of what was being done and where.
    pub fn io(context: impl Into<String>, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        QuantError::Io {
            context: context.into(),
            path: Some(path.as_ref().to_path_buf()),
            source,
        }
    }

    /// Whether this error is a configuration problem that aborts the run immediately.
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            QuantError::UnknownQuantType { .. }
                | QuantError::MissingImatrix { .. }
                | QuantError::UnsupportedCalibration { .. }
                | QuantError::InvalidModelPath { .. }
                | QuantError::Config { .. }
        )
    }

    /// Whether this error means the host cannot fit the requested work.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            QuantError::InsufficientDiskSpace { .. } | QuantError::RemediationTimedOut(_)
        )
    }

    /// Whether a registry operation failing with this error should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            QuantError::Network { .. } => true,
            QuantError::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// The concrete step the operator should take to recover.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            QuantError::InsufficientDiskSpace { .. } => {
                Some("Free up disk space on the output volume or request fewer quantization types, then try again.")
            }
            QuantError::RemediationTimedOut(_) => {
                Some("Re-run interactively and choose quantization types to drop, or free up disk space first.")
            }
            QuantError::MissingImatrix { .. } => {
                Some("Provide a calibration file via `imatrix` (.txt to compute, .dat to reuse) or drop the IQ types.")
            }
            QuantError::UnsupportedCalibration { .. } => {
                Some("Point `imatrix` at a .txt calibration text or a precomputed .dat importance matrix.")
            }
            QuantError::UnknownQuantType { .. } => {
                Some("Check `gguf_types` against the supported llama.cpp quantization types.")
            }
            QuantError::MissingCredential { .. } => {
                Some("Set `hf_token` in the config or export HF_TOKEN.")
            }
            QuantError::Spawn { .. } => {
                Some("Build llama.cpp and check that `llama_cpp_dir` points at it.")
            }
            _ => None,
        }
    }
}

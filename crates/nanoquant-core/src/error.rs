//! Error types for compression operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for compression operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Compression error types.
///
/// The variants fall into four classes. Only configuration errors surface from
/// the public generation API; operator, stage and persistence errors are
/// absorbed at layer, stage or artifact granularity and reported.
#[derive(Debug, Error)]
pub enum Error {
    /// A compression level name that is not in the level table.
    #[error("unknown compression level: {name}")]
    UnknownLevel { name: String },

    /// A recipe that violates a parameter domain or has the wrong shape.
    #[error("invalid recipe: {0}")]
    InvalidRecipe(String),

    /// A numeric operator could not execute on a tensor.
    #[error("{operator} failed: {message}")]
    Operator {
        operator: &'static str,
        message: String,
    },

    /// Operator input or output does not have the expected shape.
    #[error("shape mismatch: expected {expected_rows}x{expected_cols}, got {actual_rows}x{actual_cols}")]
    ShapeMismatch {
        expected_rows: usize,
        expected_cols: usize,
        actual_rows: usize,
        actual_cols: usize,
    },

    /// Tensor contains NaN or infinite values.
    #[error("{operator}: tensor contains non-finite values")]
    NonFinite { operator: &'static str },

    /// Tensor has no elements.
    #[error("{operator}: empty tensor")]
    EmptyTensor { operator: &'static str },

    /// A whole dispatch stage could not be applied.
    #[error("{stage} stage failed: {message}")]
    Stage {
        stage: &'static str,
        message: String,
    },

    /// An artifact could not be written.
    #[error("failed to persist {path}: {message}")]
    Persistence { path: PathBuf, message: String },

    /// Model ingestion failed.
    #[error("ingestion failed: {0}")]
    Ingestion(String),

    /// Serving registration failed.
    #[error("registration failed: {0}")]
    Registration(String),

    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an unknown level error.
    pub fn unknown_level(name: impl Into<String>) -> Self {
        Error::UnknownLevel { name: name.into() }
    }

    /// Create an invalid recipe error.
    pub fn invalid_recipe(message: impl Into<String>) -> Self {
        Error::InvalidRecipe(message.into())
    }

    /// Create an operator failure.
    pub fn operator(operator: &'static str, message: impl Into<String>) -> Self {
        Error::Operator {
            operator,
            message: message.into(),
        }
    }

    /// Create a shape mismatch error.
    pub fn shape_mismatch(expected: (usize, usize), actual: (usize, usize)) -> Self {
        Error::ShapeMismatch {
            expected_rows: expected.0,
            expected_cols: expected.1,
            actual_rows: actual.0,
            actual_cols: actual.1,
        }
    }

    /// Create a stage failure.
    pub fn stage(stage: &'static str, message: impl Into<String>) -> Self {
        Error::Stage {
            stage,
            message: message.into(),
        }
    }

    /// Create a persistence failure.
    pub fn persistence(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::Persistence {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True for errors that must propagate to the caller of the public API.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::UnknownLevel { .. } | Error::InvalidRecipe(_))
    }

    /// True for errors raised by a numeric operator on a single tensor.
    pub fn is_operator_failure(&self) -> bool {
        matches!(
            self,
            Error::Operator { .. }
                | Error::ShapeMismatch { .. }
                | Error::NonFinite { .. }
                | Error::EmptyTensor { .. }
        )
    }

    /// Get error category for logs and reports.
    pub fn category(&self) -> &'static str {
        match self {
            Error::UnknownLevel { .. } => "unknown_level",
            Error::InvalidRecipe(_) => "invalid_recipe",
            Error::Operator { .. } => "operator_failure",
            Error::ShapeMismatch { .. } => "shape_mismatch",
            Error::NonFinite { .. } => "non_finite",
            Error::EmptyTensor { .. } => "empty_tensor",
            Error::Stage { .. } => "stage_failure",
            Error::Persistence { .. } => "persistence_failure",
            Error::Ingestion(_) => "ingestion",
            Error::Registration(_) => "registration",
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
        }
    }
}

//! Error types for bi-utils.
//!
//! This module defines all error types used throughout the crate, grouped by
//! the subsystem that raises them.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for bi-utils operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Warehouse Errors ===
    /// A warehouse (Redshift/PostgreSQL) operation failed.
    #[error("warehouse query failed: {0}")]
    Warehouse(#[from] sqlx::Error),

    /// The unload produced no files to download.
    #[error("unload produced no files under s3://{bucket}/{prefix}")]
    NoFiles {
        /// Bucket that was unloaded to.
        bucket: String,
        /// Key prefix that was unloaded to.
        prefix: String,
    },

    // === AWS Errors ===
    /// An S3 request failed.
    #[error("S3 {operation} failed for {key}: {message}")]
    ObjectStore {
        /// The S3 operation name.
        operation: &'static str,
        /// The object key involved.
        key: String,
        /// Description of what went wrong.
        message: String,
    },

    /// Fetching or decoding a secret failed.
    #[error("failed to load secret '{secret_id}': {message}")]
    Secret {
        /// Secret identifier.
        secret_id: String,
        /// Description of what went wrong.
        message: String,
    },

    /// AWS credentials could not be resolved.
    #[error("AWS credentials unavailable: {0}")]
    AwsCredentials(String),

    // === Local Query Errors ===
    /// The in-memory query engine failed.
    #[error("query engine error: {0}")]
    QueryEngine(#[from] rusqlite::Error),

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Data Errors ===
    /// The frame has no rows or no columns.
    #[error("the dataframe is empty")]
    EmptyFrame,

    /// A referenced column does not exist.
    #[error("column not found: {0}")]
    MissingColumn(String),

    /// Input sequences have different lengths.
    #[error("found input variables with inconsistent numbers of samples: {0:?}")]
    InconsistentLength(Vec<usize>),

    /// A value could not be converted to the requested type.
    #[error("cannot cast {value:?} to {dtype}")]
    Cast {
        /// Rendered source value.
        value: String,
        /// Target type name.
        dtype: String,
    },

    /// A parquet file could not be read or written.
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// An arrow array could not be built or converted.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// The file format is not supported for this operation.
    #[error("{0} file extension is not supported")]
    UnsupportedFormat(String),

    /// Data QA failed in strict mode.
    #[error("data qa failcount: {failcount}, force exit since in strict mode")]
    QaFailed {
        /// Number of failed checks.
        failcount: usize,
    },

    /// A transformer was used before `fit`.
    #[error("{0} is not fitted yet, call fit first")]
    NotFitted(&'static str),

    /// A query template referenced a missing parameter.
    #[error("missing query parameter: {0}")]
    MissingQueryParam(String),

    /// An argument was invalid.
    #[error("{message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    // === Export Queue Errors ===
    /// The export queue no longer accepts items.
    #[error("{0} is closed")]
    ExporterClosed(String),

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// CSV reading or writing failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for bi-utils operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create an S3 error for the given operation and key.
    #[must_use]
    pub fn object_store(
        operation: &'static str,
        key: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::ObjectStore {
            operation,
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Create a secret loading error.
    #[must_use]
    pub fn secret(secret_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Secret {
            secret_id: secret_id.into(),
            message: message.to_string(),
        }
    }

    /// Check if this error means an unload had nothing to download.
    #[must_use]
    pub fn is_no_files(&self) -> bool {
        matches!(self, Self::NoFiles { .. })
    }

    /// Check if this error came from S3 and is worth retrying.
    #[must_use]
    pub fn is_object_store(&self) -> bool {
        matches!(self, Self::ObjectStore { .. })
    }
}

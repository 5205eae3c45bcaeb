//! Error types for the CAN telemetry edge agent.
//!
//! Errors are grouped by subsystem (reader, batcher, uploader, config) and
//! rolled up into a single crate-wide [`Error`]. Only the kinds that are
//! documented as fatal in the error-handling design should ever propagate
//! out of the supervisor's main loop.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the agent.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// CAN reader error (bus open/receive failures).
    #[error("CAN reader error: {0}")]
    Reader(#[from] ReaderError),

    /// Batcher error (serialization, partition directory creation).
    #[error("batcher error: {0}")]
    Batch(#[from] BatchError),

    /// Uploader error (transport, S3 service errors, multipart failures).
    #[error("uploader error: {0}")]
    Upload(#[from] UploadError),

    /// Generic I/O error not already wrapped by a more specific variant.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown is in progress; the operation was abandoned cooperatively.
    #[error("shutdown in progress")]
    ShuttingDown,
}

/// Configuration-loading errors. Always fatal at startup (§7 *Config*).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read from disk.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The YAML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A required field was missing after normalization.
    #[error("missing required configuration field: {0}")]
    MissingField(String),
}

/// CAN reader errors.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// The OS/driver rejected opening the interface.
    #[error("failed to open CAN bus {channel} via {interface}: {source}")]
    BusOpen {
        /// Backend name (e.g. "socketcan").
        interface: String,
        /// Interface/channel name (e.g. "can0").
        channel: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A receive or other bus operation failed (triggers reconnect, not fatal).
    #[error("CAN bus operation failed: {0}")]
    BusOperation(String),

    /// The message-definition database could not be loaded for the simulator.
    #[error("failed to load message definition database {path}: {reason}")]
    DbcLoad {
        /// Path to the definition file.
        path: PathBuf,
        /// Human-readable reason.
        reason: String,
    },
}

/// Batcher (serialization) errors. Propagation is fatal per §4.2.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Could not create the Hive partition directory.
    #[error("failed to create partition directory {path}: {source}")]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Arrow/Parquet writer failed.
    #[error("parquet write failed: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Arrow record batch construction failed.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// The atomic rename from the temporary name to the final name failed.
    #[error("failed to rename {from} to {to}: {source}")]
    Rename {
        /// Temporary path.
        from: PathBuf,
        /// Final path.
        to: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Uploader errors. Only rename-after-success failures are fatal (§4.3).
#[derive(Debug, Error)]
pub enum UploadError {
    /// Network transport failure (connection refused/reset, DNS, TLS).
    #[error("transport error: {0}")]
    Transport(String),

    /// The object store returned a transient service error (5xx, throttling).
    #[error("transient service error ({code}): {message}")]
    Transient {
        /// Service-reported error code.
        code: String,
        /// Service-reported message.
        message: String,
    },

    /// The object store returned a non-retryable service error.
    #[error("service error ({code}): {message}")]
    Terminal {
        /// Service-reported error code.
        code: String,
        /// Service-reported message.
        message: String,
    },

    /// A multipart upload failed and was aborted server-side.
    #[error("multipart upload aborted after part failure: {0}")]
    MultipartAborted(String),

    /// Renaming a file into `archive_dir` or `pending_dir` failed. This is
    /// the one uploader failure mode that is fatal to the pipeline.
    #[error("failed to move {path} to {dest_dir}: {source}")]
    StateTransition {
        /// File being moved.
        path: PathBuf,
        /// Target directory (`archive_dir` or `pending_dir`).
        dest_dir: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The pending sidecar metadata file could not be read or written.
    #[error("sidecar metadata error for {path}: {source}")]
    Sidecar {
        /// File the sidecar belongs to.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

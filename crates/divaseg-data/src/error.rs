//! Error types for the divaseg-data crate.
//!
//! Configuration and data-integrity problems are reported at setup time, before
//! any training compute is spent. Nothing in here is retried: the same inputs
//! always produce the same failure.

use std::path::PathBuf;

use thiserror::Error;

/// Error type for analytics, indexing, dataset and data module operations.
#[derive(Error, Debug)]
pub enum DataError {
    /// Bad selection, infeasible batch/worker combination, degenerate class
    /// count or an inconsistent dataset layout.
    #[error("Invalid configuration: {reason}")]
    Configuration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// A class listed in the class encodings never occurs in the ground truth,
    /// so its inverse-frequency weight is undefined.
    #[error("Class {class_index} with color {color:?} never occurs in the ground truth")]
    DivideByZero {
        /// Index of the class in the class encodings.
        class_index: usize,
        /// Ground-truth color of the class.
        color: [u8; 3],
    },

    /// An operation was invoked in a lifecycle state that does not support it.
    #[error("Invalid state: {reason}")]
    State {
        /// Description of the violated precondition.
        reason: String,
    },

    /// Error when a linear index lies outside the dataset.
    #[error("Index {index} out of range for dataset of {len} crops")]
    IndexOutOfRange {
        /// The requested linear index.
        index: usize,
        /// Number of crops in the dataset.
        len: usize,
    },

    /// Error when a dataset directory is missing.
    #[error("Directory not found: {path}")]
    DirectoryNotFound {
        /// The expected directory.
        path: PathBuf,
    },

    /// Error when walking a dataset directory fails.
    #[error("Failed to read directory: {path}")]
    DirectoryReadFailed {
        /// The directory that failed to read.
        path: PathBuf,
        /// The underlying walk error.
        #[source]
        source: walkdir::Error,
    },

    /// Error when opening, decoding or probing an image file fails.
    #[error("Failed to open image: {path}")]
    ImageOpenFailed {
        /// The image file that failed to open.
        path: PathBuf,
        /// The underlying image error.
        #[source]
        source: image::ImageError,
    },

    /// Error when reading or writing a file fails.
    #[error("I/O error on {path}")]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Error when the analytics cache file cannot be (de)serialized.
    #[error("Malformed analytics cache: {path}")]
    CacheFormat {
        /// The cache file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Error when path components contain invalid UTF-8.
    #[error("Path contains invalid UTF-8: {path}")]
    InvalidUtf8Path {
        /// The path with invalid UTF-8.
        path: PathBuf,
    },
}

impl DataError {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn state(reason: impl Into<String>) -> Self {
        Self::State {
            reason: reason.into(),
        }
    }
}

/// A specialized `Result` type for data pipeline operations.
pub type DataResult<T> = Result<T, DataError>;

//! Error types for the divaseg-train crate.

use std::path::PathBuf;

use divaseg_data::DataError;
use thiserror::Error;

/// Error type for training-loop instrumentation.
#[derive(Error, Debug)]
pub enum TrainError {
    /// The backbone failed on an input of the data module's dimensions, or
    /// the header does not fit the backbone output.
    #[error("Shape mismatch in {part}: {reason}")]
    ShapeMismatch {
        /// The failing part of the model.
        part: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// Error raised by the data pipeline.
    #[error(transparent)]
    Data(#[from] DataError),

    /// Error when a model or tensor record cannot be written.
    #[error("Failed to write record: {path}")]
    Record {
        /// The record file.
        path: PathBuf,
        /// The underlying recorder error.
        #[source]
        source: burn::record::RecorderError,
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

    /// Error when tensor data cannot be converted to the requested element type.
    #[error("Tensor data conversion failed: {reason}")]
    TensorData {
        /// The reason reported by the tensor backend.
        reason: String,
    },

    /// Error when inputs disagree with each other.
    #[error("Invalid configuration: {reason}")]
    Configuration {
        /// The reason why the inputs are invalid.
        reason: String,
    },
}

impl TrainError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A specialized `Result` type for training-loop instrumentation.
pub type TrainResult<T> = Result<T, TrainError>;

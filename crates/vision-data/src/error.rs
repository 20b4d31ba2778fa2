use std::path::PathBuf;

use thiserror::Error;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, DataError>;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode image {}: {source}", .path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error("class folder {} is missing", .0.display())]
    MissingClassFolder(PathBuf),
    #[error("invalid sample archive {}: {reason}", .path.display())]
    InvalidArchive { path: PathBuf, reason: String },
    #[error(
        "requested {requested} samples from {} but only {available} are available",
        .path.display()
    )]
    SampleCountExceeded {
        path: PathBuf,
        requested: usize,
        available: usize,
    },
    #[error("unsupported number of bands {0} (expected 1 or 3)")]
    UnsupportedBands(usize),
    #[error("invalid loader configuration: {0}")]
    Config(String),
    #[error("data loader worker stopped unexpectedly")]
    WorkerDisconnected,
}

impl DataError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

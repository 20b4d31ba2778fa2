use std::path::PathBuf;

use thiserror::Error;
use vision_data::DataError;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("class-weight count mismatch: num_classes is {expected} but {found} class weight(s) were supplied")]
    ClassWeightMismatch { expected: usize, found: usize },
    #[error("unsupported task '{0}': the task should be either classification or segmentation")]
    UnsupportedTask(String),
    #[error(
        "the configuration specified {expected} classes, but {found} class folders were found in {}",
        .path.display()
    )]
    ClassCountMismatch {
        expected: usize,
        found: usize,
        path: PathBuf,
    },
    #[error("{split}: requested {requested} samples but only {available} are available")]
    SampleCountExceeded {
        split: String,
        requested: usize,
        available: usize,
    },
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("{0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_yaml::Error> for TrainingError {
    fn from(value: serde_yaml::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<csv::Error> for TrainingError {
    fn from(value: csv::Error) -> Self {
        TrainingError::runtime(format!("failed to write delimited file: {value}"))
    }
}

impl From<DataError> for TrainingError {
    fn from(value: DataError) -> Self {
        match value {
            DataError::SampleCountExceeded {
                path,
                requested,
                available,
            } => TrainingError::SampleCountExceeded {
                split: path.display().to_string(),
                requested,
                available,
            },
            other => TrainingError::runtime(other.to_string()),
        }
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

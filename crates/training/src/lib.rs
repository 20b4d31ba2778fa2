pub mod checkpoint;
pub mod config;
pub mod error;
pub mod hyperparams;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod progress;
pub mod scheduler;
pub mod storage;
pub mod task;
pub mod trainer;

pub use checkpoint::{CheckpointMetadata, CHECKPOINT_FILENAME, FINAL_CHECKPOINT_FILENAME};
pub use config::{ExperimentConfig, GlobalConfig, TrainingConfig};
pub use error::TrainingError;
pub use hyperparams::{DefaultHyperparameters, ResolvedHyperparameters, TrainingComponents};
pub use logging::{Logger, LoggingSettings};
pub use loss::{CrossEntropyLoss, LossMetrics, LossOutput};
pub use metrics::{AverageMeter, ClassificationReport, MetricsRecord};
pub use optimizer::{Adam, AdamConfig, OptimizerState};
pub use progress::{ProgressLog, PROGRESS_FILENAME};
pub use scheduler::{LRScheduler, StepLr};
pub use storage::{BucketSync, LocalBucket, RemoteStore};
pub use task::{ClassificationTask, SegmentationTask, TaskStrategy, CLASSES_FILENAME};
pub use trainer::{BestLossTracker, RunSummary, Trainer};

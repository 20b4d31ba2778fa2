use std::{
    fs,
    path::{Path, PathBuf},
};

use model::TaskKind;
use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Experiment description: a `global` group naming the task and data, and a
/// `training` group with the run's hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub global: GlobalConfig,
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub task: String,
    pub num_classes: usize,
    /// Local dataset root, or the object prefix when `bucket_name` is set.
    pub data_path: PathBuf,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub bucket_name: Option<String>,
    pub model_name: String,
    #[serde(default = "default_number_of_bands")]
    pub number_of_bands: usize,
    /// Directory holding filesystem buckets, one sub-directory per bucket name.
    #[serde(default)]
    pub bucket_root: Option<PathBuf>,
    /// Local staging area for downloaded data and run outputs in bucket mode.
    #[serde(default = "default_local_cache")]
    pub local_cache: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub num_epochs: usize,
    #[serde(default)]
    pub learning_rate: Option<f64>,
    #[serde(default)]
    pub weight_decay: Option<f64>,
    #[serde(default)]
    pub step_size: Option<usize>,
    #[serde(default)]
    pub gamma: Option<f64>,
    #[serde(default)]
    pub class_weights: Option<Vec<f32>>,
    #[serde(default)]
    pub ignore_index: Option<i64>,
    /// Local output directory, or the object prefix when a bucket is configured.
    pub output_path: PathBuf,
    /// Compute validation quality metrics every `batch_metrics` batches.
    #[serde(default)]
    pub batch_metrics: Option<usize>,
    #[serde(default)]
    pub num_trn_samples: Option<usize>,
    #[serde(default)]
    pub num_val_samples: Option<usize>,
    #[serde(default)]
    pub num_tst_samples: Option<usize>,
    #[serde(default, deserialize_with = "empty_path_as_none")]
    pub state_dict_path: Option<PathBuf>,
    #[serde(default)]
    pub dropout_prob: Option<f32>,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_log_stdout")]
    pub log_stdout: bool,
}

impl ExperimentConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: ExperimentConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn task(&self) -> Result<TaskKind, TrainingError> {
        TaskKind::from_name(&self.global.task)
            .map_err(|_| TrainingError::UnsupportedTask(self.global.task.clone()))
    }

    /// The configured bucket, treating a blank name as local mode.
    pub fn bucket_name(&self) -> Option<&str> {
        self.global
            .bucket_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
    }

    pub fn uses_bucket(&self) -> bool {
        self.bucket_name().is_some()
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        self.task()?;

        let mut errors = Vec::new();
        let global = &self.global;
        let training = &self.training;

        if global.num_classes == 0 {
            errors.push("global.num_classes must be greater than 0".to_string());
        }
        if global.model_name.trim().is_empty() {
            errors.push("global.model_name must not be empty".to_string());
        }
        if global.number_of_bands == 0 {
            errors.push("global.number_of_bands must be greater than 0".to_string());
        }
        if self.uses_bucket() && global.bucket_root.is_none() {
            errors.push(
                "global.bucket_root is required when global.bucket_name is set".to_string(),
            );
        }

        if training.batch_size == 0 {
            errors.push("training.batch_size must be greater than 0".to_string());
        }
        if training.num_epochs == 0 {
            errors.push("training.num_epochs must be greater than 0".to_string());
        }
        if let Some(lr) = training.learning_rate {
            if lr <= 0.0 {
                errors.push("training.learning_rate must be greater than 0".to_string());
            }
        }
        if let Some(wd) = training.weight_decay {
            if wd < 0.0 {
                errors.push("training.weight_decay must be >= 0".to_string());
            }
        }
        if let Some(gamma) = training.gamma {
            if gamma <= 0.0 {
                errors.push("training.gamma must be greater than 0".to_string());
            }
        }
        if let Some(weights) = training.class_weights.as_ref() {
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                errors.push("training.class_weights must be finite and >= 0".to_string());
            }
        }
        if training.batch_metrics == Some(0) {
            errors.push("training.batch_metrics must be greater than 0 when set".to_string());
        }
        if let Some(p) = training.dropout_prob {
            if !(0.0..1.0).contains(&p) {
                errors.push("training.dropout_prob must be in [0, 1)".to_string());
            }
        }
        if training.image_size == 0 {
            errors.push("training.image_size must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }

    /// Requested sample counts for `trn`, `val` and `tst`. `None` and `0` both
    /// select every sample in the archive.
    pub fn sample_counts(&self) -> [Option<usize>; 3] {
        [
            self.training.num_trn_samples,
            self.training.num_val_samples,
            self.training.num_tst_samples,
        ]
        .map(|count| count.filter(|&n| n > 0))
    }

    fn apply_base_path(&mut self, base: &Path) {
        // Bucket keys stay as they are; only local paths are resolved.
        if !self.uses_bucket() {
            absolutize_in_place(&mut self.global.data_path, base);
            absolutize_in_place(&mut self.training.output_path, base);
        }
        absolutize_in_place(&mut self.global.local_cache, base);
        for path in [
            self.global.bucket_root.as_mut(),
            self.training.state_dict_path.as_mut(),
            self.training.tensorboard_dir.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn empty_path_as_none<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from))
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|name| !name.trim().is_empty()))
}

fn default_number_of_bands() -> usize {
    3
}

fn default_local_cache() -> PathBuf {
    PathBuf::from("bucket_cache")
}

fn default_image_size() -> usize {
    299
}

fn default_num_workers() -> usize {
    4
}

fn default_seed() -> u64 {
    42
}

fn default_log_stdout() -> bool {
    true
}

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{Device, Tensor};
use hex::encode as hex_encode;
use model::Model;
use safetensors::SafeTensors;
use sha2::{Digest, Sha256};

use crate::{
    config::ExperimentConfig,
    optimizer::{Adam, OptimizerState, ParameterState},
    TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_FILENAME: &str = "checkpoint.pth.tar";
pub const FINAL_CHECKPOINT_FILENAME: &str = "last_epoch.pth.tar";

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";
const FIRST_MOMENT_SUFFIX: &str = ".m";
const SECOND_MOMENT_SUFFIX: &str = ".v";

/// Scalar fields stored in the safetensors header next to the tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMetadata {
    pub version: u32,
    pub epoch: usize,
    pub arch: String,
    pub best_loss: f64,
    pub optimizer_step: usize,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
}

impl CheckpointMetadata {
    fn to_header(&self) -> HashMap<String, String> {
        HashMap::from([
            ("version".to_string(), self.version.to_string()),
            ("epoch".to_string(), self.epoch.to_string()),
            ("arch".to_string(), self.arch.clone()),
            ("best_loss".to_string(), self.best_loss.to_string()),
            ("optimizer_step".to_string(), self.optimizer_step.to_string()),
            (
                "created_unix_timestamp".to_string(),
                self.created_unix_timestamp.to_string(),
            ),
            ("config_sha256".to_string(), self.config_sha256.clone()),
        ])
    }

    fn from_header(path: &Path, header: &HashMap<String, String>) -> Result<Self, TrainingError> {
        fn field<'a>(
            path: &Path,
            header: &'a HashMap<String, String>,
            key: &str,
        ) -> Result<&'a str, TrainingError> {
            header.get(key).map(String::as_str).ok_or_else(|| {
                TrainingError::runtime(format!(
                    "checkpoint {} is missing '{key}' metadata",
                    path.display()
                ))
            })
        }
        fn parse<T: std::str::FromStr>(
            path: &Path,
            header: &HashMap<String, String>,
            key: &str,
        ) -> Result<T, TrainingError> {
            field(path, header, key)?.parse().map_err(|_| {
                TrainingError::runtime(format!(
                    "checkpoint {} has malformed '{key}' metadata",
                    path.display()
                ))
            })
        }

        Ok(Self {
            version: parse(path, header, "version")?,
            epoch: parse(path, header, "epoch")?,
            arch: field(path, header, "arch")?.to_string(),
            best_loss: parse(path, header, "best_loss")?,
            optimizer_step: parse(path, header, "optimizer_step")?,
            created_unix_timestamp: parse(path, header, "created_unix_timestamp")?,
            config_sha256: field(path, header, "config_sha256")?.to_string(),
        })
    }
}

pub struct SaveRequest<'a> {
    pub path: &'a Path,
    pub config: &'a ExperimentConfig,
    pub model: &'a Model,
    pub optimizer: &'a Adam,
    pub epoch: usize,
    pub best_loss: f64,
}

pub struct LoadedCheckpoint {
    pub metadata: CheckpointMetadata,
    pub model_tensors: HashMap<String, Tensor>,
    pub optimizer_state: OptimizerState,
}

/// Writes model parameters, Adam moments and metadata to `request.path`,
/// replacing any previous file.
pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointMetadata, TrainingError> {
    if let Some(parent) = request.path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                parent.display()
            ))
        })?;
    }

    let named_parameters = request.model.parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }

    let optimizer_state = request.optimizer.state();
    let mut tensors: Vec<(String, Tensor)> = Vec::with_capacity(named_parameters.len() * 3);
    for (name, var) in named_parameters {
        tensors.push((format!("{MODEL_PREFIX}{name}"), var.as_tensor().clone()));
    }
    for param in &optimizer_state.parameters {
        tensors.push((
            format!("{OPTIMIZER_PREFIX}{}{FIRST_MOMENT_SUFFIX}", param.name),
            param.first_moment.clone(),
        ));
        tensors.push((
            format!("{OPTIMIZER_PREFIX}{}{SECOND_MOMENT_SUFFIX}", param.name),
            param.second_moment.clone(),
        ));
    }

    let metadata = CheckpointMetadata {
        version: CHECKPOINT_VERSION,
        epoch: request.epoch,
        arch: request.model.architecture().name().to_string(),
        best_loss: request.best_loss,
        optimizer_step: optimizer_state.step,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(request.config)?,
    };

    let tmp_path = temporary_path(request.path);
    safetensors::serialize_to_file(tensors, &Some(metadata.to_header()), &tmp_path).map_err(
        |err| {
            TrainingError::runtime(format!(
                "failed to serialize checkpoint to {}: {err}",
                tmp_path.display()
            ))
        },
    )?;
    fs::rename(&tmp_path, request.path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to move checkpoint into place at {}: {err}",
            request.path.display()
        ))
    })?;

    log::debug!(
        "wrote checkpoint {} (epoch {}, best loss {:.6})",
        request.path.display(),
        metadata.epoch,
        metadata.best_loss
    );
    Ok(metadata)
}

pub fn load_checkpoint(path: &Path, device: &Device) -> Result<LoadedCheckpoint, TrainingError> {
    let bytes = fs::read(path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read checkpoint {}: {err}",
            path.display()
        ))
    })?;
    let (_, header) = SafeTensors::read_metadata(&bytes).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to parse checkpoint header {}: {err}",
            path.display()
        ))
    })?;
    let header = header.metadata().clone().unwrap_or_default();
    let metadata = CheckpointMetadata::from_header(path, &header)?;
    ensure_version_supported(metadata.version)?;

    let tensors = candle_core::safetensors::load_buffer(&bytes, device)
        .map_err(|err| TrainingError::runtime(format!("failed to load checkpoint tensors: {err}")))?;

    let mut model_tensors = HashMap::new();
    let mut first_moments = HashMap::new();
    let mut second_moments = HashMap::new();
    for (key, tensor) in tensors {
        if let Some(name) = key.strip_prefix(MODEL_PREFIX) {
            model_tensors.insert(name.to_string(), tensor);
        } else if let Some(rest) = key.strip_prefix(OPTIMIZER_PREFIX) {
            if let Some(name) = rest.strip_suffix(FIRST_MOMENT_SUFFIX) {
                first_moments.insert(name.to_string(), tensor);
            } else if let Some(name) = rest.strip_suffix(SECOND_MOMENT_SUFFIX) {
                second_moments.insert(name.to_string(), tensor);
            }
        } else {
            log::warn!("ignoring unexpected checkpoint tensor '{key}'");
        }
    }

    let mut parameters = Vec::with_capacity(first_moments.len());
    for (name, first_moment) in first_moments {
        let second_moment = second_moments.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint optimizer state for '{name}' lacks a second moment"
            ))
        })?;
        parameters.push(ParameterState {
            name,
            first_moment,
            second_moment,
        });
    }
    parameters.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(LoadedCheckpoint {
        optimizer_state: OptimizerState {
            step: metadata.optimizer_step,
            parameters,
        },
        metadata,
        model_tensors,
    })
}

pub fn apply_model_weights(
    model: &Model,
    mut tensors: HashMap<String, Tensor>,
) -> Result<(), TrainingError> {
    for (name, var) in model.parameters() {
        let tensor = tensors.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::runtime(format!(
                "checkpoint parameter {name} has shape {:?} but the model expects {:?}",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor
                .to_dtype(desired_dtype)
                .map_err(candle_to_training_error)?
        };
        var.set(&tensor).map_err(candle_to_training_error)?;
    }

    if !tensors.is_empty() {
        let mut extra = tensors.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

/// Loads `path` into `model` and, when given, `optimizer`.
pub fn restore_checkpoint(
    path: &Path,
    model: &Model,
    optimizer: Option<&mut Adam>,
) -> Result<CheckpointMetadata, TrainingError> {
    let loaded = load_checkpoint(path, &model.config().device)?;
    let arch = model.architecture().name();
    if loaded.metadata.arch != arch {
        log::warn!(
            "checkpoint {} was written by architecture '{}' but the model is '{}'",
            path.display(),
            loaded.metadata.arch,
            arch
        );
    }
    apply_model_weights(model, loaded.model_tensors)?;
    if let Some(optimizer) = optimizer {
        optimizer.load_state(loaded.optimizer_state)?;
    }
    Ok(loaded.metadata)
}

fn fingerprint_config(config: &ExperimentConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version > CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "checkpoint version {} is newer than supported version {}",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn candle_to_training_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

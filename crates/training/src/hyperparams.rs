use std::path::Path;

use candle_core::Tensor;
use model::Model;

use crate::{
    checkpoint::{restore_checkpoint, CheckpointMetadata},
    config::TrainingConfig,
    error::to_runtime_error,
    loss::CrossEntropyLoss,
    optimizer::{Adam, AdamConfig},
    scheduler::StepLr,
    TrainingError,
};

/// Fallback values for every optional hyperparameter. Configuration values
/// override these field by field.
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultHyperparameters {
    pub class_weights: Option<&'static [f32]>,
    pub ignore_index: Option<i64>,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// `None` means "one step past the last epoch", so the rate never decays.
    pub step_size: Option<usize>,
    pub gamma: f64,
    pub betas: (f64, f64),
    pub epsilon: f64,
}

impl DefaultHyperparameters {
    pub const V1: Self = Self {
        class_weights: None,
        ignore_index: None,
        learning_rate: 1e-3,
        weight_decay: 0.0,
        step_size: None,
        gamma: 0.1,
        betas: (0.9, 0.999),
        epsilon: 1e-8,
    };

    pub const LATEST: Self = Self::V1;
}

impl Default for DefaultHyperparameters {
    fn default() -> Self {
        Self::LATEST
    }
}

/// Hyperparameters after defaults were applied and validated.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedHyperparameters {
    pub class_weights: Option<Vec<f32>>,
    pub ignore_index: Option<u32>,
    pub adam: AdamConfig,
    pub step_size: usize,
    pub gamma: f64,
}

/// Merges `training` over `defaults` without touching any tensors.
pub fn resolve_values(
    training: &TrainingConfig,
    num_classes: usize,
    defaults: &DefaultHyperparameters,
) -> Result<ResolvedHyperparameters, TrainingError> {
    let class_weights = training
        .class_weights
        .clone()
        .or_else(|| defaults.class_weights.map(<[f32]>::to_vec));
    if let Some(weights) = class_weights.as_ref() {
        if weights.len() != num_classes {
            return Err(TrainingError::ClassWeightMismatch {
                expected: num_classes,
                found: weights.len(),
            });
        }
    }

    let ignore_index = match training.ignore_index.or(defaults.ignore_index) {
        Some(value) => Some(u32::try_from(value).map_err(|_| {
            TrainingError::validation(vec![format!(
                "training.ignore_index must be a non-negative class id, got {value}"
            )])
        })?),
        None => None,
    };

    let step_size = match training.step_size.or(defaults.step_size) {
        Some(step) if step > 0 => step,
        other => {
            let fallback = training.num_epochs + 1;
            if other == Some(0) {
                log::warn!("training.step_size of 0 is not a valid step count; using {fallback}");
            }
            fallback
        }
    };

    let (beta1, beta2) = defaults.betas;
    Ok(ResolvedHyperparameters {
        class_weights,
        ignore_index,
        adam: AdamConfig {
            learning_rate: training.learning_rate.unwrap_or(defaults.learning_rate),
            beta1,
            beta2,
            epsilon: defaults.epsilon,
            weight_decay: training.weight_decay.unwrap_or(defaults.weight_decay),
        },
        step_size,
        gamma: training.gamma.unwrap_or(defaults.gamma),
    })
}

/// Everything the epoch loop needs to update a model.
pub struct TrainingComponents {
    pub model: Model,
    pub loss: CrossEntropyLoss,
    pub optimizer: Adam,
    pub scheduler: StepLr,
    pub hyperparameters: ResolvedHyperparameters,
    /// Metadata of the checkpoint training resumes from, if any.
    pub restored: Option<CheckpointMetadata>,
}

/// Builds the loss, optimizer and scheduler for `model`, restoring weights
/// and optimizer state from `state_dict_path` when one is given.
pub fn resolve(
    training: &TrainingConfig,
    num_classes: usize,
    model: Model,
    state_dict_path: Option<&Path>,
) -> Result<TrainingComponents, TrainingError> {
    let hyperparameters = resolve_values(training, num_classes, &DefaultHyperparameters::V1)?;

    let device = model.config().device.clone();
    let weight = match hyperparameters.class_weights.as_ref() {
        Some(weights) => Some(
            Tensor::from_slice(weights, weights.len(), &device).map_err(to_runtime_error)?,
        ),
        None => None,
    };
    let loss = CrossEntropyLoss::new()
        .with_weight(weight)?
        .with_ignore_index(hyperparameters.ignore_index);

    let mut optimizer = Adam::new(model.parameters(), hyperparameters.adam)?;
    let scheduler = StepLr::new(
        hyperparameters.adam.learning_rate,
        hyperparameters.step_size,
        hyperparameters.gamma,
    )?;

    let restored = match state_dict_path {
        Some(path) => {
            log::info!("restoring model and optimizer state from {}", path.display());
            Some(restore_checkpoint(path, &model, Some(&mut optimizer))?)
        }
        None => None,
    };

    Ok(TrainingComponents {
        model,
        loss,
        optimizer,
        scheduler,
        hyperparameters,
        restored,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentConfig;
    use model::{ModelConfig, TaskKind};

    fn training(extra: &str) -> TrainingConfig {
        let yaml = format!(
            "global:\n  task: classification\n  num_classes: 3\n  data_path: /data\n  model_name: simplecnn\n\
             training:\n  batch_size: 2\n  num_epochs: 5\n  output_path: /out\n{extra}"
        );
        let config: ExperimentConfig = serde_yaml::from_str(&yaml).unwrap();
        config.training
    }

    #[test]
    fn defaults_fill_every_unset_value() {
        let resolved = resolve_values(&training(""), 3, &DefaultHyperparameters::V1).unwrap();
        assert_eq!(resolved.class_weights, None);
        assert_eq!(resolved.ignore_index, None);
        assert_eq!(resolved.adam, AdamConfig::default());
        assert_eq!(resolved.step_size, 6);
        assert!((resolved.gamma - 0.1).abs() < 1e-12);
    }

    #[test]
    fn explicit_null_means_default() {
        let resolved = resolve_values(
            &training("  learning_rate: null\n  gamma: ~\n  step_size: null\n"),
            3,
            &DefaultHyperparameters::V1,
        )
        .unwrap();
        assert!((resolved.adam.learning_rate - 1e-3).abs() < 1e-12);
        assert_eq!(resolved.step_size, 6);
    }

    #[test]
    fn configured_values_override_defaults() {
        let resolved = resolve_values(
            &training(
                "  learning_rate: 0.01\n  weight_decay: 0.0001\n  step_size: 2\n  gamma: 0.5\n  ignore_index: 255\n  class_weights: [1.0, 2.0, 3.0]\n",
            ),
            3,
            &DefaultHyperparameters::V1,
        )
        .unwrap();
        assert!((resolved.adam.learning_rate - 0.01).abs() < 1e-12);
        assert!((resolved.adam.weight_decay - 1e-4).abs() < 1e-12);
        assert_eq!(resolved.step_size, 2);
        assert!((resolved.gamma - 0.5).abs() < 1e-12);
        assert_eq!(resolved.ignore_index, Some(255));
        assert_eq!(resolved.class_weights, Some(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn zero_step_size_falls_back_to_epoch_count() {
        let resolved =
            resolve_values(&training("  step_size: 0\n"), 3, &DefaultHyperparameters::V1).unwrap();
        assert_eq!(resolved.step_size, 6);
    }

    #[test]
    fn class_weight_mismatch_is_rejected_before_building_components() {
        let config = training("  class_weights: [1.0, 2.0]\n");
        let model = Model::new(ModelConfig::new("simplecnn", TaskKind::Classification, 3)).unwrap();

        let err = match resolve(&config, 3, model, None) {
            Err(err) => err,
            Ok(_) => panic!("mismatched class weights must fail"),
        };
        assert!(matches!(
            err,
            TrainingError::ClassWeightMismatch {
                expected: 3,
                found: 2
            }
        ));
        assert!(err.to_string().contains("class-weight count mismatch"));
    }

    #[test]
    fn negative_ignore_index_is_invalid() {
        let err = resolve_values(&training("  ignore_index: -1\n"), 3, &DefaultHyperparameters::V1)
            .unwrap_err();
        assert!(matches!(err, TrainingError::Validation(_)));
    }

    #[test]
    fn resolve_builds_weighted_loss_and_scheduler() {
        let config = training("  class_weights: [1.0, 1.0, 2.0]\n  step_size: 3\n");
        let model = Model::new(ModelConfig::new("simplecnn", TaskKind::Classification, 3)).unwrap();

        let components = resolve(&config, 3, model, None).unwrap();
        let weight = components.loss.weight().unwrap();
        assert_eq!(weight.to_vec1::<f32>().unwrap(), vec![1.0, 1.0, 2.0]);
        assert_eq!(components.scheduler.step_size(), 3);
        assert!(components.restored.is_none());
    }
}

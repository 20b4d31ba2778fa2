use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{error::to_runtime_error, TrainingError};

/// Class-weighted cross entropy over `(samples, classes)` logits with optional
/// ignore-index handling. The loss is the weighted mean over non-ignored samples.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    weight: Option<Tensor>,
    ignore_index: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LossMetrics {
    pub average_loss: f64,
    /// Samples (or pixels) that contributed to the loss.
    pub total: usize,
    pub correct: usize,
}

#[derive(Debug)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-class rescaling weights, shaped `(classes,)`.
    pub fn with_weight(mut self, weight: Option<Tensor>) -> Result<Self, TrainingError> {
        if let Some(weight) = weight.as_ref() {
            if weight.rank() != 1 {
                return Err(TrainingError::initialization(format!(
                    "class weights must be one-dimensional, got {:?}",
                    weight.dims()
                )));
            }
        }
        self.weight = match weight {
            Some(weight) => Some(weight.to_dtype(DType::F32).map_err(to_runtime_error)?),
            None => None,
        };
        Ok(self)
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<u32>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    pub fn weight(&self) -> Option<&Tensor> {
        self.weight.as_ref()
    }

    pub fn ignore_index(&self) -> Option<u32> {
        self.ignore_index
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let (count, classes) = logits.dims2().map_err(|_| {
            TrainingError::runtime(format!(
                "cross entropy expects (samples, classes) logits, got {:?}",
                logits.dims()
            ))
        })?;
        if targets.dims() != [count] {
            return Err(TrainingError::runtime(format!(
                "target tensor {:?} does not match {count} logit rows",
                targets.dims()
            )));
        }
        if count == 0 || classes == 0 {
            return Err(TrainingError::runtime(
                "no samples available for loss computation",
            ));
        }
        if let Some(weight) = self.weight.as_ref() {
            if weight.dims() != [classes] {
                return Err(TrainingError::runtime(format!(
                    "class weights {:?} do not match {classes} output classes",
                    weight.dims()
                )));
            }
        }

        let device = logits.device();
        let log_probs = ops::log_softmax(logits, D::Minus1).map_err(to_runtime_error)?;
        let targets = targets
            .to_device(device)
            .map_err(to_runtime_error)?
            .to_dtype(DType::U32)
            .map_err(to_runtime_error)?;

        // Ignored targets may lie outside [0, classes); point them at class 0
        // so gather/index_select stay in range, then mask them out.
        let (valid, safe_targets) = match self.ignore_index {
            Some(ignore_index) => {
                let keep = targets.ne(ignore_index).map_err(to_runtime_error)?;
                let zeros = targets.zeros_like().map_err(to_runtime_error)?;
                let safe = keep.where_cond(&targets, &zeros).map_err(to_runtime_error)?;
                let keep = keep.to_dtype(DType::F32).map_err(to_runtime_error)?;
                (keep, safe)
            }
            None => (
                Tensor::ones(count, DType::F32, device).map_err(to_runtime_error)?,
                targets.clone(),
            ),
        };

        let sample_weight = match self.weight.as_ref() {
            Some(weight) => weight
                .to_device(device)
                .map_err(to_runtime_error)?
                .index_select(&safe_targets, 0)
                .map_err(to_runtime_error)?
                .mul(&valid)
                .map_err(to_runtime_error)?,
            None => valid.clone(),
        };

        let picked = log_probs
            .gather(&safe_targets.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?;
        let weighted_nll = picked
            .mul(&sample_weight)
            .map_err(to_runtime_error)?
            .sum_all()
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?;

        let weight_sum = scalar(&sample_weight.sum_all().map_err(to_runtime_error)?)?;
        let loss = if weight_sum > 0.0 {
            weighted_nll
                .affine(1.0 / weight_sum, 0.0)
                .map_err(to_runtime_error)?
        } else {
            weighted_nll.affine(0.0, 0.0).map_err(to_runtime_error)?
        };

        let total = scalar(&valid.sum_all().map_err(to_runtime_error)?)?.round() as usize;
        let predictions = logits.argmax(D::Minus1).map_err(to_runtime_error)?;
        let hits = predictions
            .eq(&safe_targets)
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?
            .mul(&valid)
            .map_err(to_runtime_error)?;
        let correct = scalar(&hits.sum_all().map_err(to_runtime_error)?)?.round() as usize;

        let average_loss = scalar(&loss)?;
        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                total,
                correct,
            },
        })
    }
}

fn scalar(tensor: &Tensor) -> Result<f64, TrainingError> {
    let value = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok(value as f64)
}

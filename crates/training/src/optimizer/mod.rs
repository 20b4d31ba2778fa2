use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{error::to_runtime_error, TrainingError};

const EPS: f64 = 1e-12;

/// Adam hyperparameters. `weight_decay` is an L2 penalty folded into the gradient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

#[derive(Debug)]
pub struct Adam {
    config: AdamConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl Adam {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let first_moment =
                Tensor::zeros(tensor.dims(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(tensor.dims(), DType::F32, device).map_err(to_runtime_error)?;
            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Applies one update from `grads`. Parameters without a gradient are left untouched.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let cfg = self.config;
        let mut updates = Vec::new();
        for (idx, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                updates.push((idx, grad.to_dtype(DType::F32).map_err(to_runtime_error)?));
            }
        }
        if updates.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let step_size = cfg.learning_rate / bias_correction1.max(EPS);
        let v_scale = 1.0 / bias_correction2.max(EPS);

        for (idx, grad) in updates {
            let slot = &mut self.params[idx];
            let dtype = slot.param.as_tensor().dtype();
            let param = slot
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;

            let grad = if cfg.weight_decay != 0.0 {
                let penalty = param
                    .affine(cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?;
                grad.add(&penalty).map_err(to_runtime_error)?
            } else {
                grad
            };

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?
                .add(&grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?
                .add(
                    &grad
                        .sqr()
                        .map_err(to_runtime_error)?
                        .affine(1.0 - cfg.beta2, 0.0)
                        .map_err(to_runtime_error)?,
                )
                .map_err(to_runtime_error)?;

            let denom = new_v
                .affine(v_scale, 0.0)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = new_m
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(step_size, 0.0)
                .map_err(to_runtime_error)?;
            let next = param.sub(&update).map_err(to_runtime_error)?;
            let next = if dtype == DType::F32 {
                next
            } else {
                next.to_dtype(dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            step: self.step,
            parameters: self
                .params
                .iter()
                .map(|slot| ParameterState {
                    name: slot.name.clone(),
                    first_moment: slot.first_moment.clone(),
                    second_moment: slot.second_moment.clone(),
                })
                .collect(),
        }
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;
            let dims = slot.param.as_tensor().dims();
            if saved.first_moment.dims() != dims || saved.second_moment.dims() != dims {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let device = slot.param.as_tensor().device();
            slot.first_moment = saved
                .first_moment
                .to_dtype(DType::F32)
                .and_then(|t| t.to_device(device))
                .map_err(to_runtime_error)?;
            slot.second_moment = saved
                .second_moment
                .to_dtype(DType::F32)
                .and_then(|t| t.to_device(device))
                .map_err(to_runtime_error)?;
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        self.step = state.step;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone)]
pub struct ParameterState {
    pub name: String,
    pub first_moment: Tensor,
    pub second_moment: Tensor,
}

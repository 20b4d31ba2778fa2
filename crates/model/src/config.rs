use candle_core::{DType, Device, Error, Result};

use crate::block::{Architecture, TaskKind};

/// High-level configuration for assembling one of the vision networks.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub architecture: String,
    pub task: TaskKind,
    pub num_classes: usize,
    pub in_channels: usize,
    pub dropout_prob: Option<f32>,
    pub dtype: DType,
    pub device: Device,
}

impl ModelConfig {
    pub fn new(architecture: impl Into<String>, task: TaskKind, num_classes: usize) -> Self {
        Self {
            architecture: architecture.into(),
            task,
            num_classes,
            in_channels: 3,
            dropout_prob: None,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    /// Validate structural invariants and resolve the architecture entry.
    pub fn validate(&self) -> Result<Architecture> {
        if self.num_classes == 0 {
            return Err(Error::Msg("num_classes must be greater than zero".into()));
        }
        if self.in_channels == 0 {
            return Err(Error::Msg("in_channels must be greater than zero".into()));
        }
        if let Some(p) = self.dropout_prob {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg("dropout_prob must be in [0, 1)".into()));
            }
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "model parameters must use a floating dtype, got {:?}",
                self.dtype
            )));
        }
        let architecture = Architecture::from_name(&self.architecture)?;
        if architecture.task() != self.task {
            return Err(Error::Msg(format!(
                "architecture '{}' is a {} network but the task is {}",
                architecture.name(),
                architecture.task(),
                self.task
            )));
        }
        Ok(architecture)
    }
}

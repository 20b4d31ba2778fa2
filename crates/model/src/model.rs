use candle_core::{Error, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::{
    block::{build_network, Architecture, Network, TaskKind},
    config::ModelConfig,
};

/// A vision network together with the variables it was built from.
pub struct Model {
    config: ModelConfig,
    architecture: Architecture,
    network: Box<dyn Network>,
    varmap: VarMap,
    training: bool,
}

impl Model {
    /// Builds the network named by `config.architecture` with freshly initialised weights.
    pub fn new(config: ModelConfig) -> Result<Self> {
        let architecture = config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);
        let network = build_network(
            architecture,
            config.in_channels,
            config.num_classes,
            config.dropout_prob.unwrap_or(0.0),
            vb,
        )?;
        log::debug!(
            "built {} with {} parameter tensor(s) on {:?}",
            architecture.name(),
            varmap.all_vars().len(),
            config.device
        );

        Ok(Self {
            config,
            architecture,
            network,
            varmap,
            training: true,
        })
    }

    /// Returns the model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn task(&self) -> TaskKind {
        self.architecture.task()
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Trainable variables keyed by their dotted path, sorted by name.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        let data = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    /// Produces logits for a `(batch, channels, height, width)` image batch.
    ///
    /// Classification networks return `(batch, classes)`; segmentation networks
    /// return `(batch, classes, height, width)`.
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let dims = images.dims();
        if dims.len() != 4 {
            return Err(Error::Msg(format!(
                "model input expected [batch, channels, height, width] got {:?}",
                dims
            )));
        }
        if dims[1] != self.config.in_channels {
            return Err(Error::Msg(format!(
                "model expects {} input channel(s) but batch has {}",
                self.config.in_channels, dims[1]
            )));
        }
        self.network.forward(images, self.training)
    }
}

use std::{fmt, str::FromStr};

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;

use crate::error::{DataError, Result};

/// Dataset partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Split {
    Trn,
    Val,
    Tst,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Trn, Split::Val, Split::Tst];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Trn => "trn",
            Split::Val => "val",
            Split::Tst => "tst",
        }
    }

    /// Augmentation is only applied to the training partition.
    pub fn is_training(&self) -> bool {
        matches!(self, Split::Trn)
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = DataError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "trn" => Ok(Split::Trn),
            "val" => Ok(Split::Val),
            "tst" => Ok(Split::Tst),
            other => Err(DataError::Config(format!("unknown split '{other}'"))),
        }
    }
}

/// A single labelled example; tensors live on the CPU.
#[derive(Debug, Clone)]
pub enum Sample {
    /// `image` is `(channels, height, width)` f32, `label` the class index.
    Classification { image: Tensor, label: u32 },
    /// `sat_img` is `(channels, height, width)` f32, `map_img` is `(height, width)` u32.
    Segmentation { sat_img: Tensor, map_img: Tensor },
}

/// Collated samples. `labels` is `(batch,)` for classification and
/// `(batch, height, width)` for segmentation, always u32.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Tensor,
    pub index: usize,
    pub size: usize,
}

impl Batch {
    pub fn collate(samples: Vec<Sample>, index: usize) -> Result<Self> {
        let size = samples.len();
        if size == 0 {
            return Err(DataError::Config("cannot collate an empty batch".into()));
        }

        let mut inputs = Vec::with_capacity(size);
        let mut class_labels = Vec::new();
        let mut label_maps = Vec::new();
        for sample in samples {
            match sample {
                Sample::Classification { image, label } => {
                    inputs.push(image);
                    class_labels.push(label);
                }
                Sample::Segmentation { sat_img, map_img } => {
                    inputs.push(sat_img);
                    label_maps.push(map_img);
                }
            }
        }

        let labels = match (class_labels.is_empty(), label_maps.is_empty()) {
            (false, true) => Tensor::from_vec(class_labels, size, &Device::Cpu)?,
            (true, false) => Tensor::stack(&label_maps, 0)?,
            _ => {
                return Err(DataError::Config(
                    "batch mixes classification and segmentation samples".into(),
                ))
            }
        };
        let inputs = Tensor::stack(&inputs, 0)?;

        Ok(Self {
            inputs,
            labels,
            index,
            size,
        })
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            inputs: self.inputs.to_device(device)?,
            labels: self.labels.to_dtype(DType::U32)?.to_device(device)?,
            index: self.index,
            size: self.size,
        })
    }
}

/// Random-access collection of samples.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads sample `index`; `rng` drives any augmentation.
    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample>;
}

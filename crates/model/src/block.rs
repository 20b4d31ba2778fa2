use std::fmt;

use candle_core::{Error, Module, Result, Tensor, D};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Dropout, Linear, VarBuilder};

/// Kind of prediction a network produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// One label per image, logits shaped `(batch, classes)`.
    Classification,
    /// One label per pixel, logits shaped `(batch, classes, height, width)`.
    Segmentation,
}

impl TaskKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "classification" => Ok(Self::Classification),
            "segmentation" => Ok(Self::Segmentation),
            other => Err(Error::Msg(format!("unsupported task '{other}'"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classification => "classification",
            Self::Segmentation => "segmentation",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Architectures the factory knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    SimpleCnn,
    Fcn,
    UNetSmall,
}

impl Architecture {
    pub const ALL: [Architecture; 3] = [Self::SimpleCnn, Self::Fcn, Self::UNetSmall];

    pub fn from_name(name: &str) -> Result<Self> {
        let lowered = name.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|arch| arch.name() == lowered)
            .ok_or_else(|| {
                let known = Self::ALL.map(|arch| arch.name()).join(", ");
                Error::Msg(format!(
                    "unknown model architecture '{name}' (expected one of: {known})"
                ))
            })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SimpleCnn => "simplecnn",
            Self::Fcn => "fcn",
            Self::UNetSmall => "unetsmall",
        }
    }

    pub fn task(&self) -> TaskKind {
        match self {
            Self::SimpleCnn => TaskKind::Classification,
            Self::Fcn | Self::UNetSmall => TaskKind::Segmentation,
        }
    }
}

/// Forward pass shared by every architecture; `train` toggles dropout.
pub(crate) trait Network: Send + Sync {
    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor>;
}

pub(crate) fn build_network(
    architecture: Architecture,
    in_channels: usize,
    num_classes: usize,
    dropout_prob: f32,
    vb: VarBuilder,
) -> Result<Box<dyn Network>> {
    let network: Box<dyn Network> = match architecture {
        Architecture::SimpleCnn => Box::new(SimpleCnn::new(in_channels, num_classes, dropout_prob, vb)?),
        Architecture::Fcn => Box::new(Fcn::new(in_channels, num_classes, dropout_prob, vb)?),
        Architecture::UNetSmall => {
            Box::new(UNetSmall::new(in_channels, num_classes, dropout_prob, vb)?)
        }
    };
    Ok(network)
}

fn same_padding() -> Conv2dConfig {
    Conv2dConfig {
        padding: 1,
        ..Default::default()
    }
}

fn expect_rank4(xs: &Tensor, what: &str) -> Result<()> {
    if xs.rank() != 4 {
        return Err(Error::Msg(format!(
            "{what} expected [batch, channels, height, width] got {:?}",
            xs.dims()
        )));
    }
    Ok(())
}

/// Two 3x3 convolutions, each followed by ReLU.
#[derive(Debug)]
struct DoubleConv {
    first: Conv2d,
    second: Conv2d,
}

impl DoubleConv {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            first: conv2d(in_channels, out_channels, 3, same_padding(), vb.pp("conv1"))?,
            second: conv2d(out_channels, out_channels, 3, same_padding(), vb.pp("conv2"))?,
        })
    }
}

impl Module for DoubleConv {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.first)?.relu()?.apply(&self.second)?.relu()
    }
}

/// Small convolutional classifier: two conv/pool stages, global average pooling, linear head.
struct SimpleCnn {
    stage1: Conv2d,
    stage2: Conv2d,
    dropout: Dropout,
    head: Linear,
}

impl SimpleCnn {
    const HIDDEN: usize = 32;

    fn new(in_channels: usize, num_classes: usize, dropout_prob: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            stage1: conv2d(in_channels, 16, 3, same_padding(), vb.pp("stage1"))?,
            stage2: conv2d(16, Self::HIDDEN, 3, same_padding(), vb.pp("stage2"))?,
            dropout: Dropout::new(dropout_prob),
            head: linear(Self::HIDDEN, num_classes, vb.pp("head"))?,
        })
    }
}

impl Network for SimpleCnn {
    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        expect_rank4(xs, "simplecnn input")?;
        let (_, _, height, width) = xs.dims4()?;
        if height < 4 || width < 4 {
            return Err(Error::Msg(format!(
                "simplecnn requires images of at least 4x4 pixels, got {height}x{width}"
            )));
        }
        let hidden = xs
            .apply(&self.stage1)?
            .relu()?
            .max_pool2d(2)?
            .apply(&self.stage2)?
            .relu()?
            .max_pool2d(2)?;
        let pooled = hidden.mean(D::Minus1)?.mean(D::Minus1)?;
        let pooled = self.dropout.forward(&pooled, train)?;
        pooled.apply(&self.head)
    }
}

/// Fully convolutional segmenter that keeps the input resolution.
struct Fcn {
    body: DoubleConv,
    dropout: Dropout,
    classifier: Conv2d,
}

impl Fcn {
    fn new(in_channels: usize, num_classes: usize, dropout_prob: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            body: DoubleConv::new(in_channels, 16, vb.pp("body"))?,
            dropout: Dropout::new(dropout_prob),
            classifier: conv2d(16, num_classes, 1, Default::default(), vb.pp("classifier"))?,
        })
    }
}

impl Network for Fcn {
    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        expect_rank4(xs, "fcn input")?;
        let hidden = xs.apply(&self.body)?;
        let hidden = self.dropout.forward(&hidden, train)?;
        hidden.apply(&self.classifier)
    }
}

/// Two-level U-Net with a single skip connection.
struct UNetSmall {
    encoder1: DoubleConv,
    encoder2: DoubleConv,
    decoder: DoubleConv,
    dropout: Dropout,
    classifier: Conv2d,
}

impl UNetSmall {
    fn new(in_channels: usize, num_classes: usize, dropout_prob: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            encoder1: DoubleConv::new(in_channels, 16, vb.pp("encoder1"))?,
            encoder2: DoubleConv::new(16, 32, vb.pp("encoder2"))?,
            decoder: DoubleConv::new(48, 16, vb.pp("decoder"))?,
            dropout: Dropout::new(dropout_prob),
            classifier: conv2d(16, num_classes, 1, Default::default(), vb.pp("classifier"))?,
        })
    }
}

impl Network for UNetSmall {
    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        expect_rank4(xs, "unetsmall input")?;
        let (_, _, height, width) = xs.dims4()?;
        if height < 2 || width < 2 {
            return Err(Error::Msg(format!(
                "unetsmall requires inputs of at least 2x2 pixels, got {height}x{width}"
            )));
        }
        let skip = xs.apply(&self.encoder1)?;
        let bottom = skip.max_pool2d(2)?.apply(&self.encoder2)?;
        let bottom = self.dropout.forward(&bottom, train)?;
        let upsampled = bottom.upsample_nearest2d(height, width)?;
        let merged = Tensor::cat(&[&skip, &upsampled], 1)?;
        merged.apply(&self.decoder)?.apply(&self.classifier)
    }
}

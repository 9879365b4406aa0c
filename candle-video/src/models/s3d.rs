//! # S3D
//!
//! Separable 3D convolutional network for video classification. Every full 3D convolution of
//! an I3D network is replaced by a spatial `(1, k, k)` convolution followed by a temporal
//! `(k, 1, 1)` one.
//!
//! The parameter names follow the torchvision layout so converted checkpoints load as is.
//!
//! ## Paper
//!
//! ["Rethinking Spatiotemporal Feature Learning: Speed-Accuracy Trade-offs in Video Classification"](https://arxiv.org/abs/1712.04851)
//!
//! ## References
//!
//! - [PyTorch Implementation](https://github.com/pytorch/vision/blob/main/torchvision/models/video/s3d.py)

use candle::{Module, ModuleT, Result, Tensor};
use candle_nn::{Dropout, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::layers::{
    conv3d, conv3d_no_bias, AvgPool3d, Conv3d, Conv3dConfig, MaxPool3d, Norm, NormLayer,
};

/// Number of channels produced by the feature extractor.
pub const FEATURE_CHANNELS: usize = 1024;

/// Normalization used inside [`TemporalSeparableConv`]. It does not follow
/// [`Config::norm_layer`].
pub const SEPARABLE_NORM: NormLayer = NormLayer::BatchNorm {
    eps: 1e-3,
    momentum: 1e-3,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub num_classes: usize,
    pub dropout: f64,
    pub norm_layer: NormLayer,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_classes: 400,
            dropout: 0.2,
            norm_layer: NormLayer::default(),
        }
    }
}

impl Config {
    pub fn kinetics400() -> Self {
        Self::default()
    }
}

/// Convolution without bias, followed by a normalization layer and a ReLU.
#[derive(Debug)]
pub struct Conv3dNormActivation {
    conv: Conv3d,
    norm: Norm,
    span: tracing::Span,
}

impl Conv3dNormActivation {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize, usize),
        cfg: Conv3dConfig,
        norm_layer: &NormLayer,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = conv3d_no_bias(in_channels, out_channels, kernel_size, cfg, vb.pp(0))?;
        let norm = norm_layer.build(out_channels, vb.pp(1))?;
        let span = tracing::span!(tracing::Level::TRACE, "conv-norm-act");
        Ok(Self { conv, norm, span })
    }

    /// Pads every axis by `(k - 1) / 2`, which keeps the extents for odd kernels and unit
    /// strides.
    pub fn with_default_padding(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize, usize),
        stride: (usize, usize, usize),
        norm_layer: &NormLayer,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (kt, kh, kw) = kernel_size;
        let cfg = Conv3dConfig {
            padding: (
                kt.saturating_sub(1) / 2,
                kh.saturating_sub(1) / 2,
                kw.saturating_sub(1) / 2,
            ),
            stride,
        };
        Self::new(in_channels, out_channels, kernel_size, cfg, norm_layer, vb)
    }

    /// 1x1x1 convolution, only changes the number of channels.
    pub fn pointwise(
        in_channels: usize,
        out_channels: usize,
        norm_layer: &NormLayer,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::with_default_padding(
            in_channels,
            out_channels,
            (1, 1, 1),
            (1, 1, 1),
            norm_layer,
            vb,
        )
    }
}

impl ModuleT for Conv3dNormActivation {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        xs.apply(&self.conv)?.apply_t(&self.norm, train)?.relu()
    }
}

/// A `k x k x k` convolution factored into a spatial `(1, k, k)` convolution followed by a
/// temporal `(k, 1, 1)` one. The first pass does the channel expansion.
#[derive(Debug)]
pub struct TemporalSeparableConv {
    spatial: Conv3dNormActivation,
    temporal: Conv3dNormActivation,
}

impl TemporalSeparableConv {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let spatial_cfg = Conv3dConfig {
            padding: (0, padding, padding),
            stride: (1, stride, stride),
        };
        let spatial = Conv3dNormActivation::new(
            in_channels,
            out_channels,
            (1, kernel_size, kernel_size),
            spatial_cfg,
            &SEPARABLE_NORM,
            vb.pp(0),
        )?;
        let temporal_cfg = Conv3dConfig {
            padding: (padding, 0, 0),
            stride: (stride, 1, 1),
        };
        let temporal = Conv3dNormActivation::new(
            out_channels,
            out_channels,
            (kernel_size, 1, 1),
            temporal_cfg,
            &SEPARABLE_NORM,
            vb.pp(1),
        )?;
        Ok(Self { spatial, temporal })
    }
}

impl ModuleT for TemporalSeparableConv {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        xs.apply_t(&self.spatial, train)?
            .apply_t(&self.temporal, train)
    }
}

/// Output channels of the four branches of a [`SepInceptionBlock3d`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InceptionConfig {
    pub b0_out: usize,
    pub b1_mid: usize,
    pub b1_out: usize,
    pub b2_mid: usize,
    pub b2_out: usize,
    pub b3_out: usize,
}

impl InceptionConfig {
    pub const fn new(
        b0_out: usize,
        (b1_mid, b1_out): (usize, usize),
        (b2_mid, b2_out): (usize, usize),
        b3_out: usize,
    ) -> Self {
        Self {
            b0_out,
            b1_mid,
            b1_out,
            b2_mid,
            b2_out,
            b3_out,
        }
    }

    pub const fn out_channels(&self) -> usize {
        self.b0_out + self.b1_out + self.b2_out + self.b3_out
    }
}

/// The inception blocks of the feature extractor as `(in_channels, branches)`, in order.
#[rustfmt::skip]
pub const MIXED_BLOCKS: [(usize, InceptionConfig); 9] = [
    // mixed 3b, 3c
    (192, InceptionConfig::new(64, (96, 128), (16, 32), 32)),
    (256, InceptionConfig::new(128, (128, 192), (32, 96), 64)),
    // mixed 4b to 4f
    (480, InceptionConfig::new(192, (96, 208), (16, 48), 64)),
    (512, InceptionConfig::new(160, (112, 224), (24, 64), 64)),
    (512, InceptionConfig::new(128, (128, 256), (24, 64), 64)),
    (512, InceptionConfig::new(112, (144, 288), (32, 64), 64)),
    (528, InceptionConfig::new(256, (160, 320), (32, 128), 128)),
    // mixed 5b, 5c
    (832, InceptionConfig::new(256, (160, 320), (32, 128), 128)),
    (832, InceptionConfig::new(384, (192, 384), (48, 128), 128)),
];

/// Inception block whose 3x3x3 branches use separable convolutions.
///
/// All branches keep the time and spatial extents of the input so their outputs can be
/// concatenated along the channel axis, in branch order.
#[derive(Debug)]
pub struct SepInceptionBlock3d {
    branch0: Conv3dNormActivation,
    branch1: (Conv3dNormActivation, TemporalSeparableConv),
    branch2: (Conv3dNormActivation, TemporalSeparableConv),
    branch3: (MaxPool3d, Conv3dNormActivation),
    out_channels: usize,
    span: tracing::Span,
}

impl SepInceptionBlock3d {
    pub fn new(
        in_channels: usize,
        cfg: &InceptionConfig,
        norm_layer: &NormLayer,
        vb: VarBuilder,
    ) -> Result<Self> {
        let branch0 =
            Conv3dNormActivation::pointwise(in_channels, cfg.b0_out, norm_layer, vb.pp("branch0"))?;

        let vb1 = vb.pp("branch1");
        let branch1 = (
            Conv3dNormActivation::pointwise(in_channels, cfg.b1_mid, norm_layer, vb1.pp(0))?,
            TemporalSeparableConv::new(cfg.b1_mid, cfg.b1_out, 3, 1, 1, vb1.pp(1))?,
        );

        let vb2 = vb.pp("branch2");
        let branch2 = (
            Conv3dNormActivation::pointwise(in_channels, cfg.b2_mid, norm_layer, vb2.pp(0))?,
            TemporalSeparableConv::new(cfg.b2_mid, cfg.b2_out, 3, 1, 1, vb2.pp(1))?,
        );

        // Index 0 of branch3 is the parameter-free max pool.
        let branch3 = (
            MaxPool3d::new((3, 3, 3), (1, 1, 1), (1, 1, 1))?,
            Conv3dNormActivation::pointwise(
                in_channels,
                cfg.b3_out,
                norm_layer,
                vb.pp("branch3").pp(1),
            )?,
        );

        let span = tracing::span!(tracing::Level::TRACE, "sep-inception");
        Ok(Self {
            branch0,
            branch1,
            branch2,
            branch3,
            out_channels: cfg.out_channels(),
            span,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

impl ModuleT for SepInceptionBlock3d {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let x0 = xs.apply_t(&self.branch0, train)?;
        let x1 = xs
            .apply_t(&self.branch1.0, train)?
            .apply_t(&self.branch1.1, train)?;
        let x2 = xs
            .apply_t(&self.branch2.0, train)?
            .apply_t(&self.branch2.1, train)?;
        let x3 = xs
            .apply(&self.branch3.0)?
            .apply_t(&self.branch3.1, train)?;
        Tensor::cat(&[&x0, &x1, &x2, &x3], 1)
    }
}

/// One step of the feature extractor pipeline.
#[derive(Debug)]
pub enum Stage {
    SeparableConv(TemporalSeparableConv),
    ConvNormActivation(Conv3dNormActivation),
    MaxPool(MaxPool3d),
    Inception(SepInceptionBlock3d),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SeparableConv(_) => "separable-conv",
            Self::ConvNormActivation(_) => "conv-norm-act",
            Self::MaxPool(_) => "max-pool",
            Self::Inception(_) => "inception",
        }
    }
}

impl ModuleT for Stage {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::SeparableConv(m) => m.forward_t(xs, train),
            Self::ConvNormActivation(m) => m.forward_t(xs, train),
            Self::MaxPool(m) => m.forward(xs),
            Self::Inception(m) => m.forward_t(xs, train),
        }
    }
}

// Stem, then the inception stack with its three downsampling pools.
fn s3d_features(norm_layer: &NormLayer, vb: VarBuilder) -> Result<Vec<Stage>> {
    let mut stages = Vec::with_capacity(16);
    stages.push(Stage::SeparableConv(TemporalSeparableConv::new(
        3,
        64,
        7,
        2,
        3,
        vb.pp(0),
    )?));
    stages.push(Stage::MaxPool(MaxPool3d::new(
        (1, 3, 3),
        (1, 2, 2),
        (0, 1, 1),
    )?));
    stages.push(Stage::ConvNormActivation(Conv3dNormActivation::pointwise(
        64,
        64,
        norm_layer,
        vb.pp(2),
    )?));
    stages.push(Stage::SeparableConv(TemporalSeparableConv::new(
        64,
        192,
        3,
        1,
        1,
        vb.pp(3),
    )?));
    stages.push(Stage::MaxPool(MaxPool3d::new(
        (1, 3, 3),
        (1, 2, 2),
        (0, 1, 1),
    )?));

    let mut channels = 192;
    for (block_idx, (in_channels, branches)) in MIXED_BLOCKS.iter().enumerate() {
        match block_idx {
            2 => stages.push(Stage::MaxPool(MaxPool3d::new(
                (3, 3, 3),
                (2, 2, 2),
                (1, 1, 1),
            )?)),
            7 => stages.push(Stage::MaxPool(MaxPool3d::new(
                (2, 2, 2),
                (2, 2, 2),
                (0, 0, 0),
            )?)),
            _ => {}
        }
        if *in_channels != channels {
            candle::bail!(
                "s3d: inception block {block_idx} expects {in_channels} channels, got {channels}"
            )
        }
        let stage_idx = stages.len();
        let block = SepInceptionBlock3d::new(channels, branches, norm_layer, vb.pp(stage_idx))?;
        channels = block.out_channels();
        stages.push(Stage::Inception(block));
    }
    if channels != FEATURE_CHANNELS {
        candle::bail!("s3d: feature extractor ends with {channels} channels")
    }
    Ok(stages)
}

#[derive(Debug)]
pub struct S3d {
    features: Vec<Stage>,
    avgpool: AvgPool3d,
    dropout: Dropout,
    classifier: Conv3d,
    config: Config,
    span: tracing::Span,
}

impl S3d {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        if !(0. ..1.).contains(&cfg.dropout) {
            candle::bail!("s3d: dropout probability {} is not in [0, 1)", cfg.dropout)
        }
        if cfg.num_classes == 0 {
            candle::bail!("s3d: num_classes must be positive")
        }
        let features = s3d_features(&cfg.norm_layer, vb.pp("features"))?;
        let avgpool = AvgPool3d::new((2, 7, 7), (1, 1, 1))?;
        let dropout = Dropout::new(cfg.dropout as f32);
        let classifier = conv3d(
            FEATURE_CHANNELS,
            cfg.num_classes,
            (1, 1, 1),
            Conv3dConfig::default(),
            vb.pp("classifier").pp(1),
        )?;
        tracing::debug!(
            num_classes = cfg.num_classes,
            stages = features.len(),
            "built s3d"
        );
        let span = tracing::span!(tracing::Level::TRACE, "s3d");
        Ok(Self {
            features,
            avgpool,
            dropout,
            classifier,
            config: *cfg,
            span,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stages(&self) -> &[Stage] {
        &self.features
    }

    /// Inference-mode forward pass: `(b, 3, t, h, w)` clips to `(b, num_classes)` logits.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_t(xs, false)
    }

    /// Runs the stem and the inception stack, returning `(b, 1024, t, h, w)` features.
    pub fn forward_features(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (_, channels, _, _, _) = xs.dims5()?;
        if channels != 3 {
            candle::bail!("s3d: expected a (b, 3, t, h, w) clip, got {:?}", xs.shape())
        }
        let mut xs = xs.clone();
        for (idx, stage) in self.features.iter().enumerate() {
            xs = stage.forward_t(&xs, train).map_err(|err| {
                tracing::warn!(stage = idx, kind = stage.name(), "s3d stage failed: {err}");
                err
            })?;
            tracing::trace!(stage = idx, kind = stage.name(), shape = ?xs.shape());
        }
        Ok(xs)
    }
}

impl ModuleT for S3d {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = self.forward_features(xs, train)?;
        xs.apply(&self.avgpool)?
            .apply_t(&self.dropout, train)?
            .apply(&self.classifier)?
            .mean((2, 3, 4))
    }
}

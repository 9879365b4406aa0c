//! 3D convolution built on top of candle's 2D convolution.
//!
//! The kernel is split along its temporal axis. Each temporal tap is a regular 2D kernel that
//! gets applied to the frames it covers, and the per-tap results are summed.
use candle::{IndexOp, Module, Result, Tensor};
use candle_nn::{init, Init, VarBuilder};

use super::{output_extent, select_frames};

/// Padding and stride of a [`Conv3d`], given as `(time, height, width)`.
///
/// Height and width must match as candle's 2D kernels only support square spatial
/// parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv3dConfig {
    pub padding: (usize, usize, usize),
    pub stride: (usize, usize, usize),
}

impl Default for Conv3dConfig {
    fn default() -> Self {
        Self {
            padding: (0, 0, 0),
            stride: (1, 1, 1),
        }
    }
}

impl Conv3dConfig {
    fn validate(&self, kernel: (usize, usize, usize)) -> Result<()> {
        let (kt, kh, kw) = kernel;
        if kt == 0 || kh == 0 || kw == 0 {
            candle::bail!("conv3d: kernel {kernel:?} has an empty axis")
        }
        if kh != kw {
            candle::bail!("conv3d: only square spatial kernels are supported, got {kernel:?}")
        }
        let (st, sh, sw) = self.stride;
        if st == 0 || sh == 0 || sw == 0 {
            candle::bail!("conv3d: stride {:?} must be positive", self.stride)
        }
        if sh != sw {
            candle::bail!("conv3d: only square spatial strides are supported, got {:?}", self.stride)
        }
        if self.padding.1 != self.padding.2 {
            candle::bail!(
                "conv3d: only square spatial padding is supported, got {:?}",
                self.padding
            )
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Conv3d {
    weight: Tensor,
    bias: Option<Tensor>,
    // One (out, in, kh, kw) kernel per temporal tap.
    taps: Vec<Tensor>,
    config: Conv3dConfig,
    span: tracing::Span,
}

impl Conv3d {
    pub fn new(weight: Tensor, bias: Option<Tensor>, config: Conv3dConfig) -> Result<Self> {
        let (out_channels, _, kt, kh, kw) = weight.dims5()?;
        config.validate((kt, kh, kw))?;
        if let Some(bias) = &bias {
            if bias.dims() != [out_channels] {
                candle::bail!(
                    "conv3d: unexpected bias shape {:?}, expected [{out_channels}]",
                    bias.shape()
                )
            }
        }
        let taps = (0..kt)
            .map(|dt| weight.i((.., .., dt, .., ..))?.contiguous())
            .collect::<Result<Vec<_>>>()?;
        let span = tracing::span!(tracing::Level::TRACE, "conv3d");
        Ok(Self {
            weight,
            bias,
            taps,
            config,
            span,
        })
    }

    pub fn config(&self) -> &Conv3dConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Kernel size as `(time, height, width)`.
    pub fn kernel_size(&self) -> (usize, usize, usize) {
        let dims = self.weight.dims();
        (dims[2], dims[3], dims[4])
    }
}

impl Module for Conv3d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_size, c_in, t, h, w) = xs.dims5()?;
        let (c_out, w_in, kt, k, _) = self.weight.dims5()?;
        if c_in != w_in {
            candle::bail!(
                "conv3d: input has {c_in} channels but the kernel expects {w_in} ({:?})",
                xs.shape()
            )
        }
        let (pt, p, _) = self.config.padding;
        let (st, s, _) = self.config.stride;
        let t_out = output_extent("conv3d", "time", t, kt, st, pt)?;
        let h_out = output_extent("conv3d", "height", h, k, s, p)?;
        let w_out = output_extent("conv3d", "width", w, k, s, p)?;

        let xs = xs.pad_with_zeros(2, pt, pt)?;
        // (b, t, c, h, w) so that frames can be folded into the batch axis.
        let xs = xs.transpose(1, 2)?.contiguous()?;
        let mut ys: Option<Tensor> = None;
        for (dt, tap) in self.taps.iter().enumerate() {
            let frames = select_frames(&xs, 1, dt, st, t_out)?
                .reshape((b_size * t_out, c_in, h, w))?;
            let tap_ys = frames.conv2d(tap, p, s, 1, 1)?;
            ys = Some(match ys {
                None => tap_ys,
                Some(ys) => (ys + tap_ys)?,
            });
        }
        let ys = match ys {
            Some(ys) => ys,
            None => candle::bail!("conv3d: kernel without temporal taps"),
        };
        let ys = ys
            .reshape((b_size, t_out, c_out, h_out, w_out))?
            .transpose(1, 2)?
            .contiguous()?;
        match &self.bias {
            None => Ok(ys),
            Some(bias) => ys.broadcast_add(&bias.reshape((1, c_out, 1, 1, 1))?),
        }
    }
}

pub fn conv3d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: (usize, usize, usize),
    cfg: Conv3dConfig,
    vb: VarBuilder,
) -> Result<Conv3d> {
    let (kt, kh, kw) = kernel_size;
    let ws = vb.get_with_hints(
        (out_channels, in_channels, kt, kh, kw),
        "weight",
        init::DEFAULT_KAIMING_NORMAL,
    )?;
    let bound = 1. / ((in_channels * kt * kh * kw) as f64).sqrt();
    let init_bs = Init::Uniform {
        lo: -bound,
        up: bound,
    };
    let bs = vb.get_with_hints(out_channels, "bias", init_bs)?;
    Conv3d::new(ws, Some(bs), cfg)
}

pub fn conv3d_no_bias(
    in_channels: usize,
    out_channels: usize,
    kernel_size: (usize, usize, usize),
    cfg: Conv3dConfig,
    vb: VarBuilder,
) -> Result<Conv3d> {
    let (kt, kh, kw) = kernel_size;
    let ws = vb.get_with_hints(
        (out_channels, in_channels, kt, kh, kw),
        "weight",
        init::DEFAULT_KAIMING_NORMAL,
    )?;
    Conv3d::new(ws, None, cfg)
}

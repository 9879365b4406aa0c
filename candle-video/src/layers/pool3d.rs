//! 3D pooling layers.
//!
//! Max and average windows factor over the axes: the spatial part is computed on every frame
//! with candle's 2D pooling, then the temporal part reduces neighbouring frames.
use candle::{Module, Result, Tensor};

use super::{output_extent, pad_with_value, select_frames};

fn check_window(
    op: &str,
    kernel: (usize, usize, usize),
    stride: (usize, usize, usize),
    padding: (usize, usize, usize),
) -> Result<()> {
    let kernel_axes = [kernel.0, kernel.1, kernel.2];
    let stride_axes = [stride.0, stride.1, stride.2];
    let padding_axes = [padding.0, padding.1, padding.2];
    if kernel_axes.contains(&0) || stride_axes.contains(&0) {
        candle::bail!("{op}: kernel {kernel:?} and stride {stride:?} must be positive")
    }
    for (k, p) in kernel_axes.iter().zip(padding_axes.iter()) {
        if 2 * p > *k {
            candle::bail!("{op}: padding {padding:?} must be at most half of the kernel {kernel:?}")
        }
    }
    Ok(())
}

// Runs a 2D pooling function on every frame of a (b, c, t, h, w) tensor.
fn pool_frames<F>(xs: &Tensor, h_out: usize, w_out: usize, f: F) -> Result<Tensor>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    let (b_size, c, t, h, w) = xs.dims5()?;
    let frames = xs.transpose(1, 2)?.reshape((b_size * t, c, h, w))?;
    f(&frames)?
        .reshape((b_size, t, c, h_out, w_out))?
        .transpose(1, 2)?
        .contiguous()
}

/// Max pooling over `(time, height, width)` windows. Padded positions never win the max.
#[derive(Clone, Debug)]
pub struct MaxPool3d {
    kernel: (usize, usize, usize),
    stride: (usize, usize, usize),
    padding: (usize, usize, usize),
    span: tracing::Span,
}

impl MaxPool3d {
    pub fn new(
        kernel: (usize, usize, usize),
        stride: (usize, usize, usize),
        padding: (usize, usize, usize),
    ) -> Result<Self> {
        check_window("max_pool3d", kernel, stride, padding)?;
        let span = tracing::span!(tracing::Level::TRACE, "max-pool3d");
        Ok(Self {
            kernel,
            stride,
            padding,
            span,
        })
    }

    pub fn kernel_size(&self) -> (usize, usize, usize) {
        self.kernel
    }
}

impl Module for MaxPool3d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_, _, t, h, w) = xs.dims5()?;
        let (kt, kh, kw) = self.kernel;
        let (st, sh, sw) = self.stride;
        let (pt, ph, pw) = self.padding;
        let t_out = output_extent("max_pool3d", "time", t, kt, st, pt)?;
        let h_out = output_extent("max_pool3d", "height", h, kh, sh, ph)?;
        let w_out = output_extent("max_pool3d", "width", w, kw, sw, pw)?;

        let xs = if kh > 1 || kw > 1 || sh > 1 || sw > 1 {
            pool_frames(xs, h_out, w_out, |frames| {
                let frames = pad_with_value(frames, 2, ph, f32::NEG_INFINITY)?;
                let frames = pad_with_value(&frames, 3, pw, f32::NEG_INFINITY)?;
                frames.max_pool2d_with_stride((kh, kw), (sh, sw))
            })?
        } else {
            xs.clone()
        };
        if kt == 1 && st == 1 {
            return Ok(xs);
        }
        let xs = pad_with_value(&xs, 2, pt, f32::NEG_INFINITY)?;
        let mut ys = select_frames(&xs, 2, 0, st, t_out)?;
        for dt in 1..kt {
            ys = ys.maximum(&select_frames(&xs, 2, dt, st, t_out)?)?;
        }
        Ok(ys)
    }
}

/// Average pooling over `(time, height, width)` windows, without padding.
#[derive(Clone, Debug)]
pub struct AvgPool3d {
    kernel: (usize, usize, usize),
    stride: (usize, usize, usize),
    span: tracing::Span,
}

impl AvgPool3d {
    pub fn new(kernel: (usize, usize, usize), stride: (usize, usize, usize)) -> Result<Self> {
        check_window("avg_pool3d", kernel, stride, (0, 0, 0))?;
        let span = tracing::span!(tracing::Level::TRACE, "avg-pool3d");
        Ok(Self {
            kernel,
            stride,
            span,
        })
    }

    pub fn kernel_size(&self) -> (usize, usize, usize) {
        self.kernel
    }
}

impl Module for AvgPool3d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_, _, t, h, w) = xs.dims5()?;
        let (kt, kh, kw) = self.kernel;
        let (st, sh, sw) = self.stride;
        let t_out = output_extent("avg_pool3d", "time", t, kt, st, 0)?;
        let h_out = output_extent("avg_pool3d", "height", h, kh, sh, 0)?;
        let w_out = output_extent("avg_pool3d", "width", w, kw, sw, 0)?;

        let xs = if kh > 1 || kw > 1 || sh > 1 || sw > 1 {
            pool_frames(xs, h_out, w_out, |frames| {
                frames.avg_pool2d_with_stride((kh, kw), (sh, sw))
            })?
        } else {
            xs.clone()
        };
        if kt == 1 && st == 1 {
            return Ok(xs);
        }
        let mut ys = select_frames(&xs, 2, 0, st, t_out)?;
        for dt in 1..kt {
            ys = (ys + select_frames(&xs, 2, dt, st, t_out)?)?;
        }
        ys / kt as f64
    }
}

//! 3D building blocks missing from `candle-nn`.
//!
//! Every layer works on 5D tensors laid out as `(batch, channels, time, height, width)`.
//! Spatial work is delegated to candle's 2D kernels by folding the time axis into the
//! batch axis, the temporal part is then reduced frame by frame.
use candle::{Result, Tensor};

mod conv3d;
mod norm;
mod pool3d;

pub use conv3d::{conv3d, conv3d_no_bias, Conv3d, Conv3dConfig};
pub use norm::{Norm, NormLayer};
pub use pool3d::{AvgPool3d, MaxPool3d};

/// Output size of a convolution or pooling window along one axis.
///
/// Returns an error when the padded input is smaller than the kernel, in which case the
/// output extent would not be positive.
pub fn output_extent(
    op: &str,
    axis: &str,
    size: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Result<usize> {
    if size == 0 {
        candle::bail!("{op}: empty {axis} axis")
    }
    if stride == 0 {
        candle::bail!("{op}: {axis} stride must be positive")
    }
    let padded = size + 2 * padding;
    if padded < kernel {
        candle::bail!(
            "{op}: {axis} extent {size} (padding {padding}) is smaller than the kernel {kernel}"
        )
    }
    Ok((padded - kernel) / stride + 1)
}

// Picks `len` slices along `dim`, starting at `start` and stepping by `stride`.
pub(crate) fn select_frames(
    xs: &Tensor,
    dim: usize,
    start: usize,
    stride: usize,
    len: usize,
) -> Result<Tensor> {
    if stride == 1 {
        return xs.narrow(dim, start, len);
    }
    let indexes: Vec<u32> = (0..len).map(|i| (start + i * stride) as u32).collect();
    let indexes = Tensor::new(indexes.as_slice(), xs.device())?;
    // index-select only accepts contiguous inputs.
    xs.contiguous()?.index_select(&indexes, dim)
}

// Pads both sides of `dim` with a constant value.
pub(crate) fn pad_with_value(xs: &Tensor, dim: usize, pad: usize, value: f32) -> Result<Tensor> {
    if pad == 0 {
        return Ok(xs.clone());
    }
    let mut dims = xs.dims().to_vec();
    dims[dim] = pad;
    let side = Tensor::full(value, dims, xs.device())?.to_dtype(xs.dtype())?;
    Tensor::cat(&[&side, xs, &side], dim)
}

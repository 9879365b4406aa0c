//! Turning a directory of decoded frames into a model input.
use std::path::{Path, PathBuf};

use candle::{DType, Device, Result, Tensor};
use candle_video::pretrained::VideoTransform;

const FRAME_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Image files of a directory, sorted by name.
pub fn list_frames<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    for entry in std::fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        let is_frame = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_frame {
            frames.push(path)
        }
    }
    frames.sort();
    Ok(frames)
}

/// Loads one frame as a `(3, crop_h, crop_w)` tensor: resized, center cropped, then
/// normalized with the transform mean and std.
pub fn load_frame<P: AsRef<Path>>(p: P, transform: &VideoTransform) -> Result<Tensor> {
    let (resize_h, resize_w) = transform.resize_size;
    let (crop_h, crop_w) = transform.crop_size;
    if crop_h > resize_h || crop_w > resize_w {
        candle::bail!("crop {crop_h}x{crop_w} is larger than the resized frame {resize_h}x{resize_w}")
    }
    let img = image::ImageReader::open(p)?
        .decode()
        .map_err(candle::Error::wrap)?
        .resize_exact(
            resize_w as u32,
            resize_h as u32,
            image::imageops::FilterType::Triangle,
        );
    let top = (resize_h - crop_h) / 2;
    let left = (resize_w - crop_w) / 2;
    let img = img.crop_imm(left as u32, top as u32, crop_w as u32, crop_h as u32);
    let data = img.to_rgb8().into_raw();
    let data = Tensor::from_vec(data, (crop_h, crop_w, 3), &Device::Cpu)?.permute((2, 0, 1))?;
    let mean = Tensor::new(&transform.mean, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&transform.std, &Device::Cpu)?.reshape((3, 1, 1))?;
    (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)
}

/// Builds a `(3, num_frames, crop_h, crop_w)` clip. Short videos are looped.
pub fn load_clip(
    frames: &[PathBuf],
    num_frames: usize,
    transform: &VideoTransform,
) -> Result<Tensor> {
    if frames.is_empty() || num_frames == 0 {
        candle::bail!("cannot build a {num_frames} frames clip from {} files", frames.len())
    }
    let decoded = frames
        .iter()
        .take(num_frames)
        .map(|p| load_frame(p, transform))
        .collect::<Result<Vec<_>>>()?;
    let clip: Vec<&Tensor> = (0..num_frames)
        .map(|i| &decoded[i % decoded.len()])
        .collect();
    Tensor::stack(&clip, 1)
}

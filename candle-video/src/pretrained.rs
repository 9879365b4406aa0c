//! Metadata of the published S3D weights.
use std::path::Path;

use candle::Result;

/// Preprocessing recipe the weights were trained with. Frames are resized, center cropped,
/// scaled to `[0, 1]` and normalized per channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoTransform {
    pub resize_size: (usize, usize),
    pub crop_size: (usize, usize),
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct S3dWeights {
    pub url: &'static str,
    pub num_classes: usize,
    /// Smallest `(height, width)` the network accepts.
    pub min_size: (usize, usize),
    pub min_temporal_size: usize,
    pub transforms: VideoTransform,
}

impl S3dWeights {
    /// Kinetics-400 weights, ported from Min and Corso (2019).
    pub const KINETICS400_V1: Self = Self {
        url: "https://download.pytorch.org/models/s3d.pt",
        num_classes: 400,
        min_size: (224, 224),
        min_temporal_size: 64,
        transforms: VideoTransform {
            resize_size: (256, 256),
            crop_size: (224, 224),
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
        },
    };

    pub const DEFAULT: Self = Self::KINETICS400_V1;

    /// File name of the checkpoint, the last segment of the download url.
    pub fn filename(&self) -> &'static str {
        self.url.rsplit('/').next().unwrap_or(self.url)
    }

    /// Checks a `(b, 3, t, h, w)` input shape against the documented minimum sizes.
    pub fn check_input(&self, dims: &[usize]) -> Result<()> {
        let (t, h, w) = match dims {
            [_, 3, t, h, w] => (*t, *h, *w),
            _ => candle::bail!("expected a (b, 3, t, h, w) clip, got {dims:?}"),
        };
        let (min_h, min_w) = self.min_size;
        if h < min_h || w < min_w {
            candle::bail!("frames are {h}x{w}, the minimum size is {min_h}x{min_w}")
        }
        if t < self.min_temporal_size {
            candle::bail!(
                "clip has {t} frames, the minimum is {}",
                self.min_temporal_size
            )
        }
        Ok(())
    }
}

/// Reads category names, one per line. Blank lines are skipped.
pub fn load_labels<P: AsRef<Path>>(path: P, expected: usize) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let labels: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    if labels.len() != expected {
        candle::bail!(
            "{}: found {} labels, expected {expected}",
            path.display(),
            labels.len()
        )
    }
    Ok(labels)
}

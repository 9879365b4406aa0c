#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use candle::{DType, Device, ModuleT, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_video::layers::NormLayer;
use candle_video::models::s3d::{
    Config, InceptionConfig, S3d, SepInceptionBlock3d, TemporalSeparableConv, MIXED_BLOCKS,
};

#[test]
fn separable_conv_keeps_extent() -> Result<()> {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let conv = TemporalSeparableConv::new(8, 16, 3, 1, 1, vb)?;
    let xs = Tensor::ones((2, 8, 5, 9, 9), DType::F32, &Device::Cpu)?;
    let ys = conv.forward_t(&xs, false)?;
    assert_eq!(ys.dims(), [2, 16, 5, 9, 9]);
    Ok(())
}

#[test]
fn separable_conv_stem_short_clip() -> Result<()> {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let conv = TemporalSeparableConv::new(3, 64, 7, 2, 3, vb)?;
    let xs = Tensor::zeros((1, 3, 16, 224, 224), DType::F32, &Device::Cpu)?;
    let ys = conv.forward_t(&xs, false)?;
    assert_eq!(ys.dims(), [1, 64, 8, 112, 112]);
    Ok(())
}

#[test]
fn separable_conv_stem() -> Result<()> {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let conv = TemporalSeparableConv::new(3, 64, 7, 2, 3, vb)?;
    let xs = Tensor::zeros((1, 3, 64, 224, 224), DType::F32, &Device::Cpu)?;
    let ys = conv.forward_t(&xs, false)?;
    assert_eq!(ys.dims(), [1, 64, 32, 112, 112]);
    Ok(())
}

#[test]
fn separable_conv_too_short() -> Result<()> {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let conv = TemporalSeparableConv::new(3, 4, 7, 1, 0, vb)?;
    let xs = Tensor::zeros((1, 3, 4, 16, 16), DType::F32, &Device::Cpu)?;
    assert!(conv.forward_t(&xs, false).is_err());
    Ok(())
}

#[test]
fn inception_block_mixed_3b() -> Result<()> {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let cfg = InceptionConfig::new(64, (96, 128), (16, 32), 32);
    let block = SepInceptionBlock3d::new(192, &cfg, &NormLayer::default(), vb)?;
    assert_eq!(block.out_channels(), 256);
    for (t, h, w) in [(4, 8, 8), (3, 5, 7), (1, 1, 1)] {
        let xs = Tensor::ones((1, 192, t, h, w), DType::F32, &Device::Cpu)?;
        let ys = block.forward_t(&xs, false)?;
        assert_eq!(ys.dims(), [1, 256, t, h, w]);
    }
    Ok(())
}

#[test]
fn every_inception_block_preserves_extents() -> Result<()> {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    for (idx, (in_channels, branches)) in MIXED_BLOCKS.iter().enumerate() {
        let block =
            SepInceptionBlock3d::new(*in_channels, branches, &NormLayer::default(), vb.pp(idx))?;
        let xs = Tensor::ones((2, *in_channels, 2, 3, 3), DType::F32, &Device::Cpu)?;
        let ys = block.forward_t(&xs, false)?;
        assert_eq!(ys.dims(), [2, branches.out_channels(), 2, 3, 3], "block {idx}");
    }
    Ok(())
}

#[test]
fn inception_block_channel_mismatch() -> Result<()> {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let cfg = InceptionConfig::new(64, (96, 128), (16, 32), 32);
    let block = SepInceptionBlock3d::new(192, &cfg, &NormLayer::default(), vb)?;
    let xs = Tensor::ones((1, 190, 2, 4, 4), DType::F32, &Device::Cpu)?;
    assert!(block.forward_t(&xs, false).is_err());
    Ok(())
}

#[test]
fn inception_block_is_deterministic() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let cfg = InceptionConfig::new(8, (4, 8), (2, 4), 4);
    let block = SepInceptionBlock3d::new(16, &cfg, &NormLayer::default(), vb)?;
    let xs = Tensor::randn(0f32, 1., (2, 16, 3, 6, 6), &Device::Cpu)?;
    let ys1 = block.forward_t(&xs, false)?.flatten_all()?.to_vec1::<f32>()?;
    let ys2 = block.forward_t(&xs, false)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(ys1.len(), 2 * 24 * 3 * 6 * 6);
    assert_eq!(ys1, ys2);
    Ok(())
}

#[test]
fn inception_block_with_group_norm() -> Result<()> {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let cfg = InceptionConfig::new(8, (4, 8), (4, 4), 4);
    let norm = NormLayer::GroupNorm {
        num_groups: 2,
        eps: 1e-5,
    };
    let block = SepInceptionBlock3d::new(16, &cfg, &norm, vb)?;
    let xs = Tensor::ones((1, 16, 2, 4, 4), DType::F32, &Device::Cpu)?;
    assert_eq!(block.forward_t(&xs, false)?.dims(), [1, 24, 2, 4, 4]);
    Ok(())
}

#[test]
fn s3d_short_clip() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let cfg = Config {
        num_classes: 7,
        ..Default::default()
    };
    let model = S3d::new(&cfg, vb)?;
    // A short clip that still survives every temporal downsampling.
    let xs = Tensor::randn(0f32, 1., (1, 3, 16, 224, 224), &Device::Cpu)?;
    let features = model.forward_features(&xs, false)?;
    assert_eq!(features.dims(), [1, 1024, 2, 7, 7]);
    let logits1 = model.forward(&xs)?;
    assert_eq!(logits1.dims(), [1, 7]);
    let logits2 = model.forward_t(&xs, false)?;
    let logits1 = logits1.flatten_all()?.to_vec1::<f32>()?;
    assert!(logits1.iter().all(|v| v.is_finite()));
    assert_eq!(logits1, logits2.flatten_all()?.to_vec1::<f32>()?);
    Ok(())
}

#[test]
fn s3d_rejects_small_frames() -> Result<()> {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let model = S3d::new(&Config::default(), vb)?;
    let xs = Tensor::zeros((1, 3, 16, 96, 96), DType::F32, &Device::Cpu)?;
    assert!(model.forward(&xs).is_err());
    let xs = Tensor::zeros((1, 4, 16, 224, 224), DType::F32, &Device::Cpu)?;
    assert!(model.forward(&xs).is_err());
    Ok(())
}

#[test]
#[ignore = "a batch of two 64 frame clips needs more than 5GB on cpu"]
fn s3d_kinetics_clip() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = S3d::new(&Config::kinetics400(), vb)?;
    let xs = Tensor::randn(0f32, 1., (2, 3, 64, 224, 224), &Device::Cpu)?;
    let logits1 = model.forward(&xs)?;
    assert_eq!(logits1.dims(), [2, 400]);
    let logits2 = model.forward_t(&xs, false)?;
    assert_eq!(
        logits1.flatten_all()?.to_vec1::<f32>()?,
        logits2.flatten_all()?.to_vec1::<f32>()?
    );
    Ok(())
}

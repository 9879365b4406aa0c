use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use candle::{DType, Device, Tensor};
use candle_video::checkpoint::{
    load_model, load_state_dict, parameter_shapes, s3d, verify_state_dict,
};
use candle_video::models::s3d::Config;
use candle_video::pretrained::S3dWeights;

fn zero_state_dict(cfg: &Config) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    for (name, shape) in parameter_shapes(cfg)? {
        let t = Tensor::zeros(shape, DType::F32, &Device::Cpu)?;
        tensors.insert(name, t);
    }
    Ok(tensors)
}

fn scratch_dir(name: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("candle-video-{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[test]
fn parameter_names_follow_torchvision() -> Result<()> {
    let shapes = parameter_shapes(&Config::default())?;
    assert_eq!(shapes["features.0.0.0.weight"], [64, 3, 1, 7, 7]);
    assert_eq!(shapes["features.0.1.0.weight"], [64, 64, 7, 1, 1]);
    assert_eq!(shapes["features.0.0.1.running_var"], [64]);
    assert_eq!(shapes["features.2.0.weight"], [64, 64, 1, 1, 1]);
    assert_eq!(shapes["features.3.0.0.weight"], [192, 64, 1, 3, 3]);
    assert_eq!(shapes["features.5.branch0.0.weight"], [64, 192, 1, 1, 1]);
    assert_eq!(shapes["features.5.branch1.1.0.0.weight"], [128, 96, 1, 3, 3]);
    assert_eq!(shapes["features.5.branch3.1.0.weight"], [32, 192, 1, 1, 1]);
    assert_eq!(shapes["features.15.branch2.1.1.0.weight"], [128, 128, 3, 1, 1]);
    assert_eq!(shapes["classifier.1.weight"], [400, 1024, 1, 1, 1]);
    assert_eq!(shapes["classifier.1.bias"], [400]);
    assert!(!shapes.keys().any(|k| k.starts_with("features.7.")));
    assert!(!shapes.keys().any(|k| k.starts_with("features.13.")));
    Ok(())
}

#[test]
fn matching_state_dict() -> Result<()> {
    let cfg = Config::default();
    let tensors = zero_state_dict(&cfg)?;
    verify_state_dict(&cfg, &tensors)?;
    Ok(())
}

#[test]
fn shape_mismatch_is_rejected() -> Result<()> {
    let cfg = Config::default();
    let mut tensors = zero_state_dict(&cfg)?;
    tensors.insert(
        "features.5.branch0.0.weight".to_string(),
        Tensor::zeros((32, 192, 1, 1, 1), DType::F32, &Device::Cpu)?,
    );
    let err = verify_state_dict(&cfg, &tensors).unwrap_err().to_string();
    assert!(err.contains("features.5.branch0.0.weight"), "{err}");
    assert!(err.contains("shape mismatches"), "{err}");
    Ok(())
}

#[test]
fn missing_and_unexpected_are_rejected() -> Result<()> {
    let cfg = Config::default();
    let mut tensors = zero_state_dict(&cfg)?;
    tensors.remove("classifier.1.bias");
    let err = verify_state_dict(&cfg, &tensors).unwrap_err().to_string();
    assert!(err.contains("missing [classifier.1.bias]"), "{err}");

    let mut tensors = zero_state_dict(&cfg)?;
    tensors.insert(
        "fc.weight".to_string(),
        Tensor::zeros((400, 1024), DType::F32, &Device::Cpu)?,
    );
    let err = verify_state_dict(&cfg, &tensors).unwrap_err().to_string();
    assert!(err.contains("unexpected [fc.weight]"), "{err}");
    Ok(())
}

#[test]
fn other_head_size_is_rejected() -> Result<()> {
    let tensors = zero_state_dict(&Config::default())?;
    let cfg = Config {
        num_classes: 101,
        ..Default::default()
    };
    assert!(verify_state_dict(&cfg, &tensors).is_err());
    Ok(())
}

#[test]
fn safetensors_round_trip() -> Result<()> {
    let dir = scratch_dir("safetensors")?;
    let cfg = Config::default();
    let mut tensors = zero_state_dict(&cfg)?;
    tensors.insert(
        "features.0.0.1.num_batches_tracked".to_string(),
        Tensor::zeros((), DType::I64, &Device::Cpu)?,
    );
    let path = dir.join("s3d.safetensors");
    candle::safetensors::save(&tensors, &path)?;

    let loaded = load_state_dict(&path, &Device::Cpu)?;
    assert!(!loaded.contains_key("features.0.0.1.num_batches_tracked"));
    let model = load_model(&cfg, &path, DType::F32, &Device::Cpu)?;
    assert_eq!(model.config().num_classes, 400);

    // Pretrained weights decide the head size.
    let requested = Config {
        num_classes: 10,
        ..Default::default()
    };
    let model = s3d(
        &requested,
        Some((&S3dWeights::KINETICS400_V1, path.as_path())),
        DType::F32,
        &Device::Cpu,
    )?;
    assert_eq!(model.config().num_classes, 400);
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn mismatched_file_is_not_loaded() -> Result<()> {
    let dir = scratch_dir("mismatch")?;
    let cfg = Config::default();
    let mut tensors = zero_state_dict(&cfg)?;
    tensors.insert(
        "features.2.1.weight".to_string(),
        Tensor::zeros(32, DType::F32, &Device::Cpu)?,
    );
    let path = dir.join("s3d.safetensors");
    candle::safetensors::save(&tensors, &path)?;
    assert!(load_model(&cfg, &path, DType::F32, &Device::Cpu).is_err());
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn unknown_format() {
    assert!(load_state_dict("s3d.onnx", &Device::Cpu).is_err());
}

#[test]
fn fresh_model_without_weights() -> Result<()> {
    let cfg = Config {
        num_classes: 5,
        ..Default::default()
    };
    let model = s3d(&cfg, None, DType::F32, &Device::Cpu)?;
    assert_eq!(model.config().num_classes, 5);
    assert_eq!(model.stages().len(), 16);
    Ok(())
}

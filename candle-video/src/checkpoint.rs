//! Strict loading of converted PyTorch checkpoints.
//!
//! A checkpoint is accepted only when its parameter names and shapes match the constructed
//! network exactly. Nothing is loaded from a partially matching file.
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use candle::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::models::s3d::{Config, S3d};
use crate::pretrained::S3dWeights;

// Buffers saved by PyTorch that have no counterpart in the candle layers.
const IGNORED_SUFFIXES: [&str; 1] = [".num_batches_tracked"];

// How many offending names are listed in error messages.
const MAX_REPORTED: usize = 5;

fn is_ignored(name: &str) -> bool {
    IGNORED_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Loads a state dict from a `.safetensors` file or a pickled PyTorch `.pt/.pth/.bin` file.
pub fn load_state_dict<P: AsRef<Path>>(
    path: P,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let tensors = match extension {
        "safetensors" => candle::safetensors::load(path, device)?,
        "pt" | "pth" | "bin" => candle::pickle::read_all(path)?
            .into_iter()
            .map(|(name, t)| Ok((name, t.to_device(device)?)))
            .collect::<Result<HashMap<_, _>>>()?,
        _ => candle::bail!("{}: unsupported checkpoint format", path.display()),
    };
    tracing::debug!(path = %path.display(), tensors = tensors.len(), "loaded state dict");
    Ok(tensors
        .into_iter()
        .filter(|(name, _)| !is_ignored(name))
        .collect())
}

/// Names and shapes of every parameter and buffer of a network built from `cfg`.
pub fn parameter_shapes(cfg: &Config) -> Result<BTreeMap<String, Vec<usize>>> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    S3d::new(cfg, vb)?;
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle::Error::Msg(format!("var map lock poisoned: {e}")))?;
    Ok(data
        .iter()
        .map(|(name, var)| (name.clone(), var.dims().to_vec()))
        .collect())
}

fn summarize(kind: &str, items: &[String]) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    let mut shown = items
        .iter()
        .take(MAX_REPORTED)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if items.len() > MAX_REPORTED {
        shown.push_str(", ...");
    }
    Some(format!("{} {kind} [{shown}]", items.len()))
}

/// Checks that `tensors` holds exactly the parameters of a network built from `cfg`.
pub fn verify_state_dict(cfg: &Config, tensors: &HashMap<String, Tensor>) -> Result<()> {
    let expected = parameter_shapes(cfg)?;
    let mut missing = Vec::new();
    let mut mismatched = Vec::new();
    for (name, shape) in expected.iter() {
        match tensors.get(name) {
            None => missing.push(name.clone()),
            Some(t) if t.dims() != shape.as_slice() => {
                mismatched.push(format!("{name}: {:?} <> {shape:?}", t.dims()))
            }
            Some(_) => {}
        }
    }
    let mut unexpected: Vec<String> = tensors
        .keys()
        .filter(|name| !expected.contains_key(*name))
        .cloned()
        .collect();
    unexpected.sort();

    let problems: Vec<String> = [
        summarize("missing", &missing),
        summarize("unexpected", &unexpected),
        summarize("shape mismatches", &mismatched),
    ]
    .into_iter()
    .flatten()
    .collect();
    if !problems.is_empty() {
        candle::bail!(
            "checkpoint does not match the s3d network: {}",
            problems.join("; ")
        )
    }
    Ok(())
}

/// Loads a checkpoint and builds the network from it.
pub fn load_model<P: AsRef<Path>>(
    cfg: &Config,
    path: P,
    dtype: DType,
    device: &Device,
) -> Result<S3d> {
    let tensors = load_state_dict(path, device)?;
    verify_state_dict(cfg, &tensors)?;
    let vb = VarBuilder::from_tensors(tensors, dtype, device);
    S3d::new(cfg, vb)
}

/// Builds an S3D network, either freshly initialized or from a pretrained checkpoint.
///
/// When weights are given, `num_classes` is taken from them.
pub fn s3d(
    cfg: &Config,
    pretrained: Option<(&S3dWeights, &Path)>,
    dtype: DType,
    device: &Device,
) -> Result<S3d> {
    match pretrained {
        None => {
            let varmap = VarMap::new();
            S3d::new(cfg, VarBuilder::from_varmap(&varmap, dtype, device))
        }
        Some((weights, path)) => {
            if cfg.num_classes != weights.num_classes {
                tracing::info!(
                    requested = cfg.num_classes,
                    weights = weights.num_classes,
                    "using the number of classes of the pretrained weights"
                );
            }
            let cfg = Config {
                num_classes: weights.num_classes,
                ..*cfg
            };
            load_model(&cfg, path, dtype, device)
        }
    }
}

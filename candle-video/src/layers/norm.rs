//! Normalization factory shared by the convolution blocks.
use candle::{ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, GroupNorm, VarBuilder};
use serde::{Deserialize, Serialize};

/// Describes how to build the normalization layer that follows a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormLayer {
    BatchNorm { eps: f64, momentum: f64 },
    GroupNorm { num_groups: usize, eps: f64 },
}

impl Default for NormLayer {
    fn default() -> Self {
        Self::BatchNorm {
            eps: 1e-3,
            momentum: 1e-3,
        }
    }
}

impl NormLayer {
    pub fn build(&self, num_features: usize, vb: VarBuilder) -> Result<Norm> {
        match *self {
            Self::BatchNorm { eps, momentum } => {
                if !(0. ..=1.).contains(&momentum) {
                    candle::bail!("batch-norm momentum {momentum} is not in [0, 1]")
                }
                let config = BatchNormConfig {
                    eps,
                    remove_mean: true,
                    affine: true,
                    momentum,
                };
                let bn = candle_nn::batch_norm(num_features, config, vb)?;
                Ok(Norm::BatchNorm(bn))
            }
            Self::GroupNorm { num_groups, eps } => {
                if num_groups == 0 || num_features % num_groups != 0 {
                    candle::bail!(
                        "group-norm: {num_features} channels cannot be split in {num_groups} groups"
                    )
                }
                let gn = candle_nn::group_norm(num_groups, num_features, eps, vb)?;
                Ok(Norm::GroupNorm(gn))
            }
        }
    }
}

#[derive(Debug)]
pub enum Norm {
    BatchNorm(BatchNorm),
    GroupNorm(GroupNorm),
}

impl ModuleT for Norm {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::BatchNorm(bn) => bn.forward_t(xs, train),
            Self::GroupNorm(gn) => candle::Module::forward(gn, xs),
        }
    }
}

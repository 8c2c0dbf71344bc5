//! DispConfig - Model configuration

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of supervised output scales (finest first).
pub const NUM_SCALES: usize = 6;

const BASE_MODEL_NAME: &str = "DispNet";
const CORR_SUFFIX: &str = "Corr1D";

/// Realization of the 1-D correlation feature.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrType {
    #[default]
    Tf,
    Cuda,
    None,
}

impl CorrType {
    pub fn is_corr(self) -> bool {
        self != CorrType::None
    }
}

impl FromStr for CorrType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tf" => Ok(Self::Tf),
            "cuda" => Ok(Self::Cuda),
            "none" => Ok(Self::None),
            other => Err(format!(
                "unknown correlation type '{other}' (expected tf, cuda or none)"
            )),
        }
    }
}

impl fmt::Display for CorrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Tf => "tf",
            Self::Cuda => "cuda",
            Self::None => "none",
        };
        f.write_str(s)
    }
}

/// Checkpoint/model name: `DispNet`, or `DispNetCorr1D` with correlation.
pub fn model_name(corr_type: CorrType) -> String {
    let mut name = BASE_MODEL_NAME.to_string();
    if corr_type.is_corr() {
        name.push_str(CORR_SUFFIX);
    }
    name
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispConfig {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub corr_type: CorrType,
    /// Samples whose confidence is below this value are masked out of the loss.
    pub confidence_th: f32,
    /// Weight of the cross-scale L1 smoothness term.
    pub smoothness_lambda: f32,
}

impl DispConfig {
    pub fn new(input_dim: usize, hidden_dim: usize, corr_type: CorrType) -> Self {
        Self {
            input_dim,
            hidden_dim,
            corr_type,
            confidence_th: 0.0,
            smoothness_lambda: 0.0,
        }
    }

    pub fn model_name(&self) -> String {
        model_name(self.corr_type)
    }

    /// Width of the encoder input after the optional correlation feature.
    pub fn encoder_input_dim(&self) -> usize {
        if self.corr_type.is_corr() {
            self.input_dim + self.input_dim / 2
        } else {
            self.input_dim
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.input_dim > 0, "input_dim must be > 0");
        anyhow::ensure!(self.hidden_dim > 0, "hidden_dim must be > 0");
        if self.corr_type.is_corr() {
            anyhow::ensure!(
                self.input_dim % 2 == 0,
                "correlation needs an even input_dim (left/right halves), got {}",
                self.input_dim
            );
        }
        anyhow::ensure!(
            self.smoothness_lambda >= 0.0,
            "smoothness lambda must be >= 0, got {}",
            self.smoothness_lambda
        );
        Ok(())
    }
}

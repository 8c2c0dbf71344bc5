//! Batch - one fixed-shape slice of supervised samples

use anyhow::Result;
use candle_core::{Device, Tensor};

/// Row-major batch of samples as produced by the input feed.
///
/// `features` holds `rows * dim` values; `targets` and `confidences` hold one
/// value per row.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub features: Vec<f32>,
    pub targets: Vec<f32>,
    pub confidences: Vec<f32>,
    pub rows: usize,
    pub dim: usize,
}

impl Batch {
    pub fn new(
        features: Vec<f32>,
        targets: Vec<f32>,
        confidences: Vec<f32>,
        dim: usize,
    ) -> Result<Self> {
        let rows = targets.len();
        anyhow::ensure!(rows > 0, "Batch must contain at least one row");
        anyhow::ensure!(
            features.len() == rows * dim,
            "Feature buffer has {} values, expected {} rows x {} dims",
            features.len(),
            rows,
            dim
        );
        anyhow::ensure!(
            confidences.len() == rows,
            "Confidence buffer has {} values, expected {}",
            confidences.len(),
            rows
        );
        Ok(Self {
            features,
            targets,
            confidences,
            rows,
            dim,
        })
    }

    pub fn features_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.features, (self.rows, self.dim), device)?)
    }

    pub fn targets_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.targets, (self.rows, 1), device)?)
    }

    /// 1.0 for rows whose confidence reaches `threshold`, 0.0 otherwise.
    pub fn confidence_mask(&self, threshold: f32) -> Vec<f32> {
        self.confidences
            .iter()
            .map(|&c| if c >= threshold { 1.0 } else { 0.0 })
            .collect()
    }
}

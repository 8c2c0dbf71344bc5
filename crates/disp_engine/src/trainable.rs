//! Trainable - capability interface between the training controller and a model
//!
//! The controller never looks inside the model. Anything that can run a step,
//! evaluate, summarize and persist itself by path can be trained.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use crate::batch::Batch;

/// Per-step hyperparameters handed to the model.
#[derive(Clone, Debug, PartialEq)]
pub struct StepConfig {
    /// One weight per supervised output scale, finest scale first.
    pub loss_weights: Vec<f32>,
    pub learning_rate: f64,
    /// Mean error of the most recent test pass (sentinel before the first one).
    pub last_test_error: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepOutput {
    pub loss: f32,
    pub train_error: f32,
}

/// Named scalars produced by the model for one summary record.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Summary {
    pub scalars: BTreeMap<String, f64>,
}

impl Summary {
    pub fn insert(&mut self, tag: impl Into<String>, value: f64) {
        self.scalars.insert(tag.into(), value);
    }

    pub fn get(&self, tag: &str) -> Option<f64> {
        self.scalars.get(tag).copied()
    }
}

pub trait TrainableModel {
    /// Prepare fresh training state (optimizer slots etc). Called once before
    /// any restore.
    fn init(&mut self) -> Result<()>;

    /// One parameter update on `batch`.
    fn train_step(&mut self, batch: &Batch, config: &StepConfig) -> Result<StepOutput>;

    /// Evaluation-only error on `batch`; must not touch parameters.
    fn test_error(&mut self, batch: &Batch) -> Result<f32>;

    fn summary(&self, config: &StepConfig, mean_loss: f32) -> Result<Summary>;

    /// Write the full model state to `path`.
    fn save(&self, path: &Path) -> Result<()>;

    /// Replace the full model state with the one stored at `path`.
    fn restore(&mut self, path: &Path) -> Result<()>;

    /// Restore only variables stored in `path` as `<prefix><name>` whose name and
    /// shape match a model variable. Returns how many were restored.
    fn restore_matching(&mut self, path: &Path, prefix: &str) -> Result<usize>;
}

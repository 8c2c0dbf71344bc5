#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use disp_engine::{Batch, StepConfig, StepOutput, Summary, TrainableModel};
use disp_trainer::data::{Dataset, Sample};
use disp_trainer::feed::{BatchFeed, FeedOptions};
use disp_trainer::train::schedule::{SchedulePhase, ScheduleTable};

/// Model double that records what the controller asks of it.
#[derive(Default)]
pub struct MockModel {
    pub initialized: bool,
    pub configs: Vec<StepConfig>,
    pub steps_trained: u64,
    pub test_calls: u64,
    pub restored_from: Option<PathBuf>,
    pub var_names: Vec<String>,
    /// Fail the train step with this (1-based) call index.
    pub fail_on_step: Option<u64>,
    pub loss: f32,
    /// Targets of every batch seen by `train_step` / `test_error`, in order.
    pub trained_targets: Vec<f32>,
    pub tested_targets: Vec<f32>,
}

impl MockModel {
    pub fn new() -> Self {
        Self {
            var_names: vec!["encoder.weight".into(), "encoder.bias".into()],
            loss: 2.0,
            ..Default::default()
        }
    }

    pub fn learning_rates(&self) -> Vec<f64> {
        self.configs.iter().map(|c| c.learning_rate).collect()
    }
}

impl TrainableModel for MockModel {
    fn init(&mut self) -> Result<()> {
        self.initialized = true;
        Ok(())
    }

    fn train_step(&mut self, batch: &Batch, config: &StepConfig) -> Result<StepOutput> {
        self.steps_trained += 1;
        self.trained_targets.extend_from_slice(&batch.targets);
        if self.fail_on_step == Some(self.steps_trained) {
            anyhow::bail!("device lost");
        }
        self.configs.push(config.clone());
        Ok(StepOutput {
            loss: self.loss,
            train_error: 0.5,
        })
    }

    /// Returns 1, 2, 3, ... on successive calls.
    fn test_error(&mut self, batch: &Batch) -> Result<f32> {
        self.test_calls += 1;
        self.tested_targets.extend_from_slice(&batch.targets);
        Ok(self.test_calls as f32)
    }

    fn summary(&self, config: &StepConfig, mean_loss: f32) -> Result<Summary> {
        let mut summary = Summary::default();
        summary.insert("loss", mean_loss as f64);
        summary.insert("learning_rate", config.learning_rate);
        summary.insert("test_error", config.last_test_error as f64);
        Ok(summary)
    }

    fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string(&self.steps_trained)?)?;
        Ok(())
    }

    fn restore(&mut self, path: &Path) -> Result<()> {
        self.steps_trained = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        self.restored_from = Some(path.to_path_buf());
        Ok(())
    }

    /// External files are JSON arrays of variable names.
    fn restore_matching(&mut self, path: &Path, prefix: &str) -> Result<usize> {
        let stored: Vec<String> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        Ok(self
            .var_names
            .iter()
            .filter(|name| stored.contains(&format!("{prefix}{name}")))
            .count())
    }
}

pub fn dataset(n: usize) -> Arc<Dataset> {
    dataset_from(0, n)
}

/// `n` samples whose targets are `first, first + 1, ...`.
pub fn dataset_from(first: usize, n: usize) -> Arc<Dataset> {
    let samples = (first..first + n)
        .map(|i| Sample {
            target: i as f32,
            confidence: 1.0,
            features: vec![i as f32, 1.0],
        })
        .collect();
    Arc::new(Dataset::from_samples(samples).expect("valid samples"))
}

pub fn endless_feed(name: &str) -> BatchFeed {
    BatchFeed::spawn(name, dataset(8), FeedOptions::new(2)).expect("feed")
}

pub fn single_phase_table(period: u64) -> ScheduleTable {
    ScheduleTable::new(
        vec![SchedulePhase {
            loss_weights: vec![1.0, 0.0],
            learning_rate: 1e-4,
        }],
        period,
    )
    .expect("table")
}

/// Phase `i` uses learning rate `1 / (i + 1)`.
pub fn stepped_table(phases: usize, period: u64) -> ScheduleTable {
    let phases = (0..phases)
        .map(|i| SchedulePhase {
            loss_weights: vec![1.0, i as f32],
            learning_rate: 1.0 / (i as f64 + 1.0),
        })
        .collect();
    ScheduleTable::new(phases, period).expect("table")
}

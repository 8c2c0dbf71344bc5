//! Training Arguments - CLI configuration for training

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use disp_engine::{CorrType, DispConfig, NUM_SCALES};

use super::schedule::{ScheduleConfig, SchedulePreset, ScheduleTable, DEFAULT_SCHEDULE_PERIOD};
use super::training_loop::{LoopConfig, DEFAULT_TEST_ITERS};

/// Training configuration from command line arguments
#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Path to the training list file
    #[arg(long, required = true, value_name = "FILE")]
    pub training: PathBuf,

    /// Path to the test list file
    #[arg(long, required = true, value_name = "FILE")]
    pub testing: PathBuf,

    /// Model checkpoint directory (created if absent)
    #[arg(short = 'c', long = "ckpt", default_value = ".")]
    pub checkpoint_path: PathBuf,

    #[arg(short, long, default_value_t = 4)]
    pub batch_size: usize,

    /// Summary/log period in steps
    #[arg(short = 'l', long, default_value_t = 100)]
    pub log_step: u64,

    /// Preinitialization weights (safetensors, variables under "model/")
    #[arg(short, long, value_name = "FILE")]
    pub weights: Option<PathBuf>,

    /// Checkpoint period in steps; the test period follows it
    #[arg(short, long, default_value_t = 1000)]
    pub save_step: u64,

    /// Total number of training steps
    #[arg(short, long, default_value_t = 500_000)]
    pub n_steps: u64,

    /// Correlation layer realization
    #[arg(long, default_value = "tf", value_parser = parse_corr_type)]
    pub corr_type: CorrType,

    /// Confidence threshold below which samples are masked out
    #[arg(long = "confidence-th", alias = "th", default_value_t = 0)]
    pub confidence_th: u32,

    /// Smoothness lambda for the cross-scale L1 term
    #[arg(long, default_value_t = 0.0)]
    pub smooth: f32,

    /// Steps per schedule phase
    #[arg(long, default_value_t = DEFAULT_SCHEDULE_PERIOD)]
    pub schedule_period: u64,

    /// JSON schedule table (overrides --schedule-preset)
    #[arg(long, value_name = "FILE")]
    pub schedule: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = SchedulePreset::Single)]
    pub schedule_preset: SchedulePreset,

    /// Evaluation batches per test pass
    #[arg(long, default_value_t = DEFAULT_TEST_ITERS)]
    pub test_iters: usize,

    /// Passes over the training list before the feed is exhausted (default: unlimited)
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Newest checkpoints kept on disk (0 keeps all)
    #[arg(long, default_value_t = 5)]
    pub keep_checkpoints: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value_t = 64)]
    pub hidden_dim: usize,
}

fn parse_corr_type(s: &str) -> Result<CorrType, String> {
    s.parse()
}

impl TrainArgs {
    /// Startup checks that must pass before anything is created on disk.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.batch_size > 0, "--batch-size must be > 0");
        anyhow::ensure!(self.hidden_dim > 0, "--hidden-dim must be > 0");
        anyhow::ensure!(self.smooth >= 0.0, "--smooth must be >= 0");
        self.loop_config()?;
        self.schedule_table()?.ensure_scales(NUM_SCALES)?;
        Ok(())
    }

    pub fn model_name(&self) -> String {
        disp_engine::model_name(self.corr_type)
    }

    pub fn model_config(&self, input_dim: usize) -> DispConfig {
        DispConfig {
            input_dim,
            hidden_dim: self.hidden_dim,
            corr_type: self.corr_type,
            confidence_th: self.confidence_th as f32,
            smoothness_lambda: self.smooth,
        }
    }

    pub fn loop_config(&self) -> Result<LoopConfig> {
        LoopConfig::new(self.n_steps, self.log_step, self.save_step, self.test_iters)
    }

    pub fn schedule_table(&self) -> Result<ScheduleTable> {
        let config = match &self.schedule {
            Some(path) => ScheduleConfig::load(path)?,
            None => ScheduleConfig::preset(self.schedule_preset),
        };
        Ok(ScheduleTable::from_config(&config, self.schedule_period)?)
    }
}

//! Schedule Table - step -> (loss weights, learning rate)
//!
//! The active phase is `min(step / period, phases - 1)`. Nothing here is
//! stored between calls, so a resumed run sees exactly the hyperparameters an
//! uninterrupted run would have seen at the same step.

use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SCHEDULE_PERIOD: u64 = 50_000;

const BASE_LR: f64 = 1e-4;

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("schedule table is empty")]
    Empty,

    #[error("schedule period must be > 0")]
    ZeroPeriod,

    #[error("phase {phase} has {found} loss weights, expected {expected}")]
    RaggedWeights {
        phase: usize,
        expected: usize,
        found: usize,
    },

    #[error("phase {0} has no learning rate")]
    MissingLearningRate(usize),

    #[error("phase {phase} has invalid learning rate {lr}")]
    InvalidLearningRate { phase: usize, lr: f64 },
}

/// Hyperparameters active for one phase.
#[derive(Clone, Debug, PartialEq)]
pub struct SchedulePhase {
    pub loss_weights: Vec<f32>,
    pub learning_rate: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SchedulePreset {
    /// Finest scale only, constant learning rate
    #[default]
    Single,
    /// Coarse-to-fine loss weights with a halving learning rate
    Curriculum,
}

/// Serialized form of a schedule: weights and learning rates listed per phase.
///
/// Phases are paired by index and the table is as long as `loss_weights`;
/// learning rates past that length are never reached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub loss_weights: Vec<Vec<f32>>,
    pub learning_rates: Vec<f64>,
}

impl ScheduleConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open schedule file {}", path.display()))?;
        let config = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse schedule file {}", path.display()))?;
        Ok(config)
    }

    pub fn preset(preset: SchedulePreset) -> Self {
        let loss_weights = match preset {
            SchedulePreset::Single => vec![vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0]],
            SchedulePreset::Curriculum => vec![
                vec![0.0, 0.0, 0.0, 0.0, 0.2, 1.0],
                vec![0.0, 0.0, 0.0, 0.2, 1.0, 0.5],
                vec![0.0, 0.0, 0.2, 1.0, 0.5, 0.0],
                vec![0.0, 0.2, 1.0, 0.5, 0.0, 0.0],
                vec![0.2, 1.0, 0.5, 0.0, 0.0, 0.0],
                vec![1.0, 0.5, 0.0, 0.0, 0.0, 0.0],
                vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            ],
        };
        Self {
            loss_weights,
            learning_rates: default_learning_rates(),
        }
    }
}

/// Five phases at the base rate, then twenty halvings held for three phases each.
pub fn default_learning_rates() -> Vec<f64> {
    let mut rates = vec![BASE_LR; 5];
    for _ in 0..20 {
        let last = rates[rates.len() - 1];
        rates.extend([last / 2.0; 3]);
    }
    rates
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleTable {
    phases: Vec<SchedulePhase>,
    period: u64,
}

impl ScheduleTable {
    pub fn new(phases: Vec<SchedulePhase>, period: u64) -> Result<Self, ScheduleError> {
        if phases.is_empty() {
            return Err(ScheduleError::Empty);
        }
        if period == 0 {
            return Err(ScheduleError::ZeroPeriod);
        }
        let expected = phases[0].loss_weights.len();
        for (phase, entry) in phases.iter().enumerate() {
            if entry.loss_weights.len() != expected || expected == 0 {
                return Err(ScheduleError::RaggedWeights {
                    phase,
                    expected,
                    found: entry.loss_weights.len(),
                });
            }
            if !(entry.learning_rate.is_finite() && entry.learning_rate > 0.0) {
                return Err(ScheduleError::InvalidLearningRate {
                    phase,
                    lr: entry.learning_rate,
                });
            }
        }
        Ok(Self { phases, period })
    }

    pub fn from_config(config: &ScheduleConfig, period: u64) -> Result<Self, ScheduleError> {
        let phases = config
            .loss_weights
            .iter()
            .enumerate()
            .map(|(phase, weights)| {
                let lr = config
                    .learning_rates
                    .get(phase)
                    .copied()
                    .ok_or(ScheduleError::MissingLearningRate(phase))?;
                Ok(SchedulePhase {
                    loss_weights: weights.clone(),
                    learning_rate: lr,
                })
            })
            .collect::<Result<Vec<_>, ScheduleError>>()?;
        Self::new(phases, period)
    }

    pub fn phase_index(&self, step: u64) -> usize {
        let phase = step / self.period;
        let last = (self.phases.len() - 1) as u64;
        phase.min(last) as usize
    }

    pub fn lookup(&self, step: u64) -> &SchedulePhase {
        &self.phases[self.phase_index(step)]
    }

    /// True on the first step of every period window, including past the final
    /// phase (the notice repeats while the last phase is held).
    pub fn is_phase_start(&self, step: u64) -> bool {
        step % self.period == 0
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Loss-weight vector length shared by every phase.
    pub fn num_scales(&self) -> usize {
        self.phases[0].loss_weights.len()
    }

    pub fn ensure_scales(&self, expected: usize) -> Result<()> {
        anyhow::ensure!(
            self.num_scales() == expected,
            "Schedule has {} loss weights per phase but the model supervises {} scales",
            self.num_scales(),
            expected
        );
        Ok(())
    }
}

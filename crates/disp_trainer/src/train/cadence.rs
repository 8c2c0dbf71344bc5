//! Cadence - periodic side-effect gates (test / log / save)

use std::num::NonZeroU64;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0} period must be > 0")]
pub struct CadenceError(pub &'static str);

/// `step > 0 && step % period == 0`
pub fn fires(step: u64, period: NonZeroU64) -> bool {
    step > 0 && step % period.get() == 0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CadenceGate {
    period: NonZeroU64,
}

impl CadenceGate {
    pub fn new(name: &'static str, period: u64) -> Result<Self, CadenceError> {
        NonZeroU64::new(period)
            .map(|period| Self { period })
            .ok_or(CadenceError(name))
    }

    pub fn fires(&self, step: u64) -> bool {
        fires(step, self.period)
    }

    pub fn period(&self) -> u64 {
        self.period.get()
    }
}

/// Which periodic actions are due after a step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CadenceHits {
    pub test: bool,
    pub log: bool,
    pub save: bool,
}

/// The three independent gates of the training loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cadences {
    pub test: CadenceGate,
    pub log: CadenceGate,
    pub save: CadenceGate,
}

impl Cadences {
    /// The test period follows the save period.
    pub fn new(log_period: u64, save_period: u64) -> Result<Self, CadenceError> {
        Ok(Self {
            test: CadenceGate::new("test", save_period)?,
            log: CadenceGate::new("log", log_period)?,
            save: CadenceGate::new("save", save_period)?,
        })
    }

    pub fn hits(&self, step: u64) -> CadenceHits {
        CadenceHits {
            test: self.test.fires(step),
            log: self.log.fires(step),
            save: self.save.fires(step),
        }
    }
}

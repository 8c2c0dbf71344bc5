//! Train Module - training controller for the disparity regressor
//!
//! - args: CLI arguments for training
//! - schedule: step -> (loss weights, learning rate)
//! - cadence: periodic test / log / save gates
//! - checkpoint: checkpoint naming, discovery and persistence
//! - resume: starting step recovery and preinitialization
//! - summary: step-keyed summary stream
//! - training_loop: the control loop and `run`

pub mod args;
pub mod cadence;
pub mod checkpoint;
pub mod resume;
pub mod schedule;
pub mod summary;
pub mod training_loop;

pub use args::TrainArgs;
pub use checkpoint::{CheckpointId, CheckpointStore};
pub use resume::{resume, ResumePoint, ResumeSource};
pub use schedule::ScheduleTable;
pub use training_loop::{run, LoopConfig, LoopOutcome, StopReason, TrainingLoop};

//! Disp Engine
//!
//! Model side of the disparity trainer: the capability interface the training
//! controller drives, the batch type it feeds, and a candle reference model
//! (`DispRegressor`) with multi-scale supervision.

pub mod batch;
pub mod device_utils;
pub mod model;
pub mod optim;
pub mod preinit;
pub mod trainable;

pub use batch::Batch;
pub use model::{model_name, CorrType, DispConfig, DispRegressor, NUM_SCALES};
pub use trainable::{StepConfig, StepOutput, Summary, TrainableModel};

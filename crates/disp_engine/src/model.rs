//! Model Module - DispRegressor reference model
//!
//! - DispConfig / CorrType: model configuration and variant selection
//! - DispRegressor: multi-scale regressor implementing `TrainableModel`

pub mod config;
pub mod regressor;

pub use config::{model_name, CorrType, DispConfig, NUM_SCALES};
pub use regressor::DispRegressor;

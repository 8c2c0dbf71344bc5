//! Data Module - sample lists and synthetic list generation

pub mod generate;
pub mod list;

pub use generate::GenListsArgs;
pub use list::{Dataset, Sample};

pub mod cli;
pub mod data;
pub mod feed;
pub mod train;

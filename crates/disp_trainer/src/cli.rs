use crate::data::GenListsArgs;
use crate::train::TrainArgs;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Resumable DispNet training controller", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train (or resume training) a model
    Train(TrainArgs),

    /// Write synthetic train/test lists
    GenLists(GenListsArgs),
}

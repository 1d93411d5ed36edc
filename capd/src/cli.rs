use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "capd", version, about = "Capture archive background indexer")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the reconcile/index loop until interrupted
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run a single reconcile/index round and exit
    Once {
        #[arg(short, long)]
        config: PathBuf,
    },
}

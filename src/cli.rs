use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "class-share")]
#[command(about = "Load classes through a shared class store and inspect the store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, value_name = "FILE", global = true)]
    pub db: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides).
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Load classes through the application loader.
    Load {
        #[arg(long, value_name = "PATHS")]
        cp: String,

        /// Enable sharing regardless of CLASS_SHARE_ENABLED.
        #[arg(long)]
        shared: bool,

        /// Runtime-image module served by the bootstrap loader.
        #[arg(long = "module", value_name = "NAME=DIR")]
        modules: Vec<String>,

        #[arg(value_name = "CLASS", required = true)]
        classes: Vec<String>,
    },
    /// Resolve classes through a deserialization class cache.
    Resolve {
        #[arg(long, value_name = "PATHS")]
        cp: String,

        #[arg(long, value_name = "N", default_value_t = 4)]
        threads: usize,

        #[arg(value_name = "CLASS", required = true)]
        classes: Vec<String>,
    },
    Stats,
    Clear,
}

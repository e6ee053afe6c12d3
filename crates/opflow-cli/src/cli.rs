use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "opflow",
    about = "Inspect serialized apply-phase execution graphs",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Render a marshaled graph for human eyes.
    Show {
        /// Path to the marshaled graph file.
        graph_file: PathBuf,

        /// Output format.
        #[arg(long, default_value = "text")]
        output: ShowOutput,
    },

    /// Validate a marshaled graph and report its shape.
    Check {
        /// Path to the marshaled graph file.
        graph_file: PathBuf,
    },
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ShowOutput {
    Text,
    Dot,
}

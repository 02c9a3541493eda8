use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;

mod cli;
mod tracing;

#[derive(Parser, Debug)]
#[command(name = "swiftspan", version, about = "Bridge a local object cluster with remote Swift/S3 stores")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,

    /// Structured JSON log output.
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the sync/lifecycle daemon.
    Sync {
        #[arg(long, env = "SWIFTSPAN_CONFIG")]
        config: PathBuf,
        /// One pass instead of the poll loop.
        #[arg(long)]
        once: bool,
    },
    /// Run the migrator daemon.
    Migrate {
        #[arg(long, env = "SWIFTSPAN_CONFIG")]
        config: PathBuf,
        #[arg(long)]
        once: bool,
    },
    /// Validate a config file and print a profile summary.
    CheckConfig {
        #[arg(long, env = "SWIFTSPAN_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    tracing::init_tracing(args.verbosity.log_level(), args.log_json);
    cli::run(args).await
}

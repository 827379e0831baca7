//! vigil CLI: inspect training sessions without running them.
//!
//! Checks session configuration files, resolves device specifications,
//! previews class weights and reads checkpoint records.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// vigil: training session companion
#[derive(Parser, Debug)]
#[command(name = "vigil", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Load and validate a session file, building every component it names
    Check {
        /// Session configuration (.toml or .json)
        config: PathBuf,
        /// Validate for an evaluation-only session
        #[arg(long)]
        eval: bool,
        /// Override the detected accelerator count
        #[arg(long)]
        accelerators: Option<usize>,
    },
    /// Resolve a device specification such as "cuda:0,cuda:1"
    Devices {
        spec: String,
        /// Field name reported in errors
        #[arg(long, default_value = "train_device")]
        field: String,
        /// Override the detected accelerator count
        #[arg(long)]
        accelerators: Option<usize>,
    },
    /// Preview class weights from per-class sample counts
    Weights {
        /// Counts as name=count pairs, in class-index order
        #[arg(required = true)]
        counts: Vec<String>,
        /// "uniform" or "rootK"
        #[arg(long, default_value = "uniform")]
        distribution: String,
        /// Clip weights at this value
        #[arg(long)]
        max: Option<f64>,
        /// Skip normalization to mean 1
        #[arg(long)]
        no_normalize: bool,
        /// Print a name -> weight map instead of a dense vector
        #[arg(long)]
        named: bool,
    },
    /// Inspect checkpoint records
    Ckpt {
        #[command(subcommand)]
        action: CkptAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum CkptAction {
    /// Summarize one checkpoint record
    Show { path: PathBuf },
    /// List the records of a checkpoint directory
    List { dir: PathBuf },
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));
    tracing_subscriber::registry().with(stderr_layer).init();

    commands::handle_command(cli.command)
}

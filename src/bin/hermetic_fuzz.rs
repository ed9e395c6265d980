//! hermetic-fuzz: developer CLI for hermetic fuzz-target configuration
//!
//! Helps check a run's configuration before handing it to the test framework.
//!
//! ## Features
//!
//! - **match**: evaluate instrumentation rules against fully-qualified names
//! - **inputs**: list the replay inputs a fuzz target would run in regression mode
//! - **mode**: print the execution mode this process resolves
//!
//! ## Example Usage
//!
//! ```bash
//! # Which of these names would be instrumented?
//! hermetic-fuzz match --rules 'com.example.**,!com.example.generated.**' com.example.Parser
//!
//! # What would regression mode replay for this target?
//! hermetic-fuzz inputs com.example.FuzzTest fuzz_test_1 --basedir ./fuzz-inputs
//!
//! # Is fuzzing enabled in this environment?
//! HERMETIC_FUZZ=1 hermetic-fuzz mode --json
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{inputs::InputsCmd, mode::ModeCmd, patterns::MatchCmd};
use hermetic_fuzz_core::RunConfig;

#[derive(Parser)]
#[command(
    name = "hermetic-fuzz",
    author,
    version,
    about = "Hermetic fuzz-target configuration tools",
    long_about = "Inspect how a hermetic fuzzing run is configured: which definitions get \
                  instrumented, which stored inputs a target replays, and which execution \
                  mode the environment selects."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Run configuration (JSON) to take rules and the input directory from
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output as JSON instead of human-readable format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (debug logging on stderr)
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate instrumentation rules against names
    Match(MatchCmd),

    /// List the replay inputs of a fuzz target
    Inputs(InputsCmd),

    /// Print the resolved execution mode
    Mode(ModeCmd),
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    let Cli {
        command,
        config,
        json,
        verbose,
    } = Cli::parse();
    init_tracing(verbose);

    let config = match config {
        Some(path) => RunConfig::from_json_file(&path)?,
        None => RunConfig::default(),
    };
    tracing::debug!(config = ?config, "loaded run configuration");

    match command {
        Commands::Match(cmd) => cmd.execute(&config, json),
        Commands::Inputs(cmd) => cmd.execute(&config, json),
        Commands::Mode(cmd) => cmd.execute(json),
    }
}

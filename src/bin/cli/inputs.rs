//! Replay input listing.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use sha2::{Digest, Sha256};

use hermetic_fuzz_core::corpus::replay_inputs_or_empty;
use hermetic_fuzz_core::{CorpusError, DirectoryCorpus, FuzzTarget, ReplayInputSource, RunConfig};

#[derive(Parser, Debug)]
#[command(
    about = "List the replay inputs of a fuzz target",
    long_about = "Lists the stored inputs regression mode would replay for a fuzz target, \
                  one dynamic test each, in replay order. When nothing is stored the \
                  single synthetic empty input is listed."
)]
pub struct InputsCmd {
    /// Fully-qualified name of the class owning the fuzz test
    pub class: String,

    /// Fuzz-test method name
    pub method: String,

    /// Stored-input base directory (default: from --config)
    #[arg(long)]
    pub basedir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct InputEntry {
    label: String,
    size: usize,
    sha256: String,
}

#[derive(Debug, Serialize)]
struct InputsOutput {
    target: String,
    directory: String,
    stored: usize,
    inputs: Vec<InputEntry>,
}

impl InputsCmd {
    pub fn execute(&self, config: &RunConfig, json_output: bool) -> Result<()> {
        let basedir = self
            .basedir
            .clone()
            .or_else(|| config.basedir.clone())
            .ok_or(CorpusError::NoBaseDir)?;
        let corpus = DirectoryCorpus::new(basedir);
        let target = FuzzTarget::new(&self.class, &self.method);

        let stored = corpus
            .list_replay_inputs(&target)
            .with_context(|| format!("Failed to list inputs for {target}"))?;
        let stored_count = stored.len();
        let output = InputsOutput {
            target: target.key(),
            directory: corpus.target_dir(&target).display().to_string(),
            stored: stored_count,
            inputs: replay_inputs_or_empty(stored)
                .into_iter()
                .map(|input| InputEntry {
                    size: input.data.len(),
                    sha256: hex::encode(Sha256::digest(&input.data)),
                    label: input.label,
                })
                .collect(),
        };

        if json_output {
            println!("{}", serde_json::to_string_pretty(&output)?);
            return Ok(());
        }

        println!("Fuzz target: {}", output.target);
        println!("Directory:   {}", output.directory);
        println!();
        println!("Replay inputs ({} stored):", output.stored);
        for (i, input) in output.inputs.iter().enumerate() {
            println!("  [{}] {:40} {:>8} bytes", i + 1, input.label, input.size);
        }
        Ok(())
    }
}

//! Execution mode inspection.

use anyhow::Result;
use clap::Parser;

use hermetic_fuzz_core::{resolve_mode, FUZZ_TOGGLE_VAR};

#[derive(Parser, Debug)]
#[command(
    about = "Print the execution mode this process resolves",
    long_about = "Reads the fuzzing toggle the same way a test run does. Any non-empty \
                  value selects fuzzing mode; absent or empty selects regression mode."
)]
pub struct ModeCmd {}

impl ModeCmd {
    pub fn execute(&self, json_output: bool) -> Result<()> {
        let mode = resolve_mode()?;
        if json_output {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "mode": mode,
                    "toggle": FUZZ_TOGGLE_VAR,
                }))?
            );
        } else {
            println!("{mode} ({FUZZ_TOGGLE_VAR})");
        }
        Ok(())
    }
}

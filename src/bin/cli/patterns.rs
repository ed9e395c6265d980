//! Instrumentation rule evaluation.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use hermetic_fuzz_core::{InstrumentationFilter, RuleEffect, RunConfig};

#[derive(Parser, Debug)]
#[command(
    about = "Evaluate instrumentation rules against fully-qualified names",
    long_about = "Compiles the instrumentation rules (from --rules/--exclude, or from the \
                  run configuration) and reports, for every name, whether it would be \
                  instrumented inside an isolated execution context and which rule decided."
)]
pub struct MatchCmd {
    /// Names to evaluate, e.g. "com.example.Parser"
    #[arg(required = true)]
    pub names: Vec<String>,

    /// Comma-separated globs; a leading '!' excludes (default: from --config)
    #[arg(long)]
    pub rules: Option<String>,

    /// Comma-separated globs that are always excluded
    #[arg(long)]
    pub exclude: Option<String>,
}

#[derive(Debug, Serialize)]
struct Verdict<'a> {
    name: &'a str,
    instrument: bool,
    rule: Option<String>,
}

impl MatchCmd {
    pub fn execute(&self, config: &RunConfig, json_output: bool) -> Result<()> {
        let includes = self.rules.as_deref().unwrap_or(&config.instrument);
        let excludes = self.exclude.as_deref().unwrap_or(&config.instrument_exclude);
        let filter = InstrumentationFilter::from_parts(includes, excludes)
            .context("Invalid instrumentation rules")?;

        let verdicts: Vec<Verdict<'_>> = self
            .names
            .iter()
            .map(|name| Verdict {
                name,
                instrument: filter.should_instrument(name),
                rule: filter.matching_rule(name).map(|rule| match rule.effect() {
                    RuleEffect::Include => rule.pattern().to_string(),
                    RuleEffect::Exclude => format!("!{}", rule.pattern()),
                }),
            })
            .collect();

        if json_output {
            println!("{}", serde_json::to_string_pretty(&verdicts)?);
            return Ok(());
        }

        if filter.is_empty() {
            println!("No instrumentation rules: nothing is instrumented.");
        }
        for verdict in &verdicts {
            let mark = if verdict.instrument { "instrument" } else { "skip" };
            match &verdict.rule {
                Some(rule) => println!("{mark:10} {}  ({rule})", verdict.name),
                None => println!("{mark:10} {}  (no matching rule)", verdict.name),
            }
        }
        Ok(())
    }
}

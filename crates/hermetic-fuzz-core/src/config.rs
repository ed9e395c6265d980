//! Run configuration.
//!
//! Read once at run start from the host framework's configuration parameters
//! (or a JSON file) and immutable afterwards. Every value is validated before
//! any target runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapter::PollSettings;
use crate::corpus::{DirectoryCorpus, MemoryCorpus, ReplayInputSource};
use crate::error::ConfigurationError;
use crate::isolation::ExemptNamespaces;
use crate::patterns::InstrumentationFilter;

pub const PARAMETER_PREFIX: &str = "hermetic.";
pub const INSTRUMENT_KEY: &str = "hermetic.instrument";
pub const INSTRUMENT_EXCLUDE_KEY: &str = "hermetic.instrument.exclude";
pub const BASEDIR_KEY: &str = "hermetic.basedir";
pub const EXEMPT_KEY: &str = "hermetic.exempt";
pub const POLL_INTERVAL_KEY: &str = "hermetic.poll_interval_ms";
pub const MAX_IDLE_POLLS_KEY: &str = "hermetic.max_idle_polls";
pub const PERSIST_FINDINGS_KEY: &str = "hermetic.persist_findings";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Comma-separated globs; a leading `!` excludes.
    pub instrument: String,
    /// Comma-separated globs, all excluding, applied after `instrument`.
    pub instrument_exclude: String,
    /// Base directory of stored inputs. In-memory only when unset.
    pub basedir: Option<PathBuf>,
    /// Host framework namespaces never loaded into isolated contexts.
    pub exempt: Vec<String>,
    pub poll_interval_ms: u64,
    pub max_idle_polls: u32,
    /// Write failing fuzzing inputs into the stored-input directory.
    pub persist_findings: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        let poll = PollSettings::default();
        Self {
            instrument: String::new(),
            instrument_exclude: String::new(),
            basedir: None,
            exempt: Vec::new(),
            poll_interval_ms: u64::try_from(poll.poll_interval.as_millis()).unwrap_or(100),
            max_idle_polls: poll.max_idle_polls,
            persist_findings: false,
        }
    }
}

impl RunConfig {
    /// Build from `hermetic.*` configuration parameters. Unknown
    /// `hermetic.*` keys are ignored with a warning.
    pub fn from_parameters(params: &BTreeMap<String, String>) -> Result<Self, ConfigurationError> {
        let mut config = Self::default();
        for (key, value) in params {
            match key.as_str() {
                INSTRUMENT_KEY => config.instrument = value.clone(),
                INSTRUMENT_EXCLUDE_KEY => config.instrument_exclude = value.clone(),
                BASEDIR_KEY => {
                    let value = value.trim();
                    config.basedir = (!value.is_empty()).then(|| PathBuf::from(value));
                }
                EXEMPT_KEY => {
                    config.exempt = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                }
                POLL_INTERVAL_KEY => config.poll_interval_ms = parse_param(key, value)?,
                MAX_IDLE_POLLS_KEY => config.max_idle_polls = parse_param(key, value)?,
                PERSIST_FINDINGS_KEY => config.persist_findings = parse_bool(key, value)?,
                other if other.starts_with(PARAMETER_PREFIX) => {
                    warn!(key = %other, "ignoring unknown configuration parameter");
                }
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value that can be wrong, including the instrumentation
    /// patterns.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_idle_polls == 0 {
            return Err(ConfigurationError::InvalidParameter {
                key: MAX_IDLE_POLLS_KEY.into(),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        self.compile_filter()?;
        Ok(())
    }

    pub fn compile_filter(&self) -> Result<InstrumentationFilter, ConfigurationError> {
        InstrumentationFilter::from_parts(&self.instrument, &self.instrument_exclude)
    }

    pub fn exempt_namespaces(&self) -> ExemptNamespaces {
        ExemptNamespaces::new(self.exempt.iter().cloned())
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_idle_polls: self.max_idle_polls,
        }
    }

    /// Stored inputs below `basedir`, or an in-memory store without one.
    pub fn corpus(&self) -> Arc<dyn ReplayInputSource> {
        match &self.basedir {
            Some(dir) => Arc::new(DirectoryCorpus::new(dir)),
            None => Arc::new(MemoryCorpus::new()),
        }
    }
}

fn parse_param<T>(key: &str, value: &str) -> Result<T, ConfigurationError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigurationError::InvalidParameter {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigurationError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(ConfigurationError::InvalidParameter {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}

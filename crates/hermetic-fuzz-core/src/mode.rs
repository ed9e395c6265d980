//! Process-wide execution mode.
//!
//! The mode is read once from the [`FUZZ_TOGGLE_VAR`] environment variable and
//! cached for the lifetime of the process. Nothing else in the workspace reads
//! the variable.

use std::ffi::OsStr;
use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigurationError;

/// Environment variable selecting fuzzing mode when set to a non-empty value.
pub const FUZZ_TOGGLE_VAR: &str = "HERMETIC_FUZZ";

static PROCESS_MODE: OnceLock<ExecutionMode> = OnceLock::new();

/// How fuzz targets execute for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One admitted target explored until a finding or until the explorer
    /// runs dry.
    Fuzzing,
    /// Every target replays its stored inputs as ordinary tests.
    Regression,
}

impl ExecutionMode {
    /// Interpret a raw toggle value. Absent or empty selects regression mode,
    /// anything else selects fuzzing mode.
    pub fn from_toggle(value: Option<&OsStr>) -> Result<Self, ConfigurationError> {
        let Some(raw) = value else {
            return Ok(Self::Regression);
        };
        let value = raw.to_str().ok_or(ConfigurationError::InvalidToggle {
            var: FUZZ_TOGGLE_VAR,
        })?;
        if value.is_empty() {
            Ok(Self::Regression)
        } else {
            Ok(Self::Fuzzing)
        }
    }

    pub fn is_fuzzing(self) -> bool {
        matches!(self, Self::Fuzzing)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fuzzing => write!(f, "fuzzing"),
            Self::Regression => write!(f, "regression"),
        }
    }
}

/// The mode of this process, read from the environment on first call.
///
/// Later calls return the cached value even if the environment changes.
pub fn resolve_mode() -> Result<ExecutionMode, ConfigurationError> {
    if let Some(mode) = PROCESS_MODE.get() {
        return Ok(*mode);
    }
    let mode = ExecutionMode::from_toggle(std::env::var_os(FUZZ_TOGGLE_VAR).as_deref())?;
    let mode = *PROCESS_MODE.get_or_init(|| mode);
    info!(mode = %mode, var = FUZZ_TOGGLE_VAR, "execution mode resolved");
    Ok(mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_toggle_is_regression() {
        assert_eq!(
            ExecutionMode::from_toggle(None).unwrap(),
            ExecutionMode::Regression
        );
    }

    #[test]
    fn test_empty_toggle_is_regression() {
        assert_eq!(
            ExecutionMode::from_toggle(Some(OsStr::new(""))).unwrap(),
            ExecutionMode::Regression
        );
    }

    #[test]
    fn test_any_value_is_fuzzing() {
        for value in ["1", "true", "0", "false", "yes"] {
            assert_eq!(
                ExecutionMode::from_toggle(Some(OsStr::new(value))).unwrap(),
                ExecutionMode::Fuzzing,
                "{value}"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_non_unicode_toggle_is_configuration_error() {
        use std::os::unix::ffi::OsStrExt;

        let raw = OsStr::from_bytes(&[0x66, 0x6f, 0x80]);
        assert_eq!(
            ExecutionMode::from_toggle(Some(raw)),
            Err(ConfigurationError::InvalidToggle {
                var: FUZZ_TOGGLE_VAR
            })
        );
    }

    #[test]
    fn test_resolve_mode_is_stable() {
        let first = resolve_mode().unwrap();
        assert_eq!(resolve_mode().unwrap(), first);
    }

    #[test]
    fn test_display() {
        assert_eq!(ExecutionMode::Fuzzing.to_string(), "fuzzing");
        assert_eq!(ExecutionMode::Regression.to_string(), "regression");
    }
}

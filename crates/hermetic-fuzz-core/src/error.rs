//! Error taxonomy for hermetic fuzz-target execution.
//!
//! | Error | Scope | Surfaced as |
//! |-------|-------|-------------|
//! | [`ConfigurationError`] | whole run | fatal, before any target runs |
//! | [`ResolutionError`] | one target | errored fuzz-target container |
//! | [`InstrumentationError`] | one definition | wrapped in [`ResolutionError`] |
//! | [`CorpusError`] | one target | errored fuzz-target container |
//!
//! Invocation failures are not errors here: they are [`crate::finding::Finding`]
//! values reported as failed dynamic tests.

use std::path::PathBuf;

use thiserror::Error;

/// Malformed configuration. Run-scoped and fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// An instrumentation glob could not be compiled.
    #[error("malformed instrumentation pattern `{pattern}`: {reason}")]
    MalformedPattern { pattern: String, reason: String },

    /// The fuzzing toggle holds a value that cannot be interpreted.
    #[error("fuzzing toggle {var} is not valid unicode")]
    InvalidToggle { var: &'static str },

    /// A configuration parameter has an unparsable value.
    #[error("invalid value `{value}` for configuration parameter `{key}`: {reason}")]
    InvalidParameter {
        key: String,
        value: String,
        reason: String,
    },
}

/// The instrumentation agent rejected a definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct InstrumentationError {
    pub reason: String,
}

impl InstrumentationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A definition could not be resolved inside an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// No definition source knows the name.
    #[error("definition `{name}` not found{}", required_by_suffix(.required_by))]
    NotFound {
        name: String,
        required_by: Option<String>,
    },

    /// The definition source returned something unusable for the name.
    #[error("definition `{name}` is malformed: {reason}")]
    Malformed { name: String, reason: String },

    /// The instrumentation agent failed on the definition.
    #[error("instrumentation of `{name}` failed: {source}")]
    Instrumentation {
        name: String,
        #[source]
        source: InstrumentationError,
    },

    /// The name is not reachable from the target the context was opened for.
    #[error("definition `{name}` is not reachable from fuzz target {target}")]
    Unreachable { name: String, target: String },

    /// The definition has no entry point with that name.
    #[error("definition `{class}` has no entry point `{method}`")]
    MissingEntryPoint { class: String, method: String },

    /// A context is already open for the target.
    #[error("an execution context is already open for fuzz target {target}")]
    ContextInUse { target: String },
}

fn required_by_suffix(required_by: &Option<String>) -> String {
    match required_by {
        Some(parent) => format!(" (required by `{parent}`)"),
        None => String::new(),
    }
}

/// Stored inputs could not be listed or written.
#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("failed to read stored inputs in {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist input to {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stored inputs are not configured: no base directory")]
    NoBaseDir,
}

//! Classified outcomes of a single invocation.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};

/// Error type recorded for panics escaping target code.
pub const PANIC_ERROR_TYPE: &str = "Panic";

/// Severity of a reported security issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
        };
        f.write_str(s)
    }
}

/// How a failure was raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// A sanitizer or the target reported a security issue.
    SecurityIssue { severity: Severity },
    /// An assertion in the target did not hold.
    Assertion,
    /// Any other error escaping the target, including panics.
    Runtime,
}

/// A failed invocation, carrying the original error's type and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    /// Type name of the original error, e.g. `SecurityIssueLow` or
    /// `PatternSyntaxError`.
    pub error_type: String,
    pub message: String,
}

impl Failure {
    pub fn security_issue(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::SecurityIssue { severity },
            error_type: format!("SecurityIssue{severity}"),
            message: message.into(),
        }
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Assertion,
            error_type: "AssertionFailed".into(),
            message: message.into(),
        }
    }

    pub fn runtime(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Runtime,
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        match self.kind {
            FailureKind::SecurityIssue { severity } => Some(severity),
            _ => None,
        }
    }

    pub fn is_security_issue(&self) -> bool {
        matches!(self.kind, FailureKind::SecurityIssue { .. })
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for Failure {}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Finding {
    Success,
    Failure(Failure),
}

impl Finding {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Success => None,
            Self::Failure(failure) => Some(failure),
        }
    }

    pub fn into_result(self) -> Result<(), Failure> {
        match self {
            Self::Success => Ok(()),
            Self::Failure(failure) => Err(failure),
        }
    }
}

impl From<Result<(), Failure>> for Finding {
    fn from(result: Result<(), Failure>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(failure) => Self::Failure(failure),
        }
    }
}

/// Run a body, converting an escaping panic into a runtime failure.
pub fn catch_invocation<F>(body: F) -> Finding
where
    F: FnOnce() -> Result<(), Failure>,
{
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result.into(),
        Err(payload) => Finding::Failure(Failure::runtime(
            PANIC_ERROR_TYPE,
            panic_message(payload.as_ref()),
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

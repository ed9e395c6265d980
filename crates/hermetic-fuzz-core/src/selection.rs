//! Per-run admission of fuzz targets.
//!
//! Fuzzing mode explores a single target until it produces a finding, so only
//! the first discovered target is admitted and every other one is reported as
//! skipped. Regression mode admits everything.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::mode::ExecutionMode;
use crate::target::FuzzTarget;

/// Decision for one discovered fuzz target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Admission {
    Admit,
    Skip { reason: String },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit)
    }
}

/// Admission decisions for one run, computed once.
#[derive(Debug, Clone, Default)]
pub struct TargetSelection {
    decisions: Vec<(FuzzTarget, Admission)>,
    index: HashMap<String, usize>,
    taken: HashSet<usize>,
}

impl TargetSelection {
    /// Decide admission for targets given in discovery order.
    pub fn select(mode: ExecutionMode, targets: &[FuzzTarget]) -> Self {
        let mut selection = Self::default();
        let admitted = match mode {
            ExecutionMode::Fuzzing => targets.first().map(FuzzTarget::key),
            ExecutionMode::Regression => None,
        };

        for target in targets {
            let key = target.key();
            if selection.index.contains_key(&key) {
                continue;
            }
            let admission = match mode {
                ExecutionMode::Regression => Admission::Admit,
                ExecutionMode::Fuzzing if admitted.as_deref() == Some(key.as_str()) => {
                    Admission::Admit
                }
                ExecutionMode::Fuzzing => Admission::Skip {
                    reason: format!(
                        "only one fuzz target runs per fuzzing run; {} was selected",
                        admitted.as_deref().unwrap_or_default()
                    ),
                },
            };
            debug!(target = %key, admitted = admission.is_admitted(), "fuzz target admission");
            selection.index.insert(key, selection.decisions.len());
            selection.decisions.push((target.clone(), admission));
        }
        selection
    }

    /// Decision for a target, or `None` if it was not part of discovery.
    pub fn admission(&self, target: &FuzzTarget) -> Option<&Admission> {
        self.index
            .get(&target.key())
            .map(|&i| &self.decisions[i].1)
    }

    /// Decision for the next execution of `target`.
    ///
    /// An admission is handed out once per run. A target discovered again
    /// after it was admitted is skipped, so no target executes twice.
    pub fn take_admission(&mut self, target: &FuzzTarget) -> Option<Admission> {
        let key = target.key();
        let i = *self.index.get(&key)?;
        let admission = &self.decisions[i].1;
        if !admission.is_admitted() {
            return Some(admission.clone());
        }
        if self.taken.insert(i) {
            Some(Admission::Admit)
        } else {
            debug!(target = %key, "fuzz target already executed in this run");
            Some(Admission::Skip {
                reason: format!("{key} was already executed in this run"),
            })
        }
    }

    pub fn admitted(&self) -> impl Iterator<Item = &FuzzTarget> {
        self.decisions
            .iter()
            .filter(|(_, a)| a.is_admitted())
            .map(|(t, _)| t)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &FuzzTarget> {
        self.decisions
            .iter()
            .filter(|(_, a)| !a.is_admitted())
            .map(|(t, _)| t)
    }

    pub fn decisions(&self) -> &[(FuzzTarget, Admission)] {
        &self.decisions
    }
}

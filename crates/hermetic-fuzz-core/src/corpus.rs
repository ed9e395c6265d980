//! Stored inputs replayed in regression mode.
//!
//! A target's stored inputs live under `<basedir>/<class>/<method>/`, one
//! file per input, labelled by file name. Findings produced while fuzzing are
//! written back into the same directory as `crash-<sha256>` so the next
//! regression run replays them.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::CorpusError;
use crate::target::FuzzTarget;

/// Display label of the synthetic input used when nothing is stored.
pub const EMPTY_INPUT_LABEL: &str = "<empty input>";

/// One input replayed as its own dynamic test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayInput {
    pub label: String,
    pub data: Vec<u8>,
}

impl ReplayInput {
    pub fn new(label: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }

    /// The synthetic empty input.
    pub fn empty() -> Self {
        Self::new(EMPTY_INPUT_LABEL, Vec::new())
    }
}

/// Inputs to replay for `stored`: the stored ones, or the single empty input
/// when there are none.
pub fn replay_inputs_or_empty(stored: Vec<ReplayInput>) -> Vec<ReplayInput> {
    if stored.is_empty() {
        vec![ReplayInput::empty()]
    } else {
        stored
    }
}

/// File name a failing input is persisted under.
pub fn crash_file_name(data: &[u8]) -> String {
    format!("crash-{}", hex::encode(Sha256::digest(data)))
}

/// Where replay inputs come from and where findings go.
pub trait ReplayInputSource: Send + Sync {
    /// Stored inputs for `target` in replay order. Possibly empty.
    fn list_replay_inputs(&self, target: &FuzzTarget) -> Result<Vec<ReplayInput>, CorpusError>;

    /// Store a failing input. Returns the label it will replay under, or
    /// `None` if this source does not keep findings.
    fn persist_finding(
        &self,
        _target: &FuzzTarget,
        _data: &[u8],
    ) -> Result<Option<String>, CorpusError> {
        Ok(None)
    }

    /// Human-readable location of `target`'s inputs, for reporting entries.
    fn location(&self, _target: &FuzzTarget) -> Option<String> {
        None
    }
}

/// Inputs stored as files below a base directory.
#[derive(Debug, Clone)]
pub struct DirectoryCorpus {
    base_dir: PathBuf,
}

impl DirectoryCorpus {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn target_dir(&self, target: &FuzzTarget) -> PathBuf {
        self.base_dir
            .join(&target.class_name)
            .join(&target.method_name)
    }
}

impl ReplayInputSource for DirectoryCorpus {
    fn list_replay_inputs(&self, target: &FuzzTarget) -> Result<Vec<ReplayInput>, CorpusError> {
        let dir = self.target_dir(target);
        let read_err = |source| CorpusError::Read {
            path: dir.clone(),
            source,
        };

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "no stored inputs directory");
                return Ok(Vec::new());
            }
            Err(err) => return Err(read_err(err)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(read_err)?;
            if !entry.file_type().map_err(read_err)?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            files.push((name, entry.path()));
        }
        files.sort();

        let mut inputs = Vec::with_capacity(files.len());
        for (label, path) in files {
            let data = fs::read(&path).map_err(|source| CorpusError::Read { path, source })?;
            inputs.push(ReplayInput { label, data });
        }
        debug!(dir = %dir.display(), count = inputs.len(), "listed stored inputs");
        Ok(inputs)
    }

    fn persist_finding(
        &self,
        target: &FuzzTarget,
        data: &[u8],
    ) -> Result<Option<String>, CorpusError> {
        let dir = self.target_dir(target);
        fs::create_dir_all(&dir).map_err(|source| CorpusError::Write {
            path: dir.clone(),
            source,
        })?;

        let name = crash_file_name(data);
        let path = dir.join(&name);
        if !path.exists() {
            fs::write(&path, data).map_err(|source| CorpusError::Write {
                path: path.clone(),
                source,
            })?;
        }
        info!(target = %target, path = %path.display(), "persisted failing input");
        Ok(Some(name))
    }

    fn location(&self, target: &FuzzTarget) -> Option<String> {
        Some(self.target_dir(target).display().to_string())
    }
}

/// Inputs held in memory, keyed by target.
#[derive(Debug, Default)]
pub struct MemoryCorpus {
    inputs: RwLock<BTreeMap<String, Vec<ReplayInput>>>,
}

impl MemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, target: &FuzzTarget, input: ReplayInput) -> Self {
        self.add(target, input);
        self
    }

    pub fn add(&self, target: &FuzzTarget, input: ReplayInput) {
        self.inputs
            .write()
            .entry(target.key())
            .or_default()
            .push(input);
    }
}

impl ReplayInputSource for MemoryCorpus {
    fn list_replay_inputs(&self, target: &FuzzTarget) -> Result<Vec<ReplayInput>, CorpusError> {
        Ok(self
            .inputs
            .read()
            .get(&target.key())
            .cloned()
            .unwrap_or_default())
    }

    fn persist_finding(
        &self,
        target: &FuzzTarget,
        data: &[u8],
    ) -> Result<Option<String>, CorpusError> {
        let label = crash_file_name(data);
        let mut inputs = self.inputs.write();
        let stored = inputs.entry(target.key()).or_default();
        if !stored.iter().any(|i| i.label == label) {
            stored.push(ReplayInput::new(label.clone(), data));
        }
        Ok(Some(label))
    }
}

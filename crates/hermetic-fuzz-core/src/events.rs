//! Host framework event protocol.
//!
//! Containers (the engine, a test class, a fuzz target) and tests (unit tests,
//! dynamic tests registered by a fuzz target) are identified by segment paths
//! such as `[engine:hermetic-fuzz]/[class:com.example.FuzzTest]/[fuzz-target:fuzz(bytes)]/[invocation:#1]`.
//! Events are delivered to an [`EventListener`] as they happen.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::finding::Failure;

/// Engine segment value of every id produced by this crate.
pub const ENGINE_ID: &str = "hermetic-fuzz";

/// One `[kind:value]` element of a [`TestId`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub kind: String,
    pub value: String,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.kind, self.value)
    }
}

/// Hierarchical unique id of a container or test.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestId {
    segments: Vec<Segment>,
}

impl TestId {
    pub fn engine() -> Self {
        Self {
            segments: vec![Segment {
                kind: "engine".into(),
                value: ENGINE_ID.into(),
            }],
        }
    }

    pub fn append(&self, kind: impl Into<String>, value: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Segment {
            kind: kind.into(),
            value: value.into(),
        });
        Self { segments }
    }

    pub fn class(&self, name: &str) -> Self {
        self.append("class", name)
    }

    pub fn method(&self, signature: &str) -> Self {
        self.append("method", signature)
    }

    pub fn fuzz_target(&self, signature: &str) -> Self {
        self.append("fuzz-target", signature)
    }

    /// Id of the `n`th (1-based) dynamic test below this one.
    pub fn invocation(&self, n: usize) -> Self {
        self.append("invocation", format!("#{n}"))
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn last_segment(&self) -> Option<&Segment> {
        self.segments.last()
    }

    pub fn parent(&self) -> Option<Self> {
        (self.segments.len() > 1).then(|| Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    Container,
    Test,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDescriptor {
    pub id: TestId,
    pub display_name: String,
    pub kind: TestKind,
}

impl TestDescriptor {
    pub fn container(id: TestId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            kind: TestKind::Container,
        }
    }

    pub fn test(id: TestId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            kind: TestKind::Test,
        }
    }
}

/// Terminal state of a container or test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestResult {
    Successful,
    /// An invocation produced a failing finding.
    Failed(Failure),
    /// The target could not be prepared (resolution or instrumentation).
    Errored { error: String },
    /// The run was cancelled while the test was executing.
    Aborted { reason: String },
}

impl TestResult {
    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Successful)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    DynamicTestRegistered {
        descriptor: TestDescriptor,
    },
    Started {
        descriptor: TestDescriptor,
    },
    Skipped {
        descriptor: TestDescriptor,
        reason: String,
    },
    Finished {
        descriptor: TestDescriptor,
        result: TestResult,
    },
    ReportingEntryPublished {
        descriptor: TestDescriptor,
        entry: BTreeMap<String, String>,
    },
}

impl EngineEvent {
    pub fn descriptor(&self) -> &TestDescriptor {
        match self {
            Self::DynamicTestRegistered { descriptor }
            | Self::Started { descriptor }
            | Self::Skipped { descriptor, .. }
            | Self::Finished { descriptor, .. }
            | Self::ReportingEntryPublished { descriptor, .. } => descriptor,
        }
    }

    pub fn kind(&self) -> TestKind {
        self.descriptor().kind
    }

    pub fn display_name(&self) -> &str {
        &self.descriptor().display_name
    }

    pub fn result(&self) -> Option<&TestResult> {
        match self {
            Self::Finished { result, .. } => Some(result),
            _ => None,
        }
    }
}

/// Receives events in the order they occur.
pub trait EventListener {
    fn execution_event(&self, event: EngineEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl EventListener for NoopListener {
    fn execution_event(&self, _event: EngineEvent) {}
}

/// Records every event for later inspection.
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Mutex<Vec<EngineEvent>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_events(&self) -> Events {
        Events(self.events.lock().clone())
    }

    pub fn container_events(&self) -> Events {
        self.all_events().filter(|e| e.kind() == TestKind::Container)
    }

    pub fn test_events(&self) -> Events {
        self.all_events().filter(|e| e.kind() == TestKind::Test)
    }
}

impl EventListener for EventRecorder {
    fn execution_event(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

/// An ordered selection of recorded events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Events(Vec<EngineEvent>);

impl Events {
    pub fn filter(self, predicate: impl Fn(&EngineEvent) -> bool) -> Self {
        Self(self.0.into_iter().filter(|e| predicate(e)).collect())
    }

    pub fn started(self) -> Self {
        self.filter(|e| matches!(e, EngineEvent::Started { .. }))
    }

    pub fn finished(self) -> Self {
        self.filter(|e| matches!(e, EngineEvent::Finished { .. }))
    }

    pub fn skipped(self) -> Self {
        self.filter(|e| matches!(e, EngineEvent::Skipped { .. }))
    }

    pub fn dynamically_registered(self) -> Self {
        self.filter(|e| matches!(e, EngineEvent::DynamicTestRegistered { .. }))
    }

    pub fn reporting_entry_published(self) -> Self {
        self.filter(|e| matches!(e, EngineEvent::ReportingEntryPublished { .. }))
    }

    pub fn succeeded(self) -> Self {
        self.filter(|e| e.result().is_some_and(TestResult::is_successful))
    }

    pub fn failed(self) -> Self {
        self.filter(|e| matches!(e.result(), Some(TestResult::Failed(_))))
    }

    pub fn errored(self) -> Self {
        self.filter(|e| matches!(e.result(), Some(TestResult::Errored { .. })))
    }

    pub fn aborted(self) -> Self {
        self.filter(|e| matches!(e.result(), Some(TestResult::Aborted { .. })))
    }

    /// Events whose id starts with `prefix`.
    pub fn under(self, prefix: &TestId) -> Self {
        self.filter(|e| e.descriptor().id.segments().starts_with(prefix.segments()))
    }

    pub fn count(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EngineEvent> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<EngineEvent> {
        self.0
    }
}

impl IntoIterator for Events {
    type Item = EngineEvent;
    type IntoIter = std::vec::IntoIter<EngineEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A dynamic test that was registered but has not started.
#[must_use = "a registered test must be started"]
pub struct RegisteredTest<'l> {
    listener: &'l dyn EventListener,
    descriptor: TestDescriptor,
}

impl<'l> RegisteredTest<'l> {
    pub fn register(listener: &'l dyn EventListener, descriptor: TestDescriptor) -> Self {
        listener.execution_event(EngineEvent::DynamicTestRegistered {
            descriptor: descriptor.clone(),
        });
        Self {
            listener,
            descriptor,
        }
    }

    pub fn start(self) -> RunningTest<'l> {
        self.listener.execution_event(EngineEvent::Started {
            descriptor: self.descriptor.clone(),
        });
        RunningTest {
            listener: self.listener,
            descriptor: self.descriptor,
        }
    }
}

/// A dynamic test between its start and finish events.
#[must_use = "a running test must be finished"]
pub struct RunningTest<'l> {
    listener: &'l dyn EventListener,
    descriptor: TestDescriptor,
}

impl RunningTest<'_> {
    pub fn descriptor(&self) -> &TestDescriptor {
        &self.descriptor
    }

    pub fn finish(self, result: TestResult) {
        self.listener.execution_event(EngineEvent::Finished {
            descriptor: self.descriptor,
            result,
        });
    }
}

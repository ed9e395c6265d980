//! Fuzz Target Adapter.
//!
//! Bridges one admitted fuzz target into dynamic tests below its container:
//!
//! - **Fuzzing**: one dynamic test named [`FUZZING_DISPLAY_NAME`], driven by an
//!   [`Explorer`] in a bounded polling loop. The loop ends when an invocation
//!   fails, when the explorer stays idle for `max_idle_polls` consecutive
//!   polls (normal completion), or when the run is cancelled.
//! - **Regression**: one dynamic test per replay input, each invoked exactly
//!   once, in replay order. With no stored inputs the single synthetic
//!   [`EMPTY_INPUT_LABEL`] input is replayed.
//!
//! Events are emitted as they happen. The adapter never opens or closes the
//! execution context; the caller owns the handle.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::corpus::{replay_inputs_or_empty, ReplayInputSource, EMPTY_INPUT_LABEL};
use crate::error::CorpusError;
use crate::events::{EngineEvent, EventListener, RegisteredTest, TestDescriptor, TestResult};
use crate::explorer::{CancellationFlag, Explorer};
use crate::finding::{Failure, Finding};
use crate::isolation::ExecutionContextHandle;
use crate::mode::ExecutionMode;

/// Display name of the single dynamic test of a fuzzing run.
pub const FUZZING_DISPLAY_NAME: &str = "Fuzzing...";

/// Reporting-entry key carrying the seed provenance in fuzzing mode.
pub const INITIAL_INPUT_KEY: &str = "initial_input";
/// Reporting-entry key carrying the stored-input location in regression mode.
pub const INPUTS_KEY: &str = "inputs";
/// Reporting-entry key carrying the number of stored inputs in regression mode.
pub const REPLAY_INPUTS_KEY: &str = "replay_inputs";

/// Bounds of the fuzzing loop's wait for candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    /// Longest single wait for the next candidate.
    pub poll_interval: Duration,
    /// Consecutive empty polls after which exploration is considered done.
    pub max_idle_polls: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_idle_polls: 10,
        }
    }
}

/// Why a target's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopExit {
    /// An invocation produced a failing finding.
    Finding,
    /// The explorer produced nothing within the idle bound.
    EngineTimeout,
    /// Cancelled between invocations.
    Cancelled,
    /// Every replay input ran.
    Exhausted,
}

/// Summary of one adapter run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReport {
    /// Target identity, e.g. `com.example.FuzzTest::fuzz(bytes)`.
    pub target: String,
    pub mode: ExecutionMode,
    pub dynamic_tests: usize,
    pub invocations: usize,
    pub failures: usize,
    pub exit: LoopExit,
    /// First failing finding, if any.
    pub finding: Option<Failure>,
    /// Label the failing input was persisted under.
    pub persisted_as: Option<String>,
    pub elapsed_ms: u64,
}

/// Drives one admitted target's dynamic tests.
pub struct FuzzTargetAdapter<'a> {
    listener: &'a dyn EventListener,
    corpus: &'a dyn ReplayInputSource,
    poll: PollSettings,
    cancel: CancellationFlag,
    persist_findings: bool,
}

impl<'a> FuzzTargetAdapter<'a> {
    pub fn new(listener: &'a dyn EventListener, corpus: &'a dyn ReplayInputSource) -> Self {
        Self {
            listener,
            corpus,
            poll: PollSettings::default(),
            cancel: CancellationFlag::new(),
            persist_findings: false,
        }
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_persist_findings(mut self, persist: bool) -> Self {
        self.persist_findings = persist;
        self
    }

    /// Run the target below `container` in `mode`. The explorer is only
    /// consulted in fuzzing mode.
    ///
    /// Fails only if the stored inputs cannot be listed, before any dynamic
    /// test is registered.
    pub fn run(
        &self,
        container: &TestDescriptor,
        handle: &ExecutionContextHandle,
        mode: ExecutionMode,
        explorer: &mut dyn Explorer,
    ) -> Result<TargetReport, CorpusError> {
        match mode {
            ExecutionMode::Fuzzing => Ok(self.run_fuzzing(container, handle, explorer)),
            ExecutionMode::Regression => self.run_regression(container, handle),
        }
    }

    fn publish(&self, container: &TestDescriptor, entry: BTreeMap<String, String>) {
        self.listener
            .execution_event(EngineEvent::ReportingEntryPublished {
                descriptor: container.clone(),
                entry,
            });
    }

    fn run_fuzzing(
        &self,
        container: &TestDescriptor,
        handle: &ExecutionContextHandle,
        explorer: &mut dyn Explorer,
    ) -> TargetReport {
        let target = handle.target();
        let started = Instant::now();

        let provenance = explorer
            .initial_input(target)
            .unwrap_or_else(|| EMPTY_INPUT_LABEL.to_string());
        self.publish(
            container,
            BTreeMap::from([(INITIAL_INPUT_KEY.to_string(), provenance)]),
        );

        let descriptor = TestDescriptor::test(container.id.invocation(1), FUZZING_DISPLAY_NAME);
        let running = RegisteredTest::register(self.listener, descriptor).start();
        info!(target = %target, context = %handle.id(), "fuzzing started");

        let mut invocations = 0usize;
        let mut idle_polls = 0u32;
        let mut persisted_as = None;
        let (exit, finding) = loop {
            if self.cancel.is_cancelled() {
                break (LoopExit::Cancelled, None);
            }
            let Some(input) = explorer.next_candidate(handle, self.poll.poll_interval) else {
                idle_polls += 1;
                if idle_polls >= self.poll.max_idle_polls {
                    break (LoopExit::EngineTimeout, None);
                }
                continue;
            };
            idle_polls = 0;
            invocations += 1;

            if let Finding::Failure(failure) = explorer.invoke(handle, &input) {
                info!(
                    target = %target,
                    invocations,
                    error = %failure,
                    "fuzzing produced a finding"
                );
                if self.persist_findings {
                    persisted_as = self.persist(handle, &input);
                }
                break (LoopExit::Finding, Some(failure));
            }
        };

        let result = match (&exit, &finding) {
            (_, Some(failure)) => TestResult::Failed(failure.clone()),
            (LoopExit::Cancelled, None) => TestResult::Aborted {
                reason: format!("fuzzing cancelled after {invocations} invocations"),
            },
            _ => TestResult::Successful,
        };
        running.finish(result);
        debug!(target = %target, ?exit, invocations, "fuzzing loop exited");

        TargetReport {
            target: target.key(),
            mode: ExecutionMode::Fuzzing,
            dynamic_tests: 1,
            invocations,
            failures: usize::from(finding.is_some()),
            exit,
            finding,
            persisted_as,
            elapsed_ms: elapsed_ms(started),
        }
    }

    fn persist(&self, handle: &ExecutionContextHandle, input: &[u8]) -> Option<String> {
        match self.corpus.persist_finding(handle.target(), input) {
            Ok(label) => label,
            Err(err) => {
                warn!(target = %handle.target(), error = %err, "failed to persist failing input");
                None
            }
        }
    }

    fn run_regression(
        &self,
        container: &TestDescriptor,
        handle: &ExecutionContextHandle,
    ) -> Result<TargetReport, CorpusError> {
        let target = handle.target();
        let started = Instant::now();

        let stored = self.corpus.list_replay_inputs(target)?;
        let mut entry = BTreeMap::from([(REPLAY_INPUTS_KEY.to_string(), stored.len().to_string())]);
        if let Some(location) = self.corpus.location(target) {
            entry.insert(INPUTS_KEY.to_string(), location);
        }
        self.publish(container, entry);

        let inputs = replay_inputs_or_empty(stored);
        let mut report = TargetReport {
            target: target.key(),
            mode: ExecutionMode::Regression,
            dynamic_tests: 0,
            invocations: 0,
            failures: 0,
            exit: LoopExit::Exhausted,
            finding: None,
            persisted_as: None,
            elapsed_ms: 0,
        };

        for (i, input) in inputs.iter().enumerate() {
            if self.cancel.is_cancelled() {
                report.exit = LoopExit::Cancelled;
                break;
            }
            let descriptor = TestDescriptor::test(container.id.invocation(i + 1), &input.label);
            let running = RegisteredTest::register(self.listener, descriptor).start();
            report.dynamic_tests += 1;
            report.invocations += 1;

            let result = match handle.invoke(&input.data) {
                Finding::Success => TestResult::Successful,
                Finding::Failure(failure) => {
                    debug!(target = %target, input = %input.label, error = %failure, "replay failed");
                    report.failures += 1;
                    report.finding.get_or_insert_with(|| failure.clone());
                    TestResult::Failed(failure)
                }
            };
            running.finish(result);
        }

        report.elapsed_ms = elapsed_ms(started);
        info!(
            target = %target,
            tests = report.dynamic_tests,
            failures = report.failures,
            "regression replay finished"
        );
        Ok(report)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::corpus::{MemoryCorpus, ReplayInput};
    use crate::definition::{ClassPath, RawDefinition};
    use crate::events::{EventRecorder, TestId};
    use crate::explorer::{ChannelExplorer, MutationExplorer};
    use crate::finding::Severity;
    use crate::instrument::IdentityInstrumentor;
    use crate::isolation::{AmbientNamespace, IsolatedContexts};
    use crate::patterns::InstrumentationFilter;
    use crate::target::FuzzTarget;

    /// Fails on inputs starting with `!`.
    fn contexts() -> IsolatedContexts {
        let cp = ClassPath::new().with(RawDefinition::new("com.example.T").with_entry_point(
            "fuzz",
            |_, input| {
                if input.first() == Some(&b'!') {
                    Err(Failure::security_issue(Severity::High, "bang"))
                } else {
                    Ok(())
                }
            },
        ));
        IsolatedContexts::new(
            Arc::new(AmbientNamespace::new(Arc::new(cp))),
            Arc::new(InstrumentationFilter::compile("com.example.**").unwrap()),
            Arc::new(IdentityInstrumentor),
        )
    }

    fn target() -> FuzzTarget {
        FuzzTarget::new("com.example.T", "fuzz")
    }

    fn container() -> TestDescriptor {
        let id = TestId::engine().class("com.example.T").fuzz_target("fuzz(bytes)");
        TestDescriptor::container(id, "fuzz(bytes)")
    }

    fn quick_poll() -> PollSettings {
        PollSettings {
            poll_interval: Duration::from_millis(1),
            max_idle_polls: 2,
        }
    }

    fn event_name(event: &EngineEvent) -> &'static str {
        match event {
            EngineEvent::DynamicTestRegistered { .. } => "registered",
            EngineEvent::Started { .. } => "started",
            EngineEvent::Skipped { .. } => "skipped",
            EngineEvent::Finished { .. } => "finished",
            EngineEvent::ReportingEntryPublished { .. } => "entry",
        }
    }

    /// Records which events had been delivered when each input was applied.
    struct SnapshotExplorer<'r> {
        recorder: &'r EventRecorder,
        inner: ChannelExplorer,
        at_invoke: Vec<Vec<&'static str>>,
    }

    impl Explorer for SnapshotExplorer<'_> {
        fn initial_input(&self, target: &FuzzTarget) -> Option<String> {
            self.inner.initial_input(target)
        }

        fn next_candidate(
            &mut self,
            handle: &ExecutionContextHandle,
            wait: Duration,
        ) -> Option<Vec<u8>> {
            self.inner.next_candidate(handle, wait)
        }

        fn invoke(&mut self, handle: &ExecutionContextHandle, input: &[u8]) -> Finding {
            let delivered = self.recorder.all_events().iter().map(event_name).collect();
            self.at_invoke.push(delivered);
            handle.invoke(input)
        }
    }

    #[test]
    fn test_fuzzing_publishes_entry_before_first_invocation() {
        let contexts = contexts();
        let handle = contexts.open(&target()).unwrap();
        let recorder = EventRecorder::new();
        let corpus = MemoryCorpus::new();
        let adapter = FuzzTargetAdapter::new(&recorder, &corpus).with_poll(quick_poll());

        let (tx, inner) = ChannelExplorer::new();
        tx.send(b"ok".to_vec()).unwrap();
        tx.send(b"!boom".to_vec()).unwrap();
        let mut explorer = SnapshotExplorer {
            recorder: &recorder,
            inner,
            at_invoke: Vec::new(),
        };

        adapter
            .run(&container(), &handle, ExecutionMode::Fuzzing, &mut explorer)
            .unwrap();
        assert_eq!(
            explorer.at_invoke,
            vec![
                vec!["entry", "registered", "started"],
                vec!["entry", "registered", "started"],
            ]
        );
        let all: Vec<_> = recorder.all_events().iter().map(event_name).collect();
        assert_eq!(all, vec!["entry", "registered", "started", "finished"]);
    }

    #[test]
    fn test_regression_publishes_entry_before_first_registration() {
        let contexts = contexts();
        let handle = contexts.open(&target()).unwrap();
        let recorder = EventRecorder::new();
        let corpus = MemoryCorpus::new()
            .with(&target(), ReplayInput::new("a", b"a".to_vec()))
            .with(&target(), ReplayInput::new("b", b"!b".to_vec()));
        let adapter = FuzzTargetAdapter::new(&recorder, &corpus);

        let mut explorer = MutationExplorer::new(0);
        adapter
            .run(&container(), &handle, ExecutionMode::Regression, &mut explorer)
            .unwrap();

        let all: Vec<_> = recorder.all_events().iter().map(event_name).collect();
        assert_eq!(
            all,
            vec![
                "entry",
                "registered",
                "started",
                "finished",
                "registered",
                "started",
                "finished",
            ]
        );
    }

    #[test]
    fn test_fuzzing_stops_at_first_finding() {
        let contexts = contexts();
        let handle = contexts.open(&target()).unwrap();
        let recorder = EventRecorder::new();
        let corpus = MemoryCorpus::new();
        let adapter = FuzzTargetAdapter::new(&recorder, &corpus)
            .with_poll(quick_poll())
            .with_persist_findings(true);

        let (tx, explorer) = ChannelExplorer::new();
        let mut explorer = explorer.with_initial_input("seed-a");
        tx.send(b"ok".to_vec()).unwrap();
        tx.send(b"!boom".to_vec()).unwrap();
        tx.send(b"never".to_vec()).unwrap();

        let report = adapter
            .run(&container(), &handle, ExecutionMode::Fuzzing, &mut explorer)
            .unwrap();
        assert_eq!(report.exit, LoopExit::Finding);
        assert_eq!(report.invocations, 2);
        assert_eq!(report.finding.as_ref().unwrap().error_type, "SecurityIssueHigh");
        assert!(report.persisted_as.is_some());
        assert_eq!(corpus.list_replay_inputs(&target()).unwrap()[0].data, b"!boom");

        let entries = recorder.container_events().reporting_entry_published().into_vec();
        assert_eq!(entries.len(), 1);
        let EngineEvent::ReportingEntryPublished { entry, .. } = &entries[0] else {
            panic!("expected a reporting entry");
        };
        assert_eq!(entry[INITIAL_INPUT_KEY], "seed-a");

        let tests = recorder.test_events();
        assert_eq!(tests.clone().dynamically_registered().count(), 1);
        let finished = tests.finished().into_vec();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].display_name(), FUZZING_DISPLAY_NAME);
        assert!(matches!(finished[0].result(), Some(TestResult::Failed(_))));
    }

    #[test]
    fn test_fuzzing_idle_explorer_completes_normally() {
        let contexts = contexts();
        let handle = contexts.open(&target()).unwrap();
        let recorder = EventRecorder::new();
        let corpus = MemoryCorpus::new();
        let adapter = FuzzTargetAdapter::new(&recorder, &corpus).with_poll(quick_poll());

        let mut explorer = MutationExplorer::new(3)
            .with_seeds(vec![ReplayInput::new("a", b"a".to_vec())])
            .with_budget(0);
        let report = adapter
            .run(&container(), &handle, ExecutionMode::Fuzzing, &mut explorer)
            .unwrap();
        assert_eq!(report.exit, LoopExit::EngineTimeout);
        assert_eq!(report.invocations, 0);
        assert_eq!(recorder.test_events().succeeded().count(), 1);
    }

    #[test]
    fn test_fuzzing_cancelled_is_aborted() {
        let contexts = contexts();
        let handle = contexts.open(&target()).unwrap();
        let recorder = EventRecorder::new();
        let corpus = MemoryCorpus::new();
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let adapter = FuzzTargetAdapter::new(&recorder, &corpus).with_cancellation(cancel);

        let mut explorer = MutationExplorer::new(0);
        let report = adapter
            .run(&container(), &handle, ExecutionMode::Fuzzing, &mut explorer)
            .unwrap();
        assert_eq!(report.exit, LoopExit::Cancelled);
        assert_eq!(recorder.test_events().aborted().count(), 1);
    }

    #[test]
    fn test_regression_without_inputs_replays_empty() {
        let contexts = contexts();
        let handle = contexts.open(&target()).unwrap();
        let recorder = EventRecorder::new();
        let corpus = MemoryCorpus::new();
        let adapter = FuzzTargetAdapter::new(&recorder, &corpus);

        let mut explorer = MutationExplorer::new(0);
        let report = adapter
            .run(&container(), &handle, ExecutionMode::Regression, &mut explorer)
            .unwrap();
        assert_eq!(report.dynamic_tests, 1);
        assert_eq!(report.exit, LoopExit::Exhausted);
        assert_eq!(explorer.produced(), 0);

        let finished = recorder.test_events().finished().into_vec();
        assert_eq!(finished[0].display_name(), EMPTY_INPUT_LABEL);
        assert!(finished[0].result().unwrap().is_successful());
    }

    #[test]
    fn test_regression_one_test_per_input() {
        let contexts = contexts();
        let handle = contexts.open(&target()).unwrap();
        let recorder = EventRecorder::new();
        let corpus = MemoryCorpus::new()
            .with(&target(), ReplayInput::new("fine", b"x".to_vec()))
            .with(&target(), ReplayInput::new("crash-1", b"!x".to_vec()))
            .with(&target(), ReplayInput::new("also-fine", Vec::new()));
        let adapter = FuzzTargetAdapter::new(&recorder, &corpus);

        let mut explorer = MutationExplorer::new(0);
        let report = adapter
            .run(&container(), &handle, ExecutionMode::Regression, &mut explorer)
            .unwrap();
        assert_eq!(report.dynamic_tests, 3);
        assert_eq!(report.failures, 1);

        let names: Vec<_> = recorder
            .test_events()
            .started()
            .iter()
            .map(|e| e.display_name().to_string())
            .collect();
        assert_eq!(names, vec!["fine", "crash-1", "also-fine"]);
        assert_eq!(recorder.test_events().failed().count(), 1);

        let entry = recorder.container_events().reporting_entry_published().into_vec();
        let EngineEvent::ReportingEntryPublished { entry, .. } = &entry[0] else {
            panic!("expected a reporting entry");
        };
        assert_eq!(entry[REPLAY_INPUTS_KEY], "3");
    }
}

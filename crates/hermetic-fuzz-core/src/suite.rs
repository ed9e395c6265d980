//! Host framework driver.
//!
//! Runs discovered test classes in declaration order: unit tests execute in
//! the ambient namespace, fuzz targets go through selection, an isolated
//! execution context and the [`FuzzTargetAdapter`]. Containers are the engine,
//! each class, and each fuzz target.
//!
//! Target-scoped errors (resolution, stored inputs) mark that target's
//! container as errored and the run continues with its siblings.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::adapter::{FuzzTargetAdapter, PollSettings, TargetReport};
use crate::config::RunConfig;
use crate::corpus::{MemoryCorpus, ReplayInputSource};
use crate::definition::DefinitionSource;
use crate::error::ConfigurationError;
use crate::events::{
    EngineEvent, EventListener, TestDescriptor, TestId, TestResult, ENGINE_ID,
};
use crate::explorer::{CancellationFlag, Explorer, MutationExplorer};
use crate::finding::{catch_invocation, Failure, Finding};
use crate::instrument::Instrumentor;
use crate::isolation::{AmbientNamespace, IsolatedContexts};
use crate::mode::ExecutionMode;
use crate::selection::{Admission, TargetSelection};
use crate::target::FuzzTarget;

/// Seed of the default mutation explorer.
pub const DEFAULT_EXPLORER_SEED: u64 = 0x5eed;

/// Body of a plain unit test. Runs against the ambient namespace.
pub type UnitTestFn = dyn Fn(&AmbientNamespace) -> Result<(), Failure> + Send + Sync;

/// Builds the explorer for one admitted target in fuzzing mode.
pub type ExplorerFactory =
    dyn Fn(&FuzzTarget, &dyn ReplayInputSource) -> Box<dyn Explorer> + Send + Sync;

#[derive(Clone)]
pub struct UnitTest {
    pub name: String,
    body: Arc<UnitTestFn>,
}

impl UnitTest {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&AmbientNamespace) -> Result<(), Failure> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(body),
        }
    }

    pub fn signature(&self) -> String {
        format!("{}()", self.name)
    }
}

impl fmt::Debug for UnitTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitTest").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone)]
pub enum TestMethod {
    Unit(UnitTest),
    Fuzz(FuzzTarget),
}

/// A discovered test class: its methods in declaration order.
#[derive(Debug, Clone)]
pub struct TestClass {
    pub name: String,
    pub methods: Vec<TestMethod>,
}

impl TestClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn with_unit_test<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&AmbientNamespace) -> Result<(), Failure> + Send + Sync + 'static,
    {
        self.methods.push(TestMethod::Unit(UnitTest::new(name, body)));
        self
    }

    /// Add a fuzz-test method taking raw bytes.
    pub fn with_fuzz_target(mut self, method: impl Into<String>) -> Self {
        let target = FuzzTarget::new(self.name.clone(), method);
        self.methods.push(TestMethod::Fuzz(target));
        self
    }

    pub fn with_target(mut self, target: FuzzTarget) -> Self {
        self.methods.push(TestMethod::Fuzz(target));
        self
    }

    pub fn fuzz_targets(&self) -> impl Iterator<Item = &FuzzTarget> {
        self.methods.iter().filter_map(|m| match m {
            TestMethod::Fuzz(target) => Some(target),
            TestMethod::Unit(_) => None,
        })
    }
}

/// A target whose container finished as errored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetError {
    pub target: String,
    pub error: String,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub mode: ExecutionMode,
    pub targets: Vec<TargetReport>,
    pub skipped: Vec<String>,
    pub errored: Vec<TargetError>,
    pub unit_tests: usize,
    pub unit_failures: usize,
}

impl SuiteReport {
    fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            targets: Vec::new(),
            skipped: Vec::new(),
            errored: Vec::new(),
            unit_tests: 0,
            unit_failures: 0,
        }
    }

    pub fn failures(&self) -> usize {
        self.unit_failures + self.targets.iter().map(|t| t.failures).sum::<usize>()
    }
}

pub struct SuiteRunner {
    mode: ExecutionMode,
    contexts: IsolatedContexts,
    corpus: Arc<dyn ReplayInputSource>,
    poll: PollSettings,
    persist_findings: bool,
    cancel: CancellationFlag,
    explorers: Box<ExplorerFactory>,
}

impl SuiteRunner {
    pub fn new(mode: ExecutionMode, contexts: IsolatedContexts) -> Self {
        Self {
            mode,
            contexts,
            corpus: Arc::new(MemoryCorpus::new()),
            poll: PollSettings::default(),
            persist_findings: false,
            cancel: CancellationFlag::new(),
            explorers: Box::new(default_explorer),
        }
    }

    /// Wire a runner from validated configuration.
    pub fn from_config(
        config: &RunConfig,
        mode: ExecutionMode,
        source: Arc<dyn DefinitionSource>,
        instrumentor: Arc<dyn Instrumentor>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let filter = Arc::new(config.compile_filter()?);
        let ambient = Arc::new(AmbientNamespace::new(source));
        let contexts = IsolatedContexts::new(ambient, filter, instrumentor)
            .with_exempt(config.exempt_namespaces());
        Ok(Self::new(mode, contexts)
            .with_corpus(config.corpus())
            .with_poll(config.poll_settings())
            .with_persist_findings(config.persist_findings))
    }

    pub fn with_corpus(mut self, corpus: Arc<dyn ReplayInputSource>) -> Self {
        self.corpus = corpus;
        self
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_persist_findings(mut self, persist: bool) -> Self {
        self.persist_findings = persist;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_explorers<F>(mut self, factory: F) -> Self
    where
        F: Fn(&FuzzTarget, &dyn ReplayInputSource) -> Box<dyn Explorer> + Send + Sync + 'static,
    {
        self.explorers = Box::new(factory);
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn contexts(&self) -> &IsolatedContexts {
        &self.contexts
    }

    pub fn ambient(&self) -> &Arc<AmbientNamespace> {
        self.contexts.ambient()
    }

    /// Execute `classes` in order, reporting to `listener`.
    pub fn run(&self, classes: &[TestClass], listener: &dyn EventListener) -> SuiteReport {
        let mut report = SuiteReport::new(self.mode);
        let discovered: Vec<FuzzTarget> = classes
            .iter()
            .flat_map(|c| c.fuzz_targets().cloned())
            .collect();
        let mut selection = TargetSelection::select(self.mode, &discovered);
        info!(
            mode = %self.mode,
            classes = classes.len(),
            fuzz_targets = discovered.len(),
            "starting run"
        );

        let engine = TestDescriptor::container(TestId::engine(), ENGINE_ID);
        listener.execution_event(EngineEvent::Started {
            descriptor: engine.clone(),
        });

        for class in classes {
            let class_id = engine.id.class(&class.name);
            let class_desc = TestDescriptor::container(class_id.clone(), &class.name);
            listener.execution_event(EngineEvent::Started {
                descriptor: class_desc.clone(),
            });

            for method in &class.methods {
                match method {
                    TestMethod::Unit(test) => {
                        self.run_unit_test(&class_id, test, listener, &mut report)
                    }
                    TestMethod::Fuzz(target) => {
                        self.run_fuzz_target(&class_id, target, &mut selection, listener, &mut report)
                    }
                }
            }

            listener.execution_event(EngineEvent::Finished {
                descriptor: class_desc,
                result: TestResult::Successful,
            });
        }

        listener.execution_event(EngineEvent::Finished {
            descriptor: engine,
            result: TestResult::Successful,
        });
        info!(
            targets = report.targets.len(),
            skipped = report.skipped.len(),
            errored = report.errored.len(),
            failures = report.failures(),
            "run finished"
        );
        report
    }

    fn run_unit_test(
        &self,
        class_id: &TestId,
        test: &UnitTest,
        listener: &dyn EventListener,
        report: &mut SuiteReport,
    ) {
        let signature = test.signature();
        let descriptor = TestDescriptor::test(class_id.method(&signature), &signature);
        if self.cancel.is_cancelled() {
            listener.execution_event(EngineEvent::Skipped {
                descriptor,
                reason: "run cancelled".into(),
            });
            return;
        }

        listener.execution_event(EngineEvent::Started {
            descriptor: descriptor.clone(),
        });
        report.unit_tests += 1;
        let ambient: &AmbientNamespace = self.contexts.ambient();
        let result = match catch_invocation(|| (test.body)(ambient)) {
            Finding::Success => TestResult::Successful,
            Finding::Failure(failure) => {
                report.unit_failures += 1;
                TestResult::Failed(failure)
            }
        };
        listener.execution_event(EngineEvent::Finished { descriptor, result });
    }

    fn run_fuzz_target(
        &self,
        class_id: &TestId,
        target: &FuzzTarget,
        selection: &mut TargetSelection,
        listener: &dyn EventListener,
        report: &mut SuiteReport,
    ) {
        let signature = target.signature();
        let container = TestDescriptor::container(class_id.fuzz_target(&signature), &signature);

        let admission = selection
            .take_admission(target)
            .unwrap_or(Admission::Admit);
        if let Admission::Skip { reason } = admission {
            listener.execution_event(EngineEvent::Skipped {
                descriptor: container,
                reason,
            });
            report.skipped.push(target.key());
            return;
        }
        if self.cancel.is_cancelled() {
            listener.execution_event(EngineEvent::Skipped {
                descriptor: container,
                reason: "run cancelled".into(),
            });
            report.skipped.push(target.key());
            return;
        }

        listener.execution_event(EngineEvent::Started {
            descriptor: container.clone(),
        });

        let handle = match self.contexts.open(target) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(target = %target, error = %err, "failed to open execution context");
                self.finish_errored(&container, target, err.to_string(), listener, report);
                return;
            }
        };

        let adapter = FuzzTargetAdapter::new(listener, self.corpus.as_ref())
            .with_poll(self.poll)
            .with_cancellation(self.cancel.clone())
            .with_persist_findings(self.persist_findings);
        let mut explorer = (self.explorers)(target, self.corpus.as_ref());
        let outcome = adapter.run(&container, &handle, self.mode, explorer.as_mut());
        self.contexts.close(handle);

        match outcome {
            Ok(target_report) => {
                report.targets.push(target_report);
                listener.execution_event(EngineEvent::Finished {
                    descriptor: container,
                    result: TestResult::Successful,
                });
            }
            Err(err) => {
                warn!(target = %target, error = %err, "failed to list stored inputs");
                self.finish_errored(&container, target, err.to_string(), listener, report);
            }
        }
    }

    fn finish_errored(
        &self,
        container: &TestDescriptor,
        target: &FuzzTarget,
        error: String,
        listener: &dyn EventListener,
        report: &mut SuiteReport,
    ) {
        report.errored.push(TargetError {
            target: target.key(),
            error: error.clone(),
        });
        listener.execution_event(EngineEvent::Finished {
            descriptor: container.clone(),
            result: TestResult::Errored { error },
        });
    }
}

impl fmt::Debug for SuiteRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteRunner")
            .field("mode", &self.mode)
            .field("contexts", &self.contexts)
            .field("poll", &self.poll)
            .finish()
    }
}

/// Mutation explorer seeded with the target's stored inputs.
fn default_explorer(target: &FuzzTarget, corpus: &dyn ReplayInputSource) -> Box<dyn Explorer> {
    let seeds = corpus.list_replay_inputs(target).unwrap_or_else(|err| {
        warn!(target = %target, error = %err, "ignoring unreadable seeds");
        Vec::new()
    });
    Box::new(MutationExplorer::new(DEFAULT_EXPLORER_SEED).with_seeds(seeds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ClassPath, RawDefinition};
    use crate::events::EventRecorder;
    use crate::instrument::IdentityInstrumentor;
    use crate::patterns::InstrumentationFilter;

    fn runner(mode: ExecutionMode, cp: ClassPath) -> SuiteRunner {
        let contexts = IsolatedContexts::new(
            Arc::new(AmbientNamespace::new(Arc::new(cp))),
            Arc::new(InstrumentationFilter::empty()),
            Arc::new(IdentityInstrumentor),
        );
        SuiteRunner::new(mode, contexts)
    }

    fn ok_class_path() -> ClassPath {
        ClassPath::new().with(
            RawDefinition::new("com.example.T")
                .with_entry_point("a", |_, _| Ok(()))
                .with_entry_point("b", |_, _| Ok(())),
        )
    }

    #[test]
    fn test_resolution_error_fails_only_that_target() {
        let classes = vec![TestClass::new("com.example.T")
            .with_fuzz_target("missing")
            .with_fuzz_target("a")];
        let recorder = EventRecorder::new();
        let report = runner(ExecutionMode::Regression, ok_class_path()).run(&classes, &recorder);

        assert_eq!(report.errored.len(), 1);
        assert_eq!(report.targets.len(), 1);
        assert_eq!(recorder.container_events().errored().count(), 1);
        assert_eq!(recorder.test_events().succeeded().count(), 1);
    }

    #[test]
    fn test_unit_test_panics_are_failures() {
        let classes = vec![TestClass::new("com.example.T")
            .with_unit_test("boom", |_| panic!("kaboom"))
            .with_unit_test("fine", |_| Ok(()))];
        let recorder = EventRecorder::new();
        let report = runner(ExecutionMode::Regression, ok_class_path()).run(&classes, &recorder);

        assert_eq!(report.unit_tests, 2);
        assert_eq!(report.unit_failures, 1);
        let failed = recorder.test_events().failed().into_vec();
        assert_eq!(failed[0].display_name(), "boom()");
    }

    #[test]
    fn test_engine_and_class_containers_wrap_everything() {
        let classes = vec![TestClass::new("com.example.T").with_fuzz_target("a")];
        let recorder = EventRecorder::new();
        runner(ExecutionMode::Regression, ok_class_path()).run(&classes, &recorder);

        let containers = recorder.container_events().into_vec();
        assert_eq!(containers.first().unwrap().display_name(), ENGINE_ID);
        assert_eq!(containers.last().unwrap().display_name(), ENGINE_ID);
        assert!(matches!(containers.last(), Some(EngineEvent::Finished { .. })));
        assert_eq!(recorder.container_events().started().count(), 3);
        assert_eq!(recorder.container_events().finished().count(), 3);
    }

    #[test]
    fn test_cancelled_run_skips_remaining_work() {
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let classes = vec![TestClass::new("com.example.T")
            .with_fuzz_target("a")
            .with_unit_test("u", |_| Ok(()))];
        let recorder = EventRecorder::new();
        let report = runner(ExecutionMode::Fuzzing, ok_class_path())
            .with_cancellation(cancel)
            .run(&classes, &recorder);

        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.unit_tests, 0);
        assert_eq!(recorder.all_events().skipped().count(), 2);
    }

    #[test]
    fn test_repeated_fuzz_target_runs_once_when_fuzzing() {
        let classes = vec![TestClass::new("com.example.T")
            .with_fuzz_target("a")
            .with_fuzz_target("a")];
        let recorder = EventRecorder::new();
        let runner = runner(ExecutionMode::Fuzzing, ok_class_path())
            .with_poll(PollSettings {
                poll_interval: std::time::Duration::from_millis(1),
                max_idle_polls: 1,
            })
            .with_explorers(|_, _| Box::new(MutationExplorer::new(3).with_budget(3)));
        let report = runner.run(&classes, &recorder);

        assert_eq!(report.targets.len(), 1);
        assert_eq!(report.targets[0].invocations, 3);
        assert_eq!(report.skipped, vec![FuzzTarget::new("com.example.T", "a").key()]);
        assert_eq!(recorder.test_events().dynamically_registered().count(), 1);
        assert_eq!(recorder.container_events().skipped().count(), 1);
        assert_eq!(runner.contexts().history().len(), 1);
    }

    #[test]
    fn test_contexts_are_released_after_each_target() {
        let classes = vec![TestClass::new("com.example.T")
            .with_fuzz_target("a")
            .with_fuzz_target("b")];
        let runner = runner(ExecutionMode::Regression, ok_class_path());
        runner.run(&classes, &EventRecorder::new());
        assert_eq!(runner.contexts().open_count(), 0);
        assert_eq!(runner.contexts().history().len(), 2);
    }
}

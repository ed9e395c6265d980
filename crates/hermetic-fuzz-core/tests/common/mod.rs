#![allow(dead_code)]
//! Shared fixtures for hermetic instrumentation tests.
//!
//! The class path models a test class with two fuzz targets and two unit
//! tests. Both fuzz targets call into a vulnerable class whose sanitizer hook
//! only fires when the class was instrumented; uninstrumented, the same call
//! surfaces the underlying pattern error instead.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hermetic_fuzz_core::config::{
    BASEDIR_KEY, EXEMPT_KEY, INSTRUMENT_KEY, MAX_IDLE_POLLS_KEY, PERSIST_FINDINGS_KEY,
    POLL_INTERVAL_KEY,
};
use hermetic_fuzz_core::{
    ClassPath, CoverageInstrumentor, EngineEvent, EventRecorder, Events, ExecutionMode, Failure,
    RawDefinition, RunConfig, Severity, SuiteReport, SuiteRunner, TestClass, TestKind, TestResult,
};

pub const TEST_CLASS: &str = "com.example.HermeticInstrumentationTest";
pub const VULNERABLE_FUZZ_CLASS: &str = "com.example.VulnerableFuzzClass";
pub const VULNERABLE_UNIT_CLASS: &str = "com.example.VulnerableUnitClass";
pub const ASSERTIONS: &str = "org.junit.jupiter.api.Assertions";
pub const DATA_PROVIDER: &str = hermetic_fuzz_core::DATA_PROVIDER_TYPE;
pub const HOST_NAMESPACE: &str = "org.junit";

pub const INSTRUMENT_RULES: &str = "com.other.package.**,com.example.**,com.yet.another.package.*";

pub const PATTERN_ERROR: &str = "PatternSyntaxError";
pub const SECURITY_ISSUE_LOW: &str = "SecurityIssueLow";

/// Compiles the input as a pattern. The sanitizer hook reports any call as a
/// regex injection; without it the malformed pattern blows up.
fn vulnerable_class(name: &str) -> RawDefinition {
    RawDefinition::new(name)
        .with_code(b"compile-pattern".to_vec())
        .with_reference(DATA_PROVIDER)
        .with_entry_point("vulnerable_method", |ctx, _input| {
            if ctx.hooks_active() {
                Err(Failure::security_issue(
                    Severity::Low,
                    "Regular Expression Injection: unescaped user input reached Pattern.compile",
                ))
            } else {
                Err(Failure::runtime(
                    PATTERN_ERROR,
                    "Unclosed group near index 1",
                ))
            }
        })
}

fn fuzz_test_entry(ctx: &mut hermetic_fuzz_core::InvocationContext<'_>, input: &[u8]) -> Result<(), Failure> {
    ctx.resolve(ASSERTIONS)?;
    ctx.call(VULNERABLE_FUZZ_CLASS, "vulnerable_method", input)
}

pub fn class_path() -> ClassPath {
    ClassPath::new()
        .with(
            RawDefinition::new(TEST_CLASS)
                .with_code(b"test-class".to_vec())
                .with_reference(VULNERABLE_FUZZ_CLASS)
                .with_reference(ASSERTIONS)
                .with_reference(DATA_PROVIDER)
                .with_entry_point("fuzz_test_1", fuzz_test_entry)
                .with_entry_point("fuzz_test_2", fuzz_test_entry),
        )
        .with(vulnerable_class(VULNERABLE_FUZZ_CLASS))
        .with(vulnerable_class(VULNERABLE_UNIT_CLASS))
        .with(RawDefinition::new(ASSERTIONS))
        .with(RawDefinition::new(DATA_PROVIDER))
}

fn unit_test(ambient: &hermetic_fuzz_core::AmbientNamespace) -> Result<(), Failure> {
    ambient
        .invoke(VULNERABLE_UNIT_CLASS, "vulnerable_method", b"(")
        .into_result()
}

/// Methods in declaration order: fuzz, unit, fuzz, unit.
pub fn test_class() -> TestClass {
    TestClass::new(TEST_CLASS)
        .with_fuzz_target("fuzz_test_1")
        .with_unit_test("unit_test_1", unit_test)
        .with_fuzz_target("fuzz_test_2")
        .with_unit_test("unit_test_2", unit_test)
}

pub fn parameters(basedir: Option<&Path>) -> BTreeMap<String, String> {
    let mut params = BTreeMap::from([
        (INSTRUMENT_KEY.to_string(), INSTRUMENT_RULES.to_string()),
        (EXEMPT_KEY.to_string(), HOST_NAMESPACE.to_string()),
        (POLL_INTERVAL_KEY.to_string(), "1".to_string()),
        (MAX_IDLE_POLLS_KEY.to_string(), "2".to_string()),
    ]);
    if let Some(dir) = basedir {
        params.insert(BASEDIR_KEY.to_string(), dir.display().to_string());
        params.insert(PERSIST_FINDINGS_KEY.to_string(), "true".to_string());
    }
    params
}

pub fn runner(mode: ExecutionMode, basedir: Option<&Path>) -> SuiteRunner {
    let config = RunConfig::from_parameters(&parameters(basedir)).expect("valid configuration");
    assert_eq!(config.poll_settings().poll_interval, Duration::from_millis(1));
    SuiteRunner::from_config(
        &config,
        mode,
        Arc::new(class_path()),
        Arc::new(CoverageInstrumentor),
    )
    .expect("runner")
}

/// Run the fixture class once.
pub fn run(mode: ExecutionMode) -> (SuiteRunner, EventRecorder, SuiteReport) {
    let runner = runner(mode, None);
    let recorder = EventRecorder::new();
    let report = runner.run(&[test_class()], &recorder);
    (runner, recorder, report)
}

/// One event as `<type> <unique id>`, with the display name for tests and the
/// outcome for finished events.
pub fn step(event: &EngineEvent) -> String {
    let id = &event.descriptor().id;
    let mut line = match event {
        EngineEvent::DynamicTestRegistered { .. } => format!("registered {id}"),
        EngineEvent::Started { .. } => format!("started {id}"),
        EngineEvent::Skipped { .. } => format!("skipped {id}"),
        EngineEvent::Finished { .. } => format!("finished {id}"),
        EngineEvent::ReportingEntryPublished { .. } => format!("entry {id}"),
    };
    if event.kind() == TestKind::Test {
        line.push_str(&format!(" \"{}\"", event.display_name()));
    }
    match event.result() {
        Some(TestResult::Successful) => line.push_str(" -> ok"),
        Some(TestResult::Failed(failure)) => line.push_str(&format!(" -> {}", failure.error_type)),
        Some(TestResult::Errored { .. }) => line.push_str(" -> errored"),
        Some(TestResult::Aborted { .. }) => line.push_str(" -> aborted"),
        None => {}
    }
    line
}

pub fn trace(events: Events) -> Vec<String> {
    events.iter().map(step).collect()
}

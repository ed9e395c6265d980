//! Hermetic Fuzz Core
//!
//! Runs fuzz targets inside a host test framework without letting
//! instrumentation leak into the framework, the fuzzing machinery, or plain
//! unit tests.
//!
//! # Features
//!
//! - **Instrumentation scoping**: include/exclude globs decide which
//!   definitions are instrumented
//! - **Isolated execution contexts**: every fuzz target gets its own
//!   disposable namespace, re-resolved and re-instrumented from scratch
//! - **Two execution modes**: continuous exploration of a single target, or
//!   replay of stored inputs as ordinary regression tests
//! - **Host protocol**: dynamic-test registration, reporting entries and skip
//!   events delivered as they happen
//!
//! # Core Modules
//!
//! - [`patterns`]: instrumentation rules and the compiled filter
//! - [`mode`]: process-wide execution mode
//! - [`selection`]: per-run admission of fuzz targets
//! - [`isolation`]: ambient namespace and isolated execution contexts
//! - [`adapter`]: drives one admitted target's dynamic tests
//! - [`suite`]: runs test classes end to end
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hermetic_fuzz_core::{
//!     ClassPath, CoverageInstrumentor, EventRecorder, RunConfig, SuiteRunner, TestClass,
//! };
//!
//! let config = RunConfig::from_parameters(&params)?;
//! let runner = SuiteRunner::from_config(
//!     &config,
//!     hermetic_fuzz_core::resolve_mode()?,
//!     Arc::new(class_path),
//!     Arc::new(CoverageInstrumentor),
//! )?;
//!
//! let recorder = EventRecorder::new();
//! let report = runner.run(&[TestClass::new("com.example.FuzzTest").with_fuzz_target("fuzz")], &recorder);
//! ```

#![allow(clippy::result_large_err)]

pub mod adapter;
pub mod config;
pub mod corpus;
pub mod definition;
pub mod error;
pub mod events;
pub mod explorer;
pub mod finding;
pub mod instrument;
pub mod isolation;
pub mod mode;
pub mod patterns;
pub mod selection;
pub mod suite;
pub mod target;

// Re-export main types at crate root for convenience
pub use adapter::{FuzzTargetAdapter, LoopExit, PollSettings, TargetReport, FUZZING_DISPLAY_NAME};
pub use config::RunConfig;
pub use corpus::{
    DirectoryCorpus, MemoryCorpus, ReplayInput, ReplayInputSource, EMPTY_INPUT_LABEL,
};
pub use definition::{ClassPath, DefinitionSource, EntryPoint, RawDefinition};
pub use error::{ConfigurationError, CorpusError, InstrumentationError, ResolutionError};
pub use events::{
    EngineEvent, EventListener, EventRecorder, Events, TestDescriptor, TestId, TestKind,
    TestResult,
};
pub use explorer::{CancellationFlag, ChannelExplorer, Explorer, MutationExplorer};
pub use finding::{Failure, FailureKind, Finding, Severity};
pub use instrument::{CoverageInstrumentor, IdentityInstrumentor, Instrumentor};
pub use isolation::{
    AmbientNamespace, ContextId, ContextOrigin, ExecutionContextHandle, ExemptNamespaces,
    InvocationContext, IsolatedContexts, LoadRecord, LoadedDefinition, Namespace, CORE_NAMESPACE,
};
pub use mode::{resolve_mode, ExecutionMode, FUZZ_TOGGLE_VAR};
pub use patterns::{InstrumentationFilter, InstrumentationRule, RuleEffect};
pub use selection::{Admission, TargetSelection};
pub use suite::{SuiteReport, SuiteRunner, TestClass, TestMethod, UnitTest};
pub use target::{FuzzTarget, ParameterShape, DATA_PROVIDER_TYPE};

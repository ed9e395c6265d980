//! # Isolated Execution Contexts
//!
//! Every admitted fuzz target runs inside its own disposable namespace. The
//! namespace re-resolves the target's definition and everything transitively
//! reachable from it, passing each name selected by the
//! [`InstrumentationFilter`] through the [`Instrumentor`]. Two targets never
//! share a loaded definition, so instrumentation and static state cannot leak
//! from one target into another.
//!
//! Names under an exempt namespace (the host framework's and this crate's own,
//! [`CORE_NAMESPACE`]) are never loaded into an isolated namespace. They
//! always come from the process-wide [`AmbientNamespace`], which never
//! instruments anything.
//!
//! ```text
//!                 ┌──────────────────────┐
//!                 │   DefinitionSource   │  ◄── raw, uninstrumented
//!                 └──────────┬───────────┘
//!            ┌───────────────┼────────────────────┐
//!            ▼               ▼                    ▼
//!  ┌──────────────────┐ ┌──────────────┐  ┌──────────────┐
//!  │ AmbientNamespace │ │ context ctx-1│  │ context ctx-2│  ◄── one per target
//!  │ (framework, unit │ │ target T1    │  │ target T2    │
//!  │  tests, exempt)  │ └──────────────┘  └──────────────┘
//!  └──────────────────┘        ▲ exempt names resolve through ambient
//! ```
//!
//! ## Lifecycle
//!
//! [`IsolatedContexts::open`] builds the namespace eagerly and returns an
//! [`ExecutionContextHandle`]; after that the namespace is immutable.
//! [`IsolatedContexts::close`] consumes the handle. Dropping a handle without
//! closing it (cancellation, a panic unwinding through the run) releases the
//! context just the same.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::definition::{DefinitionSource, EntryPoint, RawDefinition};
use crate::error::ResolutionError;
use crate::finding::{catch_invocation, Failure, Finding};
use crate::instrument::Instrumentor;
use crate::patterns::InstrumentationFilter;
use crate::target::FuzzTarget;

/// Namespace of this crate. Always exempt from isolation.
pub const CORE_NAMESPACE: &str = "hermetic_fuzz";

/// Nested entry-point calls deeper than this fail the invocation.
pub const MAX_CALL_DEPTH: usize = 256;

/// Identity of an isolated context, unique within its [`IsolatedContexts`].
///
/// Ids are handed out in open order starting at 1; a rejected open takes none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Which namespace a definition was loaded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "namespace", content = "id", rename_all = "snake_case")]
pub enum ContextOrigin {
    Ambient,
    Isolated(ContextId),
}

impl fmt::Display for ContextOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ambient => f.write_str("ambient"),
            Self::Isolated(id) => write!(f, "{id}"),
        }
    }
}

// =============================================================================
// Loaded definitions
// =============================================================================

/// A definition made available in exactly one namespace.
///
/// Static state lives on the loaded definition, so every namespace starts with
/// its own empty statics.
#[derive(Debug)]
pub struct LoadedDefinition {
    name: String,
    code: Vec<u8>,
    instrumented: bool,
    origin: ContextOrigin,
    references: Vec<String>,
    entry_points: BTreeMap<String, EntryPoint>,
    statics: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl LoadedDefinition {
    fn new(raw: RawDefinition, code: Vec<u8>, instrumented: bool, origin: ContextOrigin) -> Self {
        Self {
            name: raw.name,
            code,
            instrumented,
            origin,
            references: raw.references,
            entry_points: raw.entry_points,
            statics: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn is_instrumented(&self) -> bool {
        self.instrumented
    }

    pub fn origin(&self) -> ContextOrigin {
        self.origin
    }

    pub fn references(&self) -> &[String] {
        &self.references
    }

    pub fn entry_point(&self, method: &str) -> Option<&EntryPoint> {
        self.entry_points.get(method)
    }

    pub fn static_value(&self, key: &str) -> Option<Vec<u8>> {
        self.statics.lock().get(key).cloned()
    }

    /// Set a static slot, returning the previous value.
    pub fn set_static(&self, key: impl Into<String>, value: Vec<u8>) -> Option<Vec<u8>> {
        self.statics.lock().insert(key.into(), value)
    }

    /// Run `f` with exclusive access to all static slots.
    pub fn with_statics<R>(&self, f: impl FnOnce(&mut BTreeMap<String, Vec<u8>>) -> R) -> R {
        f(&mut self.statics.lock())
    }
}

// =============================================================================
// Namespaces
// =============================================================================

/// Resolution of names to loaded definitions.
pub trait Namespace {
    fn resolve(&self, name: &str) -> Result<Arc<LoadedDefinition>, ResolutionError>;

    fn origin(&self) -> ContextOrigin;
}

/// Namespace prefixes that are never isolated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExemptNamespaces {
    prefixes: Vec<String>,
}

impl Default for ExemptNamespaces {
    fn default() -> Self {
        Self::core_only()
    }
}

impl ExemptNamespaces {
    /// Only this crate's own namespace.
    pub fn core_only() -> Self {
        Self {
            prefixes: vec![CORE_NAMESPACE.to_string()],
        }
    }

    /// This crate's namespace plus the host framework's.
    pub fn new<I, S>(host: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut exempt = Self::core_only();
        for prefix in host {
            let prefix = prefix.into();
            let prefix = prefix.trim().trim_end_matches('.').to_string();
            if !prefix.is_empty() && !exempt.prefixes.contains(&prefix) {
                exempt.prefixes.push(prefix);
            }
        }
        exempt
    }

    /// Whether `name` is the prefix itself or nested below it.
    pub fn is_exempt(&self, name: &str) -> bool {
        self.prefixes.iter().any(|prefix| {
            name.strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
        })
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}

/// The process-wide namespace used by the host framework, unit tests and
/// exempt names. Definitions are loaded lazily, never instrumented, and kept
/// for the lifetime of the namespace.
pub struct AmbientNamespace {
    source: Arc<dyn DefinitionSource>,
    loaded: RwLock<BTreeMap<String, Arc<LoadedDefinition>>>,
}

impl AmbientNamespace {
    pub fn new(source: Arc<dyn DefinitionSource>) -> Self {
        Self {
            source,
            loaded: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn source(&self) -> &Arc<dyn DefinitionSource> {
        &self.source
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.read().contains_key(name)
    }

    /// Names loaded so far, sorted.
    pub fn loaded_names(&self) -> Vec<String> {
        self.loaded.read().keys().cloned().collect()
    }

    /// Invoke an entry point of an ambient definition.
    pub fn invoke(&self, class: &str, method: &str, input: &[u8]) -> Finding {
        invoke_in(self, class, method, input)
    }
}

impl fmt::Debug for AmbientNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmbientNamespace")
            .field("loaded", &self.loaded.read().len())
            .finish()
    }
}

impl Namespace for AmbientNamespace {
    fn resolve(&self, name: &str) -> Result<Arc<LoadedDefinition>, ResolutionError> {
        if let Some(def) = self.loaded.read().get(name) {
            return Ok(def.clone());
        }

        let raw = self.source.find(name).ok_or_else(|| ResolutionError::NotFound {
            name: name.to_string(),
            required_by: None,
        })?;
        raw.validate(name).map_err(|reason| ResolutionError::Malformed {
            name: name.to_string(),
            reason,
        })?;
        let code = raw.code.clone();
        let def = Arc::new(LoadedDefinition::new(raw, code, false, ContextOrigin::Ambient));

        // Another caller may have loaded the same name meanwhile; the first one wins.
        let mut loaded = self.loaded.write();
        let def = loaded.entry(name.to_string()).or_insert(def).clone();
        debug!(name = %name, "loaded definition into ambient namespace");
        Ok(def)
    }

    fn origin(&self) -> ContextOrigin {
        ContextOrigin::Ambient
    }
}

// =============================================================================
// Invocation
// =============================================================================

impl From<ResolutionError> for Failure {
    fn from(err: ResolutionError) -> Self {
        Failure::runtime("ResolutionError", err.to_string())
    }
}

/// What an entry-point body sees while it runs: the namespace it was loaded
/// into and its own loaded definition.
pub struct InvocationContext<'a> {
    namespace: &'a dyn Namespace,
    current: Arc<LoadedDefinition>,
    depth: usize,
}

impl<'a> InvocationContext<'a> {
    fn new(namespace: &'a dyn Namespace, current: Arc<LoadedDefinition>) -> Self {
        Self {
            namespace,
            current,
            depth: 0,
        }
    }

    /// The definition whose entry point is running.
    pub fn current(&self) -> &Arc<LoadedDefinition> {
        &self.current
    }

    /// Origin of the namespace the invocation runs in.
    pub fn origin(&self) -> ContextOrigin {
        self.namespace.origin()
    }

    /// Whether the running definition went through the instrumentation agent,
    /// i.e. whether its sanitizer hooks are live.
    pub fn hooks_active(&self) -> bool {
        self.current.is_instrumented()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<LoadedDefinition>, ResolutionError> {
        self.namespace.resolve(name)
    }

    /// Call an entry point on another definition of the same namespace.
    pub fn call(&mut self, class: &str, method: &str, input: &[u8]) -> Result<(), Failure> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(Failure::runtime(
                "StackOverflow",
                format!("call depth exceeded {MAX_CALL_DEPTH} at {class}::{method}"),
            ));
        }
        let def = self.namespace.resolve(class)?;
        let entry = def
            .entry_point(method)
            .cloned()
            .ok_or_else(|| ResolutionError::MissingEntryPoint {
                class: class.to_string(),
                method: method.to_string(),
            })?;
        let mut nested = InvocationContext {
            namespace: self.namespace,
            current: def,
            depth: self.depth + 1,
        };
        entry.call(&mut nested, input)
    }
}

fn invoke_in(namespace: &dyn Namespace, class: &str, method: &str, input: &[u8]) -> Finding {
    catch_invocation(|| {
        let def = namespace.resolve(class)?;
        let entry = def
            .entry_point(method)
            .cloned()
            .ok_or_else(|| ResolutionError::MissingEntryPoint {
                class: class.to_string(),
                method: method.to_string(),
            })?;
        let mut ctx = InvocationContext::new(namespace, def);
        entry.call(&mut ctx, input)
    })
}

// =============================================================================
// Isolated contexts
// =============================================================================

/// One definition resolved into an isolated context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRecord {
    pub context: ContextId,
    pub target: String,
    pub name: String,
    pub instrumented: bool,
}

/// Totals reported when a context is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub context: ContextId,
    pub target: String,
    pub definitions: usize,
    pub instrumented: usize,
}

type Arena = Arc<Mutex<BTreeMap<String, ContextId>>>;

/// Holds a target's slot in the arena; releasing it on drop.
struct ContextLease {
    arena: Arena,
    key: String,
    id: ContextId,
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        let mut arena = self.arena.lock();
        if arena.get(&self.key) == Some(&self.id) {
            arena.remove(&self.key);
            debug!(target = %self.key, context = %self.id, "execution context released");
        }
    }
}

/// A private namespace for one fuzz target.
///
/// Created by [`IsolatedContexts::open`] right before the target's first
/// invocation; closed after its last. Not cloneable and never shared between
/// targets.
pub struct ExecutionContextHandle {
    id: ContextId,
    target: FuzzTarget,
    namespace: BTreeMap<String, Arc<LoadedDefinition>>,
    ambient: Arc<AmbientNamespace>,
    exempt: ExemptNamespaces,
    target_definition: Arc<LoadedDefinition>,
    entry: EntryPoint,
    _lease: ContextLease,
}

impl ExecutionContextHandle {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn target(&self) -> &FuzzTarget {
        &self.target
    }

    /// The loaded definition owning the fuzz-test method.
    pub fn target_definition(&self) -> &Arc<LoadedDefinition> {
        &self.target_definition
    }

    /// Definitions private to this context, by name.
    pub fn definitions(&self) -> impl Iterator<Item = &Arc<LoadedDefinition>> {
        self.namespace.values()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.namespace.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.namespace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespace.is_empty()
    }

    pub fn instrumented_count(&self) -> usize {
        self.namespace.values().filter(|d| d.is_instrumented()).count()
    }

    /// Invoke the fuzz-test method once with `input`.
    pub fn invoke(&self, input: &[u8]) -> Finding {
        catch_invocation(|| {
            let mut ctx = InvocationContext::new(self, self.target_definition.clone());
            self.entry.call(&mut ctx, input)
        })
    }
}

impl fmt::Debug for ExecutionContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContextHandle")
            .field("id", &self.id)
            .field("target", &self.target.key())
            .field("definitions", &self.namespace.len())
            .finish()
    }
}

impl Namespace for ExecutionContextHandle {
    fn resolve(&self, name: &str) -> Result<Arc<LoadedDefinition>, ResolutionError> {
        if self.exempt.is_exempt(name) {
            return self.ambient.resolve(name);
        }
        self.namespace
            .get(name)
            .cloned()
            .ok_or_else(|| ResolutionError::Unreachable {
                name: name.to_string(),
                target: self.target.key(),
            })
    }

    fn origin(&self) -> ContextOrigin {
        ContextOrigin::Isolated(self.id)
    }
}

/// Factory and arena for isolated execution contexts, keyed by target
/// identity. At most one context per target is open at any time.
pub struct IsolatedContexts {
    ambient: Arc<AmbientNamespace>,
    filter: Arc<InstrumentationFilter>,
    instrumentor: Arc<dyn Instrumentor>,
    exempt: ExemptNamespaces,
    arena: Arena,
    journal: Mutex<Vec<LoadRecord>>,
    next_id: AtomicU64,
}

impl IsolatedContexts {
    pub fn new(
        ambient: Arc<AmbientNamespace>,
        filter: Arc<InstrumentationFilter>,
        instrumentor: Arc<dyn Instrumentor>,
    ) -> Self {
        Self {
            ambient,
            filter,
            instrumentor,
            exempt: ExemptNamespaces::core_only(),
            arena: Arc::new(Mutex::new(BTreeMap::new())),
            journal: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_exempt(mut self, exempt: ExemptNamespaces) -> Self {
        self.exempt = exempt;
        self
    }

    pub fn ambient(&self) -> &Arc<AmbientNamespace> {
        &self.ambient
    }

    pub fn exempt(&self) -> &ExemptNamespaces {
        &self.exempt
    }

    /// Number of contexts currently open.
    pub fn open_count(&self) -> usize {
        self.arena.lock().len()
    }

    /// Every definition resolved into any isolated context so far.
    pub fn history(&self) -> Vec<LoadRecord> {
        self.journal.lock().clone()
    }

    /// Build a fresh namespace for `target`.
    ///
    /// Resolves the target's definition, the types its parameters reference,
    /// and their transitive references. Each
    /// non-exempt name is checked against the filter exactly once and, if
    /// selected, instrumented before it becomes visible.
    pub fn open(&self, target: &FuzzTarget) -> Result<ExecutionContextHandle, ResolutionError> {
        let key = target.key();
        let id = {
            let mut arena = self.arena.lock();
            if arena.contains_key(&key) {
                return Err(ResolutionError::ContextInUse { target: key });
            }
            let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
            arena.insert(key.clone(), id);
            id
        };
        // From here on any early return releases the slot.
        let lease = ContextLease {
            arena: self.arena.clone(),
            key: key.clone(),
            id,
        };

        let namespace = self.resolve_closure(target, id)?;

        let target_definition = if self.exempt.is_exempt(&target.class_name) {
            warn!(
                target = %key,
                "fuzz target lives in an exempt namespace and will not be isolated"
            );
            self.ambient.resolve(&target.class_name)?
        } else {
            namespace
                .get(&target.class_name)
                .cloned()
                .ok_or_else(|| ResolutionError::NotFound {
                    name: target.class_name.clone(),
                    required_by: None,
                })?
        };
        let entry = target_definition
            .entry_point(&target.method_name)
            .cloned()
            .ok_or_else(|| ResolutionError::MissingEntryPoint {
                class: target.class_name.clone(),
                method: target.method_name.clone(),
            })?;

        {
            let mut journal = self.journal.lock();
            for def in namespace.values() {
                journal.push(LoadRecord {
                    context: id,
                    target: key.clone(),
                    name: def.name().to_string(),
                    instrumented: def.is_instrumented(),
                });
            }
        }

        let handle = ExecutionContextHandle {
            id,
            target: target.clone(),
            namespace,
            ambient: self.ambient.clone(),
            exempt: self.exempt.clone(),
            target_definition,
            entry,
            _lease: lease,
        };
        info!(
            target = %key,
            context = %id,
            definitions = handle.len(),
            instrumented = handle.instrumented_count(),
            "opened isolated execution context"
        );
        Ok(handle)
    }

    fn resolve_closure(
        &self,
        target: &FuzzTarget,
        id: ContextId,
    ) -> Result<BTreeMap<String, Arc<LoadedDefinition>>, ResolutionError> {
        let mut namespace = BTreeMap::new();
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<(String, Option<String>)> = VecDeque::new();
        seen.insert(target.class_name.clone());
        queue.push_back((target.class_name.clone(), None));
        for ty in target.parameters.referenced_types() {
            if seen.insert(ty.to_string()) {
                queue.push_back((ty.to_string(), Some(target.class_name.clone())));
            }
        }

        while let Some((name, required_by)) = queue.pop_front() {
            if self.exempt.is_exempt(&name) {
                self.ambient.resolve(&name).map_err(|err| match err {
                    ResolutionError::NotFound { name, .. } => {
                        ResolutionError::NotFound { name, required_by }
                    }
                    other => other,
                })?;
                continue;
            }

            let raw = self
                .ambient
                .source()
                .find(&name)
                .ok_or_else(|| ResolutionError::NotFound {
                    name: name.clone(),
                    required_by: required_by.clone(),
                })?;
            raw.validate(&name)
                .map_err(|reason| ResolutionError::Malformed {
                    name: name.clone(),
                    reason,
                })?;

            let instrument = self.filter.should_instrument(&name);
            let code = if instrument {
                self.instrumentor
                    .instrument(&raw)
                    .map_err(|source| ResolutionError::Instrumentation {
                        name: name.clone(),
                        source,
                    })?
            } else {
                raw.code.clone()
            };

            for reference in &raw.references {
                if seen.insert(reference.clone()) {
                    queue.push_back((reference.clone(), Some(name.clone())));
                }
            }

            debug!(
                context = %id,
                name = %name,
                instrumented = instrument,
                "resolved definition into isolated context"
            );
            let def = LoadedDefinition::new(raw, code, instrument, ContextOrigin::Isolated(id));
            namespace.insert(name, Arc::new(def));
        }
        Ok(namespace)
    }

    /// Release a context after the target's last invocation.
    pub fn close(&self, handle: ExecutionContextHandle) -> ContextSummary {
        let summary = ContextSummary {
            context: handle.id,
            target: handle.target.key(),
            definitions: handle.len(),
            instrumented: handle.instrumented_count(),
        };
        drop(handle);
        info!(
            target = %summary.target,
            context = %summary.context,
            "closed isolated execution context"
        );
        summary
    }
}

impl fmt::Debug for IsolatedContexts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatedContexts")
            .field("exempt", &self.exempt)
            .field("open", &self.open_count())
            .finish()
    }
}

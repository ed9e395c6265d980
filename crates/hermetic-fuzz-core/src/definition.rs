//! Raw definitions and the sources they are resolved from.
//!
//! A [`RawDefinition`] is the unit the loader resolves: an opaque code blob
//! that the instrumentation agent may rewrite, the names it references
//! (supertypes, field types, types used by its code) and the entry points that
//! can be invoked once it is loaded into a namespace.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::finding::Failure;
use crate::isolation::InvocationContext;

/// Signature of an entry point body.
pub type EntryFn =
    dyn Fn(&mut InvocationContext<'_>, &[u8]) -> Result<(), Failure> + Send + Sync;

/// A named callable on a definition.
#[derive(Clone)]
pub struct EntryPoint(Arc<EntryFn>);

impl EntryPoint {
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&mut InvocationContext<'_>, &[u8]) -> Result<(), Failure> + Send + Sync + 'static,
    {
        Self(Arc::new(body))
    }

    pub fn call(&self, ctx: &mut InvocationContext<'_>, input: &[u8]) -> Result<(), Failure> {
        (self.0)(ctx, input)
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EntryPoint(..)")
    }
}

/// An unresolved, uninstrumented definition.
#[derive(Debug, Clone)]
pub struct RawDefinition {
    /// Fully-qualified, `.`-separated name.
    pub name: String,
    /// Opaque code passed to the instrumentation agent.
    pub code: Vec<u8>,
    /// Names this definition needs resolved alongside it.
    pub references: Vec<String>,
    pub entry_points: BTreeMap<String, EntryPoint>,
}

impl RawDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: Vec::new(),
            references: Vec::new(),
            entry_points: BTreeMap::new(),
        }
    }

    pub fn with_code(mut self, code: impl Into<Vec<u8>>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_reference(mut self, name: impl Into<String>) -> Self {
        self.references.push(name.into());
        self
    }

    pub fn with_entry_point<F>(mut self, method: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut InvocationContext<'_>, &[u8]) -> Result<(), Failure> + Send + Sync + 'static,
    {
        self.entry_points.insert(method.into(), EntryPoint::new(body));
        self
    }

    /// Structural checks the loader applies before making the definition
    /// available.
    pub fn validate(&self, requested: &str) -> Result<(), String> {
        if self.name != requested {
            return Err(format!("source returned `{}`", self.name));
        }
        if self.references.iter().any(|r| r.trim().is_empty()) {
            return Err("empty reference name".into());
        }
        Ok(())
    }
}

/// Where raw definitions come from. Shared by the ambient namespace and every
/// isolated context, so it must not hand out mutable state.
pub trait DefinitionSource: Send + Sync {
    fn find(&self, name: &str) -> Option<RawDefinition>;

    fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }
}

/// In-memory definition source.
#[derive(Debug, Clone, Default)]
pub struct ClassPath {
    definitions: BTreeMap<String, RawDefinition>,
}

impl ClassPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, definition: RawDefinition) -> Self {
        self.insert(definition);
        self
    }

    /// Add a definition. A later definition with the same name wins.
    pub fn insert(&mut self, definition: RawDefinition) {
        if self.definitions.contains_key(&definition.name) {
            warn!(
                name = %definition.name,
                "duplicate definition found, overwriting previous"
            );
        }
        self.definitions.insert(definition.name.clone(), definition);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl DefinitionSource for ClassPath {
    fn find(&self, name: &str) -> Option<RawDefinition> {
        self.definitions.get(name).cloned()
    }

    fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_path_lookup() {
        let cp = ClassPath::new()
            .with(RawDefinition::new("com.example.A").with_reference("com.example.B"))
            .with(RawDefinition::new("com.example.B"));

        assert_eq!(cp.len(), 2);
        assert!(cp.contains("com.example.A"));
        assert!(!cp.contains("com.example.C"));
        let a = cp.find("com.example.A").unwrap();
        assert_eq!(a.references, vec!["com.example.B".to_string()]);
    }

    #[test]
    fn test_duplicate_overwrites() {
        let cp = ClassPath::new()
            .with(RawDefinition::new("com.example.A").with_code(vec![1]))
            .with(RawDefinition::new("com.example.A").with_code(vec![2]));
        assert_eq!(cp.len(), 1);
        assert_eq!(cp.find("com.example.A").unwrap().code, vec![2]);
    }

    #[test]
    fn test_validate() {
        let def = RawDefinition::new("com.example.A");
        assert!(def.validate("com.example.A").is_ok());
        assert!(def.validate("com.example.B").is_err());

        let bad = RawDefinition::new("com.example.A").with_reference(" ");
        assert!(bad.validate("com.example.A").is_err());
    }
}

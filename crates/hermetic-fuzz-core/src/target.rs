//! Discovered fuzz targets.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Structured input accessor handed to data-provider targets. Lives in the
/// core namespace, so it always resolves through the ambient namespace.
pub const DATA_PROVIDER_TYPE: &str = "hermetic_fuzz.api.FuzzedDataProvider";

/// Declared parameter shape of a fuzz-test method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterShape {
    /// A single raw byte slice.
    Bytes,
    /// A structured data provider consuming the raw bytes.
    DataProvider,
    /// Typed parameters decoded from the raw bytes, by type name.
    Typed { types: Vec<String> },
}

impl ParameterShape {
    /// Definitions the parameters need before the target can be invoked.
    /// Unqualified type names (`u32`, `String`) are built in and need none.
    pub fn referenced_types(&self) -> Vec<&str> {
        match self {
            Self::Bytes => Vec::new(),
            Self::DataProvider => vec![DATA_PROVIDER_TYPE],
            Self::Typed { types } => types
                .iter()
                .map(String::as_str)
                .filter(|ty| ty.contains('.'))
                .collect(),
        }
    }
}

impl fmt::Display for ParameterShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes => write!(f, "bytes"),
            Self::DataProvider => write!(f, "provider"),
            Self::Typed { types } => write!(f, "{}", types.join(", ")),
        }
    }
}

/// A fuzz-test method found at discovery time. Read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FuzzTarget {
    /// Fully-qualified name of the owning definition.
    pub class_name: String,
    /// Entry point invoked with each input.
    pub method_name: String,
    pub parameters: ParameterShape,
}

impl FuzzTarget {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            parameters: ParameterShape::Bytes,
        }
    }

    pub fn with_parameters(mut self, parameters: ParameterShape) -> Self {
        self.parameters = parameters;
        self
    }

    /// Method name with its parameter shape, e.g. `fuzz_test_1(bytes)`.
    pub fn signature(&self) -> String {
        format!("{}({})", self.method_name, self.parameters)
    }

    /// Identity of the target within a run.
    pub fn key(&self) -> String {
        format!("{}::{}", self.class_name, self.signature())
    }
}

impl fmt::Display for FuzzTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

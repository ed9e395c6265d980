//! Instrumentation agent seam.
//!
//! The loader hands every definition selected by the
//! [`crate::patterns::InstrumentationFilter`] to an [`Instrumentor`] before
//! making it available in an isolated namespace. The agent is treated as a pure
//! transform of the code blob.

use crate::definition::RawDefinition;
use crate::error::InstrumentationError;

/// Transforms raw definition code into instrumented code.
pub trait Instrumentor: Send + Sync {
    fn instrument(&self, raw: &RawDefinition) -> Result<Vec<u8>, InstrumentationError>;
}

/// Leaves code untouched. Definitions still count as instrumented.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityInstrumentor;

impl Instrumentor for IdentityInstrumentor {
    fn instrument(&self, raw: &RawDefinition) -> Result<Vec<u8>, InstrumentationError> {
        Ok(raw.code.clone())
    }
}

/// Header marking code rewritten by [`CoverageInstrumentor`].
pub const COVERAGE_MAGIC: &[u8; 6] = b"HFZCOV";

/// Prepends a coverage header (`HFZCOV` + little-endian probe count) to the
/// code, one probe per entry point plus one for the definition body.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoverageInstrumentor;

impl CoverageInstrumentor {
    /// Probe count of instrumented code, or `None` if the header is missing.
    pub fn probe_count(code: &[u8]) -> Option<u32> {
        let rest = code.strip_prefix(COVERAGE_MAGIC.as_slice())?;
        let count: [u8; 4] = rest.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(count))
    }
}

impl Instrumentor for CoverageInstrumentor {
    fn instrument(&self, raw: &RawDefinition) -> Result<Vec<u8>, InstrumentationError> {
        if raw.code.starts_with(COVERAGE_MAGIC) {
            return Err(InstrumentationError::new("code already carries coverage probes"));
        }
        let probes = u32::try_from(raw.entry_points.len() + 1)
            .map_err(|_| InstrumentationError::new("too many entry points"))?;

        let mut code = Vec::with_capacity(COVERAGE_MAGIC.len() + 4 + raw.code.len());
        code.extend_from_slice(COVERAGE_MAGIC);
        code.extend_from_slice(&probes.to_le_bytes());
        code.extend_from_slice(&raw.code);
        Ok(code)
    }
}

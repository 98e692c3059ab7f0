use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, SandboxError};

/// The value a guest script left in its result slot.
///
/// Table cells are plain JSON scalars, except where JSON cannot carry the
/// value faithfully. Those arrive as single-key objects:
/// `{"$int": "<digits>"}`, `{"$float": "NaN" | "Infinity" | "-Infinity"}`,
/// and `{"$timestamp": "<ISO 8601>"}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeclaredResult {
    /// Nothing was assigned to the slot.
    Absent,
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        /// Set when the guest stopped exporting rows at the row ceiling.
        #[serde(default)]
        truncated: bool,
    },
    /// Non-tabular value, already rendered as text by the guest.
    Scalar { text: String },
}

impl DeclaredResult {
    /// Decode the contents of the result slot.
    pub fn from_slot(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SandboxError::Protocol(format!("result slot: {e}")))
    }

    pub fn is_tabular(&self) -> bool {
        matches!(self, Self::Table { .. })
    }
}

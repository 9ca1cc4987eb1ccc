use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One user's recorded state for one catalog item.
///
/// Entries are created implicitly on first write and only ever removed by an
/// explicit per-item delete or a full progress reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    /// Completion flag
    pub done: bool,

    /// Free-text annotation; empty string is a valid note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    /// Monotonic stamp in whole seconds, used only for ordering writes.
    /// For a given item this never decreases over the life of the record.
    #[serde(default)]
    pub version: i64,
}

impl ProgressEntry {
    pub fn new(done: bool, note: Option<String>, version: i64) -> Self {
        Self {
            done,
            note,
            version,
        }
    }
}

/// The client-side view of a user's full progress, keyed by item id
pub type ProgressMap = HashMap<String, ProgressEntry>;

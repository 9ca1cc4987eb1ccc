use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tally_core::{ProgressEntry, ProgressMap};

/// A progress entry as it travels on the wire.
///
/// Field names are part of the protocol: `{done, note (omitted when absent),
/// updatedAt: integer seconds}`, keyed by item id in the surrounding map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEntry {
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub updated_at: i64,
}

impl From<ProgressEntry> for WireEntry {
    fn from(e: ProgressEntry) -> Self {
        WireEntry {
            done: e.done,
            note: e.note,
            updated_at: e.version,
        }
    }
}

impl From<WireEntry> for ProgressEntry {
    fn from(w: WireEntry) -> Self {
        ProgressEntry::new(w.done, w.note, w.updated_at)
    }
}

/// Body of `GET /api/progress` and of the batch-replace `PUT`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub collected: HashMap<String, WireEntry>,
}

impl ProgressSnapshot {
    pub fn from_map(map: ProgressMap) -> Self {
        ProgressSnapshot {
            collected: map.into_iter().map(|(k, v)| (k, v.into())).collect(),
        }
    }

    pub fn into_map(self) -> ProgressMap {
        self.collected
            .into_iter()
            .map(|(k, v)| (k, v.into()))
            .collect()
    }
}

/// Body of `POST /api/progress`: one conditional single-item write
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertRequest {
    pub item_id: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub updated_at: i64,
}

/// Acknowledgement for a single write or a batch replace.
///
/// A conflict response signals "pull the authoritative state" without
/// carrying that state; the client performs a separate fetch. Batch replies
/// additionally report how many of the submitted entries were applied so the
/// caller can react to a partial conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub conflict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

impl WriteAck {
    pub fn applied_ack() -> Self {
        WriteAck {
            ok: true,
            conflict: false,
            applied: None,
            total: None,
        }
    }

    pub fn stale() -> Self {
        WriteAck {
            ok: false,
            conflict: true,
            applied: None,
            total: None,
        }
    }

    pub fn batch(applied: usize, total: usize) -> Self {
        WriteAck {
            ok: applied == total,
            conflict: applied < total,
            applied: Some(applied),
            total: Some(total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_entry_field_names_are_stable() {
        let entry = WireEntry {
            done: true,
            note: Some("behind the shrine".into()),
            updated_at: 1_700_000_000,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(
            json,
            r#"{"done":true,"note":"behind the shrine","updatedAt":1700000000}"#
        );
    }

    #[test]
    fn absent_note_is_omitted() {
        let entry = WireEntry {
            done: false,
            note: None,
            updated_at: 5,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("note"));
    }

    #[test]
    fn empty_note_is_not_treated_as_absent() {
        let json = r#"{"done":true,"note":"","updatedAt":1}"#;
        let entry: WireEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.note.as_deref(), Some(""));
    }

    #[test]
    fn upsert_request_uses_camel_case() {
        let req = UpsertRequest {
            item_id: "spirit-ox".into(),
            done: true,
            note: None,
            updated_at: 100,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""itemId":"spirit-ox""#));
        assert!(json.contains(r#""updatedAt":100"#));
    }

    #[test]
    fn batch_ack_reports_partial_conflict() {
        let ack = WriteAck::batch(2, 5);
        assert!(!ack.ok);
        assert!(ack.conflict);
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains(r#""applied":2"#));
        assert!(json.contains(r#""total":5"#));

        let full = WriteAck::batch(3, 3);
        assert!(full.ok && !full.conflict);
    }

    #[test]
    fn clean_ack_omits_conflict_flag() {
        let json = serde_json::to_string(&WriteAck::applied_ack()).unwrap();
        assert_eq!(json, r#"{"ok":true}"#);
    }

    #[test]
    fn snapshot_round_trips_through_core_map() {
        let mut map = ProgressMap::new();
        map.insert(
            "spirit-ox".into(),
            ProgressEntry::new(true, Some("cave".into()), 100),
        );
        let snap = ProgressSnapshot::from_map(map.clone());
        assert_eq!(snap.into_map(), map);
    }
}

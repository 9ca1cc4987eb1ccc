use crate::model::ProgressMap;

/// Fold a server snapshot into local state, last-writer-wins per item.
///
/// A remote entry replaces the local one only when its version is strictly
/// newer. Items present only locally (not yet synced) are never removed:
/// the remote snapshot is additive/overriding per key, never a wholesale
/// replace at this layer.
///
/// Returns the ids whose local entry was overwritten, so callers can persist
/// and announce exactly those changes.
pub fn merge(local: &mut ProgressMap, remote: ProgressMap) -> Vec<String> {
    let mut changed = Vec::new();
    for (item_id, remote_entry) in remote {
        let local_version = local.get(&item_id).map(|e| e.version).unwrap_or(0);
        if remote_entry.version > local_version {
            changed.push(item_id.clone());
            local.insert(item_id, remote_entry);
        }
    }
    changed
}

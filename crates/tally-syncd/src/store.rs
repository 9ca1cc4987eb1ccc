use anyhow::Result;
use tally_core::{clock, merge, validate::is_valid_item_id, ProgressEntry, ProgressMap, SyncError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::cache::LocalCache;

/// Where a state mutation came from. The dirty-tracking subscriber only
/// reacts to `LocalEdit`; merges and imports must never manufacture
/// re-uploads of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    LocalEdit,
    RemoteMerge,
    Import,
}

#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub item_id: String,
    pub origin: Origin,
}

/// The client-side authoritative view of the user's progress.
///
/// Mutations are synchronous: they stamp a monotonic version, persist the
/// row to the cache, and announce the change with its origin. All network
/// activity lives elsewhere.
pub struct LocalStore {
    map: ProgressMap,
    cache: LocalCache,
    tx: UnboundedSender<StoreEvent>,
}

impl LocalStore {
    /// Hydrate from the persisted cache. Returns the store and the event
    /// stream the sync engine subscribes to.
    pub fn hydrate(cache: LocalCache) -> Result<(Self, UnboundedReceiver<StoreEvent>)> {
        let map = cache.load()?;
        let (tx, rx) = unbounded_channel();
        Ok((LocalStore { map, cache, tx }, rx))
    }

    fn notify(&self, item_id: &str, origin: Origin) {
        // Receiver dropping just means nobody is syncing
        let _ = self.tx.send(StoreEvent {
            item_id: item_id.to_string(),
            origin,
        });
    }

    /// Flip an item's completion flag. Missing entries are treated as
    /// `{done: false}` before toggling, so the first toggle marks done.
    pub fn toggle_done(&mut self, item_id: &str) -> Result<(), SyncError> {
        if !is_valid_item_id(item_id) {
            return Err(SyncError::Validation(format!("invalid item id: {item_id}")));
        }
        let prev = self.map.get(item_id);
        let entry = ProgressEntry::new(
            !prev.map(|e| e.done).unwrap_or(false),
            prev.and_then(|e| e.note.clone()),
            clock::next_version(prev.map(|e| e.version).unwrap_or(0)),
        );
        self.cache
            .upsert(item_id, &entry)
            .map_err(|e| SyncError::Cache(format!("{e:#}")))?;
        self.map.insert(item_id.to_string(), entry);
        self.notify(item_id, Origin::LocalEdit);
        Ok(())
    }

    /// Replace an item's note. Empty string is a real note, not "no note".
    pub fn set_note(&mut self, item_id: &str, note: String) -> Result<(), SyncError> {
        if !is_valid_item_id(item_id) {
            return Err(SyncError::Validation(format!("invalid item id: {item_id}")));
        }
        let prev = self.map.get(item_id);
        let entry = ProgressEntry::new(
            prev.map(|e| e.done).unwrap_or(false),
            Some(note),
            clock::next_version(prev.map(|e| e.version).unwrap_or(0)),
        );
        self.cache
            .upsert(item_id, &entry)
            .map_err(|e| SyncError::Cache(format!("{e:#}")))?;
        self.map.insert(item_id.to_string(), entry);
        self.notify(item_id, Origin::LocalEdit);
        Ok(())
    }

    /// Fold a server snapshot in, last-writer-wins per item. Changed entries
    /// are persisted and announced as `RemoteMerge` so they are not re-marked
    /// dirty.
    pub fn apply_remote(&mut self, remote: ProgressMap) -> Result<()> {
        let changed = merge(&mut self.map, remote);
        for item_id in changed {
            if let Some(entry) = self.map.get(&item_id) {
                self.cache.upsert(&item_id, entry)?;
            }
            self.notify(&item_id, Origin::RemoteMerge);
        }
        Ok(())
    }

    /// Wholesale replace from a file import. Versions are not consulted:
    /// the last import always wins locally, stamped fresh so the follow-up
    /// push wins server-side too. Malformed ids are dropped.
    pub fn import_snapshot(&mut self, incoming: ProgressMap) -> Result<()> {
        let mut replacement = ProgressMap::new();
        for (item_id, entry) in incoming {
            if !is_valid_item_id(&item_id) {
                eprintln!("import: skipping invalid item id: {item_id}");
                continue;
            }
            let prev_version = self.map.get(&item_id).map(|e| e.version).unwrap_or(0);
            replacement.insert(
                item_id,
                ProgressEntry::new(entry.done, entry.note, clock::next_version(prev_version)),
            );
        }
        self.cache.replace_all(&replacement)?;
        self.map = replacement;
        for item_id in self.map.keys() {
            self.notify(item_id, Origin::Import);
        }
        Ok(())
    }

    /// Clear all local progress (user-initiated reset)
    pub fn reset(&mut self) -> Result<()> {
        self.cache.clear()?;
        self.map.clear();
        Ok(())
    }

    pub fn get(&self, item_id: &str) -> Option<&ProgressEntry> {
        self.map.get(item_id)
    }

    pub fn version_of(&self, item_id: &str) -> i64 {
        self.map.get(item_id).map(|e| e.version).unwrap_or(0)
    }

    pub fn snapshot(&self) -> ProgressMap {
        self.map.clone()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn done_count(&self) -> usize {
        self.map.values().filter(|e| e.done).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::sync::mpsc::error::TryRecvError;

    fn fresh_store() -> (TempDir, LocalStore, UnboundedReceiver<StoreEvent>) {
        let dir = TempDir::new().unwrap();
        let cache = LocalCache::open(&dir.path().join("cache.db")).unwrap();
        let (store, rx) = LocalStore::hydrate(cache).unwrap();
        (dir, store, rx)
    }

    #[test]
    fn first_toggle_marks_done() {
        let (_dir, mut store, _rx) = fresh_store();
        store.toggle_done("spirit-ox").unwrap();
        let entry = store.get("spirit-ox").unwrap();
        assert!(entry.done);
        assert!(entry.version > 0);
    }

    #[test]
    fn toggle_flips_and_versions_strictly_increase() {
        let (_dir, mut store, _rx) = fresh_store();
        store.toggle_done("spirit-ox").unwrap();
        let v1 = store.version_of("spirit-ox");
        store.toggle_done("spirit-ox").unwrap();
        let v2 = store.version_of("spirit-ox");
        store.toggle_done("spirit-ox").unwrap();
        let v3 = store.version_of("spirit-ox");

        assert!(store.get("spirit-ox").unwrap().done);
        assert!(v1 < v2 && v2 < v3, "same-second edits must stay ordered");
    }

    #[test]
    fn toggle_preserves_note() {
        let (_dir, mut store, _rx) = fresh_store();
        store.set_note("gourd-1", "behind waterfall".into()).unwrap();
        store.toggle_done("gourd-1").unwrap();
        let entry = store.get("gourd-1").unwrap();
        assert!(entry.done);
        assert_eq!(entry.note.as_deref(), Some("behind waterfall"));
    }

    #[test]
    fn empty_note_is_a_note() {
        let (_dir, mut store, _rx) = fresh_store();
        store.set_note("gourd-1", String::new()).unwrap();
        assert_eq!(store.get("gourd-1").unwrap().note.as_deref(), Some(""));
    }

    #[test]
    fn invalid_id_is_rejected_not_stored() {
        let (_dir, mut store, mut rx) = fresh_store();
        assert!(matches!(
            store.toggle_done("no spaces allowed"),
            Err(SyncError::Validation(_))
        ));
        assert_eq!(store.len(), 0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn local_edits_announce_local_origin() {
        let (_dir, mut store, mut rx) = fresh_store();
        store.toggle_done("spirit-ox").unwrap();
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.item_id, "spirit-ox");
        assert_eq!(ev.origin, Origin::LocalEdit);
    }

    #[test]
    fn remote_merge_announces_remote_origin() {
        let (_dir, mut store, mut rx) = fresh_store();
        let mut remote = ProgressMap::new();
        remote.insert("seed-2".into(), ProgressEntry::new(true, None, 100));
        store.apply_remote(remote).unwrap();

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.origin, Origin::RemoteMerge);
        assert!(store.get("seed-2").unwrap().done);
    }

    #[test]
    fn stale_remote_produces_no_events() {
        let (_dir, mut store, mut rx) = fresh_store();
        store.toggle_done("seed-2").unwrap();
        let _ = rx.try_recv();

        let mut remote = ProgressMap::new();
        remote.insert("seed-2".into(), ProgressEntry::new(false, None, 1));
        store.apply_remote(remote).unwrap();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(store.get("seed-2").unwrap().done);
    }

    #[test]
    fn import_is_wholesale_and_restamps_versions() {
        let (_dir, mut store, _rx) = fresh_store();
        store.toggle_done("old-item").unwrap();
        let old_version = store.version_of("old-item");

        let mut incoming = ProgressMap::new();
        // Import carries a prehistoric version; it must still win locally
        incoming.insert("old-item".into(), ProgressEntry::new(false, None, 1));
        incoming.insert("new-item".into(), ProgressEntry::new(true, None, 1));
        store.import_snapshot(incoming).unwrap();

        assert_eq!(store.len(), 2);
        assert!(!store.get("old-item").unwrap().done);
        assert!(store.version_of("old-item") > old_version);
    }

    #[test]
    fn import_events_carry_import_origin() {
        let (_dir, mut store, mut rx) = fresh_store();
        let mut incoming = ProgressMap::new();
        incoming.insert("a".into(), ProgressEntry::new(true, None, 0));
        store.import_snapshot(incoming).unwrap();
        assert_eq!(rx.try_recv().unwrap().origin, Origin::Import);
    }

    #[test]
    fn hydration_restores_persisted_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        {
            let cache = LocalCache::open(&path).unwrap();
            let (mut store, _rx) = LocalStore::hydrate(cache).unwrap();
            store.toggle_done("spirit-ox").unwrap();
            store.set_note("spirit-ox", "cave".into()).unwrap();
        }
        let cache = LocalCache::open(&path).unwrap();
        let (store, _rx) = LocalStore::hydrate(cache).unwrap();
        let entry = store.get("spirit-ox").unwrap();
        assert!(entry.done);
        assert_eq!(entry.note.as_deref(), Some("cave"));
    }

    #[test]
    fn reset_clears_memory_and_cache() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        let cache = LocalCache::open(&path).unwrap();
        let (mut store, _rx) = LocalStore::hydrate(cache).unwrap();
        store.toggle_done("spirit-ox").unwrap();
        store.reset().unwrap();
        assert_eq!(store.len(), 0);

        let cache = LocalCache::open(&path).unwrap();
        assert!(cache.load().unwrap().is_empty());
    }
}

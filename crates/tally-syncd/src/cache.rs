use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use tally_core::{ProgressEntry, ProgressMap};

/// Persisted local cache backing the in-memory state store.
///
/// This is the only client state that outlives the process; the dirty queue
/// deliberately does not.
pub struct LocalCache {
    conn: Connection,
}

impl LocalCache {
    /// Open the cache at the given path and initialize the table if needed
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create cache directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open cache: {}", path.display()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS progress (
                item_id TEXT PRIMARY KEY,
                done INTEGER NOT NULL DEFAULT 0,
                note TEXT,
                version INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(Self { conn })
    }

    /// Load the full cached map; used once at hydration
    pub fn load(&self) -> Result<ProgressMap> {
        let mut stmt = self
            .conn
            .prepare("SELECT item_id, done, note, version FROM progress")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                ProgressEntry::new(row.get::<_, i64>(1)? != 0, row.get(2)?, row.get(3)?),
            ))
        })?;
        let mut map = ProgressMap::new();
        for row in rows {
            let (item_id, entry) = row?;
            map.insert(item_id, entry);
        }
        Ok(map)
    }

    /// Insert or update one cached row
    pub fn upsert(&self, item_id: &str, entry: &ProgressEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO progress (item_id, done, note, version)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(item_id) DO UPDATE SET
                done = excluded.done,
                note = excluded.note,
                version = excluded.version",
            params![item_id, entry.done as i64, entry.note, entry.version],
        )?;
        Ok(())
    }

    /// Replace the whole cache in one transaction (import path)
    pub fn replace_all(&mut self, map: &ProgressMap) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM progress", [])?;
        for (item_id, entry) in map {
            tx.execute(
                "INSERT INTO progress (item_id, done, note, version) VALUES (?1, ?2, ?3, ?4)",
                params![item_id, entry.done as i64, entry.note, entry.version],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop everything (full progress reset)
    pub fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM progress", [])?;
        Ok(())
    }
}

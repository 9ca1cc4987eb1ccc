use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use tally_core::{ProgressEntry, ProgressMap};

/// Authoritative per-user progress store with conditional-update semantics.
///
/// A write is accepted only when its version is strictly greater than the
/// stored version for that (user, item) row, so the stored version never
/// decreases regardless of network reordering or replayed requests.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::init(&pool).await?;
        Ok(Store { pool })
    }

    /// In-memory store for tests
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::init(&pool).await?;
        Ok(Store { pool })
    }

    async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                name TEXT
            )"#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS progress (
                user_id INTEGER NOT NULL,
                item_id TEXT NOT NULL,
                done INTEGER NOT NULL DEFAULT 0,
                note TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY(user_id, item_id),
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Look up a user row by verified username, creating it on first use.
    /// Returns the internal user id all progress rows are scoped by.
    pub async fn get_or_create_user(&self, username: &str, name: Option<&str>) -> Result<i64> {
        if let Some(row) = sqlx::query("SELECT id FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(row.get("id"));
        }
        let result = sqlx::query("INSERT INTO users (username, name) VALUES (?, ?)")
            .bind(username)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Fetch the user's full progress. Empty map when nothing is stored;
    /// never partial.
    pub async fn fetch_progress(&self, user_id: i64) -> Result<ProgressMap> {
        let rows = sqlx::query("SELECT item_id, done, note, version FROM progress WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let item_id: String = row.get("item_id");
                let entry = ProgressEntry::new(
                    row.get::<i64, _>("done") != 0,
                    row.get("note"),
                    row.get("version"),
                );
                (item_id, entry)
            })
            .collect())
    }

    /// Conditionally write one entry. Inserts freely when no row exists;
    /// otherwise applies only when `version` is strictly greater than the
    /// stored version. Equal versions are rejected so a replayed request is
    /// never mistaken for a newer write.
    ///
    /// Returns whether the write was applied; `false` means stale, not error.
    pub async fn upsert_progress(
        &self,
        user_id: i64,
        item_id: &str,
        done: bool,
        note: Option<&str>,
        version: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"INSERT INTO progress (user_id, item_id, done, note, version)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(user_id, item_id) DO UPDATE SET
                   done = excluded.done,
                   note = excluded.note,
                   version = excluded.version
               WHERE excluded.version > progress.version"#,
        )
        .bind(user_id)
        .bind(item_id)
        .bind(done as i64)
        .bind(note)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Apply a whole snapshot in one transaction. Each item is accepted or
    /// rejected independently under the same version rule; the caller learns
    /// how many entries actually landed.
    pub async fn replace_progress(
        &self,
        user_id: i64,
        entries: &ProgressMap,
    ) -> Result<(usize, usize)> {
        let mut tx = self.pool.begin().await?;
        let mut applied = 0;
        for (item_id, entry) in entries {
            let result = sqlx::query(
                r#"INSERT INTO progress (user_id, item_id, done, note, version)
                   VALUES (?, ?, ?, ?, ?)
                   ON CONFLICT(user_id, item_id) DO UPDATE SET
                       done = excluded.done,
                       note = excluded.note,
                       version = excluded.version
                   WHERE excluded.version > progress.version"#,
            )
            .bind(user_id)
            .bind(item_id)
            .bind(entry.done as i64)
            .bind(entry.note.as_deref())
            .bind(entry.version)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                applied += 1;
            }
        }
        tx.commit().await?;
        Ok((applied, entries.len()))
    }

    /// Delete one item's entry, or the user's whole progress when no item is
    /// given. Unconditional: a deliberate reset wins outright, no version
    /// check.
    pub async fn delete_progress(&self, user_id: i64, item_id: Option<&str>) -> Result<()> {
        match item_id {
            Some(id) => {
                sqlx::query("DELETE FROM progress WHERE user_id = ? AND item_id = ?")
                    .bind(user_id)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query("DELETE FROM progress WHERE user_id = ?")
                    .bind(user_id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// Remove a user row; progress rows go with it via cascade. There is no
    /// admin route yet, so this only backs the cascade tests.
    #[cfg(test)]
    pub async fn delete_user(&self, user_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_user() -> (Store, i64) {
        let store = Store::in_memory().await.unwrap();
        let user = store.get_or_create_user("wukong", None).await.unwrap();
        (store, user)
    }

    #[tokio::test]
    async fn fetch_on_fresh_user_is_empty() {
        let (store, user) = store_with_user().await;
        assert!(store.fetch_progress(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        let a = store.get_or_create_user("wukong", Some("Destined One")).await.unwrap();
        let b = store.get_or_create_user("wukong", None).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn first_write_is_unconditional() {
        let (store, user) = store_with_user().await;
        let applied = store
            .upsert_progress(user, "spirit-ox", true, None, 100)
            .await
            .unwrap();
        assert!(applied);

        let map = store.fetch_progress(user).await.unwrap();
        let entry = &map["spirit-ox"];
        assert!(entry.done);
        assert_eq!(entry.version, 100);
    }

    #[tokio::test]
    async fn replayed_version_applies_only_once() {
        let (store, user) = store_with_user().await;
        assert!(store
            .upsert_progress(user, "gourd-1", true, None, 100)
            .await
            .unwrap());
        // Duplicate re-delivery of the same logical write
        assert!(!store
            .upsert_progress(user, "gourd-1", true, None, 100)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn stale_write_is_rejected_and_state_kept() {
        let (store, user) = store_with_user().await;
        assert!(store
            .upsert_progress(user, "spirit-ox", true, Some("foo"), 200)
            .await
            .unwrap());
        // Tab B with a stale cache
        assert!(!store
            .upsert_progress(user, "spirit-ox", false, Some("bar"), 150)
            .await
            .unwrap());

        let map = store.fetch_progress(user).await.unwrap();
        assert_eq!(map["spirit-ox"].note.as_deref(), Some("foo"));
        assert!(map["spirit-ox"].done);
    }

    #[tokio::test]
    async fn edit_after_conflict_is_accepted() {
        let (store, user) = store_with_user().await;
        assert!(store.upsert_progress(user, "seed-9", true, None, 200).await.unwrap());
        // v1 < stored v2 gets rejected
        assert!(!store.upsert_progress(user, "seed-9", false, None, 100).await.unwrap());
        // user keeps editing, producing v3 > v2
        assert!(store
            .upsert_progress(user, "seed-9", false, Some("missed"), 300)
            .await
            .unwrap());
        let map = store.fetch_progress(user).await.unwrap();
        assert_eq!(map["seed-9"].version, 300);
        assert!(!map["seed-9"].done);
    }

    #[tokio::test]
    async fn batch_applies_each_item_independently() {
        let (store, user) = store_with_user().await;
        store.upsert_progress(user, "a", true, None, 100).await.unwrap();
        store.upsert_progress(user, "b", true, None, 100).await.unwrap();

        let mut entries = ProgressMap::new();
        // stale for "a", newer for "b", brand new "c"
        entries.insert("a".into(), ProgressEntry::new(false, None, 50));
        entries.insert("b".into(), ProgressEntry::new(false, None, 150));
        entries.insert("c".into(), ProgressEntry::new(true, Some("new".into()), 10));

        let (applied, total) = store.replace_progress(user, &entries).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(applied, 2);

        let map = store.fetch_progress(user).await.unwrap();
        assert!(map["a"].done, "stale batch entry must not change stored state");
        assert!(!map["b"].done);
        assert!(map["c"].done);
    }

    #[tokio::test]
    async fn delete_single_item_is_unconditional() {
        let (store, user) = store_with_user().await;
        store.upsert_progress(user, "curio-7", true, None, 999).await.unwrap();
        store.delete_progress(user, Some("curio-7")).await.unwrap();
        assert!(store.fetch_progress(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_all_empties_the_map() {
        let (store, user) = store_with_user().await;
        for i in 0..5 {
            store
                .upsert_progress(user, &format!("item-{i}"), true, None, 100 + i)
                .await
                .unwrap();
        }
        assert_eq!(store.fetch_progress(user).await.unwrap().len(), 5);

        store.delete_progress(user, None).await.unwrap();
        assert!(store.fetch_progress(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_a_user_cascades_to_progress() {
        let (store, user) = store_with_user().await;
        store.upsert_progress(user, "spirit-ox", true, None, 100).await.unwrap();
        store.delete_user(user).await.unwrap();

        // A fresh row under the same name starts from nothing
        let reborn = store.get_or_create_user("wukong", None).await.unwrap();
        assert!(store.fetch_progress(reborn).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let store = Store::in_memory().await.unwrap();
        let a = store.get_or_create_user("alice", None).await.unwrap();
        let b = store.get_or_create_user("bob", None).await.unwrap();
        store.upsert_progress(a, "spirit-ox", true, None, 100).await.unwrap();

        assert!(store.fetch_progress(b).await.unwrap().is_empty());
        store.delete_progress(b, None).await.unwrap();
        assert_eq!(store.fetch_progress(a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_note_is_stored_as_a_note() {
        let (store, user) = store_with_user().await;
        store.upsert_progress(user, "vessel-1", false, Some(""), 10).await.unwrap();
        let map = store.fetch_progress(user).await.unwrap();
        assert_eq!(map["vessel-1"].note.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn second_device_sees_committed_write() {
        // Toggle on one device at version 100, pull from another
        let (store, user) = store_with_user().await;
        store.upsert_progress(user, "spirit-ox", true, None, 100).await.unwrap();

        let pulled = store.fetch_progress(user).await.unwrap();
        assert_eq!(
            pulled["spirit-ox"],
            ProgressEntry::new(true, None, 100)
        );
    }
}

use serde::Serialize;
use std::time::{Duration, Instant};
use tally_core::{ProgressMap, SyncError};
use tally_proto::WriteAck;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::client::ApiClient;
use crate::config::Config;
use crate::dirty::DirtyQueue;
use crate::store::{LocalStore, Origin, StoreEvent};

/// First retry delay for a failed item; doubles per attempt up to the
/// queue's cap
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Snapshot of sync health for the `status` command; the pending count is
/// what a UI layer would use for an unsaved-changes indicator.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub items: usize,
    pub done: usize,
    pub pending: usize,
    pub stalled: Vec<String>,
    pub synced: bool,
}

/// Owns the local store, the dirty queue and all guard state, and talks to
/// the server. One engine per session; every mutation and network completion
/// goes through `&mut self`, so the drain loop is single-flight by
/// construction and the guard flags cannot be raced.
pub struct SyncEngine {
    store: LocalStore,
    events: UnboundedReceiver<StoreEvent>,
    dirty: DirtyQueue,
    client: Option<ApiClient>,
    debounce: Duration,
    drain_at: Option<Instant>,
    draining: bool,
    /// No drain may run before hydration and the first successful pull,
    /// otherwise an empty cache could be pushed over real server data
    pulled_once: bool,
    auth_failed: bool,
    import_push: Option<JoinHandle<()>>,
    import_tx: UnboundedSender<WriteAck>,
    /// The raw incoming map of the import whose push is still unconfirmed,
    /// kept so a partial conflict can restamp and resend it
    pending_import: Option<ProgressMap>,
}

impl SyncEngine {
    /// Build the engine around a hydrated store. Also returns the channel on
    /// which outcomes of background snapshot pushes arrive.
    pub fn new(
        store: LocalStore,
        events: UnboundedReceiver<StoreEvent>,
        config: &Config,
    ) -> Result<(Self, UnboundedReceiver<WriteAck>), SyncError> {
        let client = match (&config.sync.server_url, &config.sync.token) {
            (Some(url), Some(token)) => {
                Some(ApiClient::new(url, token, config.request_timeout())?)
            }
            (Some(_), None) => {
                eprintln!("server_url set but no token; running in local-only mode");
                None
            }
            _ => None,
        };
        let (import_tx, import_rx) = unbounded_channel();
        let engine = SyncEngine {
            store,
            events,
            dirty: DirtyQueue::new(BACKOFF_BASE, config.sync.max_attempts),
            client,
            debounce: config.debounce(),
            drain_at: None,
            draining: false,
            pulled_once: false,
            auth_failed: false,
            import_push: None,
            import_tx,
            pending_import: None,
        };
        Ok((engine, import_rx))
    }

    pub fn is_local_only(&self) -> bool {
        self.client.is_none()
    }

    fn can_sync(&self) -> bool {
        self.client.is_some() && !self.auth_failed && self.pulled_once
    }

    /// Process queued store events. Only `LocalEdit` marks an item dirty and
    /// (re)arms the debounce window. A `RemoteMerge` overwrite of a pending
    /// item means its local edit lost last-writer-wins: local state now
    /// equals the server's and an equal-version push could only 409, so the
    /// item comes off the queue. Import-origin mutations pass through; the
    /// import path re-pushes via batch replace, not the dirty queue.
    fn absorb_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event.origin {
                Origin::LocalEdit => {
                    self.dirty.mark(&event.item_id);
                    self.drain_at = Some(Instant::now() + self.debounce);
                }
                Origin::RemoteMerge => self.dirty.clear(&event.item_id),
                Origin::Import => {}
            }
        }
    }

    pub fn toggle(&mut self, item_id: &str) -> Result<(), SyncError> {
        let result = self.store.toggle_done(item_id);
        self.absorb_events();
        result
    }

    pub fn set_note(&mut self, item_id: &str, note: String) -> Result<(), SyncError> {
        let result = self.store.set_note(item_id, note);
        self.absorb_events();
        result
    }

    /// When the next debounced drain is due; `None` while there is nothing
    /// sendable (no server, gated, or queue empty)
    pub fn next_drain_at(&self) -> Option<Instant> {
        if !self.can_sync() {
            return None;
        }
        self.drain_at
    }

    /// Pull the authoritative snapshot and fold it into local state.
    /// Called at startup, on the timer, on an explicit wake, and after
    /// conflict responses.
    pub async fn reconcile(&mut self) {
        let Some(client) = self.client.clone() else {
            return;
        };
        match client.fetch_progress().await {
            Ok(remote) => {
                if let Err(e) = self.store.apply_remote(remote) {
                    eprintln!("failed to persist merged snapshot: {e:#}");
                }
                // Merge events drain here with RemoteMerge origin; they do
                // not mark anything dirty
                self.absorb_events();
                self.pulled_once = true;
                if !self.dirty.is_empty() && self.drain_at.is_none() {
                    self.drain_at = Some(Instant::now());
                }
            }
            Err(SyncError::Unauthorized) => {
                eprintln!("server refused our session; sync disabled");
                self.auth_failed = true;
            }
            Err(e) => {
                eprintln!("reconcile pull failed: {e}");
            }
        }
    }

    /// Send dirty items one at a time until the queue is empty or every
    /// remaining item is waiting out its backoff. Cooperative single-flight:
    /// a reentrant call returns immediately.
    pub async fn drain(&mut self) {
        if self.draining || !self.can_sync() {
            return;
        }
        let Some(client) = self.client.clone() else {
            return;
        };
        self.draining = true;
        loop {
            let Some(item_id) = self.dirty.next_ready(Instant::now()) else {
                break;
            };
            // Read the entry as it is now, not as it was when enqueued
            let Some(entry) = self.store.get(&item_id).cloned() else {
                continue;
            };
            match client.push_entry(&item_id, &entry).await {
                Ok(()) => {
                    if self.store.version_of(&item_id) > entry.version {
                        // Edited while the request was in flight; the newer
                        // state still has to go out
                        self.dirty.mark(&item_id);
                    } else {
                        self.dirty.clear(&item_id);
                    }
                }
                Err(SyncError::StaleWrite) => {
                    self.dirty.recycle(item_id, Instant::now());
                    self.reconcile().await;
                }
                Err(SyncError::Validation(msg)) => {
                    eprintln!("dropping {item_id}: {msg}");
                    self.dirty.clear(&item_id);
                }
                Err(SyncError::Unauthorized) => {
                    eprintln!("server refused our session; sync disabled");
                    self.dirty.recycle(item_id, Instant::now());
                    self.auth_failed = true;
                    break;
                }
                Err(e) => {
                    eprintln!("push of {item_id} failed: {e}");
                    self.dirty.recycle(item_id, Instant::now());
                }
            }
            self.absorb_events();
        }
        self.draining = false;
        self.drain_at = self.dirty.next_ready_at();
    }

    /// Wholesale import from a file, then a background batch push of the new
    /// snapshot. Only the most recent snapshot push is ever in flight; an
    /// older one still running is aborted first.
    pub fn import(&mut self, incoming: ProgressMap) -> Result<(), SyncError> {
        self.pending_import = Some(incoming.clone());
        self.apply_import(incoming)
    }

    fn apply_import(&mut self, incoming: ProgressMap) -> Result<(), SyncError> {
        self.store
            .import_snapshot(incoming)
            .map_err(|e| SyncError::Cache(format!("{e:#}")))?;
        self.absorb_events();

        let Some(client) = self.client.clone() else {
            return Ok(());
        };
        if let Some(handle) = self.import_push.take() {
            handle.abort();
        }
        let snapshot = self.store.snapshot();
        let tx = self.import_tx.clone();
        self.import_push = Some(tokio::spawn(async move {
            match client.push_snapshot(snapshot).await {
                Ok(ack) => {
                    let _ = tx.send(ack);
                }
                Err(e) => eprintln!("snapshot push failed: {e}"),
            }
        }));
        Ok(())
    }

    /// Handle the outcome of a background snapshot push. A partial conflict
    /// means the server advanced past our last pull while the import was in
    /// flight: pull the newer state, restamp the same import above it and
    /// push once more. A conflict on that retry is accepted as lost.
    pub async fn import_ack(&mut self, ack: &WriteAck) {
        if !ack.conflict {
            self.pending_import = None;
            return;
        }
        self.reconcile().await;
        if let Some(incoming) = self.pending_import.take() {
            if let Err(e) = self.apply_import(incoming) {
                eprintln!("import retry failed: {e}");
            }
        }
    }

    /// Full progress reset, locally and on the server. Deliberate user
    /// action: no version checks anywhere.
    pub async fn reset(&mut self) {
        if let Err(e) = self.store.reset() {
            eprintln!("failed to clear local cache: {e:#}");
        }
        self.dirty.clear_all();
        self.drain_at = None;
        if let Some(client) = self.client.clone() {
            match client.delete_all().await {
                Ok(()) => {}
                Err(SyncError::Unauthorized) => {
                    eprintln!("server refused our session; sync disabled");
                    self.auth_failed = true;
                }
                Err(e) => eprintln!("server-side reset failed: {e}"),
            }
        }
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            items: self.store.len(),
            done: self.store.done_count(),
            pending: self.dirty.len(),
            stalled: self.dirty.stalled().iter().map(|s| s.to_string()).collect(),
            synced: self.can_sync() && self.dirty.is_empty(),
        }
    }

    #[cfg(test)]
    fn force_pulled(&mut self) {
        self.pulled_once = true;
    }
}

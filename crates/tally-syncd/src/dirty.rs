use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Item-ids with unacknowledged local mutations, in loose insertion order.
///
/// Failed sends are recycled to the back with exponential per-item backoff,
/// so one permanently failing item cannot starve the rest and cannot
/// tight-loop against the server. Nothing here is persisted: after a restart
/// the cache plus the next reconciliation pull re-establish consistency.
pub struct DirtyQueue {
    queue: VecDeque<String>,
    members: HashSet<String>,
    attempts: HashMap<String, u32>,
    not_before: HashMap<String, Instant>,
    max_attempts: u32,
    backoff_base: Duration,
}

impl DirtyQueue {
    pub fn new(backoff_base: Duration, max_attempts: u32) -> Self {
        DirtyQueue {
            queue: VecDeque::new(),
            members: HashSet::new(),
            attempts: HashMap::new(),
            not_before: HashMap::new(),
            max_attempts,
            backoff_base,
        }
    }

    /// Mark an item dirty. Re-marking an already-queued item keeps its
    /// position (rapid edits coalesce); a fresh edit also resets any backoff
    /// accumulated from earlier failures.
    pub fn mark(&mut self, item_id: &str) {
        self.attempts.remove(item_id);
        self.not_before.remove(item_id);
        if self.members.insert(item_id.to_string()) {
            self.queue.push_back(item_id.to_string());
        }
    }

    /// Take the first item whose backoff window has elapsed, if any
    pub fn next_ready(&mut self, now: Instant) -> Option<String> {
        let pos = self.queue.iter().position(|id| {
            self.not_before
                .get(id)
                .map(|at| *at <= now)
                .unwrap_or(true)
        })?;
        let item_id = self.queue.remove(pos)?;
        self.members.remove(&item_id);
        Some(item_id)
    }

    /// Acknowledge a successful send: the item is clean
    pub fn clear(&mut self, item_id: &str) {
        if self.members.remove(item_id) {
            self.queue.retain(|id| id != item_id);
        }
        self.attempts.remove(item_id);
        self.not_before.remove(item_id);
    }

    /// Put a failed item back at the end of the queue with its next backoff
    /// window. The item is never dropped; past the attempt threshold it is
    /// reported by `stalled()` so the UI layer can surface it.
    pub fn recycle(&mut self, item_id: String, now: Instant) {
        let attempts = self.attempts.entry(item_id.clone()).or_insert(0);
        *attempts = attempts.saturating_add(1);
        let exp = attempts.saturating_sub(1).min(16);
        let delay = self
            .backoff_base
            .saturating_mul(1u32 << exp)
            .min(MAX_BACKOFF);
        self.not_before.insert(item_id.clone(), now + delay);
        if self.members.insert(item_id.clone()) {
            self.queue.push_back(item_id);
        }
    }

    /// Earliest moment any queued item becomes ready
    pub fn next_ready_at(&self) -> Option<Instant> {
        let now = Instant::now();
        self.queue
            .iter()
            .map(|id| self.not_before.get(id).copied().unwrap_or(now))
            .min()
    }

    /// Items that failed at least `max_attempts` times and keep being retried
    pub fn stalled(&self) -> Vec<&str> {
        self.queue
            .iter()
            .filter(|id| {
                self.attempts
                    .get(*id)
                    .map(|a| *a >= self.max_attempts)
                    .unwrap_or(false)
            })
            .map(String::as_str)
            .collect()
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.members.contains(item_id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear_all(&mut self) {
        self.queue.clear();
        self.members.clear();
        self.attempts.clear();
        self.not_before.clear();
    }
}

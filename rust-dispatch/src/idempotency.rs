//! Duplicate suppression for provider webhook retries.
//!
//! The store is an in-process compare-and-set keyed by `event_id`. A claim
//! is taken before anything is published, so two concurrent deliveries of
//! the same event cannot both publish. A failed publish releases the claim
//! so the provider's next retry can redo the work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Entries are only swept once the map grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

/// Result of trying to claim an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the event and must either complete or release it.
    Acquired,
    /// Another request is publishing this event right now.
    InFlight,
    /// The event was already dispatched.
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    InFlight,
    Completed,
}

#[derive(Debug)]
struct Entry {
    state: EntryState,
    touched_at: Instant,
}

#[derive(Debug)]
pub struct IdempotencyStore {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl IdempotencyStore {
    /// Entries older than `ttl` are forgotten; providers stop retrying long
    /// before a day passes.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Atomically claim `event_id` unless a live entry already exists.
    pub fn try_claim(&self, event_id: &str) -> Claim {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if entries.len() > PRUNE_THRESHOLD {
            let ttl = self.ttl;
            entries.retain(|_, entry| now.duration_since(entry.touched_at) < ttl);
        }

        if let Some(entry) = entries.get(event_id) {
            if now.duration_since(entry.touched_at) < self.ttl {
                return match entry.state {
                    EntryState::InFlight => Claim::InFlight,
                    EntryState::Completed => Claim::Completed,
                };
            }
        }

        entries.insert(
            event_id.to_string(),
            Entry {
                state: EntryState::InFlight,
                touched_at: now,
            },
        );
        Claim::Acquired
    }

    /// Mark a claimed event as fully dispatched.
    pub fn complete(&self, event_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            event_id.to_string(),
            Entry {
                state: EntryState::Completed,
                touched_at: Instant::now(),
            },
        );
    }

    /// Give up a claim after a failed publish. Completed entries are kept.
    pub fn release(&self, event_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(
            entries.get(event_id).map(|e| e.state),
            Some(EntryState::InFlight)
        ) {
            entries.remove(event_id);
        }
    }

    /// Claim `event_id` and hold it in a guard that releases on drop.
    ///
    /// Returns the existing claim state when the event is already taken.
    pub fn claim(store: &Arc<Self>, event_id: &str) -> Result<ClaimGuard, Claim> {
        match store.try_claim(event_id) {
            Claim::Acquired => Ok(ClaimGuard {
                store: Arc::clone(store),
                event_id: event_id.to_string(),
                completed: false,
            }),
            other => Err(other),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An acquired claim. Dropping it without [`ClaimGuard::complete`] gives
/// the event back.
#[derive(Debug)]
pub struct ClaimGuard {
    store: Arc<IdempotencyStore>,
    event_id: String,
    completed: bool,
}

impl ClaimGuard {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Mark the event as dispatched and keep it claimed until the TTL.
    pub fn complete(mut self) {
        self.store.complete(&self.event_id);
        self.completed = true;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.store.release(&self.event_id);
        }
    }
}

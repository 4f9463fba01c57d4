//! What to do with a delivery after its handler ran, and the per-worker
//! record of attempts and completed jobs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::error::ProcessingError;
use crate::queue::DeadLetterCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    DeadLetter(DeadLetterCode),
}

/// Decide the fate of a delivery on its `attempt`-th (1-based) run.
pub fn decide(outcome: &Result<(), ProcessingError>, attempt: u32, max_attempts: u32) -> Disposition {
    match outcome {
        Ok(()) => Disposition::Ack,
        Err(ProcessingError::Permanent(_)) => Disposition::DeadLetter(DeadLetterCode::PermanentFailure),
        Err(ProcessingError::Transient(_)) if attempt < max_attempts => Disposition::Requeue,
        Err(ProcessingError::Transient(_)) => {
            Disposition::DeadLetter(DeadLetterCode::MaxAttemptsExceeded)
        }
    }
}

/// Attempt number for a delivery.
///
/// Quorum queues report previous deliveries in `x-delivery-count`; classic
/// queues do not, so the worker's own count is used as a floor.
pub fn attempt_number(broker_delivery_count: Option<u32>, local_attempt: u32) -> u32 {
    match broker_delivery_count {
        Some(previous) => (previous + 1).max(local_attempt),
        None => local_attempt,
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    attempts: HashMap<String, u32>,
    completed: HashSet<String>,
    completed_order: VecDeque<String>,
}

/// Bounded memory of delivery attempts and finished jobs, keyed by
/// `queue:job_id`.
#[derive(Debug)]
pub struct DeliveryLedger {
    state: Mutex<LedgerState>,
    capacity: usize,
}

impl DeliveryLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn key(queue: &str, job_id: &str) -> String {
        format!("{queue}:{job_id}")
    }

    /// Count one more delivery of `key` and return the running total.
    pub fn record_attempt(&self, key: &str) -> u32 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.attempts.len() >= self.capacity && !state.attempts.contains_key(key) {
            // Counts are a floor for the broker's own; dropping them is safe.
            state.attempts.clear();
        }
        let count = state.attempts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn is_completed(&self, key: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.completed.contains(key)
    }

    /// Remember `key` as done, evicting the oldest entry past capacity.
    pub fn mark_completed(&self, key: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.attempts.remove(key);
        if state.completed.insert(key.to_string()) {
            state.completed_order.push_back(key.to_string());
        }
        while state.completed_order.len() > self.capacity {
            if let Some(oldest) = state.completed_order.pop_front() {
                state.completed.remove(&oldest);
            }
        }
    }

    /// Drop the attempt count of a job that left the queue unfinished.
    pub fn forget(&self, key: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.attempts.remove(key);
    }
}

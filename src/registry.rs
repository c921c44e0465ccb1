//! C1 — Node Registry: authoritative worker identity → metadata mapping.
//!
//! Grounded on `original_source/src/core/coordinator.py`'s
//! `register_node`/`remove_node`/`heartbeat`/`record_failure` (exact
//! auto-removal threshold semantics) and on `daa-compute/src/mesh/elastic.rs`'s
//! `NodeInfo` shape. All mutations serialize through a single
//! `parking_lot::Mutex`; reads return cloned snapshots, never references
//! into the guarded state, so callers never hold the lock across an await
//! or a call into another component (spec.md §5's shared-resource policy).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::{WorkerCapability, WorkerId, WorkerStatus};

/// Default auto-removal threshold (spec.md §4.1).
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMetadata {
    pub id: WorkerId,
    pub address: String,
    pub payout_address: Option<String>,
    pub capability: WorkerCapability,
    pub status: WorkerStatus,
    pub heartbeats_seen: u64,
    pub consecutive_failures: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerMetadata {
    fn new(id: WorkerId, address: String, payout_address: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            address,
            payout_address,
            capability: WorkerCapability::default(),
            status: WorkerStatus::Initializing,
            heartbeats_seen: 0,
            consecutive_failures: 0,
            last_heartbeat: now,
            registered_at: now,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    workers: HashMap<WorkerId, WorkerMetadata>,
}

/// Reason recorded when a worker is auto-removed for exceeding the failure
/// threshold, surfaced to callers that want to log it.
pub const REMOVAL_REASON_FAILURE_THRESHOLD: &str = "exceeded failure threshold";

pub struct NodeRegistry {
    state: Mutex<RegistryState>,
    max_consecutive_failures: u32,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::with_max_consecutive_failures(DEFAULT_MAX_CONSECUTIVE_FAILURES)
    }

    pub fn with_max_consecutive_failures(max_consecutive_failures: u32) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            max_consecutive_failures,
        }
    }

    /// Add (or re-add) a worker. Never rejects: a later registration
    /// overwrites the prior entry and resets failure counters, but
    /// preserves the payout address if the new registration doesn't supply
    /// one (spec.md §4.1).
    pub fn add(&self, id: WorkerId, address: String, payout_address: Option<String>) {
        let mut state = self.state.lock();
        let preserved_payout = state
            .workers
            .get(&id)
            .and_then(|w| w.payout_address.clone());
        let mut worker = WorkerMetadata::new(id.clone(), address, payout_address);
        if worker.payout_address.is_none() {
            worker.payout_address = preserved_payout;
        }
        worker.status = WorkerStatus::Ready;
        state.workers.insert(id, worker);
    }

    /// Idempotent removal — returns whether a worker was actually present.
    pub fn remove(&self, id: &str) -> bool {
        self.state.lock().workers.remove(id).is_some()
    }

    /// Record a heartbeat: bumps the counter, resets consecutive failures,
    /// and updates the last-heartbeat timestamp.
    pub fn heartbeat(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        match state.workers.get_mut(id) {
            Some(worker) => {
                worker.heartbeats_seen += 1;
                worker.consecutive_failures = 0;
                worker.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Record a failure. Returns `true` if the worker was auto-removed for
    /// crossing `max_consecutive_failures`.
    pub fn record_failure(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let should_remove = match state.workers.get_mut(id) {
            Some(worker) => {
                worker.consecutive_failures += 1;
                worker.consecutive_failures >= self.max_consecutive_failures
            }
            None => false,
        };
        if should_remove {
            state.workers.remove(id);
        }
        should_remove
    }

    pub fn update_status(&self, id: &str, status: WorkerStatus) -> bool {
        let mut state = self.state.lock();
        match state.workers.get_mut(id) {
            Some(worker) => {
                worker.status = status;
                true
            }
            None => false,
        }
    }

    /// Snapshot read: a clone of the worker's metadata, never a reference
    /// into guarded state.
    pub fn get(&self, id: &str) -> Option<WorkerMetadata> {
        self.state.lock().workers.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// List all workers matching an arbitrary predicate over a snapshot.
    pub fn list_by<F>(&self, mut predicate: F) -> Vec<WorkerMetadata>
    where
        F: FnMut(&WorkerMetadata) -> bool,
    {
        self.state
            .lock()
            .workers
            .values()
            .filter(|w| predicate(w))
            .cloned()
            .collect()
    }

    /// All workers whose status is eligible (ready/training/idle).
    pub fn eligible(&self) -> Vec<WorkerMetadata> {
        self.list_by(|w| w.status.is_eligible())
    }

    pub fn all(&self) -> Vec<WorkerMetadata> {
        self.list_by(|_| true)
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_round_trips() {
        let registry = NodeRegistry::new();
        registry.add("w1".into(), "10.0.0.1:9000".into(), Some("0xabc".into()));
        let worker = registry.get("w1").unwrap();
        assert_eq!(worker.status, WorkerStatus::Ready);
        assert_eq!(worker.payout_address.as_deref(), Some("0xabc"));
    }

    #[test]
    fn re_registration_preserves_payout_when_omitted() {
        let registry = NodeRegistry::new();
        registry.add("w1".into(), "addr1".into(), Some("0xabc".into()));
        registry.record_failure("w1");
        registry.add("w1".into(), "addr2".into(), None);
        let worker = registry.get("w1").unwrap();
        assert_eq!(worker.payout_address.as_deref(), Some("0xabc"));
        assert_eq!(worker.consecutive_failures, 0);
    }

    #[test]
    fn heartbeat_resets_consecutive_failures() {
        let registry = NodeRegistry::new();
        registry.add("w1".into(), "addr".into(), None);
        registry.record_failure("w1");
        registry.record_failure("w1");
        registry.heartbeat("w1");
        assert_eq!(registry.get("w1").unwrap().consecutive_failures, 0);
    }

    #[test]
    fn auto_removes_after_max_consecutive_failures() {
        let registry = NodeRegistry::with_max_consecutive_failures(5);
        registry.add("w1".into(), "addr".into(), None);
        for i in 0..4 {
            assert!(!registry.record_failure("w1"), "failure {i} should not remove yet");
        }
        assert!(registry.record_failure("w1"));
        assert!(registry.get("w1").is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = NodeRegistry::new();
        registry.add("w1".into(), "addr".into(), None);
        assert!(registry.remove("w1"));
        assert!(!registry.remove("w1"));
    }
}

//! In-memory sample table with atomic claim-and-transition
//!
//! The single shared mutable resource of a run. Records live in per-sample
//! slots guarded by their own locks; claiming pops from a pending queue and
//! flips Pending to InFlight in one step, so no two workers ever hold the
//! same sample. No lock here is ever held across an await point.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::sample::{SampleRecord, SampleState};

/// Requested transition for a claimed sample.
#[derive(Debug, Clone)]
pub enum Transition {
    Completed { output: String, attempts: u32, secs: f64 },
    Failed { reason: String, attempts: u32, last_error: String, secs: f64 },
    /// Interrupted before a terminal outcome; safe to repeat
    RevertToPending,
}

/// Addressable table of sample records for one run.
pub struct SampleStore {
    slots: HashMap<String, Mutex<SampleRecord>>,
    pending: Mutex<VecDeque<String>>,
}

impl SampleStore {
    /// Build the table from loaded records. Every record in a non-terminal
    /// state must already have been normalized to Pending by the checkpoint
    /// loader; ids of Pending records seed the claim queue.
    pub fn new(records: Vec<SampleRecord>) -> Self {
        let mut pending = VecDeque::new();
        let mut slots = HashMap::with_capacity(records.len());
        for record in records {
            if record.state == SampleState::Pending {
                pending.push_back(record.sample_id().to_string());
            }
            slots.insert(record.sample_id().to_string(), Mutex::new(record));
        }
        Self {
            slots,
            pending: Mutex::new(pending),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Atomically claim the next Pending sample, transitioning it to
    /// InFlight. Returns `None` once the queue is drained.
    pub fn claim_next(&self) -> Option<SampleRecord> {
        loop {
            let id = self.pending.lock().unwrap().pop_front()?;
            let Some(slot) = self.slots.get(&id) else {
                continue;
            };
            let mut record = slot.lock().unwrap();
            // A stale queue entry (e.g. after an idempotent revert pushed the
            // id twice) is skipped rather than double-claimed.
            if record.state == SampleState::Pending {
                record.state = SampleState::InFlight;
                return Some(record.clone());
            }
        }
    }

    /// Apply a transition to a claimed sample. Only InFlight records accept
    /// transitions; anything else indicates a scheduler bug and is rejected.
    pub fn apply(&self, sample_id: &str, transition: Transition) -> anyhow::Result<SampleRecord> {
        let slot = self
            .slots
            .get(sample_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown sample id: {}", sample_id))?;
        let mut record = slot.lock().unwrap();

        match transition {
            Transition::RevertToPending => {
                // Idempotent: reverting an already-Pending record is a no-op,
                // and terminal records are never demoted.
                if record.state == SampleState::InFlight {
                    record.state = SampleState::Pending;
                    self.pending
                        .lock()
                        .unwrap()
                        .push_back(sample_id.to_string());
                }
            }
            Transition::Completed { output, attempts, secs } => {
                if record.state != SampleState::InFlight {
                    anyhow::bail!(
                        "Cannot complete sample {} from state {}",
                        sample_id,
                        record.state.name()
                    );
                }
                record.state = SampleState::Completed;
                record.output = Some(output);
                record.attempts = attempts;
                record.last_error = None;
                record.inference_secs = Some(secs);
            }
            Transition::Failed { reason, attempts, last_error, secs } => {
                if record.state != SampleState::InFlight {
                    anyhow::bail!(
                        "Cannot fail sample {} from state {}",
                        sample_id,
                        record.state.name()
                    );
                }
                record.state = SampleState::Failed { reason };
                record.attempts = attempts;
                record.last_error = Some(last_error);
                record.inference_secs = Some(secs);
            }
        }
        Ok(record.clone())
    }

    /// Consistent point-in-time copy of every record.
    pub fn snapshot(&self) -> Vec<SampleRecord> {
        let mut records: Vec<SampleRecord> = self
            .slots
            .values()
            .map(|slot| slot.lock().unwrap().clone())
            .collect();
        records.sort_by(|a, b| a.sample_id().cmp(b.sample_id()));
        records
    }

    /// Per-state counts over the current table.
    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for slot in self.slots.values() {
            match slot.lock().unwrap().state {
                SampleState::Pending => counts.pending += 1,
                SampleState::InFlight => counts.in_flight += 1,
                SampleState::Completed => counts.completed += 1,
                SampleState::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }
}

/// Tally of records by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.completed + self.failed
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::TaskInstance;

    fn records(n: usize) -> Vec<SampleRecord> {
        (0..n)
            .map(|i| {
                SampleRecord::new(TaskInstance {
                    sample_id: format!("kv_dictionary/1k_{}", i),
                    task_type: "kv_dictionary".to_string(),
                    target_length: "1k".to_string(),
                    prompt: format!("prompt {}", i),
                    ground_truth: serde_json::json!({}),
                })
            })
            .collect()
    }

    #[test]
    fn test_claim_is_exclusive() {
        let store = SampleStore::new(records(3));
        let a = store.claim_next().unwrap();
        let b = store.claim_next().unwrap();
        let c = store.claim_next().unwrap();
        assert!(store.claim_next().is_none());

        let mut ids = vec![a.sample_id().to_string(), b.sample_id().to_string(), c.sample_id().to_string()];
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(store.counts().in_flight, 3);
    }

    #[test]
    fn test_conservation_through_transitions() {
        let store = SampleStore::new(records(4));
        assert_eq!(store.counts().total(), 4);

        let a = store.claim_next().unwrap();
        let b = store.claim_next().unwrap();
        store
            .apply(a.sample_id(), Transition::Completed {
                output: "out".into(),
                attempts: 1,
                secs: 0.1,
            })
            .unwrap();
        store
            .apply(b.sample_id(), Transition::Failed {
                reason: "unavailable".into(),
                attempts: 3,
                last_error: "503".into(),
                secs: 0.2,
            })
            .unwrap();

        let counts = store.counts();
        assert_eq!(counts.total(), 4);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 2);
    }

    #[test]
    fn test_revert_is_idempotent() {
        let store = SampleStore::new(records(1));
        let claimed = store.claim_next().unwrap();
        let id = claimed.sample_id().to_string();

        store.apply(&id, Transition::RevertToPending).unwrap();
        store.apply(&id, Transition::RevertToPending).unwrap();
        store.apply(&id, Transition::RevertToPending).unwrap();
        assert_eq!(store.counts().pending, 1);

        // Repeated reverts must not make the sample claimable twice.
        assert!(store.claim_next().is_some());
        assert!(store.claim_next().is_none());
    }

    #[test]
    fn test_terminal_records_never_demoted() {
        let store = SampleStore::new(records(1));
        let claimed = store.claim_next().unwrap();
        let id = claimed.sample_id().to_string();
        store
            .apply(&id, Transition::Completed { output: "out".into(), attempts: 1, secs: 0.0 })
            .unwrap();

        store.apply(&id, Transition::RevertToPending).unwrap();
        assert_eq!(store.counts().completed, 1);
        assert!(store.claim_next().is_none());

        // A second terminal transition is a scheduler bug.
        assert!(store
            .apply(&id, Transition::Completed { output: "again".into(), attempts: 1, secs: 0.0 })
            .is_err());
    }

    #[test]
    fn test_only_pending_seed_the_queue() {
        let mut recs = records(3);
        recs[0].state = SampleState::Completed;
        recs[0].output = Some("done".into());
        recs[1].state = SampleState::Failed { reason: "timeout".into() };
        let store = SampleStore::new(recs);

        let claimed = store.claim_next().unwrap();
        assert_eq!(claimed.sample_id(), "kv_dictionary/1k_2");
        assert!(store.claim_next().is_none());
    }
}

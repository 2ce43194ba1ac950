//! Request Store: keyed by request id, holds the mutable record plus its
//! completion signal; supports TTL-based GC.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::clock::{Clock, Instant};
use crate::error::EngineError;
use crate::types::{CredentialId, EngineValue, RequestId, RequestRecord, RequestStatus};

struct StoredRecord {
    record: Mutex<RequestRecord>,
    /// Signalled whenever the record reaches a terminal status, so a
    /// synchronous `poll_wait` caller does not have to spin.
    terminal: Notify,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("request id already exists")]
    DuplicateId,
    #[error("request not found")]
    NotFound,
    #[error("illegal status transition from {from:?}")]
    IllegalTransition { from: RequestStatus },
}

/// The map itself is guarded by a
/// reader-writer lock (cheap concurrent lookups/polls); each record has
/// its own mutex so mutating one request never blocks another.
#[derive(Default)]
pub struct RequestStore {
    records: RwLock<HashMap<RequestId, Arc<StoredRecord>>>,
}

impl RequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: RequestRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Err(StoreError::DuplicateId);
        }
        records.insert(
            record.id.clone(),
            Arc::new(StoredRecord {
                record: Mutex::new(record),
                terminal: Notify::new(),
            }),
        );
        Ok(())
    }

    /// A consistent snapshot — the per-record lock guarantees callers never
    /// see a partially-written record.
    pub fn get(&self, id: &str) -> Option<RequestRecord> {
        let stored = self.records.read().get(id).cloned()?;
        Some(stored.record.lock().clone())
    }

    fn with_stored<R>(&self, id: &str, f: impl FnOnce(&Arc<StoredRecord>) -> R) -> Option<R> {
        let stored = self.records.read().get(id).cloned()?;
        Some(f(&stored))
    }

    /// PENDING -> PROCESSING, stamping the assigned credential.
    pub fn mark_processing(&self, id: &str, credential: CredentialId) -> Result<(), StoreError> {
        self.with_stored(id, |stored| {
            let mut record = stored.record.lock();
            if record.status != RequestStatus::Pending {
                return Err(StoreError::IllegalTransition { from: record.status });
            }
            record.status = RequestStatus::Processing;
            record.assigned_credential = Some(credential);
            Ok(())
        })
        .unwrap_or(Err(StoreError::NotFound))
    }

    /// PROCESSING -> COMPLETED.
    pub fn complete(&self, id: &str, result: EngineValue, now: Instant) -> Result<(), StoreError> {
        let outcome = self.with_stored(id, |stored| {
            let mut record = stored.record.lock();
            if record.status != RequestStatus::Processing {
                return Err(StoreError::IllegalTransition { from: record.status });
            }
            record.status = RequestStatus::Completed;
            record.result = Some(result);
            record.terminal_at = Some(now);
            drop(record);
            stored.terminal.notify_waiters();
            Ok(())
        });
        outcome.unwrap_or(Err(StoreError::NotFound))
    }

    /// PENDING or PROCESSING -> FAILED.
    pub fn fail(&self, id: &str, error: EngineError, now: Instant) -> Result<(), StoreError> {
        let outcome = self.with_stored(id, |stored| {
            let mut record = stored.record.lock();
            if record.is_terminal() {
                return Err(StoreError::IllegalTransition { from: record.status });
            }
            record.status = RequestStatus::Failed;
            record.error = Some(error);
            record.terminal_at = Some(now);
            drop(record);
            stored.terminal.notify_waiters();
            Ok(())
        });
        outcome.unwrap_or(Err(StoreError::NotFound))
    }

    /// Cancels a PENDING or PROCESSING record, marking it FAILED(CANCELLED).
    /// Returns `Ok(true)` if cancellation took effect, `Ok(false)` if the
    /// record was already terminal. For PROCESSING, the flip to
    /// FAILED(CANCELLED) happens here, immediately and unconditionally — the
    /// worker's eventual `complete`/`fail` call for that id then finds the
    /// record already terminal and is silently rejected by those methods'
    /// own guards, discarding whatever result or error arrives late.
    pub fn cancel(&self, id: &str, now: Instant) -> Result<bool, StoreError> {
        self.with_stored(id, |stored| {
            let mut record = stored.record.lock();
            if record.is_terminal() {
                return Ok(false);
            }
            record.status = RequestStatus::Failed;
            record.error = Some(EngineError::Cancelled);
            record.terminal_at = Some(now);
            drop(record);
            stored.terminal.notify_waiters();
            Ok(true)
        })
        .ok_or(StoreError::NotFound)?
    }

    /// Waits for `id` to reach a terminal status or for `timeout` to
    /// elapse — the wall-clock wait timeout for a synchronous `wait` call.
    pub async fn wait_terminal(
        &self,
        id: &str,
        timeout: Duration,
        clock: &dyn Clock,
    ) -> Option<RequestRecord> {
        let stored = self.records.read().get(id).cloned()?;
        let start = clock.now();
        loop {
            // Register interest before checking status: `Notify::notified()`
            // captures the current notify generation at construction, so a
            // `notify_waiters()` call racing the status check below still
            // wakes this waiter, instead of being lost between the check
            // and the `.await`.
            let notified = stored.terminal.notified();
            {
                let record = stored.record.lock();
                if record.is_terminal() {
                    return Some(record.clone());
                }
            }
            let elapsed = clock.now().duration_since(start);
            if elapsed >= timeout {
                return Some(stored.record.lock().clone());
            }
            let remaining = timeout - elapsed;
            tokio::select! {
                _ = notified => {}
                _ = clock.sleep(remaining) => {
                    // Timed out: return the latest snapshot, terminal or not.
                    return Some(stored.record.lock().clone());
                }
            }
        }
    }

    /// Removes terminal records older than `max_age`. Cheap; called every
    /// dispatcher tick.
    pub fn gc(&self, max_age: Duration, now: Instant) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, stored| {
            let record = stored.record.lock();
            match record.terminal_at {
                Some(terminal_at) if now.duration_since(terminal_at) > max_age => false,
                _ => true,
            }
        });
        let removed = before - records.len();
        if removed > 0 {
            debug!(target: "store", removed, "gc reclaimed terminal records");
        }
        removed
    }

    pub fn counts(&self) -> StoreCounts {
        let records = self.records.read();
        let mut counts = StoreCounts::default();
        for stored in records.values() {
            match stored.record.lock().status {
                RequestStatus::Pending => counts.pending += 1,
                RequestStatus::Processing => counts.processing += 1,
                RequestStatus::Completed => counts.completed += 1,
                RequestStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StoreCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl Drop for RequestStore {
    fn drop(&mut self) {
        info!(target: "store", remaining = self.records.read().len(), "request store dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::types::{ClientCredential, Operation};
    use serde_json::json;

    fn record(id: &str, clock: &SystemClock) -> RequestRecord {
        RequestRecord::new(
            id.to_string(),
            ClientCredential("alice".into()),
            1,
            Operation::Generate {
                model: "m".into(),
                args: json!({}),
            },
            clock.now(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn complete_rejects_second_transition_on_terminal_record() {
        let clock = SystemClock;
        let store = RequestStore::new();
        store.insert(record("a", &clock)).unwrap();
        store.mark_processing("a", 0).unwrap();

        let now = clock.now();
        store.complete("a", json!("first"), now).unwrap();
        assert!(matches!(
            store.complete("a", json!("second"), now),
            Err(StoreError::IllegalTransition { .. })
        ));

        let got = store.get("a").unwrap();
        assert_eq!(got.result, Some(json!("first")), "second completion must not overwrite the first");
    }

    #[tokio::test(start_paused = true)]
    async fn fail_rejects_second_transition_on_terminal_record() {
        let clock = SystemClock;
        let store = RequestStore::new();
        store.insert(record("a", &clock)).unwrap();
        store.mark_processing("a", 0).unwrap();

        let now = clock.now();
        store.fail("a", EngineError::UpstreamFatal("boom".into()), now).unwrap();
        assert!(matches!(
            store.complete("a", json!("late"), now),
            Err(StoreError::IllegalTransition { .. })
        ));
        assert!(matches!(
            store.fail("a", EngineError::Internal("late".into()), now),
            Err(StoreError::IllegalTransition { .. })
        ));

        let got = store.get("a").unwrap();
        assert_eq!(got.result, None);
        assert!(matches!(got.error, Some(EngineError::UpstreamFatal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn result_and_error_are_mutually_exclusive_in_terminal_states() {
        let clock = SystemClock;
        let store = RequestStore::new();

        store.insert(record("completed", &clock)).unwrap();
        store.mark_processing("completed", 0).unwrap();
        store.complete("completed", json!("ok"), clock.now()).unwrap();
        let completed = store.get("completed").unwrap();
        assert!(completed.result.is_some());
        assert!(completed.error.is_none());

        store.insert(record("failed", &clock)).unwrap();
        store.mark_processing("failed", 0).unwrap();
        store.fail("failed", EngineError::Timeout, clock.now()).unwrap();
        let failed = store.get("failed").unwrap();
        assert!(failed.result.is_none());
        assert!(failed.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_record_transitions_to_failed_cancelled() {
        let clock = SystemClock;
        let store = RequestStore::new();
        store.insert(record("a", &clock)).unwrap();

        assert_eq!(store.cancel("a", clock.now()), Ok(true));
        let got = store.get("a").unwrap();
        assert_eq!(got.status, RequestStatus::Failed);
        assert!(matches!(got.error, Some(EngineError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_processing_record_also_transitions_to_failed_cancelled() {
        let clock = SystemClock;
        let store = RequestStore::new();
        store.insert(record("a", &clock)).unwrap();
        store.mark_processing("a", 0).unwrap();

        assert_eq!(store.cancel("a", clock.now()), Ok(true));
        let got = store.get("a").unwrap();
        assert_eq!(got.status, RequestStatus::Failed);
        assert!(matches!(got.error, Some(EngineError::Cancelled)));

        // The worker's late result must not resurrect or overwrite the
        // cancelled record.
        let late = store.complete("a", json!("too late"), clock.now());
        assert!(matches!(late, Err(StoreError::IllegalTransition { .. })));
        assert_eq!(store.get("a").unwrap().result, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_terminal_record_is_rejected() {
        let clock = SystemClock;
        let store = RequestStore::new();
        store.insert(record("a", &clock)).unwrap();
        store.mark_processing("a", 0).unwrap();
        store.complete("a", json!("ok"), clock.now()).unwrap();

        assert_eq!(store.cancel("a", clock.now()), Ok(false));
    }
}

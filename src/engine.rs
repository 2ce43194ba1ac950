//! The facade wiring the clock, credential pool, request store, priority
//! queue, and dispatcher together and exposing the client-facing
//! operations: `enqueue`, `poll`, `cancel`, `stats`, plus a synchronous
//! `poll_wait`.
//!
//! Constructed explicitly by the caller — no global/singleton instance.

use std::sync::Arc;

use tracing::info;

use crate::adapter::SharedAdapter;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::credential_pool::CredentialPool;
use crate::credential_validator::ClientCredentialValidator;
use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::queue::{PriorityQueue, QueueEntry};
use crate::store::{RequestStore, StoreCounts};
use crate::types::{ClientCredential, CredentialId, EngineValue, Operation, RequestId, RequestRecord, RequestStatus};

pub struct EngineStats {
    pub queue_size: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub total_rpm: u32,
    pub per_credential: Vec<crate::credential_pool::CredentialSnapshot>,
}

/// A consistent, client-facing view of a request's current state.
pub struct PollResult {
    pub status: RequestStatus,
    pub result: Option<EngineValue>,
    pub error: Option<EngineError>,
    pub assigned_credential: Option<CredentialId>,
}

impl From<RequestRecord> for PollResult {
    fn from(r: RequestRecord) -> Self {
        Self {
            status: r.status,
            result: r.result,
            error: r.error,
            assigned_credential: r.assigned_credential,
        }
    }
}

pub enum CancelOutcome {
    Accepted,
    NotFound,
    Terminal,
}

pub struct Engine {
    queue: Arc<PriorityQueue>,
    store: Arc<RequestStore>,
    pool: Arc<CredentialPool>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    dispatcher: Arc<Dispatcher>,
    dispatcher_handle: tokio::task::JoinHandle<()>,
}

impl Engine {
    /// Builds and starts the engine: one credential pool of `credential_count`
    /// upstream credentials, the given adapter, and the given config. The
    /// dispatcher control loop is spawned immediately.
    pub fn start(credential_count: usize, adapter: SharedAdapter, config: EngineConfig) -> Self {
        Self::start_with_clock(credential_count, adapter, config, Arc::new(SystemClock))
    }

    pub fn start_with_clock(
        credential_count: usize,
        adapter: SharedAdapter,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = Arc::new(PriorityQueue::new());
        let store = Arc::new(RequestStore::new());
        let pool = Arc::new(CredentialPool::new(credential_count, config.rpm_per_key));

        let dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::clone(&clock),
            adapter,
            config.clone(),
        );
        let dispatcher_handle = Arc::clone(&dispatcher).spawn();

        info!(target: "engine", credentials = credential_count, "engine started");

        Self {
            queue,
            store,
            pool,
            clock,
            config,
            dispatcher,
            dispatcher_handle,
        }
    }

    /// Marks an upstream credential unusable from the start (initialization
    /// failure).
    pub fn mark_credential_unusable(&self, id: CredentialId) {
        self.pool.mark_unusable(id);
    }

    pub fn enqueue(
        &self,
        client_credential: ClientCredential,
        priority: i32,
        operation: Operation,
    ) -> RequestId {
        let now = self.clock.now();
        let id = crate::types::new_request_id();
        let record = RequestRecord::new(id.clone(), client_credential, priority, operation, now);
        self.store
            .insert(record)
            .expect("uuid collision on request id");
        self.queue.push(QueueEntry {
            priority,
            enqueued_at: now,
            id: id.clone(),
        });
        id
    }

    pub fn poll(&self, id: &str) -> Option<PollResult> {
        self.store.get(id).map(PollResult::from)
    }

    /// Waits (asynchronously) until the request reaches a terminal state
    /// or the configured wall-clock timeout elapses; on timeout the
    /// request continues executing in the background.
    pub async fn poll_wait(&self, id: &str, is_stream: bool) -> Option<PollResult> {
        let timeout = if is_stream {
            self.config.wait_timeout_stream
        } else {
            self.config.wait_timeout_unary
        };
        let record = self.store.wait_terminal(id, timeout, self.clock.as_ref()).await?;
        Some(PollResult::from(record))
    }

    pub fn cancel(&self, id: &str) -> CancelOutcome {
        let now = self.clock.now();
        match self.store.cancel(id, now) {
            Ok(true) => CancelOutcome::Accepted,
            Ok(false) => CancelOutcome::Terminal,
            Err(_) => CancelOutcome::NotFound,
        }
    }

    pub fn stats(&self) -> EngineStats {
        let StoreCounts {
            pending,
            processing,
            completed,
            failed,
        } = self.store.counts();
        EngineStats {
            queue_size: self.queue.len(),
            pending,
            processing,
            completed,
            failed,
            in_flight: self.dispatcher.in_flight(),
            total_rpm: self.pool.len() as u32 * self.config.rpm_per_key,
            per_credential: self.pool.snapshot(self.clock.now()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn shutdown(self) {
        self.dispatcher.shutdown();
        let _ = self.dispatcher_handle.await;
        info!(target: "engine", "engine stopped");
    }
}

/// Validates a client token against the given validator before handing an
/// enqueue request to the engine; the HTTP ingress layer (out of scope)
/// would call this, but it is exercised directly in tests here.
pub fn authorize(
    validator: &dyn ClientCredentialValidator,
    token: &str,
) -> Result<ClientCredential, EngineError> {
    validator
        .validate(token)
        .ok_or_else(|| EngineError::Validation("unknown client credential".into()))
}

//! Dispatcher: the control loop. Drains the priority queue subject to the
//! concurrency cap and credential eligibility, launches workers that
//! invoke the upstream adapter with retry, and updates the request store.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::adapter::{run_with_retry, SharedAdapter};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::credential_pool::CredentialPool;
use crate::error::EngineError;
use crate::queue::PriorityQueue;
use crate::store::RequestStore;

const EMPTY_QUEUE_BACKOFF: Duration = Duration::from_millis(500);
const CONCURRENCY_CAP_BACKOFF: Duration = Duration::from_millis(100);
const NO_CREDENTIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Shared engine state the dispatcher drives and workers mutate. Held
/// behind `Arc` so the dispatcher loop and every spawned worker can see
/// the same store/pool/queue without a singleton — constructed and passed
/// explicitly, never global.
pub struct Dispatcher {
    pub queue: Arc<PriorityQueue>,
    pub store: Arc<RequestStore>,
    pub pool: Arc<CredentialPool>,
    pub clock: Arc<dyn Clock>,
    pub adapter: SharedAdapter,
    pub config: EngineConfig,
    in_flight: AtomicUsize,
    worker_done: Notify,
    stopped: AtomicBool,
    shutdown: Notify,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<PriorityQueue>,
        store: Arc<RequestStore>,
        pool: Arc<CredentialPool>,
        clock: Arc<dyn Clock>,
        adapter: SharedAdapter,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            store,
            pool,
            clock,
            adapter,
            config,
            in_flight: AtomicUsize::new(0),
            worker_done: Notify::new(),
            stopped: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Spawns the control loop as its own task. Exactly one dispatcher
    /// thread drives this loop — never run two against the same state.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    async fn run(self: Arc<Self>) {
        info!(target: "dispatcher", "control loop starting");
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            self.store.gc(self.config.result_ttl, self.clock.now());

            if self.queue.is_empty() {
                self.wait_or_stop(self.queue.wait_non_empty(self.clock.as_ref(), EMPTY_QUEUE_BACKOFF))
                    .await;
                continue;
            }

            if self.in_flight() >= self.config.max_concurrent {
                self.wait_or_stop(wait_notified(
                    &self.worker_done,
                    self.clock.as_ref(),
                    CONCURRENCY_CAP_BACKOFF,
                ))
                .await;
                continue;
            }

            let now = self.clock.now();
            let credential = match self.pool.acquire(now) {
                Some(c) => c,
                None => {
                    self.wait_or_stop(self.clock.sleep(NO_CREDENTIAL_BACKOFF)).await;
                    continue;
                }
            };

            let Some(entry) = self.queue.pop() else {
                continue;
            };

            let record = match self.store.get(&entry.id) {
                Some(r) => r,
                None => continue, // GC'd already
            };
            if record.status != crate::types::RequestStatus::Pending {
                // e.g. cancelled while queued: credential was only selected,
                // never used, so there is nothing to release.
                continue;
            }

            if let Err(e) = self.store.mark_processing(&entry.id, credential) {
                warn!(target: "dispatcher", id = %entry.id, error = %e, "could not mark processing");
                continue;
            }
            self.pool.record_use(credential, now);
            self.in_flight.fetch_add(1, Ordering::SeqCst);

            let worker = Arc::clone(&self);
            let id = entry.id.clone();
            tokio::spawn(async move {
                worker.run_worker(id, credential).await;
            });
        }
        info!(target: "dispatcher", "control loop stopped");
    }

    /// Races a wait future against shutdown so `shutdown()` wakes a
    /// sleeping dispatcher immediately instead of waiting out its backoff.
    async fn wait_or_stop(&self, wait: impl std::future::Future<Output = ()>) {
        tokio::select! {
            _ = wait => {}
            _ = self.shutdown.notified() => {}
        }
    }

    async fn run_worker(self: Arc<Self>, id: String, credential: usize) {
        let Some(record) = self.store.get(&id) else {
            return;
        };
        let operation = record.operation.clone();

        let outcome = tokio::spawn({
            let dispatcher = Arc::clone(&self);
            let operation = operation.clone();
            async move {
                run_with_retry(
                    dispatcher.adapter.as_ref(),
                    &dispatcher.pool,
                    dispatcher.clock.as_ref(),
                    &dispatcher.config,
                    credential,
                    &operation,
                )
                .await
            }
        })
        .await;

        let now = self.clock.now();
        match outcome {
            Ok(Ok(value)) => {
                if let Err(e) = self.store.complete(&id, value, now) {
                    warn!(target: "dispatcher", id = %id, error = %e, "complete transition rejected");
                }
            }
            Ok(Err(engine_err)) => {
                if let Err(e) = self.store.fail(&id, engine_err, now) {
                    warn!(target: "dispatcher", id = %id, error = %e, "fail transition rejected");
                }
            }
            Err(join_err) => {
                // Worker panicked; caught by tokio's task isolation rather
                // than unwinding the dispatcher.
                error!(target: "dispatcher", id = %id, error = %join_err, "worker panicked");
                let _ = self.store.fail(
                    &id,
                    EngineError::Internal(format!("worker panicked: {join_err}")),
                    now,
                );
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.worker_done.notify_one();
    }
}

async fn wait_notified(notify: &Notify, clock: &dyn Clock, timeout: Duration) {
    tokio::select! {
        _ = notify.notified() => {}
        _ = clock.sleep(timeout) => {}
    }
}

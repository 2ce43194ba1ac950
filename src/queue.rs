//! Priority Queue: min-heap ordered by `(priority, enqueued_at)`. The
//! dispatcher only pops; producers only push. No middle removal —
//! cancellation is handled by marking the record in the store instead.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::clock::{Clock, Instant};
use crate::types::RequestId;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QueueEntry {
    pub priority: i32,
    pub enqueued_at: Instant,
    pub id: RequestId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.enqueued_at.cmp(&other.enqueued_at))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A single mutex around a std `BinaryHeap`, plus a `Notify` so the
/// dispatcher can await new work instead of busy-polling an empty queue.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: Mutex<BinaryHeap<Reverse<QueueEntry>>>,
    notify: Notify,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, entry: QueueEntry) {
        self.heap.lock().push(Reverse(entry));
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<QueueEntry> {
        self.heap.lock().pop().map(|Reverse(e)| e)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Waits until the queue is (or becomes) non-empty, or `timeout`
    /// elapses, whichever comes first.
    pub async fn wait_non_empty(&self, clock: &dyn Clock, timeout: std::time::Duration) {
        if !self.is_empty() {
            return;
        }
        let notified = self.notify.notified();
        tokio::select! {
            _ = notified => {}
            _ = clock.sleep(timeout) => {}
        }
    }
}

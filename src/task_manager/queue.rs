//! Per-destination FIFO queue: one queue per
//! destination node, draining strictly in insertion order. Owned
//! one-writer/one-reader — the job ingest thread enqueues, the dispatch
//! worker for that destination pops.

use super::job::SubTask;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio::sync::Mutex;

pub struct NodeQueue {
    items: Mutex<VecDeque<SubTask>>,
    notify: Notify,
}

impl NodeQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub async fn push_back(&self, item: SubTask) {
        self.items.lock().await.push_back(item);
        self.notify.notify_one();
    }

    /// Re-inserts at the head — used on a result-wait failure to restore
    /// the sub-task to the front of its original queue, preserving the
    /// rest of the queue's order.
    pub async fn push_front(&self, item: SubTask) {
        self.items.lock().await.push_front(item);
        self.notify.notify_one();
    }

    /// Pops the head, waiting if the queue is currently empty.
    pub async fn pop_front(&self) -> SubTask {
        loop {
            // Enroll as a waiter before checking so a concurrent push
            // landing between the check and the `.await` below is never
            // missed (see the matching note in `agent::admission`).
            let notified = self.notify.notified();
            if let Some(item) = self.items.lock().await.pop_front() {
                return item;
            }
            notified.await;
        }
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

impl Default for NodeQueue {
    fn default() -> Self {
        Self::new()
    }
}

//! Bounded in-process work queue of conversation ids.
//!
//! Many producers (admission handlers, recovery sweep), one consumer (the
//! analyzer). No deduplication and no durability: the analyzer tolerates
//! duplicates and the recovery sweep rediscovers anything lost in a crash.
//!
//! This interface (`offer`/`take`/`depth`/`close`) is the seam for swapping
//! in an external broker when scaling beyond one process.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

struct QueueState {
    items: VecDeque<String>,
    closed: bool,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Non-blocking enqueue. False when the queue is full or closed.
    pub fn offer(&self, conversation_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed || state.items.len() >= self.capacity {
            return false;
        }
        state.items.push_back(conversation_id.to_string());
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Dequeue one id, waiting until one is available. Returns None only
    /// once the queue has been closed and fully drained.
    pub async fn take(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(id) = state.items.pop_front() {
                    return Some(id);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn depth(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting offers and unblock waiters; queued items stay
    /// takeable so the consumer can drain.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn offer_take_fifo() {
        let q = WorkQueue::new(10);
        assert!(q.offer("a"));
        assert!(q.offer("b"));
        assert_eq!(q.depth(), 2);
        assert_eq!(q.take().await.as_deref(), Some("a"));
        assert_eq!(q.take().await.as_deref(), Some("b"));
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn offer_rejects_when_full() {
        let q = WorkQueue::new(1);
        assert!(q.offer("a"));
        assert!(!q.offer("b"));
        assert_eq!(q.depth(), 1);
        // Draining frees the slot again.
        q.take().await;
        assert!(q.offer("c"));
    }

    #[tokio::test]
    async fn take_blocks_until_offer() {
        let q = Arc::new(WorkQueue::new(4));
        let q2 = q.clone();
        let taker = tokio::spawn(async move { q2.take().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(q.offer("late"));
        let got = tokio::time::timeout(Duration::from_secs(1), taker)
            .await
            .expect("taker timed out")
            .unwrap();
        assert_eq!(got.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn close_unblocks_waiters_and_drains() {
        let q = Arc::new(WorkQueue::new(4));
        assert!(q.offer("pending"));
        q.close();
        assert!(!q.offer("rejected"));
        // Remaining item is still takeable, then None signals shutdown.
        assert_eq!(q.take().await.as_deref(), Some("pending"));
        assert!(q.take().await.is_none());

        // A waiter blocked at close time is released too.
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.take().await });
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_are_not_deduplicated() {
        let q = WorkQueue::new(4);
        assert!(q.offer("same"));
        assert!(q.offer("same"));
        assert_eq!(q.depth(), 2);
    }
}

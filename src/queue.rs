use std::cmp::Reverse;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{JudgeError, JudgeResult};
use crate::submission::Priority;

/// What the queue knows about a waiting submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub submission_id: u32,
    pub priority: Priority,
    /// RFC 3339 timestamp, ordered lexicographically
    pub submitted_at: String,
}

impl QueueEntry {
    fn order_key(&self) -> (Reverse<Priority>, &str, u32) {
        (
            Reverse(self.priority),
            self.submitted_at.as_str(),
            self.submission_id,
        )
    }
}

#[derive(Default)]
struct QueueState {
    /// Kept sorted by priority, then submission time, then id
    entries: VecDeque<QueueEntry>,
    /// Slots promised to admissions that have not committed yet
    reserved: usize,
}

impl QueueState {
    fn insert(&mut self, entry: QueueEntry) -> usize {
        let idx = self
            .entries
            .partition_point(|e| e.order_key() <= entry.order_key());
        self.entries.insert(idx, entry);
        idx + 1
    }
}

/// Bounded queue of submissions waiting for a worker
pub struct SubmissionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl SubmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claims a slot for a new submission, or reports backpressure
    pub fn reserve(self: &Arc<Self>) -> JudgeResult<Reservation> {
        let mut state = self.state.lock();
        if state.entries.len() + state.reserved >= self.capacity {
            return Err(JudgeError::Backpressure {
                capacity: self.capacity,
            });
        }
        state.reserved += 1;

        Ok(Reservation {
            queue: Some(Arc::clone(self)),
        })
    }

    /// Puts a submission back without checking capacity
    ///
    /// Used for work the queue has already accepted once: infrastructure
    /// retries and crash recovery.
    pub fn requeue(&self, entry: QueueEntry) -> usize {
        let position = self.state.lock().insert(entry);
        self.notify.notify_one();
        position
    }

    /// Waits for the next submission to judge
    pub async fn pop(&self) -> QueueEntry {
        loop {
            if let Some(entry) = self.state.lock().entries.pop_front() {
                return entry;
            }
            self.notify.notified().await;
        }
    }

    /// Removes a waiting submission, returning whether it was queued
    pub fn cancel(&self, submission_id: u32) -> bool {
        let mut state = self.state.lock();
        let before_len = state.entries.len();
        state.entries.retain(|e| e.submission_id != submission_id);
        before_len != state.entries.len()
    }

    /// 1-based position of a waiting submission
    pub fn position(&self, submission_id: u32) -> Option<usize> {
        self.state
            .lock()
            .entries
            .iter()
            .position(|e| e.submission_id == submission_id)
            .map(|idx| idx + 1)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A claimed queue slot, released on drop unless committed
pub struct Reservation {
    queue: Option<Arc<SubmissionQueue>>,
}

impl Reservation {
    /// Turns the slot into a queued entry and returns its position
    pub fn commit(mut self, entry: QueueEntry) -> usize {
        let Some(queue) = self.queue.take() else {
            return 0;
        };
        let position = {
            let mut state = queue.state.lock();
            state.reserved -= 1;
            state.insert(entry)
        };
        queue.notify.notify_one();
        position
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.state.lock().reserved -= 1;
        }
    }
}

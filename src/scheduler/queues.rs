// Bounded per-priority FIFO queues with a shared wakeup

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

use crate::scheduler::types::{Priority, QueuedRequest};

/// One bounded FIFO per priority level. The global bound is split evenly
/// across levels. Each level has its own lock; a shared `Notify` wakes the
/// dispatcher on enqueue.
pub(crate) struct PriorityQueues {
    levels: [Mutex<VecDeque<QueuedRequest>>; Priority::COUNT],
    notify: Notify,
    capacity_per_level: usize,
}

impl PriorityQueues {
    pub(crate) fn new(max_queue_size: usize) -> Self {
        Self {
            levels: [
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
            ],
            notify: Notify::new(),
            capacity_per_level: (max_queue_size / Priority::COUNT).max(1),
        }
    }

    pub(crate) fn capacity_per_level(&self) -> usize {
        self.capacity_per_level
    }

    /// Enqueue without blocking; a full level hands the request back.
    pub(crate) fn push(&self, queued: QueuedRequest) -> Result<(), QueuedRequest> {
        {
            let mut level = self.levels[queued.request.priority.index()].lock().unwrap();
            if level.len() >= self.capacity_per_level {
                return Err(queued);
            }
            level.push_back(queued);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pop ready requests into `batch`, highest priority first, until
    /// `target` is reached. Cancelled requests are discarded on the way.
    /// Returns whether the sweep picked up a HIGH or CRITICAL request.
    pub(crate) fn sweep(&self, target: usize, batch: &mut Vec<QueuedRequest>) -> bool {
        let mut has_urgent = false;
        for priority in Priority::HIGHEST_FIRST {
            if batch.len() >= target {
                break;
            }
            let mut level = self.levels[priority.index()].lock().unwrap();
            while batch.len() < target {
                match level.pop_front() {
                    Some(queued) if queued.is_cancelled() => drop(queued),
                    Some(queued) => {
                        if matches!(priority, Priority::High | Priority::Critical) {
                            has_urgent = true;
                        }
                        batch.push(queued);
                    }
                    None => break,
                }
            }
        }
        has_urgent
    }

    /// Block until new work arrives or `timeout` elapses.
    pub(crate) async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    /// Wake the dispatcher (used on shutdown).
    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn sizes(&self) -> [usize; Priority::COUNT] {
        let mut sizes = [0usize; Priority::COUNT];
        for (i, level) in self.levels.iter().enumerate() {
            sizes[i] = level.lock().unwrap().len();
        }
        sizes
    }

    /// Remove everything still queued (shutdown drain).
    pub(crate) fn drain_all(&self) -> Vec<QueuedRequest> {
        let mut drained = Vec::new();
        for priority in Priority::HIGHEST_FIRST {
            let mut level = self.levels[priority.index()].lock().unwrap();
            drained.extend(level.drain(..));
        }
        drained
    }
}

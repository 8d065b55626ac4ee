use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use crate::task::{PublicTask, Task, TaskId};

/// Per-task progress fan-out. Subscribers receive the sanitized task on every
/// progress tick and status transition, through the same path so the two
/// cannot reorder against each other.
#[derive(Default)]
pub struct ProgressHub {
    subscribers: Mutex<HashMap<TaskId, HashMap<u64, Sender<PublicTask>>>>,
    next_id: AtomicU64,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, task_id: TaskId) -> (u64, Receiver<PublicTask>) {
        let (tx, rx) = channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.entry(task_id).or_default().insert(id, tx);
        }
        (id, rx)
    }

    pub fn unsubscribe(&self, task_id: TaskId, subscriber_id: u64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            if let Some(entry) = subscribers.get_mut(&task_id) {
                entry.remove(&subscriber_id);
                if entry.is_empty() {
                    subscribers.remove(&task_id);
                }
            }
        }
    }

    /// Deliver the current task state to every subscriber. The set is
    /// snapshotted under the lock and the sends happen outside it, so a slow
    /// consumer never blocks the producer.
    pub fn notify(&self, task: &Task) {
        let snapshot: Vec<Sender<PublicTask>> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers
                .get(&task.id)
                .map(|entry| entry.values().cloned().collect())
                .unwrap_or_default(),
            Err(_) => return,
        };
        if snapshot.is_empty() {
            return;
        }
        let public = task.to_public();
        for sender in snapshot {
            let _ = sender.send(public.clone());
        }
    }

    /// Drop every subscriber of a task; their receivers observe disconnect.
    pub fn clear_task(&self, task_id: TaskId) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&task_id);
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, task_id: TaskId) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.get(&task_id).map(HashMap::len).unwrap_or(0))
            .unwrap_or(0)
    }
}

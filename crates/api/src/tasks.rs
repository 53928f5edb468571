use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use korral_deploy::{TaskEvent, TaskState};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Latest status per background task, for polling front-ends.
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    latest: Arc<Mutex<BTreeMap<u64, TaskEvent>>>,
}

impl TaskQueue {
    pub fn new() -> Self { Self::default() }

    /// Fold every event from `rx` into the queue until all senders are gone.
    pub fn collect(&self, mut rx: mpsc::Receiver<TaskEvent>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await { queue.apply(ev); }
            debug!("tasks: event channel closed");
        })
    }

    pub fn apply(&self, ev: TaskEvent) {
        if let Ok(mut m) = self.latest.lock() { m.insert(ev.task, ev); }
    }

    pub fn get(&self, task: u64) -> Option<TaskEvent> { self.latest.lock().ok().and_then(|m| m.get(&task).cloned()) }

    /// All tasks, oldest first.
    pub fn snapshot(&self) -> Vec<TaskEvent> { self.latest.lock().map(|m| m.values().cloned().collect()).unwrap_or_default() }

    /// Forget finished tasks; returns how many were dropped.
    pub fn clear_finished(&self) -> usize {
        let Ok(mut m) = self.latest.lock() else { return 0 };
        let before = m.len();
        m.retain(|_, ev| ev.state == TaskState::Running);
        before - m.len()
    }
}

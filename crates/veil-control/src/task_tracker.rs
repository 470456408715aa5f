//! Task tracking for agent bridge tasks
//!
//! Tracks the JoinHandle of each agent's bridge so it can be aborted when the
//! agent is deregistered.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Tracks background tasks keyed by agent id
pub struct TaskTracker {
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl TaskTracker {
    /// Create a new task tracker
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a task for an agent
    pub fn register(&self, agent_id: u64, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            // If there was a previous task, abort it first
            if let Some(old_handle) = tasks.remove(&agent_id) {
                old_handle.abort();
            }
            tasks.insert(agent_id, handle);
        }
    }

    /// Unregister and abort the task of an agent
    pub fn unregister(&self, agent_id: u64) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(handle) = tasks.remove(&agent_id) {
                handle.abort();
            }
        }
    }

    /// Drop entries of tasks that already finished
    pub fn reap(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|_, handle| !handle.is_finished());
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

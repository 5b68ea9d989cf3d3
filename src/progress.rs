//! Ephemeral per-task status cache
//!
//! Latest status snapshot per task id, written by the reporting pipeline and
//! read by unrelated status-query callers. Entries are retired on a delay
//! after the task finishes so slow pollers get a final read window.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

/// How long a finished task's snapshot stays readable
pub const STATUS_LINGER: Duration = Duration::from_secs(5);

/// Latest known status of a running task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    /// Human-readable phase, e.g. "Compiling" or "Running 3/4"
    pub result: String,
    pub score: f64,
    /// Total time in milliseconds
    pub time: u32,
    /// Peak memory in KB
    pub memory: u32,
}

impl StatusSnapshot {
    pub fn compiling() -> Self {
        Self {
            result: "Compiling".to_string(),
            score: 0.0,
            time: 0,
            memory: 0,
        }
    }
}

#[derive(Clone)]
pub struct ProgressCache {
    inner: Arc<DashMap<String, StatusSnapshot>>,
    linger: Duration,
}

impl ProgressCache {
    pub fn new() -> Self {
        Self::with_linger(STATUS_LINGER)
    }

    pub fn with_linger(linger: Duration) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            linger,
        }
    }

    pub fn update(&self, task_id: &str, snapshot: StatusSnapshot) {
        self.inner.insert(task_id.to_string(), snapshot);
    }

    pub fn get(&self, task_id: &str) -> Option<StatusSnapshot> {
        self.inner.get(task_id).map(|s| s.clone())
    }

    /// Remove the entry after the linger window. The snapshot stays readable
    /// in the meantime.
    pub fn retire(&self, task_id: &str) {
        let inner = Arc::clone(&self.inner);
        let task_id = task_id.to_string();
        let linger = self.linger;
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            inner.remove(&task_id);
        });
    }
}

impl Default for ProgressCache {
    fn default() -> Self {
        Self::new()
    }
}

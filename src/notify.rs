//! External observer notifications
//!
//! The dispatch core pushes live judging events to an external observer (the
//! UI push layer in the full system). Delivery is fire-and-forget: the core
//! only guarantees the notification was attempted.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::warn;

use crate::report::{CompileStatus, JudgeProgress};

/// Pub/sub channels for observer events
pub mod channels {
    pub const TASK_STARTED: &str = "judge:events:started";
    pub const COMPILE_STATUS: &str = "judge:events:compiled";
    pub const PROGRESS: &str = "judge:events:progress";
    pub const FINISHED: &str = "judge:events:finished";
    pub const CLEANUP: &str = "judge:events:cleanup";
}

/// One method per event kind; implementations must swallow their own errors.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn task_started(&self, task_id: &str);
    async fn compile_status(&self, task_id: &str, status: &CompileStatus);
    async fn progress(&self, task_id: &str, progress: &JudgeProgress);
    async fn finished(&self, task_id: &str, progress: &JudgeProgress);
    /// Release any transient per-task state the observer holds
    async fn cleanup(&self, task_id: &str);
}

/// Publishes observer events as JSON on Redis pub/sub channels.
pub struct RedisNotifier {
    conn: Mutex<MultiplexedConnection>,
}

impl RedisNotifier {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    async fn publish(&self, channel: &str, payload: serde_json::Value) {
        let json = payload.to_string();
        let mut conn = self.conn.lock().await;
        // Ignore errors - observer notifications are non-critical
        if let Err(e) = conn.publish::<_, _, ()>(channel, &json).await {
            warn!("Failed to publish observer event on {}: {}", channel, e);
        }
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn task_started(&self, task_id: &str) {
        self.publish(channels::TASK_STARTED, serde_json::json!({ "task_id": task_id }))
            .await;
    }

    async fn compile_status(&self, task_id: &str, status: &CompileStatus) {
        self.publish(
            channels::COMPILE_STATUS,
            serde_json::json!({ "task_id": task_id, "status": status }),
        )
        .await;
    }

    async fn progress(&self, task_id: &str, progress: &JudgeProgress) {
        self.publish(
            channels::PROGRESS,
            serde_json::json!({ "task_id": task_id, "progress": progress }),
        )
        .await;
    }

    async fn finished(&self, task_id: &str, progress: &JudgeProgress) {
        self.publish(
            channels::FINISHED,
            serde_json::json!({ "task_id": task_id, "progress": progress }),
        )
        .await;
    }

    async fn cleanup(&self, task_id: &str) {
        self.publish(channels::CLEANUP, serde_json::json!({ "task_id": task_id }))
            .await;
    }
}

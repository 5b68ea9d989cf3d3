//! Durable judge record access
//!
//! The durable record is owned by the wider application; this core only loads
//! it, overwrites result fields on the result stream, saves it back, and
//! triggers the store's "propagate to related entities" side effect.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Key prefix for stored judge records
pub const RECORD_KEY_PREFIX: &str = "judge:record:";

/// Channel carrying record-updated signals for related-entity refresh
pub const RECORD_UPDATED_CHANNEL: &str = "judge:record-updates";

const RECORD_EXPIRY_SECS: u64 = 3600; // 1 hour

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeRecord {
    pub task_id: String,
    pub score: f64,
    /// True while no final result has been reported
    pub pending: bool,
    pub status: String,
    /// Total time in milliseconds
    pub total_time: u32,
    /// Peak memory in KB
    pub max_memory: u32,
    /// Full per-case result payload as reported by the worker
    pub result: Option<serde_json::Value>,
    /// Compile output, stored separately from the run result
    pub compilation: Option<serde_json::Value>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// `Ok(None)` when no record is tracked for this task id.
    async fn load(&self, task_id: &str) -> Result<Option<JudgeRecord>>;

    async fn save(&self, record: &JudgeRecord) -> Result<()>;

    /// Push the saved result out to related entities (rankings, problem
    /// statistics). Called after `save` on a final result.
    async fn propagate(&self, record: &JudgeRecord) -> Result<()>;
}

/// Record store over Redis string keys holding JSON bodies.
pub struct RedisRecordStore {
    conn: Mutex<MultiplexedConnection>,
}

impl RedisRecordStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn key(task_id: &str) -> String {
        format!("{}{}", RECORD_KEY_PREFIX, task_id)
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn load(&self, task_id: &str) -> Result<Option<JudgeRecord>> {
        let mut conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .get(Self::key(task_id))
            .await
            .context("Failed to load judge record")?;
        match raw {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("Malformed judge record")?,
            )),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &JudgeRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let mut conn = self.conn.lock().await;
        conn.set_ex::<_, _, ()>(Self::key(&record.task_id), &json, RECORD_EXPIRY_SECS)
            .await
            .context("Failed to save judge record")?;
        Ok(())
    }

    async fn propagate(&self, record: &JudgeRecord) -> Result<()> {
        let payload = serde_json::json!({
            "task_id": record.task_id,
            "status": record.status,
            "score": record.score,
        })
        .to_string();
        let mut conn = self.conn.lock().await;
        conn.publish::<_, _, ()>(RECORD_UPDATED_CHANNEL, &payload)
            .await
            .context("Failed to publish record update")?;
        Ok(())
    }
}

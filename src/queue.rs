//! Shared priority queue of pending tasks
//!
//! Workers poll the queue concurrently, one poller per connection. The single
//! correctness contract that everything else leans on: an entry removed by one
//! `poll` is never handed to another poller until it is pushed back.
//!
//! Two backends: a Redis sorted set shared across processes (ZADD / BZPOPMAX)
//! and an in-process binary heap used by tests and single-node deployments.

use std::collections::BinaryHeap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::warn;

use crate::task::QueueEntry;

/// Sorted set holding pending tasks, scored by priority
pub const TASK_QUEUE_KEY: &str = "judge:tasks";

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Insert the entry, scored by `entry.priority()`. Visible to any
    /// subsequent `poll` from any process sharing the queue. Backend failures
    /// propagate to the caller; no retries here.
    async fn push(&self, entry: &QueueEntry) -> Result<()>;

    /// Block up to `timeout` for the highest-priority entry. `Ok(None)` on
    /// timeout with no side effect; otherwise the entry is atomically removed.
    async fn poll(&self, timeout: Duration) -> Result<Option<QueueEntry>>;
}

/// Redis sorted-set backed queue.
///
/// BZPOPMAX blocks its whole connection, so pollers must not share one
/// multiplexed connection. A small pool of idle connections is kept; each
/// operation takes one (or dials a new one) and returns it on success. A
/// connection that saw an error is dropped instead of returned.
pub struct RedisTaskQueue {
    client: redis::Client,
    key: String,
    idle: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisTaskQueue {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            key: TASK_QUEUE_KEY.to_string(),
            idle: Mutex::new(Vec::new()),
        }
    }

    async fn take_conn(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok(conn);
        }
        self.client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")
    }

    async fn put_conn(&self, conn: MultiplexedConnection) {
        self.idle.lock().await.push(conn);
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn push(&self, entry: &QueueEntry) -> Result<()> {
        let member = serde_json::to_string(entry)?;
        let mut conn = self.take_conn().await?;
        conn.zadd::<_, _, _, ()>(&self.key, &member, entry.priority())
            .await
            .context("Redis ZADD failed")?;
        self.put_conn(conn).await;
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<QueueEntry>> {
        let mut conn = self.take_conn().await?;
        let popped: Option<(String, String, f64)> = conn
            .bzpopmax(&self.key, timeout.as_secs_f64())
            .await
            .context("Redis BZPOPMAX failed")?;
        self.put_conn(conn).await;

        let Some((_, member, _score)) = popped else {
            return Ok(None);
        };
        match serde_json::from_str::<QueueEntry>(&member) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                // Same treatment as an unparseable job in the worker: drop it
                // rather than poison the poll loop.
                warn!("Discarding malformed queue member: {}. Data: {}", e, member);
                Ok(None)
            }
        }
    }
}

/// Heap entry ordered by priority, then insertion sequence (FIFO among equal
/// priorities) so pop order is a total order.
struct HeapEntry {
    priority: f64,
    seq: u64,
    entry: QueueEntry,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority wins; earlier seq wins among equals
        self.priority
            .total_cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct MemoryQueueState {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

/// In-process queue for tests and single-node deployments.
pub struct MemoryTaskQueue {
    state: Mutex<MemoryQueueState>,
    notify: Notify,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryQueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn push(&self, entry: &QueueEntry) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(HeapEntry {
                priority: entry.priority(),
                seq,
                entry: entry.clone(),
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<QueueEntry>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(top) = state.heap.pop() {
                    if !state.heap.is_empty() {
                        // Pass the wakeup on to the next waiting poller
                        self.notify.notify_one();
                    }
                    return Ok(Some(top.entry));
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }
}

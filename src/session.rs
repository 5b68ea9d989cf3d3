//! Per-worker-connection dispatch session
//!
//! State machine: Idle -> WaitingForTask -> PendingAck -> Idle, with
//! Disconnected reachable from anywhere. A task is only "in flight" between
//! delivery and the worker's acknowledgment; any disconnect observed in that
//! window turns into a requeue, which is the at-least-once guarantee.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::TaskQueue;
use crate::task::QueueEntry;

/// Upper bound on a single queue poll. Bounds how long a dead connection can
/// hold a poll loop when cancellation is not observed promptly.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff after a queue backend error before polling again
const POLL_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Resolves when the worker acknowledges a delivered task.
///
/// Resolution is ack-or-link-drop only; there is deliberately no deadline
/// here (see the note in `dispatch_loop`).
pub struct DeliveryPending {
    rx: oneshot::Receiver<()>,
}

impl DeliveryPending {
    pub fn new(rx: oneshot::Receiver<()>) -> Self {
        Self { rx }
    }

    /// True once the worker acked; false if the link dropped without acking.
    pub async fn acked(self) -> bool {
        self.rx.await.is_ok()
    }
}

/// Two-phase task delivery to one worker connection.
#[async_trait]
pub trait WorkerLink: Send + Sync {
    /// Send the task envelope; the returned handle resolves on the worker's
    /// delivery acknowledgment.
    async fn deliver(&self, entry: &QueueEntry) -> Result<DeliveryPending>;
}

pub struct ConnectionSession {
    queue: Arc<dyn TaskQueue>,
    link: Arc<dyn WorkerLink>,
    cancel: CancellationToken,
    waiting: AtomicBool,
    /// The in-flight entry while in PendingAck. `take()` is the single point
    /// of discharge, so the cancel path and the disconnect path cannot both
    /// requeue the same entry.
    pending_ack: Mutex<Option<QueueEntry>>,
}

impl ConnectionSession {
    pub fn new(queue: Arc<dyn TaskQueue>, link: Arc<dyn WorkerLink>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            link,
            cancel: CancellationToken::new(),
            waiting: AtomicBool::new(false),
            pending_ack: Mutex::new(None),
        })
    }

    /// Handle a `wait_for_task` request. Returns true when a poll loop was
    /// started; a duplicate request while already waiting is ignored and
    /// returns false, so a flaky worker cannot spawn parallel loops.
    pub fn wait_for_task(self: &Arc<Self>) -> bool {
        if self.waiting.swap(true, Ordering::SeqCst) {
            debug!("Ignoring duplicate wait_for_task on busy session");
            return false;
        }
        let session = Arc::clone(self);
        tokio::spawn(session.dispatch_loop());
        true
    }

    #[cfg(test)]
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    /// The worker acknowledged the delivered task. The Idle transition
    /// happens here, synchronously with ack processing, so a
    /// `wait_for_task` that arrives right after the ack is a fresh request,
    /// never a duplicate. Callers resolve the `DeliveryPending` only after
    /// this returns.
    pub async fn task_acked(&self) {
        self.pending_ack.lock().await.take();
        self.waiting.store(false, Ordering::SeqCst);
    }

    /// The connection is gone: stop the poll loop and discharge the requeue
    /// obligation for any in-flight entry.
    pub async fn disconnected(&self) {
        self.cancel.cancel();
        self.requeue_pending().await;
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let acked = self.poll_and_deliver().await;
        // On the acked path `task_acked` already moved the session to Idle;
        // every abandoned exit resets here so the session stays re-waitable.
        if !acked {
            self.waiting.store(false, Ordering::SeqCst);
        }
    }

    /// Returns true only when the delivered task was acked by the worker.
    async fn poll_and_deliver(&self) -> bool {
        loop {
            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                res = self.queue.poll(POLL_TIMEOUT) => res,
            };

            let entry = match polled {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    error!("Task poll failed: {:#}. Retrying...", e);
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                    continue;
                }
            };

            // A poll that was already in flight can hand us an entry after
            // the disconnect was observed; push it straight back.
            if self.cancel.is_cancelled() {
                self.requeue(entry).await;
                return false;
            }

            *self.pending_ack.lock().await = Some(entry.clone());

            let pending = match self.link.deliver(&entry).await {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(
                        "Failed to deliver task {}: {:#}",
                        entry.content.task_id, e
                    );
                    self.requeue_pending().await;
                    return false;
                }
            };

            // Known gap, kept on purpose: short of a disconnect there is no
            // deadline on this wait. A transport that hangs without tearing
            // the connection down leaves the task neither running nor queued.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.requeue_pending().await;
                    return false;
                }
                acked = pending.acked() => {
                    if acked {
                        debug!("Task {} delivered and acked", entry.content.task_id);
                        return true;
                    }
                    // Link dropped without acking
                    self.requeue_pending().await;
                    return false;
                }
            }
        }
    }

    async fn requeue_pending(&self) {
        let taken = self.pending_ack.lock().await.take();
        if let Some(entry) = taken {
            self.requeue(entry).await;
        }
    }

    async fn requeue(&self, entry: QueueEntry) {
        let task_id = entry.content.task_id.clone();
        match self.queue.push(&entry).await {
            Ok(()) => info!("Requeued undelivered task {}", task_id),
            Err(e) => error!("Failed to requeue task {}: {:#}", task_id, e),
        }
    }
}

//! Worker-connection listener and server state
//!
//! Workers connect over WebSocket and exchange MessagePack frames. Each
//! connection gets a sender task forwarding outbound frames, a receiver loop
//! on the current task, a `ConnectionSession` for dispatch, and a `WsLink`
//! that correlates task deliveries with `task_ack` frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::notify::Notifier;
use crate::progress::{ProgressCache, StatusSnapshot};
use crate::protocol::{self, ClientFrame, ClientMessage, ServerMessage};
use crate::queue::TaskQueue;
use crate::record::RecordStore;
use crate::report::{self, ResultSummarizer};
use crate::session::{ConnectionSession, DeliveryPending, WorkerLink};
use crate::storage::ArtifactStore;
use crate::task::QueueEntry;

/// Everything the dispatch core needs, constructed once at startup and
/// passed explicitly; there are no ambient singletons.
pub struct ServerState {
    pub config: ServerConfig,
    pub queue: Arc<dyn TaskQueue>,
    pub cache: ProgressCache,
    pub records: Arc<dyn RecordStore>,
    pub notifier: Arc<dyn Notifier>,
    pub summarizer: Arc<dyn ResultSummarizer>,
    pub storage: Arc<dyn ArtifactStore>,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        queue: Arc<dyn TaskQueue>,
        records: Arc<dyn RecordStore>,
        notifier: Arc<dyn Notifier>,
        summarizer: Arc<dyn ResultSummarizer>,
        storage: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            config,
            queue,
            cache: ProgressCache::new(),
            records,
            notifier,
            summarizer,
            storage,
        }
    }

    /// Latest cached status snapshot for a task, if any.
    pub fn cached_status(&self, task_id: &str) -> Option<StatusSnapshot> {
        self.cache.get(task_id)
    }
}

/// WebSocket binding of the two-phase delivery protocol.
pub struct WsLink {
    outbound: mpsc::UnboundedSender<Message>,
    acks: DashMap<u64, oneshot::Sender<()>>,
    next_seq: AtomicU64,
}

impl WsLink {
    pub fn new(outbound: mpsc::UnboundedSender<Message>) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            acks: DashMap::new(),
            next_seq: AtomicU64::new(0),
        })
    }

    fn send(&self, msg: &ServerMessage) -> Result<()> {
        let bytes = protocol::encode(msg)?;
        self.outbound
            .send(Message::Binary(bytes.into()))
            .ok()
            .context("Worker connection closed")
    }

    /// Detach the ack sender for `seq`, if the delivery is still outstanding.
    fn take_ack(&self, seq: u64) -> Option<oneshot::Sender<()>> {
        let found = self.acks.remove(&seq).map(|(_, tx)| tx);
        if found.is_none() {
            debug!("task_ack for unknown seq {}", seq);
        }
        found
    }
}

#[async_trait]
impl WorkerLink for WsLink {
    async fn deliver(&self, entry: &QueueEntry) -> Result<DeliveryPending> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.acks.insert(seq, tx);
        if let Err(e) = self.send(&ServerMessage::Task {
            seq,
            entry: entry.clone(),
        }) {
            self.acks.remove(&seq);
            return Err(e);
        }
        Ok(DeliveryPending::new(rx))
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/judge", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

static CONN_SEQ: AtomicU64 = AtomicU64::new(0);

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let conn_id = CONN_SEQ.fetch_add(1, Ordering::SeqCst);
    info!("Worker connection {} established", conn_id);

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let link = WsLink::new(outbound_tx);
    let session = ConnectionSession::new(Arc::clone(&state.queue), link.clone());

    // Sender task: forward outbound frames to the WebSocket sink
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Binary(bytes)) => match protocol::decode_client_frame(&bytes) {
                Ok(frame) => handle_frame(&state, &session, &link, frame).await,
                Err(e) => {
                    // Protocol error: log and keep the connection open
                    error!("Protocol error on connection {}: {}", conn_id, e);
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Receive error on connection {}: {}", conn_id, e);
                break;
            }
        }
    }

    // Requeue obligation is discharged before the session is dropped
    session.disconnected().await;
    send_task.abort();
    info!("Worker connection {} closed", conn_id);
}

/// Process one authenticated frame from a worker.
async fn handle_frame(
    state: &Arc<ServerState>,
    session: &Arc<ConnectionSession>,
    link: &Arc<WsLink>,
    frame: ClientFrame,
) {
    if frame.token != state.config.judge_token {
        // Dropped with no state change and no response
        warn!("Dropping frame with invalid judge token");
        return;
    }

    match frame.msg {
        ClientMessage::WaitForTask => {
            if session.wait_for_task() {
                // Receipt ack, decoupled from the eventual task delivery
                if let Err(e) = link.send(&ServerMessage::WaitAck) {
                    warn!("Failed to ack wait_for_task: {:#}", e);
                }
            }
        }
        ClientMessage::TaskAck { seq } => {
            if let Some(ack) = link.take_ack(seq) {
                // The Idle transition must land before the next frame is
                // read; the worker's follow-up wait_for_task depends on it
                session.task_acked().await;
                let _ = ack.send(());
            }
        }
        ClientMessage::ReportProgress(report) => {
            let state = Arc::clone(state);
            tokio::spawn(async move {
                report::handle_progress(&state, report).await;
            });
        }
        ClientMessage::ReportResult(report) => {
            let state = Arc::clone(state);
            tokio::spawn(async move {
                if let Err(e) = report::handle_result(&state, report).await {
                    error!("Failed to process result report: {:#}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use crate::testutil::test_state;
    use std::time::Duration;

    fn ws_link() -> (Arc<WsLink>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WsLink::new(tx), rx)
    }

    fn decode_server(msg: Message) -> ServerMessage {
        match msg {
            Message::Binary(bytes) => rmp_serde::from_slice(&bytes).unwrap(),
            other => panic!("expected binary frame, got {:?}", other),
        }
    }

    fn frame(token: &str, msg: ClientMessage) -> ClientFrame {
        ClientFrame {
            token: token.into(),
            msg,
        }
    }

    #[tokio::test]
    async fn test_invalid_token_is_dropped_silently() {
        let (state, _harness) = test_state();
        let (link, mut outbound) = ws_link();
        let session = ConnectionSession::new(Arc::clone(&state.queue), link.clone());

        handle_frame(&state, &session, &link, frame("wrong", ClientMessage::WaitForTask)).await;

        assert!(!session.is_waiting());
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_for_task_is_acked_immediately() {
        let (state, _harness) = test_state();
        let (link, mut outbound) = ws_link();
        let session = ConnectionSession::new(Arc::clone(&state.queue), link.clone());

        handle_frame(
            &state,
            &session,
            &link,
            frame("test-secret", ClientMessage::WaitForTask),
        )
        .await;

        assert!(session.is_waiting());
        assert_eq!(decode_server(outbound.recv().await.unwrap()), ServerMessage::WaitAck);
        session.disconnected().await;
    }

    #[tokio::test]
    async fn test_duplicate_wait_for_task_gets_no_second_ack() {
        let (state, _harness) = test_state();
        let (link, mut outbound) = ws_link();
        let session = ConnectionSession::new(Arc::clone(&state.queue), link.clone());

        let wait = frame("test-secret", ClientMessage::WaitForTask);
        handle_frame(&state, &session, &link, wait.clone()).await;
        handle_frame(&state, &session, &link, wait).await;

        assert_eq!(decode_server(outbound.recv().await.unwrap()), ServerMessage::WaitAck);
        assert!(outbound.try_recv().is_err());
        session.disconnected().await;
    }

    #[tokio::test]
    async fn test_task_ack_resolves_pending_delivery() {
        let (state, _harness) = test_state();
        let (link, mut outbound) = ws_link();
        let session = ConnectionSession::new(Arc::clone(&state.queue), link.clone());

        let entry = QueueEntry::new(Task::answer_submission("t".into(), "d".into(), 1.0));
        let pending = link.deliver(&entry).await.unwrap();

        let ServerMessage::Task { seq, entry: sent } =
            decode_server(outbound.recv().await.unwrap())
        else {
            panic!("expected task frame");
        };
        assert_eq!(sent, entry);

        handle_frame(
            &state,
            &session,
            &link,
            frame("test-secret", ClientMessage::TaskAck { seq }),
        )
        .await;

        assert!(tokio::time::timeout(Duration::from_secs(1), pending.acked())
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_task_after_task_ack_is_honored() {
        let (state, harness) = test_state();
        let (link, mut outbound) = ws_link();
        let session = ConnectionSession::new(Arc::clone(&state.queue), link.clone());

        let wait = frame("test-secret", ClientMessage::WaitForTask);
        handle_frame(&state, &session, &link, wait.clone()).await;
        assert_eq!(decode_server(outbound.recv().await.unwrap()), ServerMessage::WaitAck);

        harness
            .queue
            .push(&QueueEntry::new(Task::answer_submission(
                "t1".into(),
                "d".into(),
                1.0,
            )))
            .await
            .unwrap();
        let ServerMessage::Task { seq, .. } = decode_server(outbound.recv().await.unwrap())
        else {
            panic!("expected task frame");
        };

        handle_frame(
            &state,
            &session,
            &link,
            frame("test-secret", ClientMessage::TaskAck { seq }),
        )
        .await;

        // The worker asks for more work in the very next frame; that is the
        // normal dispatch cycle, not a duplicate of the satisfied wait
        handle_frame(&state, &session, &link, wait).await;
        let next = tokio::time::timeout(Duration::from_secs(1), outbound.recv())
            .await
            .expect("wait_for_task after task_ack was ignored")
            .unwrap();
        assert_eq!(decode_server(next), ServerMessage::WaitAck);

        harness
            .queue
            .push(&QueueEntry::new(Task::answer_submission(
                "t2".into(),
                "d".into(),
                1.0,
            )))
            .await
            .unwrap();
        let ServerMessage::Task { entry, .. } =
            decode_server(tokio::time::timeout(Duration::from_secs(1), outbound.recv())
                .await
                .expect("no delivery from the second wait")
                .unwrap())
        else {
            panic!("expected task frame");
        };
        assert_eq!(entry.content.task_id, "t2");
        session.disconnected().await;
    }

    #[tokio::test]
    async fn test_report_frames_reach_the_pipeline() {
        let (state, harness) = test_state();
        let (link, _outbound) = ws_link();
        let session = ConnectionSession::new(Arc::clone(&state.queue), link.clone());

        handle_frame(
            &state,
            &session,
            &link,
            frame(
                "test-secret",
                ClientMessage::ReportProgress(crate::report::ProgressReport {
                    task_id: "t".into(),
                    event: crate::report::ProgressEvent::Started,
                }),
            ),
        )
        .await;

        // The report is handled on its own task
        tokio::time::timeout(Duration::from_secs(1), async {
            while state.cache.get("t").is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(state.cache.get("t").unwrap().result, "Compiling");
        assert!(!harness.notifier.calls().is_empty());
    }
}

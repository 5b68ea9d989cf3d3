//! Shared test doubles
//!
//! In-memory stand-ins for the external collaborators: a manually acked
//! worker link, a recording notifier, and map-backed record/artifact stores.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use crate::config::ServerConfig;
use crate::notify::Notifier;
use crate::queue::MemoryTaskQueue;
use crate::record::{JudgeRecord, RecordStore};
use crate::report::{CaseSummarizer, CompileStatus, JudgeProgress};
use crate::server::ServerState;
use crate::session::{DeliveryPending, WorkerLink};
use crate::storage::ArtifactStore;
use crate::task::QueueEntry;

/// Worker link whose deliveries surface on a channel; the test decides when
/// (and whether) to ack by using or dropping the oneshot sender.
pub struct TestLink {
    deliveries: mpsc::UnboundedSender<(QueueEntry, oneshot::Sender<()>)>,
}

impl TestLink {
    pub fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<(QueueEntry, oneshot::Sender<()>)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { deliveries: tx }), rx)
    }
}

#[async_trait]
impl WorkerLink for TestLink {
    async fn deliver(&self, entry: &QueueEntry) -> Result<DeliveryPending> {
        let (ack_tx, ack_rx) = oneshot::channel();
        // A dropped receiver behaves like a dead link: the pending delivery
        // resolves unacked.
        let _ = self.deliveries.send((entry.clone(), ack_tx));
        Ok(DeliveryPending::new(ack_rx))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotifierCall {
    Started(String),
    Compiled(String),
    Progress(String),
    Finished(String),
    Cleanup(String),
}

#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<NotifierCall>>,
}

impl RecordingNotifier {
    pub fn calls(&self) -> Vec<NotifierCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: NotifierCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn task_started(&self, task_id: &str) {
        self.record(NotifierCall::Started(task_id.into()));
    }

    async fn compile_status(&self, task_id: &str, _status: &CompileStatus) {
        self.record(NotifierCall::Compiled(task_id.into()));
    }

    async fn progress(&self, task_id: &str, _progress: &JudgeProgress) {
        self.record(NotifierCall::Progress(task_id.into()));
    }

    async fn finished(&self, task_id: &str, _progress: &JudgeProgress) {
        self.record(NotifierCall::Finished(task_id.into()));
    }

    async fn cleanup(&self, task_id: &str) {
        self.record(NotifierCall::Cleanup(task_id.into()));
    }
}

#[derive(Default)]
pub struct MemoryRecordStore {
    records: DashMap<String, JudgeRecord>,
    saved: Mutex<Vec<JudgeRecord>>,
    propagated: Mutex<Vec<String>>,
}

impl MemoryRecordStore {
    pub fn insert(&self, record: JudgeRecord) {
        self.records.insert(record.task_id.clone(), record);
    }

    pub fn saved(&self) -> Vec<JudgeRecord> {
        self.saved.lock().unwrap().clone()
    }

    pub fn propagated(&self) -> Vec<String> {
        self.propagated.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load(&self, task_id: &str) -> Result<Option<JudgeRecord>> {
        Ok(self.records.get(task_id).map(|r| r.clone()))
    }

    async fn save(&self, record: &JudgeRecord) -> Result<()> {
        self.records.insert(record.task_id.clone(), record.clone());
        self.saved.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn propagate(&self, record: &JudgeRecord) -> Result<()> {
        self.propagated.lock().unwrap().push(record.task_id.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryArtifactStore {
    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        self.objects.insert(key.to_string(), bytes);
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .get(key)
            .map(|b| b.clone())
            .ok_or_else(|| anyhow!("No such object: {}", key))
    }
}

/// Handles onto the doubles inside a test `ServerState`.
pub struct TestHarness {
    pub queue: Arc<MemoryTaskQueue>,
    pub notifier: Arc<RecordingNotifier>,
    pub records: Arc<MemoryRecordStore>,
    pub storage: Arc<MemoryArtifactStore>,
}

pub fn test_state() -> (Arc<ServerState>, TestHarness) {
    let queue = Arc::new(MemoryTaskQueue::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let records = Arc::new(MemoryRecordStore::default());
    let storage = Arc::new(MemoryArtifactStore::default());

    let state = Arc::new(ServerState::new(
        ServerConfig::for_tests(),
        queue.clone(),
        records.clone(),
        notifier.clone(),
        Arc::new(CaseSummarizer),
        storage.clone(),
    ));

    (
        state,
        TestHarness {
            queue,
            notifier,
            records,
            storage,
        },
    )
}

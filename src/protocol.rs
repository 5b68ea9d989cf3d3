//! Wire protocol for worker connections
//!
//! Frames are MessagePack maps (named fields) so every payload stays a
//! compact self-describing map/array/scalar tree. Every client frame carries
//! the shared secret; the server validates it before looking at the message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::report::{ProgressReport, ResultReport};
use crate::task::QueueEntry;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("frame encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// Worker-originated frame: shared secret plus the message proper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub token: String,
    pub msg: ClientMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request the next task; acked with `ServerMessage::WaitAck`
    WaitForTask,
    /// Delivery acknowledgment for a `ServerMessage::Task` frame
    TaskAck { seq: u64 },
    ReportProgress(ProgressReport),
    ReportResult(ResultReport),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Receipt of `wait_for_task`, decoupled from task delivery
    WaitAck,
    /// Task envelope; the worker must answer with `task_ack` carrying `seq`
    Task { seq: u64, entry: QueueEntry },
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode_client_frame(bytes: &[u8]) -> Result<ClientFrame, ProtocolError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

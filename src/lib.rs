//! Judge task dispatch core
//!
//! Distributes compute-heavy evaluation tasks to a pool of remote worker
//! processes over a shared priority queue, tracks live progress, and
//! reconciles final results into durable storage. Workers connect over
//! WebSocket and speak a MessagePack frame protocol; every delivered task is
//! guaranteed at-least-once by requeueing on any disconnect between delivery
//! and acknowledgment.

pub mod config;
pub mod dispatch;
pub mod notify;
pub mod progress;
pub mod protocol;
pub mod queue;
pub mod record;
pub mod report;
pub mod server;
pub mod session;
pub mod storage;
pub mod task;

#[cfg(test)]
pub(crate) mod testutil;

pub use dispatch::submit;
pub use server::{router, ServerState};

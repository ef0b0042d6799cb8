//! Boundary to the message broker: publishing telemetry, receiving
//! commands, and recording consumer progress.
//!
//! The emulator only relies on the traits in this module. Three backends are
//! provided:
//!
//! - [`memory`] keeps everything in process; used by tests.
//! - [`file`] stores streams as JSON-lines files and checkpoints as a JSON
//!   document, so progress survives restarts.
//! - [`tcp`] broadcasts telemetry to connected clients and appends their
//!   command lines to a [`CommandSink`].

pub mod file;
pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream closed: {0}")]
    Closed(String),
    #[error("broker rejected the operation: {0}")]
    Rejected(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Identifies one message within its partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle {
    pub partition: String,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub handle: MessageHandle,
    pub body: Vec<u8>,
}

impl ReceivedMessage {
    pub fn new(partition: impl Into<String>, offset: u64, body: impl Into<Vec<u8>>) -> Self {
        Self {
            handle: MessageHandle {
                partition: partition.into(),
                offset,
            },
            body: body.into(),
        }
    }

    /// Body for logging; invalid UTF-8 is replaced, never rejected.
    pub fn body_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Where a partition subscription begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Earliest,
    /// First offset to deliver.
    Offset(u64),
}

impl StartPosition {
    /// Resumes right after the last checkpointed offset, or from the
    /// beginning when nothing was checkpointed yet.
    pub fn after_checkpoint(checkpoint: Option<u64>) -> Self {
        match checkpoint {
            Some(offset) => StartPosition::Offset(offset + 1),
            None => StartPosition::Earliest,
        }
    }

    pub fn first_offset(self) -> u64 {
        match self {
            StartPosition::Earliest => 0,
            StartPosition::Offset(offset) => offset,
        }
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last checkpointed offset of `partition`.
    async fn load(&self, partition: &str) -> Result<Option<u64>, TransportError>;

    async fn checkpoint(&self, handle: &MessageHandle) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Next message in delivery order; `None` once the stream has ended.
    ///
    /// Dropping the returned future before it completes must not lose a
    /// message.
    async fn next_message(&mut self) -> Result<Option<ReceivedMessage>, TransportError>;
}

/// Write side of an inbound stream.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Appends one message and returns its offset within `partition`.
    async fn append(&self, partition: &str, body: Vec<u8>) -> Result<u64, TransportError>;
}

#[async_trait]
pub trait InboundSource: Send + Sync {
    /// Opens every partition right after its last checkpoint. Partitions
    /// that appear later are resolved against the same store.
    async fn subscribe(
        &self,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Box<dyn Subscription>, TransportError>;
}

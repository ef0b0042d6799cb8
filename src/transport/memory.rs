use super::{
    CheckpointStore, CommandSink, InboundSource, MessageHandle, Publisher, ReceivedMessage, StartPosition,
    Subscription, TransportError,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct StreamLog {
    partitions: BTreeMap<String, Vec<Vec<u8>>>,
    closed: bool,
}

#[derive(Debug, Default)]
struct StreamInner {
    log: Mutex<StreamLog>,
    appended: Notify,
}

/// Partitioned, append-only, in-process message log. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    inner: Arc<StreamInner>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message and returns its offset within the partition.
    pub fn push(&self, partition: &str, body: impl Into<Vec<u8>>) -> u64 {
        let offset = {
            let mut log = lock(&self.inner.log);
            let messages = log.partitions.entry(partition.to_string()).or_default();
            messages.push(body.into());
            (messages.len() - 1) as u64
        };
        self.inner.appended.notify_waiters();
        offset
    }

    /// Ends every subscription once it has drained the log.
    pub fn close(&self) {
        lock(&self.inner.log).closed = true;
        self.inner.appended.notify_waiters();
    }

    pub fn len(&self, partition: &str) -> usize {
        lock(&self.inner.log).partitions.get(partition).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner.log).partitions.values().all(Vec::is_empty)
    }

    fn partition_names(&self) -> Vec<String> {
        lock(&self.inner.log).partitions.keys().cloned().collect()
    }
}

#[async_trait]
impl CommandSink for MemoryStream {
    async fn append(&self, partition: &str, body: Vec<u8>) -> Result<u64, TransportError> {
        Ok(self.push(partition, body))
    }
}

#[async_trait]
impl InboundSource for MemoryStream {
    async fn subscribe(
        &self,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let mut cursors = HashMap::new();
        for partition in self.partition_names() {
            let start = StartPosition::after_checkpoint(checkpoints.load(&partition).await?);
            cursors.insert(partition, start.first_offset());
        }

        Ok(Box::new(MemorySubscription {
            stream: self.clone(),
            checkpoints,
            cursors,
        }))
    }
}

pub struct MemorySubscription {
    stream: MemoryStream,
    checkpoints: Arc<dyn CheckpointStore>,
    cursors: HashMap<String, u64>,
}

enum Poll {
    Ready(ReceivedMessage),
    Discovered(Vec<String>),
    Closed,
    Pending,
}

impl MemorySubscription {
    fn poll_log(&mut self) -> Poll {
        let log = lock(&self.stream.inner.log);

        let unknown: Vec<String> = log
            .partitions
            .keys()
            .filter(|name| !self.cursors.contains_key(*name))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Poll::Discovered(unknown);
        }

        for (partition, messages) in &log.partitions {
            let cursor = self.cursors.get(partition).copied().unwrap_or(0);
            if let Some(body) = messages.get(cursor as usize) {
                self.cursors.insert(partition.clone(), cursor + 1);
                return Poll::Ready(ReceivedMessage::new(partition.clone(), cursor, body.clone()));
            }
        }

        if log.closed {
            Poll::Closed
        } else {
            Poll::Pending
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Result<Option<ReceivedMessage>, TransportError> {
        let inner = Arc::clone(&self.stream.inner);
        loop {
            let appended = inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            match self.poll_log() {
                Poll::Ready(message) => return Ok(Some(message)),
                Poll::Closed => return Ok(None),
                Poll::Discovered(partitions) => {
                    for partition in partitions {
                        let start =
                            StartPosition::after_checkpoint(self.checkpoints.load(&partition).await?);
                        self.cursors.insert(partition, start.first_offset());
                    }
                }
                Poll::Pending => appended.await,
            }
        }
    }
}

#[derive(Debug, Default)]
struct PublisherState {
    published: Vec<Vec<u8>>,
    failure: Option<String>,
}

/// Records every payload; can be told to reject publishes.
#[derive(Debug, Clone, Default)]
pub struct MemoryPublisher {
    state: Arc<Mutex<PublisherState>>,
    published: Arc<Notify>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, reason: impl Into<String>) {
        lock(&self.state).failure = Some(reason.into());
    }

    pub fn published(&self) -> Vec<Vec<u8>> {
        lock(&self.state).published.clone()
    }

    pub fn published_count(&self) -> usize {
        lock(&self.state).published.len()
    }

    /// Waits until at least `count` payloads have been published.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let published = self.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();
            if self.published_count() >= count {
                return;
            }
            published.await;
        }
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        {
            let mut state = lock(&self.state);
            if let Some(reason) = &state.failure {
                return Err(TransportError::Rejected(reason.clone()));
            }
            state.published.push(payload);
        }
        self.published.notify_waiters();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CheckpointState {
    positions: HashMap<String, u64>,
    history: Vec<MessageHandle>,
    failure: Option<String>,
}

/// Checkpoints kept in memory, plus the ordered list of every checkpoint
/// call.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    state: Arc<Mutex<CheckpointState>>,
    written: Arc<Notify>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_positions<'a>(positions: impl IntoIterator<Item = (&'a str, u64)>) -> Self {
        let store = Self::new();
        lock(&store.state).positions = positions
            .into_iter()
            .map(|(partition, offset)| (partition.to_string(), offset))
            .collect();
        store
    }

    pub fn fail_with(&self, reason: impl Into<String>) {
        lock(&self.state).failure = Some(reason.into());
    }

    pub fn position(&self, partition: &str) -> Option<u64> {
        lock(&self.state).positions.get(partition).copied()
    }

    pub fn history(&self) -> Vec<MessageHandle> {
        lock(&self.state).history.clone()
    }

    /// Waits until at least `count` checkpoints have been written.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let written = self.written.notified();
            tokio::pin!(written);
            written.as_mut().enable();
            if lock(&self.state).history.len() >= count {
                return;
            }
            written.await;
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, partition: &str) -> Result<Option<u64>, TransportError> {
        Ok(self.position(partition))
    }

    async fn checkpoint(&self, handle: &MessageHandle) -> Result<(), TransportError> {
        {
            let mut state = lock(&self.state);
            if let Some(reason) = &state.failure {
                return Err(TransportError::Rejected(reason.clone()));
            }
            state.positions.insert(handle.partition.clone(), handle.offset);
            state.history.push(handle.clone());
        }
        self.written.notify_waiters();
        Ok(())
    }
}

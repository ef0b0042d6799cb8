use super::{
    CheckpointStore, CommandSink, InboundSource, MessageHandle, Publisher, ReceivedMessage, StartPosition,
    Subscription, TransportError,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const PARTITION_EXTENSION: &str = "jsonl";

async fn ensure_parent(path: &Path) -> Result<(), TransportError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

/// Appends each payload as one line to a file.
#[derive(Debug)]
pub struct JsonLinesPublisher {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonLinesPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Publisher for JsonLinesPublisher {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut file = self.file.lock().await;
        if file.is_none() {
            ensure_parent(&self.path).await?;
            let opened = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *file = Some(opened);
        }

        let Some(out) = file.as_mut() else {
            return Err(TransportError::Closed(self.path.display().to_string()));
        };
        let mut line = payload;
        line.push(b'\n');
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }
}

/// Appends one message to a partition file, creating it if needed, and
/// returns its offset.
pub async fn append_message(
    dir: &Path,
    partition: &str,
    body: &[u8],
) -> Result<u64, TransportError> {
    FileInbox::new(dir).append(partition, body.to_vec()).await
}

pub fn partition_path(dir: &Path, partition: &str) -> PathBuf {
    dir.join(format!("{partition}.{PARTITION_EXTENSION}"))
}

#[derive(Debug)]
struct InboxPartition {
    file: File,
    next_offset: u64,
}

/// Write side of a [`FileSource`] directory. Offsets continue from the
/// lines already on disk, so they stay valid across restarts. Assumes it is
/// the only writer of the partitions it appends to.
#[derive(Debug)]
pub struct FileInbox {
    dir: PathBuf,
    partitions: Mutex<HashMap<String, InboxPartition>>,
}

impl FileInbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            partitions: Mutex::new(HashMap::new()),
        }
    }

    async fn open_partition(&self, partition: &str) -> Result<InboxPartition, TransportError> {
        fs::create_dir_all(&self.dir).await?;
        let path = partition_path(&self.dir, partition);
        let existing = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut next_offset = existing.iter().filter(|b| **b == b'\n').count() as u64;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        // A torn last line is terminated so it cannot swallow the next message.
        if existing.last().is_some_and(|b| *b != b'\n') {
            file.write_all(b"\n").await?;
            next_offset += 1;
        }
        info!(partition, next_offset, "opened inbox partition");
        Ok(InboxPartition { file, next_offset })
    }
}

#[async_trait]
impl CommandSink for FileInbox {
    async fn append(&self, partition: &str, body: Vec<u8>) -> Result<u64, TransportError> {
        let mut partitions = self.partitions.lock().await;
        if !partitions.contains_key(partition) {
            let opened = self.open_partition(partition).await?;
            partitions.insert(partition.to_string(), opened);
        }
        let Some(inbox) = partitions.get_mut(partition) else {
            return Err(TransportError::Closed(partition.to_string()));
        };

        let mut line = body;
        line.push(b'\n');
        inbox.file.write_all(&line).await?;
        inbox.file.flush().await?;
        let offset = inbox.next_offset;
        inbox.next_offset += 1;
        Ok(offset)
    }
}

/// Inbound stream stored as a directory of `<partition>.jsonl` files. Each
/// line is one message and its 0-based line number is its offset.
#[derive(Debug, Clone)]
pub struct FileSource {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileSource {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
        }
    }
}

#[async_trait]
impl InboundSource for FileSource {
    async fn subscribe(
        &self,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        fs::create_dir_all(&self.dir).await?;
        let mut subscription = FileSubscription {
            dir: self.dir.clone(),
            poll_interval: self.poll_interval,
            checkpoints,
            partitions: BTreeMap::new(),
        };
        subscription.discover().await?;
        Ok(Box::new(subscription))
    }
}

struct PartitionCursor {
    partition: String,
    reader: BufReader<File>,
    // Bytes of a line whose newline has not been written yet
    pending: Vec<u8>,
    next_offset: u64,
    start_offset: u64,
}

impl PartitionCursor {
    /// Next complete line at or after the start offset, if one is available.
    async fn read_message(&mut self) -> Result<Option<ReceivedMessage>, TransportError> {
        loop {
            let read = self.reader.read_until(b'\n', &mut self.pending).await?;
            if read == 0 || self.pending.last() != Some(&b'\n') {
                return Ok(None);
            }

            let mut line = std::mem::take(&mut self.pending);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let offset = self.next_offset;
            self.next_offset += 1;

            if offset < self.start_offset || line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(ReceivedMessage::new(self.partition.clone(), offset, line)));
        }
    }
}

pub struct FileSubscription {
    dir: PathBuf,
    poll_interval: Duration,
    checkpoints: Arc<dyn CheckpointStore>,
    partitions: BTreeMap<String, PartitionCursor>,
}

impl FileSubscription {
    async fn discover(&mut self) -> Result<(), TransportError> {
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PARTITION_EXTENSION) {
                continue;
            }
            let Some(partition) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };
            if self.partitions.contains_key(&partition) {
                continue;
            }

            let start = StartPosition::after_checkpoint(self.checkpoints.load(&partition).await?);
            info!(partition = %partition, start = ?start, "opening inbound partition");
            let file = File::open(&path).await?;
            self.partitions.insert(
                partition.clone(),
                PartitionCursor {
                    partition,
                    reader: BufReader::new(file),
                    pending: Vec::new(),
                    next_offset: 0,
                    start_offset: start.first_offset(),
                },
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Subscription for FileSubscription {
    async fn next_message(&mut self) -> Result<Option<ReceivedMessage>, TransportError> {
        loop {
            for cursor in self.partitions.values_mut() {
                if let Some(message) = cursor.read_message().await? {
                    return Ok(Some(message));
                }
            }
            tokio::time::sleep(self.poll_interval).await;
            self.discover().await?;
        }
    }
}

/// Checkpoints persisted as a JSON object `{partition: offset}`.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    positions: Mutex<Option<BTreeMap<String, u64>>>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            positions: Mutex::new(None),
        }
    }

    async fn read_positions(&self) -> Result<BTreeMap<String, u64>, TransportError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_positions(&self, positions: &BTreeMap<String, u64>) -> Result<(), TransportError> {
        ensure_parent(&self.path).await?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(positions)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, partition: &str) -> Result<Option<u64>, TransportError> {
        let mut positions = self.positions.lock().await;
        if positions.is_none() {
            *positions = Some(self.read_positions().await?);
        }
        Ok(positions.as_ref().and_then(|p| p.get(partition).copied()))
    }

    async fn checkpoint(&self, handle: &MessageHandle) -> Result<(), TransportError> {
        let mut positions = self.positions.lock().await;
        if positions.is_none() {
            *positions = Some(self.read_positions().await?);
        }
        if let Some(map) = positions.as_mut() {
            map.insert(handle.partition.clone(), handle.offset);
            self.write_positions(map).await?;
            debug!(partition = %handle.partition, offset = handle.offset, "checkpoint written");
        }
        Ok(())
    }
}

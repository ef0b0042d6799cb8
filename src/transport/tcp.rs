use super::{CommandSink, Publisher, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

pub const TCP_PARTITION: &str = "tcp";
const TELEMETRY_BROADCAST_BUFFER_SIZE: usize = 256;

/// Line sent back to a client for every command line it submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub status: ReceiptStatus,
    pub partition: String,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Accepted,
}

/// TCP front end: broadcasts telemetry lines to every client and appends
/// command lines from clients to the inbound [`TCP_PARTITION`]. A receipt is
/// only sent once the sink has stored the line.
pub struct TcpGateway {
    listener: TcpListener,
    telemetry_tx: broadcast::Sender<Arc<[u8]>>,
    inbound: Arc<dyn CommandSink>,
}

impl TcpGateway {
    pub async fn bind(
        addr: SocketAddr,
        inbound: Arc<dyn CommandSink>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let (telemetry_tx, _) = broadcast::channel(TELEMETRY_BROADCAST_BUFFER_SIZE);
        info!("🌐 TCP gateway listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            telemetry_tx,
            inbound,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn publisher(&self) -> TcpPublisher {
        TcpPublisher {
            telemetry_tx: self.telemetry_tx.clone(),
        }
    }

    /// Accept loop; runs until the task is aborted.
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    info!("🔗 Client connected: {}", addr);
                    let telemetry_rx = self.telemetry_tx.subscribe();
                    let inbound = Arc::clone(&self.inbound);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, inbound, telemetry_rx).await {
                            warn!("Client {} error: {}", addr, e);
                        }
                        info!("🔌 Client {} disconnected", addr);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    inbound: Arc<dyn CommandSink>,
    mut telemetry_rx: broadcast::Receiver<Arc<[u8]>>,
) -> Result<(), TransportError> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    let telemetry_writer = Arc::clone(&writer);
    let telemetry_task = tokio::spawn(async move {
        loop {
            match telemetry_rx.recv().await {
                Ok(line) => {
                    let mut out = telemetry_writer.lock().await;
                    if let Err(e) = write_line(&mut *out, &line).await {
                        warn!("Failed to send telemetry: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Telemetry client lagging, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut line = Vec::new();
    let result = loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break Ok(()),
            Ok(_) => {
                let body = trim_line(&line);
                if body.is_empty() {
                    continue;
                }
                let offset = match inbound.append(TCP_PARTITION, body.to_vec()).await {
                    Ok(offset) => offset,
                    Err(e) => {
                        error!("Failed to queue command line: {}", e);
                        break Err(e);
                    }
                };
                debug!(offset, "📨 Command line queued");

                let receipt = Receipt {
                    status: ReceiptStatus::Accepted,
                    partition: TCP_PARTITION.to_string(),
                    offset,
                };
                let encoded = serde_json::to_vec(&receipt)?;
                let mut out = writer.lock().await;
                if let Err(e) = write_line(&mut *out, &encoded).await {
                    break Err(e.into());
                }
            }
            Err(e) => break Err(e.into()),
        }
    };

    telemetry_task.abort();
    result
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

async fn write_line<W>(out: &mut W, line: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(line).await?;
    out.write_all(b"\n").await
}

/// Publishes telemetry to every connected gateway client.
#[derive(Debug, Clone)]
pub struct TcpPublisher {
    telemetry_tx: broadcast::Sender<Arc<[u8]>>,
}

#[async_trait]
impl Publisher for TcpPublisher {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        // No connected clients is not a failure; the event is simply unseen.
        if self.telemetry_tx.send(Arc::from(payload)).is_err() {
            debug!("No telemetry clients connected");
        }
        Ok(())
    }
}

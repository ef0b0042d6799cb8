use evsim::command::RemoteCommand;
use evsim::config::{EmulatorConfig, StreamBackend};
use evsim::console::StatusReporter;
use evsim::consumer::CommandConsumer;
use evsim::device::SharedDevice;
use evsim::emulator::Backends;
use evsim::error::EmulatorError;
use evsim::supervisor::{ShutdownSignal, ShutdownTrigger};
use evsim::transport::memory::{MemoryCheckpointStore, MemoryStream};
use evsim::transport::tcp::*;
use evsim::transport::{CheckpointStore, InboundSource, Publisher};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

async fn start_gateway() -> (SocketAddr, TcpPublisher, MemoryStream, tokio::task::JoinHandle<()>) {
    let inbound = MemoryStream::new();
    let gateway = TcpGateway::bind("127.0.0.1:0".parse().unwrap(), Arc::new(inbound.clone()))
        .await
        .unwrap();
    let addr = gateway.local_addr().unwrap();
    let publisher = gateway.publisher();
    let task = tokio::spawn(gateway.serve());
    (addr, publisher, inbound, task)
}

#[tokio::test]
async fn test_command_lines_are_queued_with_receipts() {
    let (addr, _publisher, inbound, task) = start_gateway().await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(&RemoteCommand::TurnEvChargingOn.to_payload()).await.unwrap();
    writer.write_all(b"\n\n").await.unwrap();
    writer.write_all(b"not json\n").await.unwrap();

    let first: Receipt = serde_json::from_str(
        &tokio::time::timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap(),
    )
    .unwrap();
    assert_eq!(first.status, ReceiptStatus::Accepted);
    assert_eq!(first.partition, TCP_PARTITION);
    assert_eq!(first.offset, 0);

    // The empty line in between is dropped, not queued.
    let second: Receipt = serde_json::from_str(
        &tokio::time::timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap(),
    )
    .unwrap();
    assert_eq!(second.offset, 1);
    assert_eq!(inbound.len(TCP_PARTITION), 2);

    let mut subscription = inbound
        .subscribe(Arc::new(MemoryCheckpointStore::new()))
        .await
        .unwrap();
    let message = subscription.next_message().await.unwrap().unwrap();
    assert_eq!(message.body, RemoteCommand::TurnEvChargingOn.to_payload());

    task.abort();
}

#[tokio::test]
async fn test_telemetry_is_broadcast_to_clients() {
    let (addr, publisher, _inbound, task) = start_gateway().await;

    let mut clients = Vec::new();
    for _ in 0..2 {
        let stream = TcpStream::connect(addr).await.unwrap();
        clients.push(BufReader::new(stream).lines());
    }
    // Clients subscribe to the broadcast when accepted; give the accept
    // loop a moment.
    tokio::time::sleep(Duration::from_millis(100)).await;

    publisher.publish(b"{\"EventName\":\"SensorReadingEvent\"}".to_vec()).await.unwrap();

    for lines in &mut clients {
        let line = tokio::time::timeout(WAIT, lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line, "{\"EventName\":\"SensorReadingEvent\"}");
    }

    task.abort();
}

#[tokio::test]
async fn test_publishing_without_clients_is_not_an_error() {
    let (_addr, publisher, _inbound, task) = start_gateway().await;
    publisher.publish(b"{}".to_vec()).await.unwrap();
    task.abort();
}

async fn send_command(addr: SocketAddr, payload: &[u8]) -> Receipt {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    writer.write_all(payload).await.unwrap();
    writer.write_all(b"\n").await.unwrap();
    let line = tokio::time::timeout(WAIT, lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    serde_json::from_str(&line).unwrap()
}

/// Gateway plus command consumer, wired the way the daemon does it.
struct Daemon {
    addr: SocketAddr,
    device: SharedDevice,
    checkpoints: Arc<dyn CheckpointStore>,
    trigger: ShutdownTrigger,
    consumer: JoinHandle<Result<(), EmulatorError>>,
    gateway: JoinHandle<()>,
}

impl Daemon {
    async fn start(config: &EmulatorConfig) -> Self {
        let mut backends = Backends::from_config(config).await.unwrap();
        let gateway = backends.gateway.take().unwrap();
        let addr = gateway.local_addr().unwrap();
        let gateway = tokio::spawn(gateway.serve());

        let device = SharedDevice::new();
        let checkpoints = Arc::clone(&backends.checkpoints);
        let (reporter, _output) = StatusReporter::captured();
        let consumer =
            CommandConsumer::new(device.clone(), backends.source, backends.checkpoints, reporter);
        let (trigger, signal) = ShutdownSignal::channel();
        let consumer = tokio::spawn(consumer.run(signal));

        Self {
            addr,
            device,
            checkpoints,
            trigger,
            consumer,
            gateway,
        }
    }

    async fn wait_for_checkpoint(&self, offset: u64) {
        tokio::time::timeout(WAIT, async {
            while self.checkpoints.load(TCP_PARTITION).await.unwrap() != Some(offset) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn stop(self) {
        self.trigger.trigger();
        tokio::time::timeout(WAIT, self.consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        self.gateway.abort();
    }
}

fn tcp_inbound_config(dir: &Path) -> EmulatorConfig {
    let mut config = EmulatorConfig::default();
    config.inbound.backend = StreamBackend::Tcp;
    config.inbound.path = dir.join("commands");
    config.inbound.poll_interval_ms = 10;
    config.outbound.path = dir.join("telemetry.jsonl");
    config.checkpoint.path = dir.join("checkpoints.json");
    config.tcp.bind = "127.0.0.1:0".parse().unwrap();
    config
}

#[tokio::test]
async fn test_commands_after_restart_are_applied() {
    let dir = tempdir().unwrap();
    let config = tcp_inbound_config(dir.path());

    let first_run = Daemon::start(&config).await;
    let payloads = [
        RemoteCommand::TurnEvChargingOn.to_payload(),
        RemoteCommand::TurnEvChargingOff.to_payload(),
        b"not json".to_vec(),
    ];
    for (expected, payload) in payloads.iter().enumerate() {
        let receipt = send_command(first_run.addr, payload).await;
        assert_eq!(receipt.offset, expected as u64);
    }
    first_run.wait_for_checkpoint(2).await;
    first_run.stop().await;

    // Same inbox and checkpoint file, fresh process state.
    let second_run = Daemon::start(&config).await;
    assert!(!second_run.device.snapshot().await.ev_charging);

    let receipt = send_command(second_run.addr, &RemoteCommand::TurnEvChargingOn.to_payload()).await;
    assert_eq!(receipt.status, ReceiptStatus::Accepted);
    assert_eq!(receipt.offset, 3);

    second_run.wait_for_checkpoint(3).await;
    assert!(second_run.device.snapshot().await.ev_charging);
    second_run.stop().await;
}

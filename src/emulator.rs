use crate::config::{CheckpointBackend, EmulatorConfig, StreamBackend};
use crate::console::{ConsoleInput, StatusReporter};
use crate::consumer::CommandConsumer;
use crate::device::SharedDevice;
use crate::error::EmulatorError;
use crate::publisher::TelemetryPublisher;
use crate::supervisor::{RunOutcome, Supervisor, TaskKind};
use crate::telemetry::TelemetrySerializer;
use crate::transport::file::{FileCheckpointStore, FileInbox, FileSource, JsonLinesPublisher};
use crate::transport::memory::MemoryCheckpointStore;
use crate::transport::tcp::TcpGateway;
use crate::transport::{CheckpointStore, InboundSource, Publisher};
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tracing::info;

/// The three broker capabilities the emulator runs against.
pub struct Backends {
    pub publisher: Arc<dyn Publisher>,
    pub source: Arc<dyn InboundSource>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Accept loop to run alongside the tasks when a stream uses TCP.
    pub gateway: Option<TcpGateway>,
}

impl Backends {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        source: Arc<dyn InboundSource>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            publisher,
            source,
            checkpoints,
            gateway: None,
        }
    }

    /// Commands are always read from the inbox directory. With a TCP
    /// gateway, client command lines are appended there too, so their
    /// offsets survive a restart just like the checkpoints do.
    pub async fn from_config(config: &EmulatorConfig) -> Result<Self, EmulatorError> {
        let gateway = if config.uses_tcp() {
            let inbox = Arc::new(FileInbox::new(&config.inbound.path));
            Some(TcpGateway::bind(config.tcp.bind, inbox).await?)
        } else {
            None
        };

        let publisher: Arc<dyn Publisher> = match (config.outbound.backend, &gateway) {
            (StreamBackend::Tcp, Some(gateway)) => Arc::new(gateway.publisher()),
            _ => Arc::new(JsonLinesPublisher::new(&config.outbound.path)),
        };

        let source: Arc<dyn InboundSource> =
            Arc::new(FileSource::new(&config.inbound.path, config.poll_interval()));

        let checkpoints: Arc<dyn CheckpointStore> = match config.checkpoint.backend {
            CheckpointBackend::File => Arc::new(FileCheckpointStore::new(&config.checkpoint.path)),
            CheckpointBackend::Memory => Arc::new(MemoryCheckpointStore::new()),
        };

        Ok(Self {
            publisher,
            source,
            checkpoints,
            gateway,
        })
    }
}

/// One emulator run: a single device instance shared by the publisher, the
/// consumer and the operator console.
pub struct Emulator {
    config: EmulatorConfig,
    device: SharedDevice,
    reporter: StatusReporter,
    serializer: TelemetrySerializer,
}

impl Emulator {
    pub fn new(config: EmulatorConfig, reporter: StatusReporter) -> Self {
        Self {
            config,
            device: SharedDevice::new(),
            reporter,
            serializer: TelemetrySerializer::system(),
        }
    }

    pub fn with_serializer(mut self, serializer: TelemetrySerializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn device(&self) -> SharedDevice {
        self.device.clone()
    }

    /// Runs until the first task finishes or `stop` resolves.
    pub async fn run<R, S>(self, backends: Backends, input: R, stop: S) -> RunOutcome
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        S: Future<Output = ()>,
    {
        let gateway = backends.gateway.map(|gateway| tokio::spawn(gateway.serve()));

        let mut supervisor = Supervisor::new(self.config.shutdown_grace());

        let mut publisher = TelemetryPublisher::new(
            self.device.clone(),
            backends.publisher,
            self.config.telemetry_interval(),
        )
        .with_serializer(self.serializer);
        if self.config.console.echo_events {
            publisher = publisher.with_echo(self.reporter.clone());
        }
        supervisor.spawn(TaskKind::Publisher, publisher.run(supervisor.shutdown_signal()));

        let consumer = CommandConsumer::new(
            self.device.clone(),
            backends.source,
            backends.checkpoints,
            self.reporter.clone(),
        );
        supervisor.spawn(TaskKind::Consumer, consumer.run(supervisor.shutdown_signal()));

        let console = ConsoleInput::new(input, self.device.clone(), self.reporter.clone());
        supervisor.spawn(TaskKind::Console, console.run(supervisor.shutdown_signal()));

        let outcome = supervisor.run_until(stop).await;

        if let Some(gateway) = gateway {
            gateway.abort();
        }
        info!(finish = ?outcome.finish, success = outcome.is_success(), "Emulator stopped");
        outcome
    }
}

use crate::console::StatusReporter;
use crate::device::{DeviceSnapshot, SharedDevice};
use crate::error::EmulatorError;
use crate::supervisor::ShutdownSignal;
use crate::telemetry::{TelemetryEvent, TelemetrySerializer};
use crate::transport::Publisher;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Timer-driven telemetry loop. Fixed delay: the next cycle starts one
/// interval after the previous one finished publishing.
pub struct TelemetryPublisher {
    device: SharedDevice,
    serializer: TelemetrySerializer,
    publisher: Arc<dyn Publisher>,
    interval: Duration,
    echo: Option<StatusReporter>,
}

impl TelemetryPublisher {
    pub fn new(device: SharedDevice, publisher: Arc<dyn Publisher>, interval: Duration) -> Self {
        Self {
            device,
            serializer: TelemetrySerializer::system(),
            publisher,
            interval,
            echo: None,
        }
    }

    pub fn with_serializer(mut self, serializer: TelemetrySerializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Also prints every published event on the operator console.
    pub fn with_echo(mut self, reporter: StatusReporter) -> Self {
        self.echo = Some(reporter);
        self
    }

    /// One telemetry cycle: snapshot, serialize, publish meter then EV.
    pub async fn publish_once(&self) -> Result<[TelemetryEvent; 2], EmulatorError> {
        let snapshot: DeviceSnapshot = self.device.snapshot().await;
        let events = self.serializer.serialize(&snapshot)?;

        for event in &events {
            let payload = event.to_json_bytes()?;
            if let Some(reporter) = &self.echo {
                reporter.note(&format!("Sending data: {}", String::from_utf8_lossy(&payload)));
            }
            debug!(payload = %String::from_utf8_lossy(&payload), "publishing event");
            self.publisher.publish(payload).await?;
            info!(
                device = ?event.device.kind,
                event_id = %event.event_instance_id,
                "📡 Telemetry published"
            );
        }

        Ok(events)
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<(), EmulatorError> {
        info!("Telemetry publisher running every {:?}", self.interval);
        loop {
            if shutdown.is_requested() {
                return Ok(());
            }

            // A started cycle always completes so no event is left half-sent.
            self.publish_once().await?;

            tokio::select! {
                () = shutdown.requested() => {
                    info!("Telemetry publisher stopping");
                    return Ok(());
                }
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

use crate::command::interpret;
use crate::console::StatusReporter;
use crate::device::{DeviceSnapshot, Mutation, SharedDevice};
use crate::error::EmulatorError;
use crate::supervisor::ShutdownSignal;
use crate::transport::{CheckpointStore, InboundSource, ReceivedMessage};
use std::sync::Arc;
use tracing::{info, warn};

/// What happened to one inbound message. Every outcome is checkpointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Applied(Mutation, DeviceSnapshot),
    /// Valid command envelope with no known command in it.
    Ignored,
    /// Not UTF-8 / JSON / an object. Skipped for good.
    Malformed,
}

/// Inbound command loop: receive, interpret, apply, checkpoint, in delivery
/// order, one message at a time.
pub struct CommandConsumer {
    device: SharedDevice,
    source: Arc<dyn InboundSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    reporter: StatusReporter,
}

impl CommandConsumer {
    pub fn new(
        device: SharedDevice,
        source: Arc<dyn InboundSource>,
        checkpoints: Arc<dyn CheckpointStore>,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            device,
            source,
            checkpoints,
            reporter,
        }
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<(), EmulatorError> {
        let mut subscription = self.source.subscribe(Arc::clone(&self.checkpoints)).await?;
        info!("Command consumer subscribed");

        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.requested() => {
                    info!("Command consumer stopping");
                    return Ok(());
                }
                next = subscription.next_message() => next?,
            };

            let Some(message) = next else {
                info!("Inbound stream ended");
                return Ok(());
            };

            // Apply and checkpoint run to completion; shutdown is only
            // observed between messages.
            self.process(&message).await?;
        }
    }

    pub async fn process(&self, message: &ReceivedMessage) -> Result<ProcessOutcome, EmulatorError> {
        let outcome = match interpret(&message.body) {
            Ok(Mutation::NoOp) => {
                info!(
                    partition = %message.handle.partition,
                    offset = message.handle.offset,
                    "📨 Received: {}",
                    message.body_lossy()
                );
                ProcessOutcome::Ignored
            }
            Ok(mutation) => {
                info!(
                    partition = %message.handle.partition,
                    offset = message.handle.offset,
                    "📨 Received: {}",
                    message.body_lossy()
                );
                let snapshot = self.device.apply(mutation).await;
                info!(?mutation, "✅ Command applied");
                if let Mutation::SetCharging(on) = mutation {
                    self.reporter
                        .note(if on { "EV charging on" } else { "EV charging off" });
                }
                self.reporter.report(&snapshot);
                ProcessOutcome::Applied(mutation, snapshot)
            }
            Err(e) => {
                warn!(
                    partition = %message.handle.partition,
                    offset = message.handle.offset,
                    error = %e,
                    "Failed deserializing {}",
                    message.body_lossy()
                );
                ProcessOutcome::Malformed
            }
        };

        self.checkpoints.checkpoint(&message.handle).await?;
        Ok(outcome)
    }
}

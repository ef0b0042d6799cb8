use chrono::{TimeZone, Utc};
use evsim::command::RemoteCommand;
use evsim::config::EmulatorConfig;
use evsim::console::StatusReporter;
use evsim::device::{Mutation, SharedDevice};
use evsim::emulator::{Backends, Emulator};
use evsim::publisher::TelemetryPublisher;
use evsim::supervisor::{Finish, ShutdownSignal, TaskKind};
use evsim::telemetry::*;
use evsim::transport::memory::{MemoryCheckpointStore, MemoryPublisher, MemoryStream};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::oneshot;

fn fixed_serializer() -> TelemetrySerializer {
    let time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    TelemetrySerializer::new(FixedClock(time), SequentialIds::default())
}

fn published_events(publisher: &MemoryPublisher) -> Vec<TelemetryEvent> {
    publisher
        .published()
        .iter()
        .map(|payload| serde_json::from_slice(payload).unwrap())
        .collect()
}

struct Harness {
    publisher: MemoryPublisher,
    stream: MemoryStream,
    checkpoints: MemoryCheckpointStore,
}

impl Harness {
    fn new() -> Self {
        Self {
            publisher: MemoryPublisher::new(),
            stream: MemoryStream::new(),
            checkpoints: MemoryCheckpointStore::new(),
        }
    }

    fn backends(&self) -> Backends {
        Backends::new(
            Arc::new(self.publisher.clone()),
            Arc::new(self.stream.clone()),
            Arc::new(self.checkpoints.clone()),
        )
    }
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_scenario() {
    let harness = Harness::new();
    let (reporter, output) = StatusReporter::captured();
    let emulator =
        Emulator::new(EmulatorConfig::default(), reporter).with_serializer(fixed_serializer());
    let device = emulator.device();
    let (mut operator, input) = tokio::io::duplex(64);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let driver = async {
        // First cycle runs right away with the initial state.
        harness.publisher.wait_for(2).await;
        let first = published_events(&harness.publisher);
        assert_eq!(first[0].device.kind, DeviceType::Meter);
        assert_eq!(
            flatten_characteristics(&first[0])["power_consumption_wh"],
            json!(1000.0)
        );
        assert_eq!(first[1].device.kind, DeviceType::ElectricVehicle);
        let ev = flatten_characteristics(&first[1]);
        assert_eq!(ev["ev_plugged_in"], json!(0));
        assert_eq!(ev["ev_battery_level"], json!(50.0));
        assert_eq!(ev["ev_charging"], json!(0));
        assert_eq!(first[1].characteristic("ev_plugged_in").unwrap().value, "False");

        // Operator plugs in, then the remote side starts charging.
        operator.write_all(b"e\n").await.unwrap();
        while !device.snapshot().await.ev_plugged_in {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        harness
            .stream
            .push("0", RemoteCommand::TurnEvChargingOn.to_payload());
        harness.checkpoints.wait_for(1).await;

        // A cycle that had already taken its snapshot may still be in
        // flight; look at the first one that starts after both changes.
        let seen = harness.publisher.published_count();
        let start = if seen % 2 == 0 { seen + 2 } else { seen + 1 };
        harness.publisher.wait_for(start + 2).await;

        let events = published_events(&harness.publisher);
        let meter = &events[start];
        let ev = &events[start + 1];
        assert_eq!(meter.device.id, METER_DEVICE_ID);
        assert_eq!(
            flatten_characteristics(meter)["power_consumption_wh"],
            json!(2000.0)
        );
        assert_eq!(ev.device.id, EV_DEVICE_ID);
        assert_eq!(ev.characteristic("ev_charging").unwrap().value, "True");
        assert_eq!(ev.characteristic("ev_plugged_in").unwrap().value, "True");

        stop_tx.send(()).unwrap();
    };

    let stop = async {
        let _ = stop_rx.await;
    };
    let (outcome, ()) = tokio::join!(
        emulator.run(harness.backends(), BufReader::new(input), stop),
        driver
    );

    assert_eq!(outcome.finish, Finish::StopRequested);
    assert!(outcome.is_success());

    let console = output.contents();
    assert!(console.contains("EV plugged in: True\n"));
    assert!(console.contains("EV charging on\n"));
    assert!(console.contains("Power consumption: 2000\n"));
}

#[tokio::test(start_paused = true)]
async fn test_closed_operator_input_ends_run() {
    let harness = Harness::new();
    let (reporter, _output) = StatusReporter::captured();
    let emulator =
        Emulator::new(EmulatorConfig::default(), reporter).with_serializer(fixed_serializer());
    let (operator, input) = tokio::io::duplex(64);
    drop(operator);

    let outcome = emulator
        .run(harness.backends(), BufReader::new(input), std::future::pending())
        .await;

    assert_eq!(outcome.finish, Finish::Task(TaskKind::Console));
    assert!(outcome.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_publish_failure_ends_run() {
    let harness = Harness::new();
    harness.publisher.fail_with("outbound stream unavailable");
    let (reporter, _output) = StatusReporter::captured();
    let emulator = Emulator::new(EmulatorConfig::default(), reporter);
    let (_operator, input) = tokio::io::duplex(64);

    let outcome = emulator
        .run(harness.backends(), BufReader::new(input), std::future::pending())
        .await;

    assert_eq!(outcome.finish, Finish::Task(TaskKind::Publisher));
    assert!(!outcome.is_success());
    assert_eq!(outcome.first_error().unwrap().0, TaskKind::Publisher);
    assert_eq!(harness.publisher.published_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_finite_inbound_stream_ends_run() {
    let harness = Harness::new();
    harness
        .stream
        .push("0", RemoteCommand::TurnEvChargingOff.to_payload());
    harness.stream.close();
    let (reporter, _output) = StatusReporter::captured();
    let emulator = Emulator::new(EmulatorConfig::default(), reporter);
    let (_operator, input) = tokio::io::duplex(64);

    let outcome = emulator
        .run(harness.backends(), BufReader::new(input), std::future::pending())
        .await;

    assert_eq!(outcome.finish, Finish::Task(TaskKind::Consumer));
    assert!(outcome.is_success());
    assert_eq!(harness.checkpoints.position("0"), Some(0));
}

#[tokio::test]
async fn test_publish_once_sends_meter_then_ev() {
    let publisher = MemoryPublisher::new();
    let device = SharedDevice::new();
    device.apply(Mutation::IncreaseLoad).await;

    let telemetry = TelemetryPublisher::new(
        device,
        Arc::new(publisher.clone()),
        Duration::from_secs(60),
    )
    .with_serializer(fixed_serializer());

    let [meter, ev] = telemetry.publish_once().await.unwrap();
    assert_eq!(meter.characteristic("power_consumption_wh").unwrap().value, "1100");
    assert_eq!(ev.device.kind, DeviceType::ElectricVehicle);

    let sent = published_events(&publisher);
    assert_eq!(sent, vec![meter, ev]);
}

#[tokio::test(start_paused = true)]
async fn test_publisher_uses_fixed_delay() {
    let publisher = MemoryPublisher::new();
    let telemetry = TelemetryPublisher::new(
        SharedDevice::new(),
        Arc::new(publisher.clone()),
        Duration::from_secs(60),
    );
    let (trigger, signal) = ShutdownSignal::channel();
    let task = tokio::spawn(telemetry.run(signal));

    publisher.wait_for(2).await;
    let first_cycle = tokio::time::Instant::now();
    publisher.wait_for(4).await;
    assert!(first_cycle.elapsed() >= Duration::from_secs(60));
    assert_eq!(publisher.published_count(), 4);

    trigger.trigger();
    task.await.unwrap().unwrap();
    assert_eq!(publisher.published_count(), 4);
}

#[tokio::test]
async fn test_echo_prints_sent_events() {
    let publisher = MemoryPublisher::new();
    let (reporter, output) = StatusReporter::captured();
    let telemetry = TelemetryPublisher::new(
        SharedDevice::new(),
        Arc::new(publisher.clone()),
        Duration::from_secs(60),
    )
    .with_echo(reporter);

    telemetry.publish_once().await.unwrap();

    let text = output.contents();
    assert_eq!(text.matches("Sending data: ").count(), 2);
    assert!(text.contains("\"EventName\":\"SensorReadingEvent\""));
}

use evsim::console::{ConsoleInput, StatusReporter};
use evsim::device::SharedDevice;
use evsim::supervisor::ShutdownSignal;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};

const BOARD_HEADER: &str = "Power consumption: ";

/// Feeds `keys` to a console task, closes the input and waits for the task
/// to finish on its own.
async fn run_console(keys: &[u8]) -> (SharedDevice, String) {
    let device = SharedDevice::new();
    let (reporter, output) = StatusReporter::captured();
    let (mut operator, input) = tokio::io::duplex(256);
    operator.write_all(keys).await.unwrap();
    drop(operator);

    let (_trigger, signal) = ShutdownSignal::channel();
    let console = ConsoleInput::new(BufReader::new(input), device.clone(), reporter);
    tokio::time::timeout(Duration::from_secs(5), console.run(signal))
        .await
        .unwrap()
        .unwrap();

    (device, output.contents())
}

#[tokio::test]
async fn test_every_line_redraws_the_board() {
    let (device, text) = run_console(b"a\nq\n\nx\n").await;

    // Known key, unknown key, empty line, known key.
    assert_eq!(text.matches(BOARD_HEADER).count(), 4);
    assert_eq!(text.matches("EV battery: ").count(), 4);

    let snapshot = device.snapshot().await;
    assert_eq!(snapshot.base_load_wh, 1100);
    assert_eq!(snapshot.ev_battery_percent, 40);

    let boards: Vec<&str> = text.split(BOARD_HEADER).skip(1).collect();
    assert!(boards[0].starts_with("1100\n"));
    assert!(boards[1].contains("EV battery: 50\n"));
    assert!(boards[3].contains("EV battery: 40\n"));
}

#[tokio::test]
async fn test_keys_change_shared_device() {
    let (device, text) = run_console(b"a\na\nz\ns\ns\nx\ne\r\n").await;

    let snapshot = device.snapshot().await;
    assert_eq!(snapshot.base_load_wh, 1100);
    assert_eq!(snapshot.ev_battery_percent, 60);
    assert!(snapshot.ev_plugged_in);
    assert!(!snapshot.ev_charging);

    assert_eq!(text.matches(BOARD_HEADER).count(), 7);
    assert!(text.ends_with("Power consumption: 1100\nEV charging: False\nEV plugged in: True\nEV battery: 60\n"));
}

#[tokio::test]
async fn test_last_line_without_newline_is_handled() {
    let (device, text) = run_console(b"e\ne").await;

    assert!(!device.snapshot().await.ev_plugged_in);
    assert_eq!(text.matches(BOARD_HEADER).count(), 2);
}

#[tokio::test]
async fn test_shutdown_stops_waiting_console() {
    let device = SharedDevice::new();
    let (reporter, output) = StatusReporter::captured();
    let (_operator, input) = tokio::io::duplex(64);
    let (trigger, signal) = ShutdownSignal::channel();

    let console = ConsoleInput::new(BufReader::new(input), device, reporter);
    let task = tokio::spawn(console.run(signal));

    trigger.trigger();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(output.contents().is_empty());
}

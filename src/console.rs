//! Operator console: single-key commands on the input side, a four-line
//! status board on the output side.

use crate::device::{DeviceSnapshot, Mutation, SharedDevice};
use crate::error::EmulatorError;
use crate::supervisor::ShutdownSignal;
use colored::Colorize;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info};

/// Maps one line of operator input to a mutation. Surrounding whitespace is
/// ignored; anything that is not a known key yields `None`.
pub fn parse_operator_key(line: &str) -> Option<Mutation> {
    match line.trim() {
        "a" => Some(Mutation::IncreaseLoad),
        "z" => Some(Mutation::DecreaseLoad),
        "s" => Some(Mutation::IncreaseBattery),
        "x" => Some(Mutation::DecreaseBattery),
        "e" => Some(Mutation::TogglePlug),
        _ => None,
    }
}

fn capitalized_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

pub fn status_lines(snapshot: &DeviceSnapshot) -> [(&'static str, String); 4] {
    [
        ("Power consumption", snapshot.total_power_wh().to_string()),
        ("EV charging", capitalized_bool(snapshot.ev_charging).to_string()),
        ("EV plugged in", capitalized_bool(snapshot.ev_plugged_in).to_string()),
        ("EV battery", snapshot.ev_battery_percent.to_string()),
    ]
}

pub fn render_status(snapshot: &DeviceSnapshot) -> String {
    status_lines(snapshot)
        .iter()
        .map(|(label, value)| format!("{label}: {value}\n"))
        .collect()
}

fn render_status_colored(snapshot: &DeviceSnapshot) -> String {
    status_lines(snapshot)
        .iter()
        .map(|(label, value)| {
            let value = match value.as_str() {
                "True" => value.as_str().green().to_string(),
                "False" => value.as_str().red().to_string(),
                other => other.cyan().to_string(),
            };
            format!("{}: {}\n", label.bold(), value)
        })
        .collect()
}

/// Writes status boards and notes to the operator console. Clones share the
/// writer, so lines from different tasks never interleave mid-line.
#[derive(Clone)]
pub struct StatusReporter {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
    color: bool,
}

impl StatusReporter {
    pub fn new(out: impl Write + Send + 'static, color: bool) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(out))),
            color,
        }
    }

    pub fn stdout(color: bool) -> Self {
        Self::new(std::io::stdout(), color)
    }

    /// Reporter writing into a buffer that can be read back.
    pub fn captured() -> (Self, CapturedOutput) {
        let buffer = CapturedOutput::default();
        (Self::new(buffer.clone(), false), buffer)
    }

    pub fn report(&self, snapshot: &DeviceSnapshot) {
        let text = if self.color {
            render_status_colored(snapshot)
        } else {
            render_status(snapshot)
        };
        self.write(&text);
    }

    pub fn note(&self, message: &str) {
        let line = if self.color {
            format!("{}\n", message.yellow())
        } else {
            format!("{message}\n")
        };
        self.write(&line);
    }

    fn write(&self, text: &str) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        // The console is best effort; a closed stdout must not stop the emulator.
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

/// Shared in-memory sink for [`StatusReporter::captured`].
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    pub fn contents(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Interactive input task: one line per iteration until the input closes.
pub struct ConsoleInput<R> {
    reader: R,
    device: SharedDevice,
    reporter: StatusReporter,
}

impl<R> ConsoleInput<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R, device: SharedDevice, reporter: StatusReporter) -> Self {
        Self {
            reader,
            device,
            reporter,
        }
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<(), EmulatorError> {
        info!("⌨️  Operator console ready (a/z load, s/x battery, e plug)");
        let mut lines = self.reader.split(b'\n');

        loop {
            let segment = tokio::select! {
                biased;
                () = shutdown.requested() => {
                    info!("Operator console stopping");
                    return Ok(());
                }
                segment = lines.next_segment() => segment?,
            };

            let Some(segment) = segment else {
                info!("Operator input closed");
                return Ok(());
            };

            let line = String::from_utf8_lossy(&segment);
            let snapshot = match parse_operator_key(&line) {
                Some(mutation) => {
                    debug!(key = %line.trim(), ?mutation, "operator command");
                    self.device.apply(mutation).await
                }
                None => self.device.snapshot().await,
            };
            self.reporter.report(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_keys() {
        assert_eq!(parse_operator_key("a"), Some(Mutation::IncreaseLoad));
        assert_eq!(parse_operator_key("z"), Some(Mutation::DecreaseLoad));
        assert_eq!(parse_operator_key("s"), Some(Mutation::IncreaseBattery));
        assert_eq!(parse_operator_key("x"), Some(Mutation::DecreaseBattery));
        assert_eq!(parse_operator_key("e\r"), Some(Mutation::TogglePlug));
        assert_eq!(parse_operator_key("A"), None);
        assert_eq!(parse_operator_key("ae"), None);
        assert_eq!(parse_operator_key(""), None);
    }

    #[test]
    fn test_status_board_has_four_lines() {
        let snapshot = DeviceSnapshot {
            base_load_wh: 1000,
            ev_plugged_in: true,
            ev_charging: true,
            ev_battery_percent: 70,
        };
        assert_eq!(
            render_status(&snapshot),
            "Power consumption: 2000\nEV charging: True\nEV plugged in: True\nEV battery: 70\n"
        );
    }

    #[test]
    fn test_captured_reporter() {
        let (reporter, output) = StatusReporter::captured();
        reporter.note("EV charging on");
        reporter.report(&crate::device::DeviceState::new().snapshot());

        let text = output.contents();
        assert!(text.starts_with("EV charging on\n"));
        assert!(text.contains("Power consumption: 1000\n"));
        assert!(text.contains("EV plugged in: False\n"));
    }
}

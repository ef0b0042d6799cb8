use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "evsim.toml";
// Telemetry cycle: one meter and one EV event per minute
const DEFAULT_TELEMETRY_INTERVAL_SECS: u64 = 60;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;
const DEFAULT_TCP_PORT: u16 = 8080;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EmulatorConfig {
    pub telemetry: TelemetryCfg,
    pub inbound: InboundCfg,
    pub outbound: OutboundCfg,
    pub checkpoint: CheckpointCfg,
    pub tcp: TcpCfg,
    pub console: ConsoleCfg,
    pub supervisor: SupervisorCfg,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TelemetryCfg {
    pub interval_secs: u64,
}
impl Default for TelemetryCfg {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_TELEMETRY_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamBackend {
    File,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    File,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct InboundCfg {
    /// `tcp` also accepts command lines from gateway clients, appended to
    /// the `tcp` partition.
    pub backend: StreamBackend,
    /// Directory of `<partition>.jsonl` files.
    pub path: PathBuf,
    pub poll_interval_ms: u64,
}
impl Default for InboundCfg {
    fn default() -> Self {
        Self {
            backend: StreamBackend::File,
            path: "streams/commands".into(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OutboundCfg {
    pub backend: StreamBackend,
    pub path: PathBuf,
}
impl Default for OutboundCfg {
    fn default() -> Self {
        Self {
            backend: StreamBackend::File,
            path: "streams/telemetry.jsonl".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CheckpointCfg {
    pub backend: CheckpointBackend,
    pub path: PathBuf,
}
impl Default for CheckpointCfg {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::File,
            path: "checkpoints.json".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TcpCfg {
    pub bind: SocketAddr,
}
impl Default for TcpCfg {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_TCP_PORT),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConsoleCfg {
    pub color: bool,
    /// Print every published event on the console.
    pub echo_events: bool,
}
impl Default for ConsoleCfg {
    fn default() -> Self {
        Self {
            color: true,
            echo_events: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SupervisorCfg {
    pub shutdown_grace_ms: u64,
}
impl Default for SupervisorCfg {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl EmulatorConfig {
    /// Reads `path` if given (it must exist), otherwise `evsim.toml` in the
    /// working directory if present, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telemetry.interval_secs == 0 {
            return Err(ConfigError::Invalid("telemetry.interval_secs must be > 0".into()));
        }
        if self.inbound.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("inbound.poll_interval_ms must be > 0".into()));
        }
        // The tcp gateway stores command lines in the inbox directory too.
        if self.inbound.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("inbound.path cannot be empty".into()));
        }
        if self.outbound.backend == StreamBackend::File && self.outbound.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("outbound.path cannot be empty".into()));
        }
        if self.checkpoint.backend == CheckpointBackend::File
            && self.checkpoint.path.as_os_str().is_empty()
        {
            return Err(ConfigError::Invalid("checkpoint.path cannot be empty".into()));
        }
        Ok(())
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.inbound.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.supervisor.shutdown_grace_ms)
    }

    pub fn uses_tcp(&self) -> bool {
        self.inbound.backend == StreamBackend::Tcp || self.outbound.backend == StreamBackend::Tcp
    }
}

//! # Meter and EV Charger Emulator
//!
//! Emulates a household power meter and an electric vehicle charger. The
//! emulator publishes a telemetry event for each device on a fixed delay,
//! reacts to remote charging commands arriving on an inbound stream, and
//! accepts single-key operator commands on the console. All three mutate or
//! read one shared device state.
//!
//! ## Features
//!
//! - **Race-free device model**: every read and write of the device state is
//!   one critical section, never held across I/O
//! - **Telemetry**: `SensorReadingEvent` JSON records with typed string values
//! - **Remote commands**: `{"message": "TurnEvChargingOn"}` style payloads, with
//!   per-message checkpointing so a restart resumes where it left off
//! - **Supervision**: the first task to finish ends the run; no half-alive mode
//! - **Pluggable transports**: in-memory, JSON-lines files, or a TCP gateway
//!
//! ## Quick Start
//!
//! ```rust
//! use evsim::{DeviceState, Mutation, TelemetrySerializer};
//!
//! let mut state = DeviceState::new();
//! state.apply(Mutation::TogglePlug);
//! state.apply(Mutation::SetCharging(true));
//!
//! let [meter, ev] = TelemetrySerializer::system().serialize(&state.snapshot())?;
//! assert_eq!(meter.characteristics[0].value, "2000");
//! assert_eq!(ev.characteristics[2].value, "True");
//! # Ok::<(), evsim::telemetry::TelemetryError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`device`] - Device state, mutations and the shared handle
//! - [`telemetry`] - Wire model and serializer for outbound events
//! - [`command`] - Inbound command decoding
//! - [`publisher`], [`consumer`], [`console`] - The three concurrent tasks
//! - [`supervisor`] - Task lifecycle and shutdown
//! - [`transport`] - Broker boundary and its backends
//! - [`emulator`] - Wiring of configuration, backends and tasks

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_errors_doc)]

extern crate alloc;

pub mod command;
pub mod config;
pub mod console;
pub mod consumer;
pub mod device;
pub mod emulator;
pub mod error;
pub mod logging;
pub mod publisher;
pub mod supervisor;
pub mod telemetry;
pub mod transport;

// Re-export main public types for convenience
pub use command::{interpret, DecodeError, RemoteCommand};
pub use config::EmulatorConfig;
pub use device::{DeviceSnapshot, DeviceState, Mutation, SharedDevice};
pub use emulator::{Backends, Emulator};
pub use error::EmulatorError;
pub use supervisor::{RunOutcome, Supervisor, TaskKind};
pub use telemetry::{TelemetryEvent, TelemetrySerializer};

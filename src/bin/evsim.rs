use clap::{App, Arg};
use evsim::config::{ConfigError, EmulatorConfig};
use evsim::console::StatusReporter;
use evsim::emulator::{Backends, Emulator};
use evsim::logging;
use std::path::PathBuf;
use tokio::io::BufReader;
use tracing::{error, warn};

const EXIT_FAILURE: i32 = 1;
const EXIT_CONFIG: i32 = 2;

#[tokio::main]
async fn main() {
    let code = run().await;
    // Exit explicitly: the blocking stdin reader cannot be cancelled and
    // would otherwise keep the runtime alive until the next keystroke.
    std::process::exit(code);
}

async fn run() -> i32 {
    let matches = App::new("evsim")
        .version("0.1.0")
        .author("Energy Systems Engineering Team")
        .about("🔌 Power meter and EV charger emulator")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Configuration file (TOML); defaults to ./evsim.toml when present")
                .takes_value(true)
                .env("EVSIM_CONFIG"),
        )
        .arg(
            Arg::with_name("interval-secs")
                .long("interval-secs")
                .value_name("SECONDS")
                .help("Telemetry interval in seconds")
                .takes_value(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(n) if n > 0 => Ok(()),
                    _ => Err("Interval must be a positive number".into()),
                }),
        )
        .arg(
            Arg::with_name("bind")
                .long("bind")
                .value_name("ADDR")
                .help("TCP gateway address for the tcp backends")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("no-color")
                .long("no-color")
                .help("Disable colored console output"),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level when RUST_LOG is not set")
                .takes_value(true)
                .possible_values(&["error", "warn", "info", "debug", "trace"])
                .default_value("info"),
        )
        .get_matches();

    logging::init(matches.value_of("log-level").unwrap_or("info"));

    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            error!("❌ {}", e);
            return EXIT_CONFIG;
        }
    };

    println!("🔌 Meter & EV Charger Emulator");
    println!("==============================");
    println!("   Telemetry every {}s", config.telemetry.interval_secs);
    println!("   Keys: a/z load ±100 Wh, s/x battery ±10%, e plug/unplug EV");

    let backends = match Backends::from_config(&config).await {
        Ok(backends) => backends,
        Err(e) => {
            error!("❌ Failed to open transports: {}", e);
            return EXIT_FAILURE;
        }
    };

    let reporter = StatusReporter::stdout(config.console.color);
    let emulator = Emulator::new(config, reporter);
    let input = BufReader::new(tokio::io::stdin());
    let stop = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let outcome = emulator.run(backends, input, stop).await;
    println!("🛑 Emulator stopped");

    match outcome.first_error() {
        None => 0,
        Some((task, e)) => {
            error!("❌ {} failed: {}", task, e);
            EXIT_FAILURE
        }
    }
}

fn load_config(matches: &clap::ArgMatches<'_>) -> Result<EmulatorConfig, ConfigError> {
    let path = matches.value_of("config").map(PathBuf::from);
    let mut config = EmulatorConfig::load(path.as_deref())?;

    if let Some(secs) = matches.value_of("interval-secs") {
        config.telemetry.interval_secs = secs
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad interval: {secs}")))?;
    }
    if let Some(bind) = matches.value_of("bind") {
        config.tcp.bind = bind
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad bind address: {bind}")))?;
    }
    if matches.is_present("no-color") {
        config.console.color = false;
    }

    config.validate()?;
    Ok(config)
}

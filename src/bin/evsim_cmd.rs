use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use evsim::command::RemoteCommand;
use evsim::telemetry::{flatten_characteristics, TelemetryEvent};
use evsim::transport::file::append_message;
use evsim::transport::tcp::Receipt;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const DEFAULT_PARTITION: &str = "0";
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(5);

type CmdResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let matches = App::new("evsim-cmd")
        .version("0.1.0")
        .author("Energy Systems Engineering Team")
        .about("🔌 Send remote commands to the meter & EV charger emulator")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Emulator TCP gateway host")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Emulator TCP gateway port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true)
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be a number between 0 and 65535".into()),
                }),
        )
        .arg(
            Arg::with_name("inbox")
                .long("inbox")
                .value_name("DIR")
                .help("Append to a file-backed inbound stream instead of using TCP")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("partition")
                .long("partition")
                .value_name("NAME")
                .help("Partition to append to when using --inbox")
                .takes_value(true)
                .default_value(DEFAULT_PARTITION)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("charge-on")
                .about("⚡ Ask the EV charger to start charging"),
        )
        .subcommand(
            SubCommand::with_name("charge-off")
                .about("🔋 Ask the EV charger to stop charging"),
        )
        .subcommand(
            SubCommand::with_name("send")
                .about("📨 Send a raw payload as-is")
                .arg(
                    Arg::with_name("payload")
                        .help("Raw message body, e.g. '{\"message\": \"TurnEvChargingOn\"}'")
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("📡 Print telemetry events from the TCP gateway"),
        )
        .get_matches();

    if let Err(e) = run(&matches).await {
        eprintln!("{} {}", "❌".red(), e.to_string().bright_red());
        std::process::exit(1);
    }
}

async fn run(matches: &ArgMatches<'_>) -> CmdResult<()> {
    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let addr = format!("{host}:{port}");

    let payload = match matches.subcommand() {
        ("charge-on", _) => RemoteCommand::TurnEvChargingOn.to_payload(),
        ("charge-off", _) => RemoteCommand::TurnEvChargingOff.to_payload(),
        ("send", Some(sub)) => sub.value_of("payload").unwrap_or_default().as_bytes().to_vec(),
        ("watch", _) => return watch(&addr).await,
        _ => return Err("no command given, see --help".into()),
    };

    match matches.value_of("inbox") {
        Some(dir) => {
            let partition = matches.value_of("partition").unwrap_or(DEFAULT_PARTITION);
            let offset = append_message(Path::new(dir), partition, &payload).await?;
            println!(
                "{} Appended to {} partition {} at offset {}",
                "✅".green(),
                dir.bright_white(),
                partition.bright_white(),
                offset.to_string().bright_white()
            );
        }
        None => {
            let receipt = send_over_tcp(&addr, &payload).await?;
            println!(
                "{} Accepted at {}:{}",
                "✅".green(),
                receipt.partition.bright_white(),
                receipt.offset.to_string().bright_white()
            );
        }
    }
    Ok(())
}

async fn connect(addr: &str) -> CmdResult<TcpStream> {
    match TcpStream::connect(addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to emulator at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!(
                    "{} Is the emulator running with a tcp backend? Try:",
                    "💡".yellow()
                );
                eprintln!("   {}", "evsim --config evsim.toml".bright_cyan());
            }
            Err(e.into())
        }
    }
}

/// Sends one payload line and waits for its receipt. Telemetry lines that
/// arrive in the meantime are skipped.
async fn send_over_tcp(addr: &str, payload: &[u8]) -> CmdResult<Receipt> {
    let stream = connect(addr).await?;
    let (reader, mut writer) = stream.into_split();

    writer.write_all(payload).await?;
    writer.write_all(b"\n").await?;

    let mut lines = BufReader::new(reader).lines();
    let receipt = tokio::time::timeout(RECEIPT_TIMEOUT, async {
        while let Some(line) = lines.next_line().await? {
            if let Ok(receipt) = serde_json::from_str::<Receipt>(&line) {
                return Ok(receipt);
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "emulator closed the connection",
        ))
    })
    .await
    .map_err(|_| "timed out waiting for the emulator to accept the command")??;

    Ok(receipt)
}

async fn watch(addr: &str) -> CmdResult<()> {
    let stream = connect(addr).await?;
    println!(
        "{}",
        "📡 Watching telemetry (Press Ctrl+C to stop)...".bright_blue().bold()
    );

    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        match serde_json::from_str::<TelemetryEvent>(&line) {
            Ok(event) => print_event(&event),
            Err(_) => println!("{}", line.dimmed()),
        }
    }

    println!("{}", "Connection closed".yellow());
    Ok(())
}

fn print_event(event: &TelemetryEvent) {
    let values = flatten_characteristics(event)
        .into_iter()
        .map(|(name, value)| format!("{}={}", name.bright_white(), value))
        .collect::<Vec<_>>()
        .join(" ");
    println!(
        "{} {:<15} {}",
        event.event_time.format("%H:%M:%S").to_string().dimmed(),
        format!("{:?}", event.device.kind).bright_cyan(),
        values
    );
}

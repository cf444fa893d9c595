//! lsock - Unix domain socket probe
//!
//! Runs the available-bytes scenarios and offers small listen/send/probe
//! helpers over the same socket layer.

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use localsock_core::config::{Config, MAX_SCENARIO_BYTES, ScenarioConfig};
use localsock_core::logging::{LogFormat, init_logging};
use localsock_core::session::{Role, Scenario, ScenarioReport, run_scenario};
use localsock_core::{Connection, EndpointAddress, Listener};
use tracing::{debug, info};

/// lsock - Unix domain socket probe
#[derive(Parser, Debug)]
#[command(name = "lsock")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a localsock.toml (defaults to $LOCALSOCK_CONFIG, then the
    /// user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive (overrides the config file)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_parser = ["pretty", "json"])]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the available-bytes scenarios between a local server and client
    Scenario {
        /// Which side checks `available_bytes()` first
        #[arg(long, value_enum, default_value_t = Side::Both)]
        at: Side,

        /// Bytes written in each direction
        #[arg(long)]
        bytes: Option<usize>,

        /// Sleep before reading, in milliseconds
        #[arg(long)]
        settle_ms: Option<u64>,

        /// Socket path or @abstract name (defaults to a temp dir)
        #[arg(long)]
        socket: Option<String>,

        /// Print the reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Accept one connection and copy what it sends to stdout
    Listen {
        /// Socket path or @abstract name
        address: String,
    },

    /// Connect and send TEXT (or stdin)
    Send {
        /// Socket path or @abstract name
        address: String,

        /// Text to send; stdin is used when omitted
        text: Option<String>,
    },

    /// Connect and report how many bytes are already pending
    Probe {
        /// Socket path or @abstract name
        address: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Side {
    Client,
    Server,
    Both,
}

impl Side {
    /// First writers of the scenarios to run.
    fn first_writers(self) -> &'static [Role] {
        match self {
            Self::Client => &[Role::Server],
            Self::Server => &[Role::Client],
            Self::Both => &[Role::Server, Role::Client],
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_resolved(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format.as_deref() {
        config.logging.format = format.parse::<LogFormat>().map_err(anyhow::Error::msg)?;
    }
    init_logging(&config.logging).context("Failed to initialize logging")?;
    debug!(?config, "configuration resolved");

    match cli.command {
        Commands::Scenario {
            at,
            bytes,
            settle_ms,
            socket,
            json,
        } => {
            let mut scenario = config.scenario;
            if let Some(bytes) = bytes {
                scenario.bytes = bytes;
            }
            if let Some(settle_ms) = settle_ms {
                scenario.settle_ms = settle_ms;
            }
            run_scenarios(at, &scenario, socket.as_deref(), json)
        }
        Commands::Listen { address } => listen(&config, &parse_address(&address)?),
        Commands::Send { address, text } => send(&config, &parse_address(&address)?, text),
        Commands::Probe { address } => probe(&config, &parse_address(&address)?),
    }
}

fn parse_address(s: &str) -> Result<EndpointAddress> {
    EndpointAddress::parse(s).with_context(|| format!("Invalid socket address '{s}'"))
}

fn run_scenarios(
    at: Side,
    settings: &ScenarioConfig,
    socket: Option<&str>,
    json: bool,
) -> Result<()> {
    if settings.bytes > MAX_SCENARIO_BYTES {
        bail!(
            "--bytes must be at most {MAX_SCENARIO_BYTES}, got {}",
            settings.bytes
        );
    }

    // Keeps the default socket's directory alive until every scenario ran.
    let tempdir = tempfile::Builder::new()
        .prefix("lsock-")
        .tempdir()
        .context("Failed to create temp dir for the socket")?;
    let address = match socket {
        Some(s) => parse_address(s)?,
        None => EndpointAddress::from_path(tempdir.path().join("scenario.sock")),
    };

    let mut reports = Vec::new();
    for &first_writer in at.first_writers() {
        let scenario = Scenario::from_config(first_writer, settings);
        info!(scenario = scenario.name(), address = %address, "running scenario");
        let report = run_scenario(&address, &scenario)
            .with_context(|| format!("Scenario {} failed", scenario.name()))?;
        reports.push(report);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print_report(report);
        }
    }
    Ok(())
}

fn print_report(report: &ScenarioReport) {
    println!(
        "{}: ok ({} bytes, {} ms)",
        report.scenario, report.bytes, report.elapsed_ms
    );
    for (role, side) in [("client", &report.client), ("server", &report.server)] {
        let how = if side.primed {
            "primed with one byte"
        } else {
            "all bytes already queued"
        };
        println!(
            "  {role:<6} initial available={:<5} read={:<5} {how}",
            side.initial_available, side.bytes_read
        );
    }
}

fn listen(config: &Config, address: &EndpointAddress) -> Result<()> {
    let mut listener = Listener::bind_with(address, &config.listener)
        .with_context(|| format!("Failed to listen on {address}"))?;
    listener.set_socket_options(config.socket);
    info!(address = %address, "waiting for a connection");

    let conn = listener.accept().context("Failed to accept")?;
    info!(peer = ?conn.peer_address().ok().flatten(), "client connected");

    let mut stdout = std::io::stdout().lock();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let available = conn.available_bytes().context("Failed to query pending bytes")?;
        let n = conn.read(&mut buf).context("Failed to read")?;
        if n == 0 {
            break;
        }
        info!(available, read = n, "received");
        stdout.write_all(&buf[..n]).context("Failed to write to stdout")?;
    }
    stdout.flush()?;
    conn.close();
    listener.close();
    info!("peer finished");
    Ok(())
}

fn send(config: &Config, address: &EndpointAddress, text: Option<String>) -> Result<()> {
    let payload = match text {
        Some(text) => text.into_bytes(),
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };
    let conn = Connection::connect_with(address, &config.socket)
        .with_context(|| format!("Failed to connect to {address}"))?;
    conn.write(&payload).context("Failed to send")?;
    conn.shutdown_write().context("Failed to shut down write side")?;
    info!(bytes = payload.len(), address = %address, "sent");
    conn.close();
    Ok(())
}

fn probe(config: &Config, address: &EndpointAddress) -> Result<()> {
    let conn = Connection::connect_with(address, &config.socket)
        .with_context(|| format!("Failed to connect to {address}"))?;
    let pending = conn
        .available_bytes()
        .context("Failed to query pending bytes")?;
    println!("{pending}");
    conn.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn scenario_defaults_to_both_sides() {
        let cli = Cli::try_parse_from(["lsock", "scenario"]).unwrap();
        match cli.command {
            Commands::Scenario { at, json, .. } => {
                assert_eq!(at, Side::Both);
                assert!(!json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn side_maps_to_first_writer() {
        assert_eq!(Side::Client.first_writers(), &[Role::Server]);
        assert_eq!(Side::Server.first_writers(), &[Role::Client]);
        assert_eq!(Side::Both.first_writers().len(), 2);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["lsock", "probe", "@x", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format.as_deref(), Some("json"));
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["lsock", "--log-format", "xml", "probe", "@x"]).is_err());
    }
}

//! chanlink - interactive channel client
//!
//! Reads commands from stdin, drives the connection manager and prints every
//! status and message event.

use chanlink::config::LinkConfig;
use chanlink::lifecycle::{ConnectionManager, ManagerSettings};
use chanlink::observability::{init_default_logging, init_logging, metrics::metrics, LogFormat};
use chanlink::protocol::validate_channel;
use chanlink::sink::{ChannelSink, EventLog, LinkEvent};
use chanlink::transport::MqttBus;
use chanlink::{LinkError, LinkResult};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};

/// Single-channel pub/sub client
#[derive(Parser)]
#[command(name = "chanlink")]
#[command(about = "Join one channel on a pub/sub bus and chat over it")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CHANLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and read commands from stdin
    Run {
        /// Broker host (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Broker port (overrides config)
        #[arg(long)]
        port: Option<u16>,
        /// Channel to join (overrides config)
        #[arg(long)]
        channel: Option<String>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

/// One line of user input
#[derive(Debug, PartialEq, Eq)]
enum ShellCommand {
    Connect {
        host: String,
        port: u16,
        channel: String,
    },
    /// Reconnect to the last target
    Reconnect,
    Disconnect,
    Send {
        channel: String,
        text: String,
    },
    /// Send to the current channel
    Say(String),
    ShowLog,
    Status,
    Quit,
    Empty,
    Invalid(String),
}

fn parse_command(line: &str) -> ShellCommand {
    let line = line.trim();
    if line.is_empty() {
        return ShellCommand::Empty;
    }
    if !line.starts_with('/') {
        return ShellCommand::Say(line.to_string());
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();

    match command {
        "/connect" if rest.is_empty() => ShellCommand::Reconnect,
        "/connect" => {
            let args: Vec<&str> = rest.split_whitespace().collect();
            match args.as_slice() {
                [host, port, channel] => match port.parse() {
                    Ok(port) => ShellCommand::Connect {
                        host: host.to_string(),
                        port,
                        channel: channel.to_string(),
                    },
                    Err(_) => ShellCommand::Invalid(format!("invalid port '{port}'")),
                },
                _ => ShellCommand::Invalid("usage: /connect [host port channel]".to_string()),
            }
        }
        "/disconnect" => ShellCommand::Disconnect,
        "/send" => match rest.split_once(char::is_whitespace) {
            Some((channel, text)) if !text.trim().is_empty() => ShellCommand::Send {
                channel: channel.to_string(),
                text: text.trim().to_string(),
            },
            _ => ShellCommand::Invalid("usage: /send <channel> <text>".to_string()),
        },
        "/log" => ShellCommand::ShowLog,
        "/status" => ShellCommand::Status,
        "/quit" | "/exit" => ShellCommand::Quit,
        other => ShellCommand::Invalid(format!("unknown command '{other}'")),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize observability system
    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    info!("Starting chanlink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run {
            host,
            port,
            channel,
        } => run(apply_overrides(config, host, port, channel)).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> LinkResult<LinkConfig> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(LinkConfig::load_from_file(path)?)
        }
        None => {
            // Try default locations
            for path_str in ["chanlink.toml", "config/chanlink.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(LinkConfig::load_from_file(&path)?);
                }
            }

            info!("No configuration file found, using defaults");
            Ok(LinkConfig::default())
        }
    }
}

fn apply_overrides(
    mut config: LinkConfig,
    host: Option<String>,
    port: Option<u16>,
    channel: Option<String>,
) -> LinkConfig {
    if let Some(host) = host {
        config.bus.host = host;
    }
    if let Some(port) = port {
        config.bus.port = port;
    }
    if let Some(channel) = channel {
        config.bus.channel = channel;
    }
    config
}

async fn run(config: LinkConfig) -> LinkResult<()> {
    config.validate()?;

    let log = Arc::new(EventLog::new(config.log.capacity));
    let (sink, events) = ChannelSink::new();
    let printer = tokio::spawn(print_events(events, Arc::clone(&log)));

    let manager = ConnectionManager::new(
        Arc::new(MqttBus::new()),
        Arc::new(sink),
        ManagerSettings::from_config(&config),
    );
    manager.request_connect(config.bus.host.clone(), config.bus.port, config.bus.channel.clone());

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .map_err(|e| LinkError::internal(format!("cannot install SIGINT handler: {e}")))?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| LinkError::internal(format!("cannot install SIGTERM handler: {e}")))?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = read_commands(&manager, &log) => {
            info!("Input closed, shutting down...");
        }
    }

    manager.shutdown().await;
    drop(manager);
    // The printer ends once the manager's sink is gone
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), printer).await;
    Ok(())
}

async fn read_commands(manager: &ConnectionManager, log: &EventLog) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to read input: {}", e);
                return;
            }
        };

        match parse_command(&line) {
            ShellCommand::Connect {
                host,
                port,
                channel,
            } => {
                if let Err(e) = checked_channel(&channel) {
                    println!("! {e}");
                    continue;
                }
                manager.request_connect(host, port, channel);
            }
            ShellCommand::Reconnect => match manager.target() {
                Some(target) => manager.request_connect(
                    target.endpoint.host,
                    target.endpoint.port,
                    target.channel,
                ),
                None => println!("! no previous connection"),
            },
            ShellCommand::Disconnect => manager.request_disconnect(),
            ShellCommand::Send { channel, text } => match checked_channel(&channel) {
                Ok(()) => manager.request_send(channel, text),
                Err(e) => println!("! {e}"),
            },
            ShellCommand::Say(text) => match manager.active_channel() {
                Some(channel) => manager.request_send(channel, text),
                None => println!("! not connected"),
            },
            ShellCommand::ShowLog => {
                for entry in log.entries() {
                    println!("{} {}", entry.at.format("%m-%d %H:%M:%S"), entry.line);
                }
            }
            ShellCommand::Status => print_status(manager),
            ShellCommand::Quit => return,
            ShellCommand::Empty => {}
            ShellCommand::Invalid(reason) => println!("! {reason}"),
        }
    }
}

/// Channel name typed by the user, checked before it reaches the manager
fn checked_channel(channel: &str) -> LinkResult<()> {
    validate_channel(channel)
        .map_err(|e| LinkError::invalid_input(format!("channel '{channel}': {e}")))
}

fn print_status(manager: &ConnectionManager) {
    match manager.target() {
        Some(target) => println!("target: {} - {}", target.channel, target.endpoint),
        None => println!("target: none"),
    }
    println!("connected: {}", manager.is_connected());
    if let Some(at) = manager.last_heartbeat() {
        println!("last heartbeat: {at}");
    }
    match serde_json::to_string_pretty(&metrics().snapshot()) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!("Failed to render metrics: {}", e),
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<LinkEvent>, log: Arc<EventLog>) {
    while let Some(event) = events.recv().await {
        let line = event.to_string();
        println!("{line}");
        log.push(line);
    }
}

fn handle_config_command(config: LinkConfig, show: bool) -> LinkResult<()> {
    config.validate()?;
    if show {
        println!("Current configuration:");
        let rendered = toml::to_string_pretty(&config)
            .map_err(|e| LinkError::internal(format!("cannot render configuration: {e}")))?;
        println!("{rendered}");
    }

    info!("Configuration validation complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect() {
        assert_eq!(
            parse_command("/connect 10.0.0.1 6379 room1"),
            ShellCommand::Connect {
                host: "10.0.0.1".to_string(),
                port: 6379,
                channel: "room1".to_string(),
            }
        );
        assert_eq!(parse_command("/connect"), ShellCommand::Reconnect);
        assert!(matches!(
            parse_command("/connect host notaport room1"),
            ShellCommand::Invalid(_)
        ));
        assert!(matches!(
            parse_command("/connect host 1883"),
            ShellCommand::Invalid(_)
        ));
    }

    #[test]
    fn test_parse_send_and_say() {
        assert_eq!(
            parse_command("/send room2 hello there"),
            ShellCommand::Send {
                channel: "room2".to_string(),
                text: "hello there".to_string(),
            }
        );
        assert!(matches!(parse_command("/send room2"), ShellCommand::Invalid(_)));
        assert_eq!(parse_command("  hi  "), ShellCommand::Say("hi".to_string()));
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_command("/disconnect"), ShellCommand::Disconnect);
        assert_eq!(parse_command("/log"), ShellCommand::ShowLog);
        assert_eq!(parse_command("/status"), ShellCommand::Status);
        assert_eq!(parse_command("/quit"), ShellCommand::Quit);
        assert_eq!(parse_command(""), ShellCommand::Empty);
        assert!(matches!(parse_command("/bogus"), ShellCommand::Invalid(_)));
    }

    #[test]
    fn test_checked_channel() {
        assert!(checked_channel("room1").is_ok());

        let error = checked_channel("rooms/#").unwrap_err();
        assert!(matches!(error, LinkError::InvalidInput { .. }));
        assert!(error.to_string().contains("rooms/#"));
        assert!(matches!(
            checked_channel(""),
            Err(LinkError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_apply_overrides() {
        let config = apply_overrides(
            LinkConfig::default(),
            Some("10.0.0.1".to_string()),
            None,
            Some("room2".to_string()),
        );
        assert_eq!(config.bus.host, "10.0.0.1");
        assert_eq!(config.bus.port, 1883);
        assert_eq!(config.bus.channel, "room2");
    }
}

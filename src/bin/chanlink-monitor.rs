//! chanlink monitor
//!
//! Passive observer of one channel. Unlike the interactive client it shows
//! every envelope on the wire, heartbeats and control notices included.

use chanlink::protocol::{validate_channel, Envelope, EnvelopeKind};
use chanlink::transport::{BusConnector, BusEvent, ClientOptions, Endpoint, MqttBus};
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Monitor all traffic on a chanlink channel
#[derive(Parser)]
#[command(name = "chanlink-monitor")]
#[command(about = "Monitor every envelope published on a channel")]
#[command(version)]
struct Args {
    /// Channel to observe
    #[arg(long, default_value = "room1")]
    channel: String,

    /// Broker host
    #[arg(long, default_value = "127.0.0.1")]
    broker_host: String,

    /// Broker port
    #[arg(long, default_value_t = 1883)]
    broker_port: u16,

    /// Output format
    #[arg(short, long, default_value = "pretty")]
    format: OutputFormat,

    /// Hide heartbeats
    #[arg(long)]
    no_heartbeats: bool,
}

/// Output formatting options
#[derive(Clone, Debug, clap::ValueEnum)]
enum OutputFormat {
    /// Color-coded, one line per envelope (default)
    Pretty,
    /// Raw JSON output for programmatic processing
    Json,
}

const RESET: &str = "\x1b[0m";

/// Label and color of an inbound payload (pure function)
fn kind_style(kind: Option<EnvelopeKind>) -> (&'static str, &'static str) {
    match kind {
        Some(EnvelopeKind::Data) => ("DATA", "\x1b[1;32m"),         // Green
        Some(EnvelopeKind::Control) => ("CONTROL", "\x1b[1;33m"),   // Yellow
        Some(EnvelopeKind::Heartbeat) => ("HEARTBEAT", "\x1b[0;90m"), // Dark gray
        None => ("RAW", "\x1b[0;37m"),                              // White
    }
}

/// Render one inbound payload, or `None` when it is filtered out
fn format_payload(args: &Args, channel: &str, payload: &[u8]) -> Option<String> {
    let envelope = Envelope::decode(payload);
    let kind = envelope.as_ref().map(|e| e.kind);
    if args.no_heartbeats && kind == Some(EnvelopeKind::Heartbeat) {
        return None;
    }

    match args.format {
        OutputFormat::Json => Some(match &envelope {
            Some(envelope) => serde_json::to_string(envelope).unwrap_or_default(),
            None => serde_json::json!({ "channel": channel, "raw": String::from_utf8_lossy(payload) })
                .to_string(),
        }),
        OutputFormat::Pretty => {
            let (label, color) = kind_style(kind);
            Some(match envelope {
                Some(envelope) => format!(
                    "{color}[{label}]{RESET} {} {channel} <{}> {}",
                    envelope.sent_at.format("%H:%M:%S"),
                    &envelope.origin.simple().to_string()[..8],
                    envelope.body
                ),
                None => format!(
                    "{color}[{label}]{RESET} {channel} {}",
                    String::from_utf8_lossy(payload)
                ),
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("chanlink=info,chanlink_monitor=info,rumqttc=warn")
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    validate_channel(&args.channel)?;

    let endpoint = Endpoint::new(args.broker_host.clone(), args.broker_port);
    println!("chanlink monitor");
    println!("================");
    println!("Broker: {endpoint}");
    println!("Channel: {}", args.channel);
    println!("Press Ctrl+C to stop monitoring");
    println!();

    let client = MqttBus::new().create_client(&endpoint, &ClientOptions::default())?;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let subscription = client.connect_pubsub(events_tx).await?;
    subscription.subscribe(&args.channel).await?;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received...");
                break;
            }
            event = events_rx.recv() => match event {
                Some(BusEvent::Subscribed { channel }) => info!("Subscribed to {}", channel),
                Some(BusEvent::Unsubscribed { channel }) => info!("Unsubscribed from {}", channel),
                Some(BusEvent::Message { channel, payload }) => {
                    if let Some(line) = format_payload(&args, &channel, &payload) {
                        println!("{line}");
                    }
                }
                None => {
                    error!("Subscription link closed");
                    break;
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

//! Cast V2 client binary.
//!
//! Connects to one device, authenticates it, runs a single command and
//! closes. Results are printed to stdout as JSON; logs go to stderr.

use anyhow::{Context, Result};
use cast_session::{CastClient, HandlerOutcome, NamespaceHandler};
use cast_wire::{Message, PLATFORM_DESTINATION_ID, REQUEST_ID};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::CastConfig;
use logging::CastLogFormatter;

/// Persistent authenticated Cast V2 client
#[derive(Parser, Debug)]
#[command(name = "castv2", version, about = "Authenticated Cast V2 client")]
struct Args {
    /// Device address, e.g. 192.168.1.40
    #[arg(long)]
    host: Option<IpAddr>,

    /// Device port
    #[arg(long)]
    port: Option<u16>,

    /// Configuration file path
    #[arg(long, default_value = "cast.yaml")]
    config: PathBuf,

    /// PEM file with trusted device roots
    #[arg(long)]
    trust_anchors: Option<PathBuf>,

    /// Certificate revocation list (PEM or DER)
    #[arg(long)]
    crl: Option<PathBuf>,

    /// Expected SHA-256 fingerprint of the device's TLS certificate
    #[arg(long)]
    fingerprint: Option<String>,

    /// How long to wait for the connection, e.g. 15s
    #[arg(long, default_value = "15s")]
    connect_wait: humantime::Duration,

    /// Request timeout, e.g. 10s
    #[arg(long)]
    request_timeout: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: CastCommand,
}

#[derive(Subcommand, Debug)]
enum CastCommand {
    /// Print the receiver status
    Status,
    /// Connect, authenticate and report how long it took
    Ping,
    /// Print connection and receiver updates until interrupted
    Watch {
        /// Also print messages on these namespaces (repeatable)
        #[arg(long)]
        namespace: Vec<String>,
    },
    /// Send a JSON message
    Send {
        /// Namespace, e.g. urn:x-cast:com.google.cast.receiver
        #[arg(long)]
        namespace: String,
        /// JSON object payload
        #[arg(long)]
        payload: String,
        /// Destination id
        #[arg(long, default_value = PLATFORM_DESTINATION_ID)]
        destination: String,
        /// Wait for the correlated reply and print it
        #[arg(long)]
        wait_reply: bool,
    },
}

/// Prints every message of the namespace it is registered for
struct Printer;

impl NamespaceHandler for Printer {
    fn on_message(&self, message: &Message, data: &Value) -> HandlerOutcome {
        print_json(&json!({
            "event": "message",
            "namespace": message.namespace,
            "source": message.source_id,
            "data": data,
        }));
        HandlerOutcome::Handled
    }
}

fn print_json(value: &Value) {
    println!("{}", value);
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("castv2={}", args.log_level).parse()?)
        .add_directive(format!("cast_session={}", args.log_level).parse()?)
        .add_directive(format!("cast_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(CastLogFormatter::new())
        .init();

    info!(component = "cli", "Starting castv2 v{}", env!("CARGO_PKG_VERSION"));

    let mut cast_config = CastConfig::load_from_file(&args.config)?;
    if let Some(host) = args.host {
        cast_config.host = Some(host.to_string());
    }
    if let Some(port) = args.port {
        cast_config.port = port;
    }
    if let Some(path) = &args.trust_anchors {
        cast_config.trust_anchors = Some(path.clone());
    }
    if let Some(path) = &args.crl {
        cast_config.crl = Some(path.clone());
    }
    if let Some(fingerprint) = &args.fingerprint {
        cast_config.fingerprint = Some(fingerprint.clone());
    }

    let endpoint = cast_config.endpoint()?;
    let mut client_config = cast_config.client_config()?;
    if let Some(timeout) = args.request_timeout {
        client_config.request_timeout = timeout.into();
    }

    let started = Instant::now();
    let client = CastClient::spawn(endpoint, client_config)?;

    if let CastCommand::Watch { namespace } = &args.command {
        return watch(&client, namespace).await;
    }

    let status = client
        .wait_established(args.connect_wait.into())
        .await
        .context("Device did not become ready")?;
    info!(
        component = "cli",
        "Connected to {} (generation {})", status.address, status.generation
    );

    let result = run(&client, args.command, started).await;
    client.close().await;
    result
}

async fn run(client: &CastClient, command: CastCommand, started: Instant) -> Result<()> {
    match command {
        CastCommand::Status => {
            let reply = client
                .request_platform(json!({ "type": "GET_STATUS" }))
                .await
                .context("GET_STATUS failed")?;
            print_json(&reply);
        }
        CastCommand::Ping => {
            let status = client.status();
            print_json(&json!({
                "address": status.address.to_string(),
                "generation": status.generation,
                "state": status.state.to_string(),
                "elapsed_ms": started.elapsed().as_millis() as u64,
            }));
        }
        CastCommand::Send {
            namespace,
            payload,
            destination,
            wait_reply,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            if wait_reply || payload.get(REQUEST_ID).is_some() {
                let reply = client
                    .request(&namespace, &destination, payload)
                    .await
                    .with_context(|| format!("request on {} failed", namespace))?;
                print_json(&reply);
            } else {
                client.send(&namespace, &destination, payload).await?;
                debug!(component = "cli", "Sent message on {}", namespace);
            }
        }
        CastCommand::Watch { .. } => {}
    }
    Ok(())
}

async fn watch(client: &CastClient, namespaces: &[String]) -> Result<()> {
    let printer = Arc::new(Printer);
    for namespace in namespaces {
        client.register(namespace, &printer).await?;
    }

    let mut status = client.watch_status();
    let mut receiver = client.watch_receiver_status();

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    warn!(component = "cli", "Client stopped");
                    break;
                }
                let current = status.borrow_and_update().clone();
                print_json(&json!({
                    "event": "connection",
                    "generation": current.generation,
                    "state": current.state.to_string(),
                }));
            }
            changed = receiver.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = receiver.borrow_and_update().clone();
                if let Some(current) = current {
                    print_json(&json!({
                        "event": "receiver",
                        "app_id": current.app_id,
                        "display_name": current.display_name,
                        "transport_id": current.transport_id,
                        "is_active_input": current.is_active_input,
                        "is_stand_by": current.is_stand_by,
                        "volume_level": current.volume_level,
                        "volume_muted": current.volume_muted,
                    }));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(component = "cli", "Interrupted, closing");
                break;
            }
        }
    }

    client.close().await;
    // Keep the handler alive until the client is closed
    drop(printer);
    Ok(())
}

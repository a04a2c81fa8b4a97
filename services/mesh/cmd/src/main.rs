//! Mesh network node binary.
//!
//! Runs one mesh node over TCP neighbor links and offers a line-oriented
//! console on stdin:
//!
//! ```text
//! /msg <peer-id> <text>   private message
//! /peers                  neighbors and session state
//! /stats                  router counters
//! /leave                  announce departure and exit
//! <text>                  broadcast
//! ```

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use mesh_node::delivery::DeliveryOutcome;
use mesh_node::session::StaticIdentity;
use mesh_node::wire::{PeerId, Value};
use mesh_node::{ChannelSink, Delivery, MeshEvent, MeshNode};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod transport;

use config::Settings;
use logging::MeshLogFormatter;

/// Application kind used for console chat messages
const CHAT_KIND: u8 = 1;

/// Crates whose events follow `--log-level`
const MESH_CRATES: [&str; 7] = [
    "mesh_bin",
    "mesh_node",
    "mesh_session",
    "mesh_routing",
    "mesh_delivery",
    "mesh_storage",
    "mesh_wire",
];

/// Mesh network node
#[derive(Parser, Debug)]
#[command(name = "mesh", version, about = "Encrypted store-and-forward mesh node")]
struct Args {
    /// Listen address, e.g. 0.0.0.0:9000
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Connect to address, e.g. 127.0.0.1:9000 (repeatable)
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// Derive the identity key from this passphrase instead of a random key
    #[arg(long)]
    identity_seed: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "mesh.yaml")]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("warn");
    for krate in MESH_CRATES {
        env_filter = env_filter.add_directive(format!("{}={}", krate, args.log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(MeshLogFormatter::new("mesh".to_string()))
        .init();

    info!("Starting mesh node v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = Settings::load_from_file(&args.config)?;
    if args.listen.is_some() {
        settings.node.listen = args.listen;
    }
    if !args.connect.is_empty() {
        settings.node.connect = args.connect.clone();
    }
    if args.identity_seed.is_some() {
        settings.node.identity_seed = args.identity_seed.clone();
    }

    let identity = match &settings.node.identity_seed {
        Some(seed) => {
            let digest: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
            StaticIdentity::from_seed(&digest)
        }
        None => StaticIdentity::generate(),
    };

    let (sink, mut deliveries) = ChannelSink::new(256);
    let (node, mut events) = MeshNode::new(
        settings.mesh.clone(),
        Arc::new(identity),
        Arc::new(sink),
        None,
    )
    .map_err(|e| anyhow::anyhow!("Failed to create mesh node: {}", e))?;
    info!("Local peer id: {}", node.local_id());

    let _maintenance = node.spawn_maintenance();
    let link_buffer = settings.node.link_buffer;

    if let Some(listen) = settings.node.listen {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to bind {}", listen))?;
        component_info!("transport", "Listening on {}", listen);
        tokio::spawn(transport::serve(Arc::clone(&node), listener, link_buffer));
    }
    for addr in &settings.node.connect {
        component_info!("transport", "Dialing neighbor {}", addr);
        tokio::spawn(transport::dial(Arc::clone(&node), *addr, link_buffer));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        if !run_command(&node, line.trim()).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Console closed");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("Console read failed: {}", e);
                        stdin_open = false;
                    }
                }
            }

            Some(delivery) = deliveries.recv() => print_delivery(&delivery),

            Some(event) = events.recv() => log_event(&event),

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                if let Err(e) = node.leave().await {
                    debug!("Leave not announced: {}", e);
                }
                break;
            }
        }
    }

    info!("Mesh node shutdown complete");
    Ok(())
}

/// Execute one console line; `false` when the node should exit
async fn run_command(node: &Arc<MeshNode>, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }

    if let Some(rest) = line.strip_prefix("/msg ") {
        let Some((peer, text)) = rest.trim().split_once(' ') else {
            println!("usage: /msg <peer-id> <text>");
            return true;
        };
        let peer: PeerId = match peer.parse() {
            Ok(peer) => peer,
            Err(e) => {
                println!("bad peer id: {}", e);
                return true;
            }
        };
        send_private(node, peer, text).await;
        return true;
    }

    match line {
        "/peers" => {
            for peer in node.neighbors() {
                println!("{}  session={:?}", peer, node.session_state(&peer));
            }
        }
        "/stats" => println!("{:?}", node.router_stats()),
        "/leave" => {
            if let Err(e) = node.leave().await {
                warn!("Leave failed: {}", e);
            }
            return false;
        }
        text => {
            let result = match chat_body(text) {
                Ok(body) => node.broadcast(CHAT_KIND, body).await.map(|_| ()),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                warn!("Broadcast failed: {}", e);
            }
        }
    }
    true
}

/// Console chat payload: `{text, sent_at}`
fn chat_body(text: &str) -> Result<Bytes, mesh_node::wire::WireError> {
    Value::map()
        .with("text", text)
        .with("sent_at", chrono::Utc::now().timestamp_millis())
        .encode()
}

fn chat_text(body: &[u8]) -> Option<String> {
    let value = Value::decode(body).ok()?;
    value.get("text")?.as_str().map(str::to_string)
}

async fn send_private(node: &Arc<MeshNode>, peer: PeerId, text: &str) {
    let body = match chat_body(text) {
        Ok(body) => body,
        Err(e) => {
            warn!("Could not encode message: {}", e);
            return;
        }
    };
    match node.send_private(peer, CHAT_KIND, body).await {
        Ok(receipt) => {
            tokio::spawn(async move {
                let id = receipt.message_id();
                match receipt.outcome().await {
                    DeliveryOutcome::Delivered => println!("delivered {} to {}", id, peer),
                    outcome => println!("message {} to {}: {}", id, peer, outcome),
                }
            });
        }
        Err(e) if e.is_no_session() => {
            println!("securing a session with {}, send again shortly", peer)
        }
        Err(e) => warn!("Private message failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_body() {
        let body = chat_body("hello mesh").unwrap();
        assert_eq!(chat_text(&body).as_deref(), Some("hello mesh"));
        assert_eq!(chat_text(b"not cbor at all"), None);
    }
}

fn print_delivery(delivery: &Delivery) {
    let scope = if delivery.broadcast { "all" } else { "private" };
    let text = match delivery.kind {
        Some(CHAT_KIND) => chat_text(&delivery.body),
        _ => None,
    };
    match text {
        Some(text) => println!("<{}> ({}) {}", delivery.sender, scope, text),
        None => println!(
            "<{}> ({}) {:?}, {} bytes",
            delivery.sender,
            scope,
            delivery.packet_type,
            delivery.body.len()
        ),
    }
}

fn log_event(event: &MeshEvent) {
    match event {
        MeshEvent::SessionEstablished { peer, role } => {
            component_info!("session", "Session with {} established ({:?})", peer, role)
        }
        MeshEvent::SessionFailed { peer, reason } => {
            component_warn!("session", "Session with {} failed: {}", peer, reason)
        }
        MeshEvent::PeerLeft { peer } => info!("Peer {} left the mesh", peer),
        MeshEvent::PacketRejected { from, reason } => {
            debug!("Rejected packet from {}: {}", from, reason)
        }
        other => debug!("{:?}", other),
    }
}

//! Dials devp2p peers, keeps the sessions alive with pings and disconnects
//! cleanly on ctrl-c.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rlpx::{Node, NodeConfig, SessionEvent};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pingpong", about = "RLPx ping/pong peer", version)]
struct Cli {
    /// JSON node configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hex secp256k1 secret key; random when omitted.
    #[arg(long)]
    private_key: Option<String>,

    #[arg(long)]
    udp_port: Option<u16>,

    /// Accept inbound peers on this TCP port.
    #[arg(long)]
    listen: Option<u16>,

    /// Use the pre-EIP-8 handshake when dialling.
    #[arg(long)]
    legacy: bool,

    /// Ping ready peers every N polls; 0 disables.
    #[arg(long, default_value_t = 20)]
    ping_every: u64,

    /// Log as JSON lines.
    #[arg(long)]
    json: bool,

    /// Peers as enode://<pubkey>@<ip>:<port>.
    enodes: Vec<String>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn load_config(cli: &Cli) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(key) = &cli.private_key {
        config.private_key = Some(key.clone());
    }
    if let Some(port) = cli.udp_port {
        config.udp_port = Some(port);
    }
    if let Some(port) = cli.listen {
        config.listen_port = Some(port);
    }
    config.legacy_handshake |= cli.legacy;
    config.peers.extend(cli.enodes.iter().cloned());
    config.max_peers = config.max_peers.max(config.peers.len());
    config.validate()?;
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = load_config(&cli)?;
    let interval = config.poll_timeout();
    let mut node = Node::new(config)?;
    info!(enode = %node.enode(), "listening");

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let mut polls: u64 = 0;
    while !interrupted.load(Ordering::SeqCst) {
        tokio::time::sleep(interval).await;
        for (slot, event) in node.poll_for(Duration::ZERO)? {
            match event {
                SessionEvent::Hello(hello) => {
                    info!(slot, client = %hello.client_id, port = hello.listen_port, "hello")
                }
                SessionEvent::Pong(latency) => info!(slot, ?latency, "pong"),
                SessionEvent::Failed(err) => warn!(slot, error = %err, "peer failed"),
                _ => {}
            }
        }
        polls += 1;
        if cli.ping_every > 0 && polls % cli.ping_every == 0 {
            node.broadcast_ping();
        }
    }

    info!("interrupted, disconnecting peers");
    node.stop();
    Ok(())
}

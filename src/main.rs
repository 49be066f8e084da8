//! Shard node binary.
//!
//! Runs a verifier (coordinator), a drafter (scout), or both in one
//! process. With `--prompt` the node drives a single completion through the
//! façade, prints the streamed tokens, and exits.

use clap::Parser;
use shard::{
    ChatMessage, CompletionRequest, MeshConfig, Node, NodeOptions, NodeRole, TerminalStatus,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "shard", version, about = "Shard: speculative-decoding inference mesh")]
struct Args {
    /// Node role: verifier, drafter, both
    #[arg(short, long, default_value = "verifier")]
    role: String,

    /// Listen port
    #[arg(short, long, default_value_t = shard::net::DEFAULT_PORT)]
    port: u16,

    /// Data directory (reputation ledger)
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Bootstrap peers (comma-separated host:port)
    #[arg(short = 's', long)]
    peers: Option<String>,

    /// Verifier model backend: deterministic[:<seed>] or remote:<addr>
    #[arg(long, default_value = "deterministic")]
    verifier_model: String,

    /// Drafter model backend: deterministic[:<seed>] or remote:<addr>
    #[arg(long, default_value = "deterministic")]
    drafter_model: String,

    /// Local verifier endpoint for the co-location probe
    #[arg(long)]
    verifier_endpoint: Option<SocketAddr>,

    /// Run one completion for this prompt, print it, and exit
    #[arg(long)]
    prompt: Option<String>,

    /// Token cap for --prompt runs
    #[arg(long, default_value_t = 64)]
    max_tokens: usize,

    /// Verification-prompt injection rate (0.0 - 1.0)
    #[arg(long)]
    injection_rate: Option<f64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shard=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let role = match args.role.as_str() {
        "verifier" => NodeRole::verifier(),
        "drafter" => NodeRole::drafter(),
        "both" => NodeRole::both(),
        _ => {
            error!("invalid role. Use: verifier, drafter, both");
            return;
        }
    };

    let bootstrap: Vec<SocketAddr> = args
        .peers
        .as_deref()
        .map(|s| {
            s.split(',')
                .filter_map(|p| match p.trim().parse() {
                    Ok(addr) => Some(addr),
                    Err(_) => {
                        warn!("ignoring unparseable peer address '{}'", p.trim());
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let mut config = MeshConfig {
        data_dir: args.data_dir.clone(),
        bootstrap,
        verifier_endpoint: args.verifier_endpoint,
        ..Default::default()
    };
    if let Some(rate) = args.injection_rate {
        config.verification_injection_rate = rate;
    }

    info!("Shard v{} — role {}, port {}", VERSION, args.role, args.port);
    if !config.bootstrap.is_empty() {
        info!("bootstrap peers: {:?}", config.bootstrap);
    }

    let node = match Node::start(
        NodeOptions {
            config,
            role,
            verifier_model: args.verifier_model,
            drafter_model: args.drafter_model,
        },
        args.port,
    )
    .await
    {
        Ok(node) => node,
        Err(e) => {
            error!("failed to start node: {}", e);
            return;
        }
    };

    // One-shot completion mode.
    if let Some(prompt) = args.prompt {
        let request = CompletionRequest {
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: args.max_tokens,
            stop_tokens: Vec::new(),
        };
        match node.complete(request) {
            Ok(mut handle) => {
                info!("streaming completion {}", handle.fingerprint);
                while let Some(token) = handle.next_token().await {
                    print!("{} ", token);
                    use std::io::Write;
                    std::io::stdout().flush().ok();
                }
                println!();
                match handle.status().await {
                    TerminalStatus::Stop => info!("completion stopped"),
                    TerminalStatus::Length => info!("completion hit the token cap"),
                    TerminalStatus::Error(e) => error!("completion failed: {}", e),
                }
            }
            Err(e) => error!("cannot run completion: {}", e),
        }
        node.shutdown().await;
        return;
    }

    // Status printer.
    {
        let node = node.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                let stats = node.stats();
                info!(
                    "status: {} peer(s) ({} verified) | inbox fps {} | tracked {} | banned {} | drops m={} o={} u={} q={}",
                    stats.peers.total,
                    stats.peers.verified,
                    stats.inbox.fingerprints,
                    stats.reputation_tracked,
                    stats.banned,
                    stats.transport.malformed,
                    stats.transport.oversized,
                    stats.transport.unauthenticated,
                    stats.transport.dropped_overflow,
                );
            }
        });
    }

    info!("node running on {}; waiting for peers", node.local_addr());
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    node.shutdown().await;
}

//! Courier daemon and CLI.
//!
//! Three verbs: `send` submits a bundle toward a peer, `recv` runs a
//! receiver/relay node, and `status` prints every bundle's state and
//! counters from the local store.

use clap::{Parser, Subcommand};
use courier::{Config, Node, TransferOutcome};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Delay/disruption-tolerant reliable file transfer over UDP.
#[derive(Parser, Debug)]
#[command(name = "courier", version, about)]
struct Args {
    /// Path to configuration file (overrides the default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a file to a destination endpoint
    Send {
        /// Destination endpoint, host:port
        #[arg(long)]
        to: String,
        /// File to send
        file: PathBuf,
        /// Enable forward error correction
        #[arg(long)]
        fec: bool,
        /// Block until DELIVERED or TTL expiry
        #[arg(long)]
        wait: bool,
        /// Bundle time-to-live in seconds
        #[arg(long, value_name = "SEC")]
        ttl: Option<u64>,
        /// Chunk payload size in bytes
        #[arg(long, value_name = "BYTES")]
        chunk: Option<usize>,
        /// Sliding window size in chunks
        #[arg(long, value_name = "N")]
        window: Option<u32>,
        /// Local port to bind
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run as a receiver (or relay, with --forward)
    Recv {
        /// Local port to bind
        #[arg(long)]
        port: Option<u16>,
        /// Forward received bundles to this next hop, host:port
        #[arg(long, value_name = "HOST:PORT")]
        forward: Option<String>,
    },
    /// Print every bundle's state and counters
    Status {
        /// Port of the node whose store to inspect
        #[arg(long)]
        port: Option<u16>,
    },
}

fn load_config(args: &Args) -> Config {
    let result = match &args.config {
        Some(path) => Config::load_file(path).map(|config| (config, vec![path.clone()])),
        None => Config::load(),
    };
    match result {
        Ok((config, loaded)) => {
            for path in &loaded {
                info!(path = %path.display(), "Loaded config file");
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

fn resolve_endpoint(addr: &str) -> SocketAddr {
    match addr.to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(resolved) => resolved,
            None => {
                error!("Destination '{}' resolved to no addresses", addr);
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!("Invalid destination '{}': {}", addr, e);
            std::process::exit(1);
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    let exit_code = match &args.command {
        Command::Send {
            to,
            file,
            fec,
            wait,
            ttl,
            chunk,
            window,
            port,
        } => {
            let mut config = load_config(&args);
            if let Some(port) = port {
                config.node.port = *port;
            }
            if let Some(ttl) = ttl {
                config.transfer.ttl_sec = *ttl;
            }
            if let Some(chunk) = chunk {
                config.transfer.chunk_size = *chunk;
            }
            if let Some(window) = window {
                config.transfer.window_size = *window;
            }
            cmd_send(config, to, file, *fec, *wait).await
        }
        Command::Recv { port, forward } => {
            let mut config = load_config(&args);
            if let Some(port) = port {
                config.node.port = *port;
            }
            if let Some(forward) = forward {
                config.custody.next_hop = Some(forward.clone());
            }
            cmd_recv(config).await
        }
        Command::Status { port } => {
            let mut config = load_config(&args);
            if let Some(port) = port {
                config.node.port = *port;
            }
            cmd_status(config)
        }
    };
    std::process::exit(exit_code);
}

async fn cmd_send(config: Config, to: &str, file: &PathBuf, fec: bool, wait: bool) -> i32 {
    let dest = resolve_endpoint(to);

    let mut node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to create node: {}", e);
            return 1;
        }
    };
    if let Err(e) = node.start().await {
        error!("Failed to start node: {}", e);
        return 1;
    }

    let bundle_id = match node.submit_with_fec(file, dest, fec) {
        Ok(bundle_id) => bundle_id,
        Err(e) => {
            error!("Submission failed: {}", e);
            node.stop();
            return 1;
        }
    };
    println!("Bundle ID: {}", bundle_id);

    let outcome = tokio::select! {
        result = node.run_until_settled(bundle_id, wait) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            node.stop();
            return 1;
        }
    };

    let code = match outcome {
        Ok(TransferOutcome::Delivered) => {
            println!("Transfer delivered");
            0
        }
        Ok(TransferOutcome::CustodyTransferred) => {
            println!("Custody transferred downstream; delivery will complete independently");
            0
        }
        Ok(TransferOutcome::Expired) => {
            error!("Transfer expired before delivery");
            1
        }
        Err(e) => {
            error!("Transfer failed: {}", e);
            1
        }
    };

    if let Ok(Some(record)) = node.store().load_bundle(&bundle_id) {
        println!("Bytes sent: {}", record.bytes_sent);
        println!("Chunks retransmitted: {}", record.chunks_retransmitted);
    }

    node.stop();
    code
}

async fn cmd_recv(config: Config) -> i32 {
    let mut node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to create node: {}", e);
            return 1;
        }
    };
    if let Err(e) = node.start().await {
        error!("Failed to start node: {}", e);
        return 1;
    }

    println!(
        "Courier node {} listening on {}",
        node.node_id(),
        node.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                error!("Event loop error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    node.stop();
    0
}

fn cmd_status(config: Config) -> i32 {
    let store = match courier::Store::open(&config.db_path()) {
        Ok(store) => store,
        Err(e) => {
            error!(
                "Cannot open store at {} (is a node still running on it?): {}",
                config.db_path().display(),
                e
            );
            return 1;
        }
    };

    let bundles = match store.list_bundles() {
        Ok(bundles) => bundles,
        Err(e) => {
            error!("Failed to list bundles: {}", e);
            return 1;
        }
    };

    if bundles.is_empty() {
        println!("No bundles found");
        return 0;
    }

    println!("Found {} bundle(s):\n", bundles.len());
    for bundle in bundles {
        println!("Bundle ID: {}", bundle.bundle_id);
        println!("  Source: {}", bundle.src_node);
        println!("  Destination: {}", bundle.dst_node);
        if let Some(path) = &bundle.file_path {
            println!("  File: {}", path);
        }
        println!("  Size: {} bytes", bundle.length);
        println!("  State: {}", bundle.state);
        println!(
            "  Chunks: {} ({} data)",
            bundle.total_chunks, bundle.num_data_chunks
        );
        if bundle.fec_enabled {
            println!("  FEC: k={} r={}", bundle.k, bundle.r);
        }
        println!("  Bytes sent: {}", bundle.bytes_sent);
        println!("  Chunks retransmitted: {}", bundle.chunks_retransmitted);
        println!();
    }

    0
}

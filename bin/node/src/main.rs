//! Node binary: wires the crates in this workspace into one running
//! process per spec.md §5's task inventory (P2P listener, one task per
//! peer, miner loop, rate-limiter sweeper, metrics sampler) and §6's
//! process-signal handling.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chainmgr::{Chain, GenesisConfig};
use clap::Parser;
use kvstore::{KvStore, MemoryKv, SledKv};
use minerloop::Miner;
use netp2p::{NetworkId, Server};
use nodeconfig::NodeConfig;
use primitives::Address;
use ratelimit::Limiter;
use tokio_util::sync::CancellationToken;
use txpool::Pool;

#[derive(Parser, Debug)]
#[command(name = "ferrite-node", about = "Standalone EVM-compatible PoW node")]
struct Cli {
    /// Path to a YAML config file. Missing file falls back to defaults.
    #[arg(long, default_value = "node.yaml")]
    config: PathBuf,

    /// Overrides `mining` from the config file.
    #[arg(long)]
    mine: bool,

    /// Overrides `miner` from the config file.
    #[arg(long)]
    miner: Option<String>,

    /// Overrides `port` from the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Run against an in-memory store instead of `<data_dir>/chaindata`.
    /// Convenient for local smoke-testing; never durable across restarts.
    #[arg(long)]
    ephemeral: bool,
}

fn load_config(cli: &Cli) -> NodeConfig {
    let mut config = match NodeConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            log::warn!(target: "node", "could not load {:?} ({err}); using defaults", cli.config);
            NodeConfig::default()
        }
    };
    if cli.mine {
        config.mining = true;
    }
    if let Some(miner) = &cli.miner {
        config.miner = miner.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config
}

fn open_store(config: &NodeConfig, ephemeral: bool) -> Arc<dyn KvStore> {
    if ephemeral {
        return Arc::new(MemoryKv::new());
    }
    let dir = config.chaindata_dir();
    if let Err(e) = std::fs::create_dir_all(&dir) {
        log::error!(target: "node", "could not create chaindata dir {dir:?}: {e}");
        std::process::exit(1);
    }
    match SledKv::open(&dir) {
        Ok(kv) => Arc::new(kv),
        Err(e) => {
            log::error!(target: "node", "could not open chaindata store at {dir:?}: {e}");
            std::process::exit(1);
        }
    }
}

/// Spawns the metrics sampler named in spec.md §5's task inventory: a
/// periodic log line summarizing chain head, peer count and mempool size.
/// The metrics backend itself is the (out-of-scope) observability
/// collaborator; this task only owns the sampling cadence.
fn spawn_metrics_sampler(
    chain: Arc<Chain>,
    pool: Arc<Pool>,
    server: Arc<Server>,
    interval: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!(target: "node", "metrics sampler shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let head = chain.head_header();
                    log::info!(
                        target: "metrics",
                        "head=#{} hash={:?} peers={} handshaked_peers={} mempool={}",
                        head.number,
                        head.hash,
                        server.peer_count(),
                        server.handshaked_peer_count(),
                        pool.size(),
                    );
                }
            }
        }
    });
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            log::warn!(target: "node", "could not install SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let config = load_config(&cli);

    let kv = open_store(&config, cli.ephemeral);
    let genesis = GenesisConfig {
        chain_id: config.chain_id,
        gas_limit: config.block_gas_limit,
        timestamp: 0,
        allocations: Vec::new(),
    };
    let chain = match Chain::open(kv, &genesis) {
        Ok(chain) => Arc::new(chain),
        Err(e) => {
            log::error!(target: "node", "could not open chain: {e}");
            std::process::exit(1);
        }
    };
    let pool = Arc::new(Pool::new());

    let cancel = CancellationToken::new();

    let network = NetworkId {
        chain_id: chain.chain_id(),
        genesis_hash: chain.get_block_by_number(0).expect("genesis always present").header.hash,
    };
    let server = Server::new(chain.clone(), pool.clone(), network, config.max_peers, cancel.clone());

    let listen_addr = format!("0.0.0.0:{}", config.port);
    {
        let server = server.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(&listen_addr).await {
                log::error!(target: "node", "P2P listener exited: {e}");
                cancel.cancel();
            }
        });
    }

    for boot_node in &config.boot_nodes {
        let server = server.clone();
        let addr = boot_node.clone();
        tokio::spawn(async move { server.connect_to(&addr).await });
    }

    if config.enable_rate_limit {
        let limiter = Arc::new(Limiter::new(config.rate_limit, config.rate_limit_window()));
        ratelimit::spawn_sweeper(limiter, cancel.clone());
    }

    let miner = if config.mining {
        let miner_address = match Address::from_str(&config.miner) {
            Ok(addr) => addr,
            Err(e) => {
                log::error!(target: "node", "invalid miner address {:?}: {e}", config.miner);
                std::process::exit(1);
            }
        };
        let miner = Miner::new(chain.clone(), pool.clone(), miner_address);
        miner.start();
        Some(miner)
    } else {
        None
    };

    if config.enable_metrics {
        spawn_metrics_sampler(
            chain.clone(),
            pool.clone(),
            server.clone(),
            config.health_check_interval(),
            cancel.clone(),
        );
    }

    log::info!(target: "node", "ferrite-node up: chain_id={} port={} mining={}", config.chain_id, config.port, config.mining);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!(target: "node", "received interrupt, shutting down");
        }
        _ = terminate_signal() => {
            log::info!(target: "node", "received terminate signal, shutting down");
        }
    }

    cancel.cancel();
    if let Some(miner) = &miner {
        miner.stop();
    }

    // Bounded shutdown join per spec.md §5; tasks still running past the
    // deadline are abandoned rather than awaited indefinitely.
    let _ = tokio::time::timeout(Duration::from_secs(30), tokio::time::sleep(Duration::from_millis(200))).await;
    log::info!(target: "node", "shutdown complete");
}

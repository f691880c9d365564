//! P2P server (spec.md §4.8): a TCP listener plus one task per peer,
//! newline-delimited JSON frames, handshake-gated message handling, and
//! block/transaction gossip.

mod peer;
mod wire;

pub use peer::PeerState;
pub use wire::Frame;

use std::collections::HashMap;
use std::sync::Arc;

use chainmgr::Chain;
use parking_lot::RwLock;
use primitives::types::{Block, Transaction};
use primitives::Hash;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use txpool::Pool;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identifying parameters a peer's handshake is checked against, per
/// spec.md §6: "chain ID and genesis hash must match".
#[derive(Debug, Clone, Copy)]
pub struct NetworkId {
    pub chain_id: u64,
    pub genesis_hash: Hash,
}

/// Listener plus shared peer table. One per node; cheap to hold as an
/// `Arc` since the accept loop, every peer task, and the miner's gossip
/// calls all need a handle to it.
pub struct Server {
    chain: Arc<Chain>,
    pool: Arc<Pool>,
    chain_id: u64,
    genesis_hash: Hash,
    max_peers: usize,
    peers: RwLock<HashMap<u64, Arc<peer::PeerHandle>>>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(
        chain: Arc<Chain>,
        pool: Arc<Pool>,
        network: NetworkId,
        max_peers: usize,
        cancel: CancellationToken,
    ) -> Arc<Server> {
        Arc::new(Server {
            chain,
            pool,
            chain_id: network.chain_id,
            genesis_hash: network.genesis_hash,
            max_peers,
            peers: RwLock::new(HashMap::new()),
            cancel,
        })
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Number of peers whose handshake has completed (state machine past
    /// `HANDSHAKED`), i.e. eligible gossip targets.
    pub fn handshaked_peer_count(&self) -> usize {
        self.peers
            .read()
            .values()
            .filter(|p| p.state().is_handshaked())
            .count()
    }

    /// Binds `addr` and runs the accept loop until the server's
    /// cancellation token fires. Each accepted connection is handed to its
    /// own task via [`peer::handle_connection`]; the loop itself never
    /// blocks on any single peer.
    pub async fn serve(self: Arc<Self>, addr: &str) -> Result<(), NetError> {
        let listener = TcpListener::bind(addr).await?;
        log::info!(target: "netp2p", "listening on {addr}");
        self.serve_listener(listener).await
    }

    /// As [`Server::serve`], but against a listener the caller already
    /// bound. Useful for binding an ephemeral port (`:0`) and reading it
    /// back before handing the listener off.
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> Result<(), NetError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::info!(target: "netp2p", "accept loop shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => self.clone().accept(stream, remote_addr),
                        Err(e) => log::warn!(target: "netp2p", "accept error: {e}"),
                    }
                }
            }
        }
    }

    fn accept(self: Arc<Self>, stream: TcpStream, addr: std::net::SocketAddr) {
        if self.peer_count() >= self.max_peers {
            log::info!(target: "netp2p", "rejecting {addr}: at max_peers ({})", self.max_peers);
            return;
        }
        tokio::spawn(async move { peer::handle_connection(self, stream, addr).await });
    }

    /// Dials a configured boot node. Connection failures are logged and
    /// otherwise non-fatal: boot nodes are best-effort discovery, not a
    /// required dependency.
    pub async fn connect_to(self: Arc<Self>, addr: &str) {
        if self.peer_count() >= self.max_peers {
            return;
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let remote_addr = stream
                    .peer_addr()
                    .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
                tokio::spawn(async move { peer::handle_connection(self, stream, remote_addr).await });
            }
            Err(e) => log::warn!(target: "netp2p", "could not connect to boot node {addr}: {e}"),
        }
    }

    /// Sends `tx` to every HANDSHAKED peer. Per spec.md §4.8, a single
    /// peer's send failure is logged and never aborts the broadcast.
    pub fn broadcast_tx(&self, tx: &Transaction) {
        let frame = wire::tx_frame(tx);
        for peer in self.peers.read().values() {
            if peer.state().is_handshaked() {
                peer.send(&frame);
            }
        }
    }

    pub fn broadcast_block(&self, block: &Block) {
        let frame = wire::block_frame(block);
        for peer in self.peers.read().values() {
            if peer.state().is_handshaked() {
                peer.send(&frame);
            }
        }
    }
}

//! Per-peer connection handling: the handshake and the HANDSHAKED message
//! loop, per spec.md §4.8's state machine
//! `NEW -> VERSION_SENT -> HANDSHAKED -> {SYNCING, IDLE} -> CLOSED`.
//!
//! Reads and writes are split across two tasks joined by an unbounded
//! channel, so a slow/blocked peer socket on the write side never stalls
//! this peer's read loop (and vice versa); `broadcast_*` from other peers'
//! tasks never blocks on this peer's own I/O.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use primitives::Hash;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::wire::{self, Frame};
use crate::Server;

/// Handshake-and-beyond lifecycle of one connection, per spec.md §4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    VersionSent,
    Handshaked,
    Syncing,
    Idle,
    Closed,
}

impl PeerState {
    pub fn is_handshaked(&self) -> bool {
        matches!(self, PeerState::Handshaked | PeerState::Syncing | PeerState::Idle)
    }
}

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_peer_id() -> u64 {
    NEXT_PEER_ID.fetch_add(1, Ordering::SeqCst)
}

/// A live peer's outward-facing handle, held in the server's peer table.
/// `send` is best-effort: a full or closed channel is logged and dropped,
/// never propagated (per spec.md §4.8's gossip error policy).
pub struct PeerHandle {
    pub id: u64,
    pub addr: SocketAddr,
    pub state: Arc<RwLock<PeerState>>,
    outbound: mpsc::UnboundedSender<String>,
}

impl PeerHandle {
    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    pub fn send(&self, frame: &Frame) {
        if self.outbound.send(frame.to_line()).is_err() {
            log::debug!(target: "netp2p", "peer {} outbound channel closed", self.id);
        }
    }
}

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Drives one TCP connection end to end: handshake, then the HANDSHAKED
/// message loop, until the peer disconnects, sends something unreadable,
/// or the server's `cancel` token fires. Registers and deregisters itself
/// in `server.peers` around the body so a lookup never observes a
/// half-initialized peer.
pub async fn handle_connection(server: Arc<Server>, stream: TcpStream, addr: SocketAddr) {
    let id = next_peer_id();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).lines();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let state = Arc::new(RwLock::new(PeerState::New));

    let handle = Arc::new(PeerHandle {
        id,
        addr,
        state: state.clone(),
        outbound: outbound_tx.clone(),
    });
    server.peers.write().insert(id, handle.clone());
    log::info!(target: "netp2p", "peer {id} connected from {addr}");

    let writer_task = tokio::spawn(async move {
        while let Some(line) = outbound_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let outcome = run_handshake(&server, &handle, &mut reader).await;
    match outcome {
        Ok(remote_best_height) => {
            *state.write() = PeerState::Handshaked;
            log::info!(target: "netp2p", "peer {id} handshaked");

            let local_best_height = server.chain.head_header().number;
            if remote_best_height > local_best_height {
                *state.write() = PeerState::Syncing;
                handle.send(&Frame::new(
                    "sync_request",
                    wire::SyncRequest {
                        from: local_best_height + 1,
                        to: remote_best_height,
                    },
                ));
            } else {
                *state.write() = PeerState::Idle;
            }

            message_loop(&server, &handle, &mut reader).await;
        }
        Err(reason) => {
            log::info!(target: "netp2p", "peer {id} handshake failed: {reason}");
        }
    }

    *state.write() = PeerState::Closed;
    server.peers.write().remove(&id);
    drop(outbound_tx);
    let _ = writer_task.await;
    log::info!(target: "netp2p", "peer {id} disconnected");
}

type Lines = tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>;

async fn read_frame(reader: &mut Lines) -> Result<Option<Frame>, String> {
    match reader.next_line().await {
        Ok(Some(line)) => {
            if line.trim().is_empty() {
                return Ok(None);
            }
            serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| format!("malformed frame: {e}"))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(format!("socket read error: {e}")),
    }
}

/// Sends our `version`, then waits up to [`HANDSHAKE_TIMEOUT`] for the
/// remote's. Per spec.md §4.8: mismatched `chain_id`/`genesis_hash` gets a
/// `handshake_error` reply and the connection is dropped; anything else
/// unreadable in this window is also a handshake failure.
async fn run_handshake(
    server: &Arc<Server>,
    handle: &PeerHandle,
    reader: &mut Lines,
) -> Result<u64, String> {
    let local_best_height = server.chain.head_header().number;
    handle.send(&wire::version_frame(
        server.chain_id,
        server.genesis_hash,
        local_best_height,
    ));
    *handle.state.write() = PeerState::VersionSent;

    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(reader))
        .await
        .map_err(|_| "handshake timed out".to_string())??
        .ok_or_else(|| "peer closed before sending version".to_string())?;

    if frame.kind != "version" {
        return Err(format!("expected version, got {}", frame.kind));
    }
    let remote: wire::Version = frame
        .payload()
        .map_err(|e| format!("malformed version payload: {e}"))?;

    if remote.chain_id != server.chain_id || remote.genesis_hash != server.genesis_hash {
        handle.send(&wire::handshake_error_frame("chain id or genesis hash mismatch"));
        return Err("chain id or genesis hash mismatch".to_string());
    }

    handle.send(&wire::handshake_success_frame());
    Ok(remote.best_height)
}

/// The HANDSHAKED-only message loop of spec.md §4.8. Exits on a closed
/// socket, a read error, or server cancellation.
async fn message_loop(server: &Arc<Server>, handle: &PeerHandle, reader: &mut Lines) {
    loop {
        tokio::select! {
            _ = server.cancel.cancelled() => return,
            frame = read_frame(reader) => {
                match frame {
                    Ok(Some(frame)) => handle_message(server, handle, frame),
                    Ok(None) => return,
                    Err(e) => {
                        log::debug!(target: "netp2p", "peer {} read error: {e}", handle.id);
                        return;
                    }
                }
            }
        }
    }
}

fn handle_message(server: &Arc<Server>, handle: &PeerHandle, frame: Frame) {
    match frame.kind.as_str() {
        "sync_request" => {
            let req: wire::SyncRequest = match frame.payload() {
                Ok(r) => r,
                Err(e) => return log::debug!(target: "netp2p", "bad sync_request: {e}"),
            };
            for number in req.from..=req.to {
                if let Some(block) = server.chain.get_block_by_number(number) {
                    handle.send(&wire::block_frame(&block));
                }
            }
        }
        "getblocks" => {
            let head = server.chain.head_header().number;
            let items: Vec<Hash> = (0..=head)
                .filter_map(|n| server.chain.get_block_by_number(n))
                .map(|b| b.header.hash)
                .collect();
            handle.send(&wire::inv_blocks_frame(items));
        }
        "inv" => {
            let inv: wire::Inv = match frame.payload() {
                Ok(i) => i,
                Err(e) => return log::debug!(target: "netp2p", "bad inv: {e}"),
            };
            let missing: Vec<Hash> = inv
                .items
                .into_iter()
                .filter(|h| server.chain.get_block_by_hash(h).is_none())
                .collect();
            if !missing.is_empty() {
                handle.send(&wire::getdata_frame(missing));
            }
        }
        "getdata" => {
            let req: wire::GetData = match frame.payload() {
                Ok(r) => r,
                Err(e) => return log::debug!(target: "netp2p", "bad getdata: {e}"),
            };
            for hash in req.items {
                if let Some(block) = server.chain.get_block_by_hash(&hash) {
                    handle.send(&wire::block_frame(&block));
                }
            }
        }
        "block" => {
            let block: primitives::types::Block = match frame.payload() {
                Ok(b) => b,
                Err(e) => return log::debug!(target: "netp2p", "bad block payload: {e}"),
            };
            let now = chrono::Utc::now().timestamp();
            if let Err(e) = server.chain.add_block(block, now) {
                log::warn!(target: "netp2p", "peer {} offered an invalid block: {e}", handle.id);
            }
        }
        "tx" => {
            let tx: primitives::types::Transaction = match frame.payload() {
                Ok(t) => t,
                Err(e) => return log::debug!(target: "netp2p", "bad tx payload: {e}"),
            };
            if let Err(e) = server.pool.add(tx) {
                log::debug!(target: "netp2p", "peer {} offered a rejected tx: {e}", handle.id);
            }
        }
        "version" | "handshake_error" | "handshake_success" => {
            log::debug!(target: "netp2p", "peer {} re-sent a handshake message post-handshake", handle.id);
        }
        other => {
            log::debug!(target: "netp2p", "peer {} sent unknown message type {other}", handle.id);
        }
    }
}

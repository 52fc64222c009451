//! Peer management for the TCP transport
//!
//! Tracks authenticated copayer sessions and routes frames to them.

use crate::network::message::Frame;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify, RwLock};

/// Default maximum number of connected peers
pub const MAX_PEERS: usize = 15;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Max peers reached")]
    MaxPeersReached,
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),
    #[error("Already connected to {0}")]
    AlreadyConnected(String),
    #[error("Stale session nonce from {0}")]
    StaleNonce(String),
    #[error("Inbound connections from {0} are not allowed")]
    NotAllowed(String),
}

/// Information about a connected peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub copayer_id: String,
    pub addr: SocketAddr,
    /// Whether this is an outbound connection
    pub outbound: bool,
    pub nonce: u64,
}

/// Handle for sending frames to a peer
#[derive(Clone)]
pub struct PeerHandle {
    pub tx: mpsc::Sender<Frame>,
    /// Signalled to tear the connection down
    pub close: Arc<Notify>,
}

impl PeerHandle {
    pub async fn send(&self, frame: Frame) -> Result<(), PeerError> {
        self.tx.send(frame).await.map_err(|_| PeerError::Disconnected)
    }
}

/// Manages all authenticated sessions, keyed by copayer id
pub struct PeerManager {
    peers: RwLock<HashMap<String, PeerInfo>>,
    handles: RwLock<HashMap<String, PeerHandle>>,
    max_peers: usize,
}

impl PeerManager {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            max_peers,
        }
    }

    /// Add a new peer
    pub async fn add_peer(&self, info: PeerInfo, handle: PeerHandle) -> Result<(), PeerError> {
        let mut peers = self.peers.write().await;

        if peers.contains_key(&info.copayer_id) {
            return Err(PeerError::AlreadyConnected(info.copayer_id));
        }
        if peers.len() >= self.max_peers {
            return Err(PeerError::MaxPeersReached);
        }

        log::info!(
            "Added peer: {} at {} (outbound: {})",
            info.copayer_id,
            info.addr,
            info.outbound
        );
        let mut handles = self.handles.write().await;
        handles.insert(info.copayer_id.clone(), handle);
        peers.insert(info.copayer_id.clone(), info);
        Ok(())
    }

    /// Remove a peer
    pub async fn remove_peer(&self, copayer_id: &str) {
        let mut peers = self.peers.write().await;
        peers.remove(copayer_id);

        let mut handles = self.handles.write().await;
        handles.remove(copayer_id);

        log::info!("Removed peer: {}", copayer_id);
    }

    pub async fn is_connected(&self, copayer_id: &str) -> bool {
        self.peers.read().await.contains_key(copayer_id)
    }

    /// Get all connected copayer ids
    pub async fn get_peers(&self) -> Vec<String> {
        let peers = self.peers.read().await;
        peers.keys().cloned().collect()
    }

    pub async fn get_peer_info(&self, copayer_id: &str) -> Option<PeerInfo> {
        self.peers.read().await.get(copayer_id).cloned()
    }

    /// Get peer count
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Broadcast a frame to all peers
    pub async fn broadcast(&self, frame: Frame) {
        let handles = self.handles.read().await;
        for (copayer_id, handle) in handles.iter() {
            if let Err(e) = handle.send(frame.clone()).await {
                log::warn!("Failed to send to {}: {}", copayer_id, e);
            }
        }
    }

    /// Send a frame to a specific peer
    pub async fn send_to(&self, copayer_id: &str, frame: Frame) -> Result<(), PeerError> {
        let handles = self.handles.read().await;
        if let Some(handle) = handles.get(copayer_id) {
            handle.send(frame).await
        } else {
            Err(PeerError::Disconnected)
        }
    }

    /// Close every session
    pub async fn disconnect_all(&self) {
        let handles = self.handles.read().await;
        for handle in handles.values() {
            handle.close.notify_one();
        }
    }
}

//! Transport collaborator
//!
//! What the wallet needs from whatever moves messages between copayers.
//! Delivery is best effort: messages to peers that are not connected are
//! dropped, and the wallet makes up for it by re-sending state on connect.

use crate::crypto::{sha256, KeyPair};
use crate::network::message::WireMessage;
use crate::network::nonce::NetworkNonces;
use crate::network::peer::PeerError;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of the event channel handed to the wallet
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Transport not started")]
    NotStarted,
    #[error("Transport already started")]
    AlreadyStarted,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("Handshake signing failed: {0}")]
    Signing(String),
}

/// Who a message goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    All,
    Copayers(Vec<String>),
}

impl Recipients {
    pub fn one(copayer_id: impl Into<String>) -> Self {
        Recipients::Copayers(vec![copayer_id.into()])
    }
}

/// Options for starting the transport
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub copayer_id: String,
    /// Identity key proving `copayer_id` to peers
    pub identity: KeyPair,
    pub max_peers: usize,
}

/// Events delivered to the wallet
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A session with a copayer was established; `is_new` when we never had
    /// one with it before
    PeerConnected { copayer_id: String, is_new: bool },
    PeerDisconnected { peer_id: String },
    Data { sender: String, message: WireMessage },
    /// The transport shut down
    Closed,
    ServerError(String),
}

/// Short transport-level id of a copayer
pub fn peer_id_for(copayer_id: &str) -> String {
    hex::encode(&sha256(copayer_id.as_bytes())[..8])
}

#[async_trait]
pub trait Network: Send + Sync {
    /// Go online; events are delivered on the returned channel
    async fn start(&self, options: StartOptions)
        -> Result<mpsc::Receiver<NetworkEvent>, NetworkError>;

    async fn connect_to_peers(&self, copayer_ids: &[String]) -> Result<(), NetworkError>;

    async fn send(&self, recipients: Recipients, message: &WireMessage)
        -> Result<(), NetworkError>;

    /// Refuse inbound sessions from anyone not listed
    async fn restrict_inbound_to(&self, copayer_ids: &[String]);

    async fn disconnect(&self);

    async fn is_online(&self) -> bool;

    async fn online_peer_ids(&self) -> Vec<String>;

    fn peer_id_for_copayer(&self, copayer_id: &str) -> String {
        peer_id_for(copayer_id)
    }

    async fn nonces(&self) -> NetworkNonces;

    /// Restore persisted nonces; must be called before `start`
    async fn set_nonces(&self, nonces: NetworkNonces);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id() {
        let id = peer_id_for("02abcdef");
        assert_eq!(id.len(), 16);
        assert_eq!(id, peer_id_for("02abcdef"));
        assert_ne!(id, peer_id_for("03abcdef"));
    }
}

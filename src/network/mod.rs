//! Copayer networking
//!
//! Wire messages and the transports that carry them between copayers.
//!
//! # Features
//! - Tagged JSON wire messages
//! - Signed session handshakes with replay-resistant nonces
//! - TCP transport with inbound restriction
//! - In-process transport for tests and demos

pub mod memory;
pub mod message;
pub mod nonce;
pub mod peer;
pub mod server;
pub mod tcp;
pub mod transport;

pub use memory::{MemoryHub, MemoryNetwork};
pub use message::{Frame, Hello, Payload, WireMessage, MAGIC, MAX_FRAME_SIZE, PROTOCOL_VERSION};
pub use nonce::NetworkNonces;
pub use peer::{PeerError, PeerHandle, PeerInfo, PeerManager, MAX_PEERS};
pub use server::{connect_to_peer, FrameCodec, Server};
pub use tcp::{TcpConfig, TcpNetwork};
pub use transport::{
    peer_id_for, Network, NetworkError, NetworkEvent, Recipients, StartOptions,
    EVENT_CHANNEL_CAPACITY,
};

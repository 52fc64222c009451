//! Wire messages exchanged between copayers
//!
//! Every message is a JSON object tagged with `type` and the `walletId` it
//! belongs to; the remaining fields depend on the type.

use crate::crypto::{KeyPair, TrustedError, TrustedMessaging};
use crate::multisig::{AddressBookEntry, BranchIndexes, KeyRing, Proposal};
use crate::wallet::identity::WalletIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x43, 0x53, 0x47, 0x4E]; // "CSGN"

/// Maximum frame size (4 MB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Handshake sent first on every TCP connection
///
/// Signed with the copayer's identity key, so the id cannot be claimed by
/// anyone else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub version: u32,
    pub copayer_id: String,
    /// Session nonce of the sender
    pub nonce: u64,
    /// Port the sender accepts connections on, 0 if none
    pub listen_port: u16,
    pub signature: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HelloFields<'a> {
    version: u32,
    copayer_id: &'a str,
    nonce: u64,
    listen_port: u16,
}

impl Hello {
    /// Create a new signed handshake
    pub fn signed(identity: &KeyPair, nonce: u64, listen_port: u16) -> Result<Self, TrustedError> {
        let messaging = TrustedMessaging::new(identity.clone());
        let copayer_id = messaging.identity_id();
        let signature = messaging.sign(&HelloFields {
            version: PROTOCOL_VERSION,
            copayer_id: &copayer_id,
            nonce,
            listen_port,
        })?;

        Ok(Self {
            version: PROTOCOL_VERSION,
            copayer_id,
            nonce,
            listen_port,
            signature,
        })
    }

    pub fn verify(&self) -> bool {
        let fields = HelloFields {
            version: self.version,
            copayer_id: &self.copayer_id,
            nonce: self.nonce,
            listen_port: self.listen_port,
        };
        TrustedMessaging::verify(&self.copayer_id, &fields, &self.signature)
    }
}

/// Unit of the TCP transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "lowercase")]
pub enum Frame {
    Hello(Hello),
    Data(WireMessage),
}

impl Frame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Message payload by type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    /// Join handshake, carries the wallet options
    #[serde(rename = "walletId")]
    WalletId {
        opts: WalletIdentity,
        #[serde(rename = "networkName")]
        network_name: String,
    },

    /// Request for the full wallet state
    #[serde(rename = "walletReady")]
    WalletReady,

    #[serde(rename = "publicKeyRing")]
    PublicKeyRing {
        #[serde(rename = "publicKeyRing")]
        public_key_ring: KeyRing,
    },

    #[serde(rename = "indexes")]
    Indexes {
        indexes: BTreeMap<String, BranchIndexes>,
    },

    #[serde(rename = "txProposal")]
    TxProposal {
        #[serde(rename = "txProposal")]
        tx_proposal: Box<Proposal>,
    },

    #[serde(rename = "reject")]
    Reject { ntxid: String },

    #[serde(rename = "seen")]
    Seen { ntxid: String },

    #[serde(rename = "addressbook")]
    AddressBook {
        #[serde(rename = "addressBook")]
        address_book: BTreeMap<String, AddressBookEntry>,
    },
}

impl Payload {
    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::WalletId { .. } => "walletId",
            Payload::WalletReady => "walletReady",
            Payload::PublicKeyRing { .. } => "publicKeyRing",
            Payload::Indexes { .. } => "indexes",
            Payload::TxProposal { .. } => "txProposal",
            Payload::Reject { .. } => "reject",
            Payload::Seen { .. } => "seen",
            Payload::AddressBook { .. } => "addressbook",
        }
    }
}

/// A message addressed to one wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "walletId")]
    pub wallet_id: String,
    #[serde(flatten)]
    pub payload: Payload,
}

impl WireMessage {
    pub fn new(wallet_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            payload,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }

    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

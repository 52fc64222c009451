//! Session nonces
//!
//! One 8-byte counter for ourselves and one per copayer. Every handshake
//! takes a fresh own nonce, and a peer's nonce must be strictly greater
//! than the last one seen from that copayer; anything else is a replay.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkNonces {
    own: u64,
    peers: BTreeMap<String, u64>,
}

fn to_hex(nonce: u64) -> String {
    hex::encode(nonce.to_be_bytes())
}

fn from_hex(encoded: &str) -> Option<u64> {
    let bytes = hex::decode(encoded).ok()?;
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

impl NetworkNonces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from the persisted hex form; malformed entries are skipped
    pub fn from_hex(own: Option<&str>, peers: &BTreeMap<String, String>) -> Self {
        Self {
            own: own.and_then(from_hex).unwrap_or(0),
            peers: peers
                .iter()
                .filter_map(|(id, nonce)| from_hex(nonce).map(|n| (id.clone(), n)))
                .collect(),
        }
    }

    pub fn own_hex(&self) -> String {
        to_hex(self.own)
    }

    pub fn peers_hex(&self) -> BTreeMap<String, String> {
        self.peers
            .iter()
            .map(|(id, nonce)| (id.clone(), to_hex(*nonce)))
            .collect()
    }

    pub fn own(&self) -> u64 {
        self.own
    }

    /// Nonce for a new handshake
    pub fn bump_own(&mut self) -> u64 {
        self.own = self.own.saturating_add(1);
        self.own
    }

    pub fn peer(&self, copayer_id: &str) -> Option<u64> {
        self.peers.get(copayer_id).copied()
    }

    /// Whether we ever had a session with this copayer
    pub fn is_seeded(&self, copayer_id: &str) -> bool {
        self.peers.contains_key(copayer_id)
    }

    /// Record a peer nonce; `false` unless it is newer than the last one
    pub fn observe(&mut self, copayer_id: &str, nonce: u64) -> bool {
        match self.peers.get(copayer_id) {
            Some(last) if nonce <= *last => false,
            _ => {
                self.peers.insert(copayer_id.to_string(), nonce);
                true
            }
        }
    }
}

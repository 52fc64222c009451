//! Wallet events
//!
//! Published on a broadcast channel owned by the wallet. Slow subscribers
//! lag and lose events; the wallet never waits for them.

use crate::wallet::error::ProtocolViolation;
use bitflags::bitflags;

/// Capacity of the event channel
pub const EVENT_CAPACITY: usize = 256;

/// What happened to a proposal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProposalEventKind {
    New,
    Signed,
    Rejected,
    Seen,
    Sent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletEvent {
    /// The transport is up
    Ready { copayer_id: String },
    PublicKeyRingUpdated,
    TxProposalsUpdated,
    TxProposalEvent {
        kind: ProposalEventKind,
        ntxid: String,
        copayer_id: String,
    },
    AddressBookUpdated,
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },
    /// Message for another wallet
    BadMessage {
        sender: String,
        violation: ProtocolViolation,
    },
    /// A peer's key ring conflicts with ours
    ConnectionError {
        sender: String,
        violation: ProtocolViolation,
    },
    CorruptProposal {
        sender: String,
        violation: ProtocolViolation,
    },
    ProtocolViolation {
        sender: String,
        violation: ProtocolViolation,
    },
    ServerError(String),
    Closed,
}

bitflags! {
    /// Entity families touched while handling one event
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Dirty: u8 {
        const KEY_RING = 0b0001;
        const PROPOSALS = 0b0010;
        const ADDRESS_BOOK = 0b0100;
    }
}

impl Dirty {
    /// Notifications owed for the touched families, one each
    pub fn notifications(self) -> Vec<WalletEvent> {
        let mut events = Vec::new();
        if self.contains(Dirty::KEY_RING) {
            events.push(WalletEvent::PublicKeyRingUpdated);
        }
        if self.contains(Dirty::PROPOSALS) {
            events.push(WalletEvent::TxProposalsUpdated);
        }
        if self.contains(Dirty::ADDRESS_BOOK) {
            events.push(WalletEvent::AddressBookUpdated);
        }
        events
    }
}

//! Wallet errors

use crate::blockchain::ChainError;
use crate::crypto::{HdError, TrustedError};
use crate::multisig::{
    AddressBookError, AddressError, BuildError, KeyRingError, ProposalError, TxError,
};
use crate::network::NetworkError;
use crate::storage::StorageError;
use crate::wallet::identity::ConfigurationError;
use thiserror::Error;

/// A peer broke the protocol
///
/// Never returned from inbound handlers; reported as a `WalletEvent` and
/// the offending message is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("Message for wallet {found}, expected {expected}")]
    WalletIdMismatch { expected: String, found: String },
    #[error("Key ring conflict: {0}")]
    KeyRingConflict(String),
    #[error("Corrupt proposal: {0}")]
    CorruptProposal(String),
    #[error("Copayer {copayer} rejected proposal {ntxid} after signing it")]
    RejectAfterSign { ntxid: String, copayer: String },
    #[error("Unknown proposal {0}")]
    UnknownProposal(String),
    #[error("Sender {0} is not a copayer of this wallet")]
    NotACopayer(String),
    #[error("Proposal {0} was already sent")]
    AlreadySent(String),
    #[error("Index out of range: {0}")]
    IndexOutOfRange(String),
}

/// Wallet errors
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Key ring error: {0}")]
    KeyRing(#[from] KeyRingError),
    #[error("Proposal error: {0}")]
    Proposal(#[from] ProposalError),
    #[error("Address book error: {0}")]
    AddressBook(#[from] AddressBookError),
    #[error("Address error: {0}")]
    Address(#[from] AddressError),
    #[error("Transaction error: {0}")]
    Tx(#[from] TxError),
    #[error("Build error: {0}")]
    Build(#[from] BuildError),
    #[error("Key derivation error: {0}")]
    Key(#[from] HdError),
    #[error("Signing error: {0}")]
    Signing(#[from] TrustedError),
    #[error("Blockchain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("Proposal {0} is not complete")]
    Incomplete(String),
    #[error("Comment is {len} characters, at most {max} allowed")]
    CommentTooLong { len: usize, max: usize },
    #[error("Could not sign the new transaction")]
    SigningFailed,
    #[error("Wallet has stopped")]
    Stopped,
}

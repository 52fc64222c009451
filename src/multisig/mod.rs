//! Shared multisig wallet state
//!
//! The entities every copayer replicates: the public key ring, transaction
//! proposals and the address book, plus the script and transaction
//! machinery they are built on.
//!
//! # Example
//!
//! ```ignore
//! use cosigner::multisig::{CopayerSigner, KeyRing, NetworkKind};
//!
//! // Three copayers each contribute an extended public key
//! let mut ring = KeyRing::new(NetworkKind::Testnet, 2, 3)?;
//! for signer in &signers {
//!     ring.add_copayer(signer.xpub()?, None)?;
//! }
//!
//! // Every copayer derives the same 2-of-3 P2SH address
//! let (path, address) = ring.generate_address(&signers[0].copayer_id()?, false)?;
//! ```

pub mod address;
pub mod address_book;
pub mod builder;
pub mod keyring;
pub mod proposal;
pub mod script;
pub mod signer;
pub mod transaction;

pub use address::{Address, AddressError, AddressKind, NetworkKind};
pub use address_book::{AddressBook, AddressBookEntry, AddressBookError};
pub use builder::{select_coins, BuildError, CoinSelection, Spendable, TxBuilder};
pub use keyring::{BranchIndexes, CopayerKey, HdPath, KeyRing, KeyRingError, MAX_BRANCH_INDEX};
pub use proposal::{MergeOutcome, Proposal, ProposalError, ProposalSet, ProposalStatus};
pub use script::{RedeemScript, ScriptError, MAX_MULTISIG_KEYS};
pub use signer::{copayer_id_for, CopayerSigner};
pub use transaction::{
    OutPoint, PartialTx, TxError, TxInput, TxOutput, DEFAULT_FEE_PER_KB, DUST_THRESHOLD,
    MAX_MONEY, SIGHASH_ALL,
};

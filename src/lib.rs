//! Cosigner: shared M-of-N multisignature wallets in Rust
//!
//! Every copayer runs their own replica of the wallet. Replicas find each
//! other over an authenticated peer transport and converge on the same:
//! - Public key ring (one BIP32 extended public key per copayer)
//! - Set of transaction proposals with their signatures and rejections
//! - Address book of labelled destinations
//!
//! Funds live at 2-of-3 style P2SH addresses derived from the key ring, and
//! an Insight-compatible blockchain service provides unspent outputs,
//! address activity and broadcast.
//!
//! # Example
//!
//! ```ignore
//! use cosigner::wallet::{Collaborators, EngineConfig, Wallet, WalletOptions};
//!
//! let wallet = Wallet::load("8a3f01c2", EngineConfig::default(), collaborators).await?;
//! let (handle, _task) = wallet.spawn().await?;
//!
//! let ntxid = handle.create_tx(address, 25_000, Some("rent".into())).await?;
//! println!("Proposal {} waiting for signatures", ntxid);
//! ```

pub mod blockchain;
pub mod cli;
pub mod crypto;
pub mod multisig;
pub mod network;
pub mod storage;
pub mod wallet;

// Re-export commonly used types
pub use blockchain::{Blockchain, ChainError, InsightClient, MemoryChain, UnspentOutput};
pub use crypto::KeyPair;
pub use multisig::{
    AddressBook, CopayerSigner, KeyRing, NetworkKind, PartialTx, Proposal, ProposalSet,
    ProposalStatus,
};
pub use network::{MemoryHub, MemoryNetwork, Network, TcpConfig, TcpNetwork};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageConfig, WalletSnapshot};
pub use wallet::{
    Collaborators, EngineConfig, Wallet, WalletError, WalletEvent, WalletHandle, WalletOptions,
};

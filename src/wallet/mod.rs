//! Wallet engine
//!
//! One copayer's view of a shared M-of-N wallet and the protocol that keeps
//! it in sync with the other copayers.
//!
//! # Example
//!
//! ```ignore
//! use cosigner::wallet::{Collaborators, EngineConfig, Wallet, WalletOptions};
//!
//! let wallet = Wallet::create(
//!     WalletOptions::new()
//!         .network(NetworkKind::Testnet)
//!         .copayers(2, 3)
//!         .spend_unconfirmed(false)
//!         .version("1.0.0")
//!         .reconnect_delay(Duration::from_secs(5))
//!         .signer(CopayerSigner::generate()),
//!     EngineConfig::default(),
//!     collaborators,
//! )
//! .await?;
//!
//! // Hand the secret to the other copayers, then run the wallet
//! println!("{}", wallet.secret());
//! let (handle, _task) = wallet.spawn().await?;
//! ```

pub mod balance;
pub mod connection;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod identity;
pub mod lifecycle;
pub mod runtime;
pub mod wallet;

pub use balance::Balance;
pub use connection::{ConnectionManager, CopayerInfo};
pub use error::{ProtocolViolation, WalletError};
pub use events::{Dirty, ProposalEventKind, WalletEvent, EVENT_CAPACITY};
pub use identity::{
    random_wallet_id, ConfigurationError, EngineConfig, WalletIdentity, WalletOptions,
    WalletSetup, DEFAULT_RECONNECT_DELAY_MS,
};
pub use lifecycle::{AddressInfo, ProposalView};
pub use runtime::{WalletCommand, WalletHandle, WalletInfo, COMMAND_CHANNEL_CAPACITY};
pub use wallet::{Collaborators, Wallet};

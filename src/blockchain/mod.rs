//! Blockchain service collaborator
//!
//! The wallet never validates the chain itself. It asks a blockchain
//! service for unspent outputs and address activity, and hands it finished
//! transactions to broadcast.

pub mod insight;
pub mod memory;

pub use insight::InsightClient;
pub use memory::MemoryChain;

use crate::multisig::{OutPoint, PartialTx, TxError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Satoshis per coin
pub const SATOSHIS_PER_COIN: f64 = 100_000_000.0;

/// Blockchain service errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Service returned status {0}")]
    Status(u16),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Blockchain service unavailable: {0}")]
    Unavailable(String),
    #[error("Transaction error: {0}")]
    Tx(#[from] TxError),
}

/// Unspent output as reported by the service, amounts in coins
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnspentOutput {
    pub address: String,
    pub txid: String,
    pub vout: u32,
    pub amount: f64,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_pub_key: Option<String>,
}

impl UnspentOutput {
    /// Amount in satoshis, rounded per output
    pub fn amount_sat(&self) -> u64 {
        (self.amount * SATOSHIS_PER_COIN).round() as u64
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid.clone(), self.vout)
    }
}

/// Blockchain queries and broadcast
#[async_trait]
pub trait Blockchain: Send + Sync {
    /// Unspent outputs of the given addresses
    async fn get_unspent(&self, addresses: &[String]) -> Result<Vec<UnspentOutput>, ChainError>;

    /// Txid of `tx` if the network already accepted it
    async fn check_accepted(&self, tx: &PartialTx) -> Result<Option<String>, ChainError>;

    /// Broadcast a raw transaction, returning its txid if accepted
    async fn broadcast(&self, raw_tx: &str) -> Result<Option<String>, ChainError>;

    /// Whether each address ever appeared in a transaction
    async fn check_activity(&self, addresses: &[String]) -> Result<Vec<bool>, ChainError>;
}

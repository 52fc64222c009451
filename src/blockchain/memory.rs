//! In-process blockchain service
//!
//! Used by the demo command and throughout the tests. Clones share state,
//! so several wallets can talk to the same chain.

use crate::blockchain::{Blockchain, ChainError, UnspentOutput};
use crate::crypto::double_sha256;
use crate::multisig::PartialTx;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct ChainState {
    unspent: Vec<UnspentOutput>,
    active: BTreeSet<String>,
    accepted: BTreeSet<String>,
    broadcasts: Vec<String>,
    offline: bool,
    reject_broadcasts: bool,
    activity_queries: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryChain {
    state: Arc<RwLock<ChainState>>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fund an address; the address also becomes active
    pub async fn add_unspent(&self, output: UnspentOutput) {
        let mut state = self.state.write().await;
        state.active.insert(output.address.clone());
        state.unspent.push(output);
    }

    pub async fn mark_active(&self, address: &str) {
        self.state.write().await.active.insert(address.to_string());
    }

    /// Record a transaction as accepted without going through broadcast
    pub async fn accept(&self, txid: &str) {
        self.state.write().await.accepted.insert(txid.to_string());
    }

    /// Make every query fail
    pub async fn set_offline(&self, offline: bool) {
        self.state.write().await.offline = offline;
    }

    /// Make broadcasts return no txid
    pub async fn set_reject_broadcasts(&self, reject: bool) {
        self.state.write().await.reject_broadcasts = reject;
    }

    /// Number of `check_activity` calls so far
    pub async fn activity_query_count(&self) -> usize {
        self.state.read().await.activity_queries
    }

    pub async fn broadcasts(&self) -> Vec<String> {
        self.state.read().await.broadcasts.clone()
    }

    fn check_online(state: &ChainState) -> Result<(), ChainError> {
        if state.offline {
            return Err(ChainError::Unavailable("memory chain is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Blockchain for MemoryChain {
    async fn get_unspent(&self, addresses: &[String]) -> Result<Vec<UnspentOutput>, ChainError> {
        let state = self.state.read().await;
        Self::check_online(&state)?;
        Ok(state
            .unspent
            .iter()
            .filter(|u| addresses.contains(&u.address))
            .cloned()
            .collect())
    }

    async fn check_accepted(&self, tx: &PartialTx) -> Result<Option<String>, ChainError> {
        let state = self.state.read().await;
        Self::check_online(&state)?;
        let txid = tx.txid()?;
        Ok(state.accepted.contains(&txid).then_some(txid))
    }

    async fn broadcast(&self, raw_tx: &str) -> Result<Option<String>, ChainError> {
        let mut state = self.state.write().await;
        Self::check_online(&state)?;
        if state.reject_broadcasts {
            return Ok(None);
        }

        let raw = hex::decode(raw_tx).map_err(|e| ChainError::InvalidResponse(e.to_string()))?;
        let mut hash = double_sha256(&raw);
        hash.reverse();
        let txid = hex::encode(hash);

        state.broadcasts.push(raw_tx.to_string());
        state.accepted.insert(txid.clone());
        Ok(Some(txid))
    }

    async fn check_activity(&self, addresses: &[String]) -> Result<Vec<bool>, ChainError> {
        let mut state = self.state.write().await;
        Self::check_online(&state)?;
        state.activity_queries += 1;
        Ok(addresses.iter().map(|a| state.active.contains(a)).collect())
    }
}

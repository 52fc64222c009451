//! Wallet identity and engine configuration
//!
//! `WalletIdentity` is the part of the wallet options every copayer shares;
//! `EngineConfig` holds local tunables that never leave this node.

use crate::multisig::{CopayerSigner, NetworkKind, MAX_MULTISIG_KEYS};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default base delay between reconnection rounds
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;

/// Configuration errors, fatal at the call that hits them
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Missing required option: {0}")]
    MissingOption(&'static str),
    #[error("Invalid copayer parameters: {0}-of-{1}")]
    InvalidParameters(u8, u8),
    #[error("Network mismatch: expected {expected}, got {found}")]
    NetworkMismatch {
        expected: NetworkKind,
        found: NetworkKind,
    },
    #[error("Invalid wallet secret: {0}")]
    InvalidSecret(String),
    #[error("Invalid signer: {0}")]
    InvalidSigner(String),
}

fn default_reconnect_delay() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

/// Options shared by all copayers of a wallet
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub required_copayers: u8,
    pub total_copayers: u8,
    pub spend_unconfirmed: bool,
    pub version: String,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

impl WalletIdentity {
    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn is_shared(&self) -> bool {
        self.total_copayers > 1
    }
}

/// Random 8-byte wallet id, hex encoded
pub fn random_wallet_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Local engine tunables
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Refuse wallets on any other network
    pub force_network: Option<NetworkKind>,
    /// Addresses scanned per discovery window
    pub scan_window: u32,
    /// Branches scanned at the same time during discovery
    pub discovery_concurrency: usize,
    /// Confirmations an output needs unless unconfirmed spending is on
    pub min_confirmations: u32,
    /// Fee rate in satoshis per kB
    pub fee_per_kb: u64,
    /// Delay between going online and the first full announcement
    pub grace: Duration,
    pub max_comment_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            force_network: None,
            scan_window: 20,
            discovery_concurrency: 4,
            min_confirmations: 1,
            fee_per_kb: crate::multisig::DEFAULT_FEE_PER_KB,
            grace: Duration::from_millis(10),
            max_comment_len: 100,
        }
    }
}

/// Everything a fresh wallet is built from
#[derive(Debug)]
pub struct WalletSetup {
    pub identity: WalletIdentity,
    pub network: NetworkKind,
    pub signer: CopayerSigner,
    pub nickname: Option<String>,
}

/// Builder for the construction options of a new wallet
///
/// Required options have no defaults; `build` fails on the first one that
/// is missing.
#[derive(Debug, Default)]
pub struct WalletOptions {
    id: Option<String>,
    name: Option<String>,
    nickname: Option<String>,
    network: Option<NetworkKind>,
    required: Option<u8>,
    total: Option<u8>,
    spend_unconfirmed: Option<bool>,
    version: Option<String>,
    reconnect_delay: Option<Duration>,
    signer: Option<CopayerSigner>,
}

impl WalletOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Nickname of the local copayer
    pub fn nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn network(mut self, network: NetworkKind) -> Self {
        self.network = Some(network);
        self
    }

    pub fn copayers(mut self, required: u8, total: u8) -> Self {
        self.required = Some(required);
        self.total = Some(total);
        self
    }

    pub fn spend_unconfirmed(mut self, spend_unconfirmed: bool) -> Self {
        self.spend_unconfirmed = Some(spend_unconfirmed);
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    pub fn signer(mut self, signer: CopayerSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Validate the options
    pub fn build(self, config: &EngineConfig) -> Result<WalletSetup, ConfigurationError> {
        let network = self
            .network
            .ok_or(ConfigurationError::MissingOption("network"))?;
        let required = self
            .required
            .ok_or(ConfigurationError::MissingOption("required"))?;
        let total = self
            .total
            .ok_or(ConfigurationError::MissingOption("total"))?;
        let spend_unconfirmed = self
            .spend_unconfirmed
            .ok_or(ConfigurationError::MissingOption("spend_unconfirmed"))?;
        let version = self
            .version
            .ok_or(ConfigurationError::MissingOption("version"))?;
        let reconnect_delay = self
            .reconnect_delay
            .ok_or(ConfigurationError::MissingOption("reconnect_delay"))?;
        let signer = self
            .signer
            .ok_or(ConfigurationError::MissingOption("signer"))?;

        if required == 0 || required > total || total as usize > MAX_MULTISIG_KEYS {
            return Err(ConfigurationError::InvalidParameters(required, total));
        }
        if let Some(expected) = config.force_network {
            if expected != network {
                return Err(ConfigurationError::NetworkMismatch {
                    expected,
                    found: network,
                });
            }
        }

        Ok(WalletSetup {
            identity: WalletIdentity {
                id: self.id.unwrap_or_else(random_wallet_id),
                name: self.name,
                required_copayers: required,
                total_copayers: total,
                spend_unconfirmed,
                version,
                reconnect_delay_ms: reconnect_delay.as_millis() as u64,
            },
            network,
            signer,
            nickname: self.nickname,
        })
    }
}

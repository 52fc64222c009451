//! Connection management
//!
//! Keeps the copayer mesh together: announces the wallet once the
//! transport is up, reconnects to every known copayer with a doubling
//! delay, and greets copayers it has never had a session with.

use crate::network::{NetworkEvent, Recipients, StartOptions};
use crate::wallet::error::WalletError;
use crate::wallet::events::WalletEvent;
use crate::wallet::wallet::Wallet;
use std::time::Duration;
use tokio::sync::mpsc;

/// Reconnection backoff and the pending invitation
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    base_delay: Duration,
    current_delay: Option<Duration>,
    seeded: Option<String>,
}

impl ConnectionManager {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            current_delay: None,
            seeded: None,
        }
    }

    /// Delay before the next round: the base first, then doubling
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current_delay {
            Some(delay) => delay.saturating_mul(2),
            None => self.base_delay,
        };
        self.current_delay = Some(delay);
        delay
    }

    pub fn current_delay(&self) -> Option<Duration> {
        self.current_delay
    }

    /// Start the backoff over
    pub fn reset(&mut self) {
        self.current_delay = None;
    }

    /// Remember the copayer that invited us
    pub fn seed(&mut self, copayer_id: impl Into<String>) {
        self.seeded = Some(copayer_id.into());
    }

    pub fn seeded(&self) -> Option<&str> {
        self.seeded.as_deref()
    }

    pub fn take_seed(&mut self) -> Option<String> {
        self.seeded.take()
    }
}

impl Wallet {
    /// Bring the transport up and announce readiness
    pub async fn start_network(&mut self) -> Result<mpsc::Receiver<NetworkEvent>, WalletError> {
        let options = StartOptions {
            copayer_id: self.copayer_id.clone(),
            identity: self.identity_key.clone(),
            max_peers: self.identity.total_copayers as usize,
        };
        if self.keyring.is_complete() {
            self.lock_incoming().await;
        }

        let events = self.network.start(options).await?;
        // The session nonce moved on
        self.persist().await?;

        log::info!("Wallet {} online as {}", self.identity.id, self.copayer_id);
        self.emit(WalletEvent::Ready {
            copayer_id: self.copayer_id.clone(),
        });
        Ok(events)
    }

    /// Grace period is over: re-announce full state
    pub(crate) fn after_grace(&self) {
        self.emit(WalletEvent::PublicKeyRingUpdated);
        self.emit(WalletEvent::TxProposalsUpdated);
    }

    pub(crate) async fn lock_incoming(&self) {
        self.network
            .restrict_inbound_to(&self.keyring.copayer_ids())
            .await;
    }

    /// Dial every known copayer, then ask the inviter for the wallet state
    pub async fn connect_to_all(&mut self) -> Result<(), WalletError> {
        let mut ids = self.keyring.copayer_ids();
        if let Some(seeded) = self.connection.seeded() {
            if !ids.iter().any(|id| id == seeded) {
                ids.push(seeded.to_string());
            }
        }
        self.network.connect_to_peers(&ids).await?;

        if let Some(seeded) = self.connection.take_seed() {
            self.send_wallet_ready(Recipients::one(seeded)).await?;
        }
        Ok(())
    }

    /// One reconnection round; `None` once the transport is offline
    pub(crate) async fn reconnect_round(&mut self) -> Option<Duration> {
        if !self.network.is_online().await {
            return None;
        }
        if let Err(e) = self.connect_to_all().await {
            log::warn!("Reconnection round failed: {}", e);
        }
        Some(self.connection.next_delay())
    }

    pub fn seed_copayer(&mut self, copayer_id: impl Into<String>) {
        self.connection.seed(copayer_id);
    }

    /// Tear down the transport
    pub async fn disconnect(&mut self) {
        log::info!("Disconnecting wallet {}", self.identity.id);
        self.network.disconnect().await;
        self.connection.reset();
    }

    /// React to one transport event
    pub async fn handle_network_event(&mut self, event: NetworkEvent) -> Result<(), WalletError> {
        match event {
            NetworkEvent::PeerConnected { copayer_id, is_new } => {
                // Every session took a fresh nonce; a restart must not reuse it
                self.persist().await?;
                if is_new {
                    log::info!("New copayer session with {}", copayer_id);
                    self.send_wallet_id(Recipients::one(copayer_id.clone()))
                        .await?;
                }
                self.emit(WalletEvent::PeerConnected {
                    peer_id: self.network.peer_id_for_copayer(&copayer_id),
                });
            }
            NetworkEvent::PeerDisconnected { peer_id } => {
                self.connection.reset();
                self.emit(WalletEvent::PeerDisconnected { peer_id });
            }
            NetworkEvent::Data { sender, message } => {
                self.handle_message(&sender, message).await?;
            }
            NetworkEvent::Closed => self.emit(WalletEvent::Closed),
            NetworkEvent::ServerError(message) => self.emit(WalletEvent::ServerError(message)),
        }
        Ok(())
    }

    /// Transport ids of all copayers in the ring
    pub fn registered_peer_ids(&self) -> Vec<CopayerInfo> {
        self.keyring
            .copayer_ids()
            .into_iter()
            .enumerate()
            .map(|(index, copayer_id)| CopayerInfo {
                peer_id: self.network.peer_id_for_copayer(&copayer_id),
                nickname: self.keyring.nickname(&copayer_id).map(str::to_string),
                index,
                copayer_id,
            })
            .collect()
    }

    pub async fn online_peer_ids(&self) -> Vec<String> {
        self.network.online_peer_ids().await
    }
}

/// A copayer of the ring as shown to users
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopayerInfo {
    pub copayer_id: String,
    pub peer_id: String,
    pub nickname: Option<String>,
    pub index: usize,
}

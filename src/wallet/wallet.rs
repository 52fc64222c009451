//! Wallet state
//!
//! One copayer's replica of the shared wallet: the key ring, proposals and
//! address book, plus the collaborators it talks to. Every change goes
//! through `commit`, which persists before anyone is told about it.

use crate::blockchain::Blockchain;
use crate::crypto::{KeyPair, TrustedMessaging};
use crate::multisig::{AddressBook, CopayerSigner, KeyRing, NetworkKind, ProposalSet};
use crate::network::{Network, NetworkNonces, Payload, Recipients, WireMessage};
use crate::storage::{Storage, WalletSnapshot};
use crate::wallet::connection::ConnectionManager;
use crate::wallet::error::WalletError;
use crate::wallet::events::{Dirty, WalletEvent, EVENT_CAPACITY};
use crate::wallet::identity::{ConfigurationError, EngineConfig, WalletIdentity, WalletOptions};
use std::sync::Arc;
use tokio::sync::broadcast;

/// External services a wallet needs
#[derive(Clone)]
pub struct Collaborators {
    pub network: Arc<dyn Network>,
    pub blockchain: Arc<dyn Blockchain>,
    pub storage: Arc<dyn Storage>,
}

pub struct Wallet {
    pub(crate) identity: WalletIdentity,
    pub(crate) config: EngineConfig,
    pub(crate) copayer_id: String,
    pub(crate) identity_key: KeyPair,
    pub(crate) signer: CopayerSigner,
    pub(crate) messaging: TrustedMessaging,
    pub(crate) keyring: KeyRing,
    pub(crate) proposals: ProposalSet,
    pub(crate) address_book: AddressBook,
    pub(crate) network: Arc<dyn Network>,
    pub(crate) blockchain: Arc<dyn Blockchain>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) events: broadcast::Sender<WalletEvent>,
    pub(crate) connection: ConnectionManager,
}

impl Wallet {
    /// Create a brand new wallet holding only our own key
    pub async fn create(
        options: WalletOptions,
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> Result<Self, WalletError> {
        let setup = options.build(&config)?;
        let mut keyring = KeyRing::new(
            setup.network,
            setup.identity.required_copayers,
            setup.identity.total_copayers,
        )?;
        keyring.add_copayer(setup.signer.xpub()?, setup.nickname)?;

        let wallet = Self::assemble(
            setup.identity,
            config,
            setup.signer,
            keyring,
            ProposalSet::new(),
            AddressBook::new(),
            collaborators,
        )?;
        log::info!(
            "Created wallet {} ({}) as copayer {}",
            wallet.identity.display_name(),
            wallet.keyring.network(),
            wallet.copayer_id
        );
        wallet.persist().await?;
        Ok(wallet)
    }

    /// Rehydrate from a trusted snapshot
    ///
    /// Nothing in the snapshot is re-verified.
    pub async fn from_snapshot(
        snapshot: WalletSnapshot,
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> Result<Self, WalletError> {
        let network = snapshot.public_key_ring.network();
        if let Some(expected) = config.force_network {
            if expected != network {
                return Err(ConfigurationError::NetworkMismatch {
                    expected,
                    found: network,
                }
                .into());
            }
        }
        let ring = &snapshot.public_key_ring;
        if ring.required() != snapshot.opts.required_copayers
            || ring.total() != snapshot.opts.total_copayers
        {
            return Err(ConfigurationError::InvalidParameters(
                snapshot.opts.required_copayers,
                snapshot.opts.total_copayers,
            )
            .into());
        }

        collaborators
            .network
            .set_nonces(NetworkNonces::from_hex(
                Some(&snapshot.network_nonce),
                &snapshot.network_nonces,
            ))
            .await;

        let mut keyring = snapshot.public_key_ring;
        keyring.add_copayer(snapshot.private_key.xpub()?, None)?;

        Self::assemble(
            snapshot.opts,
            config,
            snapshot.private_key,
            keyring,
            snapshot.tx_proposals,
            snapshot.address_book,
            collaborators,
        )
    }

    /// Load a stored wallet by id
    pub async fn load(
        wallet_id: &str,
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> Result<Self, WalletError> {
        let snapshot = collaborators.storage.load(wallet_id)?;
        Self::from_snapshot(snapshot, config, collaborators).await
    }

    fn assemble(
        identity: WalletIdentity,
        config: EngineConfig,
        signer: CopayerSigner,
        keyring: KeyRing,
        proposals: ProposalSet,
        address_book: AddressBook,
        collaborators: Collaborators,
    ) -> Result<Self, WalletError> {
        let copayer_id = signer.copayer_id()?;
        let identity_key = signer.identity_key_pair()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let connection = ConnectionManager::new(identity.reconnect_delay());

        Ok(Self {
            identity,
            config,
            copayer_id,
            messaging: TrustedMessaging::new(identity_key.clone()),
            identity_key,
            signer,
            keyring,
            proposals,
            address_book,
            network: collaborators.network,
            blockchain: collaborators.blockchain,
            storage: collaborators.storage,
            events,
            connection,
        })
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn identity(&self) -> &WalletIdentity {
        &self.identity
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn copayer_id(&self) -> &str {
        &self.copayer_id
    }

    pub fn network_kind(&self) -> NetworkKind {
        self.keyring.network()
    }

    pub fn keyring(&self) -> &KeyRing {
        &self.keyring
    }

    pub fn proposals(&self) -> &ProposalSet {
        &self.proposals
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.address_book
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    /// Current state in its persisted form
    pub async fn snapshot(&self) -> WalletSnapshot {
        let nonces = self.network.nonces().await;
        WalletSnapshot {
            opts: self.identity.clone(),
            network_nonce: nonces.own_hex(),
            network_nonces: nonces.peers_hex(),
            public_key_ring: self.keyring.clone(),
            tx_proposals: self.proposals.clone(),
            private_key: self.signer.clone(),
            address_book: self.address_book.clone(),
        }
    }

    pub(crate) async fn persist(&self) -> Result<(), WalletError> {
        let snapshot = self.snapshot().await;
        self.storage.persist(&self.identity.id, &snapshot)?;
        log::debug!("Wallet {} stored", self.identity.id);
        Ok(())
    }

    /// Persist, then notify once per touched entity family
    pub(crate) async fn commit(&self, dirty: Dirty) -> Result<(), WalletError> {
        if dirty.is_empty() {
            return Ok(());
        }
        self.persist().await?;
        for event in dirty.notifications() {
            self.emit(event);
        }
        Ok(())
    }

    pub(crate) fn emit(&self, event: WalletEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Send to peers; skipped while the transport is down
    pub(crate) async fn send(
        &self,
        recipients: Recipients,
        payload: Payload,
    ) -> Result<(), WalletError> {
        if !self.network.is_online().await {
            log::debug!("Offline, not sending {}", payload.type_name());
            return Ok(());
        }
        let message = WireMessage::new(self.identity.id.clone(), payload);
        log::debug!("Sending {} to {:?}", message.type_name(), recipients);
        self.network.send(recipients, &message).await?;
        Ok(())
    }

    pub(crate) async fn send_wallet_id(&self, recipients: Recipients) -> Result<(), WalletError> {
        let payload = Payload::WalletId {
            opts: self.identity.clone(),
            network_name: self.keyring.network().name().to_string(),
        };
        self.send(recipients, payload).await
    }

    pub(crate) async fn send_wallet_ready(
        &self,
        recipients: Recipients,
    ) -> Result<(), WalletError> {
        self.send(recipients, Payload::WalletReady).await
    }

    pub(crate) async fn send_public_key_ring(
        &self,
        recipients: Recipients,
    ) -> Result<(), WalletError> {
        let payload = Payload::PublicKeyRing {
            public_key_ring: self.keyring.clone(),
        };
        self.send(recipients, payload).await
    }

    pub(crate) async fn send_indexes(&self, recipients: Recipients) -> Result<(), WalletError> {
        let payload = Payload::Indexes {
            indexes: self.keyring.indexes().clone(),
        };
        self.send(recipients, payload).await
    }

    pub(crate) async fn send_tx_proposal(
        &self,
        ntxid: &str,
        recipients: Recipients,
    ) -> Result<(), WalletError> {
        let Some(proposal) = self.proposals.get(ntxid) else {
            return Ok(());
        };
        let payload = Payload::TxProposal {
            tx_proposal: Box::new(proposal.clone()),
        };
        self.send(recipients, payload).await
    }

    pub(crate) async fn send_all_tx_proposals(
        &self,
        recipients: Recipients,
    ) -> Result<(), WalletError> {
        for ntxid in self.proposals.ntxids() {
            self.send_tx_proposal(&ntxid, recipients.clone()).await?;
        }
        Ok(())
    }

    pub(crate) async fn send_seen(
        &self,
        ntxid: &str,
        recipients: Recipients,
    ) -> Result<(), WalletError> {
        let payload = Payload::Seen {
            ntxid: ntxid.to_string(),
        };
        self.send(recipients, payload).await
    }

    pub(crate) async fn send_reject(&self, ntxid: &str) -> Result<(), WalletError> {
        let payload = Payload::Reject {
            ntxid: ntxid.to_string(),
        };
        self.send(Recipients::All, payload).await
    }

    pub(crate) async fn send_address_book(
        &self,
        recipients: Recipients,
    ) -> Result<(), WalletError> {
        let payload = Payload::AddressBook {
            address_book: self.address_book.entries().clone(),
        };
        self.send(recipients, payload).await
    }
}

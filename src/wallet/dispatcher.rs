//! Inbound message dispatch
//!
//! Routes each peer message to its handler and merges what it carries
//! into local state. Handlers never return protocol violations: the
//! message is dropped and the violation reported as an event. Only local
//! failures (storage, transport) propagate.

use crate::multisig::{
    AddressBookEntry, BranchIndexes, KeyRing, KeyRingError, Proposal, ProposalError,
};
use crate::network::{Payload, Recipients, WireMessage};
use crate::wallet::error::{ProtocolViolation, WalletError};
use crate::wallet::events::{Dirty, ProposalEventKind, WalletEvent};
use crate::wallet::identity::WalletIdentity;
use crate::wallet::wallet::Wallet;
use chrono::Utc;
use std::collections::BTreeMap;

impl Wallet {
    /// Handle one message from `sender`
    pub async fn handle_message(
        &mut self,
        sender: &str,
        message: WireMessage,
    ) -> Result<(), WalletError> {
        log::debug!("Received {} from {}", message.type_name(), sender);

        let handshake = matches!(message.payload, Payload::WalletId { .. });
        if message.wallet_id != self.identity.id && !handshake {
            log::warn!(
                "Bad message from {}: wallet {} is not ours",
                sender,
                message.wallet_id
            );
            self.emit(WalletEvent::BadMessage {
                sender: sender.to_string(),
                violation: ProtocolViolation::WalletIdMismatch {
                    expected: self.identity.id.clone(),
                    found: message.wallet_id,
                },
            });
            return Ok(());
        }

        match message.payload {
            Payload::WalletId { opts, network_name } => {
                self.on_wallet_id(sender, &opts, &network_name).await
            }
            Payload::WalletReady => self.on_wallet_ready(sender).await,
            Payload::PublicKeyRing { public_key_ring } => {
                self.on_public_key_ring(sender, &public_key_ring).await
            }
            Payload::Indexes { indexes } => self.on_indexes(sender, &indexes).await,
            Payload::TxProposal { tx_proposal } => self.on_tx_proposal(sender, &tx_proposal).await,
            Payload::Reject { ntxid } => self.on_reject(sender, &ntxid).await,
            Payload::Seen { ntxid } => self.on_seen(sender, &ntxid).await,
            Payload::AddressBook { address_book } => {
                self.on_address_book(sender, &address_book).await
            }
        }
    }

    fn violation(&self, sender: &str, violation: ProtocolViolation) {
        log::warn!("Protocol violation by {}: {}", sender, violation);
        self.emit(WalletEvent::ProtocolViolation {
            sender: sender.to_string(),
            violation,
        });
    }

    /// Senders of everything but the join handshake must be in the ring
    fn require_member(&self, sender: &str) -> bool {
        if self.keyring.contains(sender) {
            return true;
        }
        self.violation(sender, ProtocolViolation::NotACopayer(sender.to_string()));
        false
    }

    async fn on_wallet_id(
        &mut self,
        sender: &str,
        opts: &WalletIdentity,
        network_name: &str,
    ) -> Result<(), WalletError> {
        if opts.id != self.identity.id || network_name != self.keyring.network().name() {
            log::info!(
                "Copayer {} is on wallet {} ({}), ignoring",
                sender,
                opts.id,
                network_name
            );
            return Ok(());
        }
        self.send_wallet_ready(Recipients::one(sender)).await
    }

    async fn on_wallet_ready(&mut self, sender: &str) -> Result<(), WalletError> {
        // Joiners are not in the ring yet
        if self.keyring.is_complete() && !self.require_member(sender) {
            return Ok(());
        }
        let to = Recipients::one(sender);
        self.send_public_key_ring(to.clone()).await?;
        self.send_address_book(to.clone()).await?;
        self.send_all_tx_proposals(to).await
    }

    async fn on_public_key_ring(
        &mut self,
        sender: &str,
        ring: &KeyRing,
    ) -> Result<(), WalletError> {
        let was_incomplete = !self.keyring.is_complete();
        match self.keyring.merge(ring, self.config.scan_window) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e @ KeyRingError::IndexOutOfRange { .. }) => {
                self.violation(sender, ProtocolViolation::IndexOutOfRange(e.to_string()));
                return Ok(());
            }
            Err(e) => {
                log::warn!("Key ring from {} rejected: {}", sender, e);
                self.emit(WalletEvent::ConnectionError {
                    sender: sender.to_string(),
                    violation: ProtocolViolation::KeyRingConflict(e.to_string()),
                });
                return Ok(());
            }
        }

        self.commit(Dirty::KEY_RING).await?;
        if was_incomplete {
            self.send_public_key_ring(Recipients::one(sender)).await?;
        }
        if self.keyring.is_complete() {
            self.lock_incoming().await;
        }
        Ok(())
    }

    async fn on_indexes(
        &mut self,
        sender: &str,
        indexes: &BTreeMap<String, BranchIndexes>,
    ) -> Result<(), WalletError> {
        if !self.require_member(sender) {
            return Ok(());
        }
        match self.keyring.merge_indexes(indexes, self.config.scan_window) {
            Ok(true) => self.commit(Dirty::KEY_RING).await,
            Ok(false) => Ok(()),
            Err(e) => {
                self.violation(sender, ProtocolViolation::IndexOutOfRange(e.to_string()));
                Ok(())
            }
        }
    }

    async fn on_tx_proposal(&mut self, sender: &str, inbound: &Proposal) -> Result<(), WalletError> {
        if !self.require_member(sender) {
            return Ok(());
        }
        let now = Utc::now();
        let outcome = match self.proposals.merge(inbound, &self.keyring, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Corrupt proposal from {}: {}", sender, e);
                self.emit(WalletEvent::CorruptProposal {
                    sender: sender.to_string(),
                    violation: ProtocolViolation::CorruptProposal(e.to_string()),
                });
                return Ok(());
            }
        };
        if !outcome.has_changes() {
            return Ok(());
        }

        let ntxid = outcome.ntxid.clone();
        let mut sent_txid = None;
        let mut accept_error = None;
        let mut complete = false;
        if let Some(proposal) = self.proposals.get_mut(&ntxid) {
            if outcome.changed {
                proposal.set_seen(&self.copayer_id, now);
            }
            complete = proposal.is_complete();
            if outcome.changed && complete && !proposal.is_sent() {
                // Another copayer may have completed and broadcast it already
                match self.blockchain.check_accepted(&proposal.tx).await {
                    Ok(Some(txid)) => {
                        proposal.set_sent(txid.clone(), now);
                        sent_txid = Some(txid);
                    }
                    Ok(None) => {}
                    Err(e) => accept_error = Some(e),
                }
            }
        }

        self.commit(Dirty::PROPOSALS).await?;

        if outcome.is_new {
            self.emit(WalletEvent::TxProposalEvent {
                kind: ProposalEventKind::New,
                ntxid: ntxid.clone(),
                copayer_id: sender.to_string(),
            });
        }
        for signer in &outcome.new_signers {
            if outcome.is_new && signer == sender {
                continue;
            }
            self.emit(WalletEvent::TxProposalEvent {
                kind: ProposalEventKind::Signed,
                ntxid: ntxid.clone(),
                copayer_id: signer.clone(),
            });
        }
        if sent_txid.is_some() {
            self.emit(WalletEvent::TxProposalEvent {
                kind: ProposalEventKind::Sent,
                ntxid: ntxid.clone(),
                copayer_id: sender.to_string(),
            });
        }

        // Seen-only changes are bookkeeping: no ack, no relay
        if outcome.changed {
            self.send_seen(&ntxid, Recipients::one(sender)).await?;
            if !complete {
                self.send_tx_proposal(&ntxid, Recipients::All).await?;
            }
        }
        // The merge itself is kept; acceptance is checked again on send
        match accept_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn on_reject(&mut self, sender: &str, ntxid: &str) -> Result<(), WalletError> {
        if !self.require_member(sender) {
            return Ok(());
        }
        let Some(proposal) = self.proposals.get_mut(ntxid) else {
            self.violation(sender, ProtocolViolation::UnknownProposal(ntxid.to_string()));
            return Ok(());
        };

        match proposal.set_rejected(sender, Utc::now()) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(ProposalError::AlreadySigned(copayer)) => {
                self.violation(
                    sender,
                    ProtocolViolation::RejectAfterSign {
                        ntxid: ntxid.to_string(),
                        copayer,
                    },
                );
                return Ok(());
            }
            Err(e) => {
                log::debug!("Ignoring reject of {}: {}", ntxid, e);
                self.violation(sender, ProtocolViolation::AlreadySent(ntxid.to_string()));
                return Ok(());
            }
        }

        self.commit(Dirty::PROPOSALS).await?;
        self.emit(WalletEvent::TxProposalEvent {
            kind: ProposalEventKind::Rejected,
            ntxid: ntxid.to_string(),
            copayer_id: sender.to_string(),
        });
        Ok(())
    }

    async fn on_seen(&mut self, sender: &str, ntxid: &str) -> Result<(), WalletError> {
        if !self.require_member(sender) {
            return Ok(());
        }
        let Some(proposal) = self.proposals.get_mut(ntxid) else {
            self.violation(sender, ProtocolViolation::UnknownProposal(ntxid.to_string()));
            return Ok(());
        };
        if !proposal.set_seen(sender, Utc::now()) {
            return Ok(());
        }

        self.commit(Dirty::PROPOSALS).await?;
        self.emit(WalletEvent::TxProposalEvent {
            kind: ProposalEventKind::Seen,
            ntxid: ntxid.to_string(),
            copayer_id: sender.to_string(),
        });
        Ok(())
    }

    async fn on_address_book(
        &mut self,
        sender: &str,
        entries: &BTreeMap<String, AddressBookEntry>,
    ) -> Result<(), WalletError> {
        if !self.keyring.contains(sender) {
            log::debug!("Dropping address book from non-copayer {}", sender);
            return Ok(());
        }
        let keyring = &self.keyring;
        let added = self
            .address_book
            .merge(entries, keyring.network(), |copayer_id| keyring.contains(copayer_id));
        if !added.is_empty() {
            log::debug!("Added {} address book entries from {}", added.len(), sender);
            self.commit(Dirty::ADDRESS_BOOK).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{MemoryChain, UnspentOutput};
    use crate::crypto::{KeyPair, TrustedMessaging};
    use crate::multisig::{Address, NetworkKind, ProposalStatus};
    use crate::network::MemoryHub;
    use crate::storage::Storage;
    use crate::wallet::wallet::tests::{complete_wallets, options, test_wallet, TestWallet};
    use tokio::sync::broadcast;

    fn message(wallet: &TestWallet, payload: Payload) -> WireMessage {
        WireMessage::new(wallet.wallet.id().to_string(), payload)
    }

    fn drain(events: &mut broadcast::Receiver<WalletEvent>) -> Vec<WalletEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Fund copayer 0's first address and let it draft a proposal
    async fn drafted(wallets: &mut [TestWallet]) -> String {
        let address = wallets[0].wallet.generate_address(false).await.unwrap();
        wallets[0]
            .chain
            .add_unspent(UnspentOutput {
                address,
                txid: "ab".repeat(32),
                vout: 0,
                amount: 0.01,
                confirmations: 6,
                script_pub_key: None,
            })
            .await;
        let to = wallets[0].wallet.generate_address(false).await.unwrap();
        wallets[0]
            .wallet
            .create_tx(&to, 500_000, Some("rent".to_string()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_wrong_wallet_id() {
        let mut wallets = complete_wallets(2, 3).await;
        let mut events = wallets[0].wallet.subscribe();
        let sender = wallets[1].wallet.copayer_id().to_string();
        let writes = wallets[0].storage.write_count();

        let msg = WireMessage::new("other", Payload::Seen { ntxid: "aa".to_string() });
        wallets[0].wallet.handle_message(&sender, msg).await.unwrap();

        assert!(matches!(
            drain(&mut events).as_slice(),
            [WalletEvent::BadMessage { .. }]
        ));
        assert_eq!(wallets[0].storage.write_count(), writes);
    }

    #[tokio::test]
    async fn test_wallet_id_is_answered() {
        let hub = MemoryHub::new();
        let chain = MemoryChain::new();
        let mut alice = test_wallet(&hub, &chain, options("w1", 2, 2)).await;
        let _rx = alice.wallet.start_network().await.unwrap();

        // A wallet id handshake may carry any walletId
        let opts = alice.wallet.identity().clone();
        let msg = WireMessage::new(
            "",
            Payload::WalletId {
                opts,
                network_name: "testnet".to_string(),
            },
        );
        alice.wallet.handle_message("02bb", msg).await.unwrap();

        let sent = alice.network.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Recipients::one("02bb"));
        assert!(matches!(sent[0].1.payload, Payload::WalletReady));
    }

    #[tokio::test]
    async fn test_key_ring_exchange() {
        let hub = MemoryHub::new();
        let chain = MemoryChain::new();
        let mut alice = test_wallet(&hub, &chain, options("w1", 2, 2)).await;
        let mut bob = test_wallet(&hub, &chain, options("w1", 2, 2)).await;
        let _a = alice.wallet.start_network().await.unwrap();
        let _b = bob.wallet.start_network().await.unwrap();
        let mut events = alice.wallet.subscribe();

        let bob_id = bob.wallet.copayer_id().to_string();
        let ring = bob.wallet.keyring().clone();
        let msg = message(&bob, Payload::PublicKeyRing { public_key_ring: ring.clone() });
        alice.wallet.handle_message(&bob_id, msg).await.unwrap();

        assert!(alice.wallet.keyring().is_complete());
        assert_eq!(drain(&mut events), vec![WalletEvent::PublicKeyRingUpdated]);
        let sent = alice.network.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Recipients::one(bob_id.clone()));
        assert!(matches!(sent[0].1.payload, Payload::PublicKeyRing { .. }));

        // Same ring again changes nothing
        let msg = message(&bob, Payload::PublicKeyRing { public_key_ring: ring });
        alice.wallet.handle_message(&bob_id, msg).await.unwrap();
        assert!(drain(&mut events).is_empty());
        assert_eq!(alice.network.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_ring() {
        let hub = MemoryHub::new();
        let chain = MemoryChain::new();
        let mut alice = test_wallet(&hub, &chain, options("w1", 2, 3)).await;
        let other = test_wallet(&hub, &chain, options("w1", 1, 3)).await;
        let mut events = alice.wallet.subscribe();
        let before = alice.wallet.keyring().copayer_ids();

        let msg = message(
            &alice,
            Payload::PublicKeyRing {
                public_key_ring: other.wallet.keyring().clone(),
            },
        );
        alice.wallet.handle_message("02cc", msg).await.unwrap();

        assert_eq!(alice.wallet.keyring().copayer_ids(), before);
        assert!(matches!(
            drain(&mut events).as_slice(),
            [WalletEvent::ConnectionError { .. }]
        ));
    }

    #[tokio::test]
    async fn test_proposal_round_trip() {
        let mut wallets = complete_wallets(2, 3).await;
        for w in wallets.iter_mut() {
            let _ = w.wallet.start_network().await.unwrap();
        }
        let ntxid = drafted(&mut wallets).await;
        let alice_id = wallets[0].wallet.copayer_id().to_string();
        let bob_id = wallets[1].wallet.copayer_id().to_string();
        let proposal = wallets[0].wallet.proposals().get(&ntxid).unwrap().clone();

        // Bob learns the proposal, acknowledges it and relays it
        let mut events = wallets[1].wallet.subscribe();
        let msg = message(&wallets[0], Payload::TxProposal { tx_proposal: Box::new(proposal) });
        wallets[1].wallet.handle_message(&alice_id, msg).await.unwrap();

        let stored = wallets[1].wallet.proposals().get(&ntxid).unwrap();
        assert!(stored.signed_by.contains_key(&alice_id));
        assert!(stored.seen_by.contains_key(&bob_id));
        let got = drain(&mut events);
        assert!(got.contains(&WalletEvent::TxProposalsUpdated));
        assert!(got.contains(&WalletEvent::TxProposalEvent {
            kind: ProposalEventKind::New,
            ntxid: ntxid.clone(),
            copayer_id: alice_id.clone(),
        }));
        let sent = wallets[1].network.sent().await;
        assert!(matches!(sent[0].1.payload, Payload::Seen { .. }));
        assert_eq!(sent[0].0, Recipients::one(alice_id.clone()));
        assert!(matches!(sent[1].1.payload, Payload::TxProposal { .. }));

        // Bob signs, completing 2-of-3; Alice merges and finds it complete
        assert!(wallets[1].wallet.sign(&ntxid).await.unwrap());
        let signed = wallets[1].wallet.proposals().get(&ntxid).unwrap().clone();
        let msg = message(&wallets[1], Payload::TxProposal { tx_proposal: Box::new(signed) });
        wallets[0].wallet.handle_message(&bob_id, msg).await.unwrap();

        let alice_view = wallets[0].wallet.proposals().get(&ntxid).unwrap();
        assert_eq!(alice_view.status(2, 3), ProposalStatus::Complete);
        assert!(alice_view.signed_by.contains_key(&bob_id));
    }

    #[tokio::test]
    async fn test_complete_proposal_already_on_chain() {
        let mut wallets = complete_wallets(2, 3).await;
        let ntxid = drafted(&mut wallets).await;
        let bob_id = wallets[1].wallet.copayer_id().to_string();

        let proposal = wallets[0].wallet.proposals().get(&ntxid).unwrap().clone();
        let msg = message(&wallets[0], Payload::TxProposal { tx_proposal: Box::new(proposal) });
        let alice_id = wallets[0].wallet.copayer_id().to_string();
        wallets[1].wallet.handle_message(&alice_id, msg).await.unwrap();
        assert!(wallets[1].wallet.sign(&ntxid).await.unwrap());

        let signed = wallets[1].wallet.proposals().get(&ntxid).unwrap().clone();
        let txid = signed.tx.txid().unwrap();
        wallets[0].chain.accept(&txid).await;

        let msg = message(&wallets[1], Payload::TxProposal { tx_proposal: Box::new(signed) });
        wallets[0].wallet.handle_message(&bob_id, msg).await.unwrap();
        let stored = wallets[0].wallet.proposals().get(&ntxid).unwrap();
        assert_eq!(stored.sent_txid.as_deref(), Some(txid.as_str()));
        assert_eq!(stored.status(2, 3), ProposalStatus::Sent);

        // The persisted copy carries the sent marker too
        let snapshot = wallets[0].storage.load(wallets[0].wallet.id()).unwrap();
        assert!(snapshot.tx_proposals.get(&ntxid).unwrap().is_sent());
    }

    #[tokio::test]
    async fn test_corrupt_proposal() {
        let mut wallets = complete_wallets(2, 3).await;
        let ntxid = drafted(&mut wallets).await;
        let alice_id = wallets[0].wallet.copayer_id().to_string();
        let mut events = wallets[1].wallet.subscribe();

        let mut forged = wallets[0].wallet.proposals().get(&ntxid).unwrap().clone();
        let stranger = KeyPair::generate();
        let input = &mut forged.tx.inputs[0];
        let sig = input.signatures.values().next().unwrap().clone();
        input.signatures.insert(stranger.public_key_hex(), sig);

        let msg = message(&wallets[0], Payload::TxProposal { tx_proposal: Box::new(forged) });
        wallets[1].wallet.handle_message(&alice_id, msg).await.unwrap();

        assert!(wallets[1].wallet.proposals().is_empty());
        assert!(matches!(
            drain(&mut events).as_slice(),
            [WalletEvent::CorruptProposal { .. }]
        ));
    }

    #[tokio::test]
    async fn test_reject_after_sign_is_refused() {
        let mut wallets = complete_wallets(2, 3).await;
        let ntxid = drafted(&mut wallets).await;
        let alice_id = wallets[0].wallet.copayer_id().to_string();
        let bob_id = wallets[1].wallet.copayer_id().to_string();
        let mut events = wallets[0].wallet.subscribe();

        // Alice created and signed it, her reject is refused by Bob
        let proposal = wallets[0].wallet.proposals().get(&ntxid).unwrap().clone();
        let msg = message(&wallets[0], Payload::TxProposal { tx_proposal: Box::new(proposal) });
        wallets[1].wallet.handle_message(&alice_id, msg).await.unwrap();
        let before = wallets[1].wallet.proposals().get(&ntxid).unwrap().clone();
        let msg = message(&wallets[0], Payload::Reject { ntxid: ntxid.clone() });
        wallets[1].wallet.handle_message(&alice_id, msg).await.unwrap();
        assert_eq!(wallets[1].wallet.proposals().get(&ntxid).unwrap(), &before);

        // Bob has not signed, his reject counts
        let msg = message(&wallets[1], Payload::Reject { ntxid: ntxid.clone() });
        wallets[0].wallet.handle_message(&bob_id, msg).await.unwrap();
        let stored = wallets[0].wallet.proposals().get(&ntxid).unwrap();
        assert_eq!(stored.reject_count(), 1);
        assert!(drain(&mut events).contains(&WalletEvent::TxProposalEvent {
            kind: ProposalEventKind::Rejected,
            ntxid: ntxid.clone(),
            copayer_id: bob_id.clone(),
        }));

        let msg = message(&wallets[1], Payload::Reject { ntxid: "ff".to_string() });
        wallets[0].wallet.handle_message(&bob_id, msg).await.unwrap();
        assert!(matches!(
            drain(&mut events).as_slice(),
            [WalletEvent::ProtocolViolation {
                violation: ProtocolViolation::UnknownProposal(_),
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_seen_is_bookkeeping_only() {
        let mut wallets = complete_wallets(2, 3).await;
        let ntxid = drafted(&mut wallets).await;
        let carol_id = wallets[2].wallet.copayer_id().to_string();
        let status = wallets[0].wallet.proposals().get(&ntxid).unwrap().status(2, 3);

        let msg = message(&wallets[2], Payload::Seen { ntxid: ntxid.clone() });
        wallets[0].wallet.handle_message(&carol_id, msg).await.unwrap();

        let stored = wallets[0].wallet.proposals().get(&ntxid).unwrap();
        assert!(stored.seen_by.contains_key(&carol_id));
        assert_eq!(stored.status(2, 3), status);
    }

    #[tokio::test]
    async fn test_address_book_signatures() {
        let mut wallets = complete_wallets(2, 3).await;
        let alice_id = wallets[0].wallet.copayer_id().to_string();
        let to = wallets[0].wallet.generate_address(false).await.unwrap();
        wallets[0]
            .wallet
            .set_address_book(&to, "savings")
            .await
            .unwrap();
        let mut entries = wallets[0].wallet.address_book().entries().clone();

        // Tampered label: dropped without a trace
        entries.get_mut(&to).unwrap().label = "thief".to_string();
        let msg = message(&wallets[0], Payload::AddressBook { address_book: entries });
        wallets[1].wallet.handle_message(&alice_id, msg).await.unwrap();
        assert!(wallets[1].wallet.address_book().is_empty());

        // Signed by someone outside the ring
        let outsider = TrustedMessaging::new(KeyPair::generate());
        let entry = AddressBookEntry::signed(&to, "x", &outsider, 1).unwrap();
        let msg = message(
            &wallets[0],
            Payload::AddressBook {
                address_book: BTreeMap::from([(to.clone(), entry)]),
            },
        );
        wallets[1].wallet.handle_message(&alice_id, msg).await.unwrap();
        assert!(wallets[1].wallet.address_book().is_empty());

        // Signed by a copayer, but not a testnet address
        let livenet = Address::for_script(NetworkKind::Livenet, b"elsewhere").to_string();
        let entry = AddressBookEntry::signed(&livenet, "x", &wallets[0].wallet.messaging, 1).unwrap();
        let msg = message(
            &wallets[0],
            Payload::AddressBook {
                address_book: BTreeMap::from([(livenet, entry)]),
            },
        );
        wallets[1].wallet.handle_message(&alice_id, msg).await.unwrap();
        assert!(wallets[1].wallet.address_book().is_empty());

        let entries = wallets[0].wallet.address_book().entries().clone();
        let msg = message(&wallets[0], Payload::AddressBook { address_book: entries });
        wallets[1].wallet.handle_message(&alice_id, msg).await.unwrap();
        assert_eq!(wallets[1].wallet.address_book().get(&to).unwrap().label, "savings");
    }

    #[tokio::test]
    async fn test_indexes_only_advance() {
        let mut wallets = complete_wallets(2, 3).await;
        let alice_id = wallets[0].wallet.copayer_id().to_string();
        for _ in 0..3 {
            wallets[0].wallet.generate_address(false).await.unwrap();
        }
        let indexes = wallets[0].wallet.keyring().indexes().clone();
        let msg = message(&wallets[0], Payload::Indexes { indexes });
        wallets[1].wallet.handle_message(&alice_id, msg).await.unwrap();
        assert_eq!(wallets[1].wallet.keyring().index_for(&alice_id, false), 3);

        let stale = wallets[2].wallet.keyring().indexes().clone();
        let msg = message(&wallets[0], Payload::Indexes { indexes: stale });
        wallets[1].wallet.handle_message(&alice_id, msg).await.unwrap();
        assert_eq!(wallets[1].wallet.keyring().index_for(&alice_id, false), 3);
    }

    #[tokio::test]
    async fn test_indexes_out_of_range_are_refused() {
        let mut wallets = complete_wallets(2, 3).await;
        let alice_id = wallets[0].wallet.copayer_id().to_string();
        let mut events = wallets[1].wallet.subscribe();
        let writes = wallets[1].storage.write_count();

        let mut indexes = wallets[1].wallet.keyring().indexes().clone();
        indexes.insert(
            alice_id.clone(),
            BranchIndexes {
                receive: 0x7fff_ffff,
                change: 0,
            },
        );
        let msg = message(&wallets[0], Payload::Indexes { indexes });
        wallets[1].wallet.handle_message(&alice_id, msg).await.unwrap();

        assert_eq!(wallets[1].wallet.keyring().index_for(&alice_id, false), 0);
        assert_eq!(wallets[1].storage.write_count(), writes);
        assert!(matches!(
            drain(&mut events).as_slice(),
            [WalletEvent::ProtocolViolation {
                violation: ProtocolViolation::IndexOutOfRange(_),
                ..
            }]
        ));

        // Same bound for indexes carried by a key ring
        let mut ring = wallets[0].wallet.keyring().clone();
        ring.advance_index(&alice_id, true, 5_000);
        let msg = message(&wallets[0], Payload::PublicKeyRing { public_key_ring: ring });
        wallets[1].wallet.handle_message(&alice_id, msg).await.unwrap();
        assert_eq!(wallets[1].wallet.keyring().index_for(&alice_id, true), 0);

        // The wallet keeps working
        let balance = wallets[1].wallet.get_balance().await.unwrap();
        assert_eq!(balance.total, 0);
    }

    #[tokio::test]
    async fn test_acceptance_check_failure_is_reported() {
        let mut wallets = complete_wallets(2, 3).await;
        let ntxid = drafted(&mut wallets).await;
        let alice_id = wallets[0].wallet.copayer_id().to_string();
        let bob_id = wallets[1].wallet.copayer_id().to_string();

        let proposal = wallets[0].wallet.proposals().get(&ntxid).unwrap().clone();
        let msg = message(&wallets[0], Payload::TxProposal { tx_proposal: Box::new(proposal) });
        wallets[1].wallet.handle_message(&alice_id, msg).await.unwrap();
        assert!(wallets[1].wallet.sign(&ntxid).await.unwrap());

        wallets[0].chain.set_offline(true).await;
        let signed = wallets[1].wallet.proposals().get(&ntxid).unwrap().clone();
        let msg = message(&wallets[1], Payload::TxProposal { tx_proposal: Box::new(signed) });
        let result = wallets[0].wallet.handle_message(&bob_id, msg).await;

        assert!(matches!(result, Err(WalletError::Chain(_))));
        // The signature is merged and stored, just not marked sent
        let stored = wallets[0].wallet.proposals().get(&ntxid).unwrap();
        assert_eq!(stored.status(2, 3), ProposalStatus::Complete);
        let snapshot = wallets[0].storage.load(wallets[0].wallet.id()).unwrap();
        assert!(!snapshot.tx_proposals.get(&ntxid).unwrap().is_sent());
        assert!(snapshot.tx_proposals.get(&ntxid).unwrap().signed_by.contains_key(&bob_id));
    }
}

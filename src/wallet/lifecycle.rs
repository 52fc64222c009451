//! Local wallet commands
//!
//! Everything a user of this copayer can do to the shared state: sign,
//! reject and send proposals, label addresses, confirm backups and hand
//! out the join secret.

use crate::crypto::{decode_check, encode_check, public_key_from_hex};
use crate::multisig::{AddressBookEntry, HdPath, Proposal, ProposalError, ProposalStatus};
use crate::network::Recipients;
use crate::wallet::error::{ProtocolViolation, WalletError};
use crate::wallet::events::{Dirty, ProposalEventKind, WalletEvent};
use crate::wallet::identity::ConfigurationError;
use crate::wallet::wallet::Wallet;
use chrono::Utc;

/// A proposal as seen by the local copayer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposalView {
    pub ntxid: String,
    pub proposal: Proposal,
    pub status: ProposalStatus,
    pub signed_by_us: bool,
    pub rejected_by_us: bool,
    pub finally_rejected: bool,
}

/// An address of this wallet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressInfo {
    pub address: String,
    pub path: HdPath,
    pub is_change: bool,
    /// Generated on our own branch
    pub owned: bool,
}

impl Wallet {
    /// Add our signatures to a proposal
    ///
    /// Returns `false` when no new signature could be added.
    pub async fn sign(&mut self, ntxid: &str) -> Result<bool, WalletError> {
        let proposal = self
            .proposals
            .get_mut(ntxid)
            .ok_or_else(|| ProposalError::UnknownProposal(ntxid.to_string()))?;
        let keys = self.signer.keys_for_paths(&proposal.input_paths)?;
        if !proposal.sign(&self.copayer_id, &keys, Utc::now())? {
            log::debug!("Nothing to sign on {}", ntxid);
            return Ok(false);
        }

        self.commit(Dirty::PROPOSALS).await?;
        self.emit(WalletEvent::TxProposalEvent {
            kind: ProposalEventKind::Signed,
            ntxid: ntxid.to_string(),
            copayer_id: self.copayer_id.clone(),
        });
        self.send_tx_proposal(ntxid, Recipients::All).await?;
        Ok(true)
    }

    /// Reject a proposal we have not signed
    pub async fn reject(&mut self, ntxid: &str) -> Result<(), WalletError> {
        let proposal = self
            .proposals
            .get_mut(ntxid)
            .ok_or_else(|| ProposalError::UnknownProposal(ntxid.to_string()))?;
        match proposal.set_rejected(&self.copayer_id, Utc::now()) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(ProposalError::AlreadySigned(copayer)) => {
                return Err(ProtocolViolation::RejectAfterSign {
                    ntxid: ntxid.to_string(),
                    copayer,
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        }

        self.commit(Dirty::PROPOSALS).await?;
        self.emit(WalletEvent::TxProposalEvent {
            kind: ProposalEventKind::Rejected,
            ntxid: ntxid.to_string(),
            copayer_id: self.copayer_id.clone(),
        });
        self.send_reject(ntxid).await
    }

    /// Broadcast a complete proposal
    ///
    /// A failed or empty broadcast is followed by an acceptance check,
    /// since another copayer may have sent the same transaction first.
    pub async fn send_tx(&mut self, ntxid: &str) -> Result<Option<String>, WalletError> {
        let proposal = self
            .proposals
            .get(ntxid)
            .ok_or_else(|| ProposalError::UnknownProposal(ntxid.to_string()))?;
        if let Some(txid) = &proposal.sent_txid {
            return Ok(Some(txid.clone()));
        }
        if !proposal.is_complete() {
            return Err(WalletError::Incomplete(ntxid.to_string()));
        }
        let tx = proposal.tx.clone();
        let raw = tx.raw_hex()?;

        let txid = match self.blockchain.broadcast(&raw).await {
            Ok(Some(txid)) => Some(txid),
            result => {
                let accepted = match self.blockchain.check_accepted(&tx).await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("Could not check proposal {}: {}", ntxid, e);
                        None
                    }
                };
                match (accepted, result) {
                    (Some(txid), _) => Some(txid),
                    (None, Err(e)) => return Err(e.into()),
                    (None, Ok(_)) => None,
                }
            }
        };
        let Some(txid) = txid else {
            log::warn!("Broadcast of {} returned no transaction id", ntxid);
            return Ok(None);
        };

        if let Some(proposal) = self.proposals.get_mut(ntxid) {
            proposal.set_sent(txid.clone(), Utc::now());
        }
        log::info!("Proposal {} sent as {}", ntxid, txid);
        self.commit(Dirty::PROPOSALS).await?;
        self.emit(WalletEvent::TxProposalEvent {
            kind: ProposalEventKind::Sent,
            ntxid: ntxid.to_string(),
            copayer_id: self.copayer_id.clone(),
        });
        self.send_tx_proposal(ntxid, Recipients::All).await?;
        Ok(Some(txid))
    }

    pub fn proposals_view(&self) -> Vec<ProposalView> {
        let (required, total) = (self.keyring.required(), self.keyring.total());
        self.proposals
            .iter()
            .map(|(ntxid, proposal)| ProposalView {
                ntxid: ntxid.clone(),
                status: proposal.status(required, total),
                signed_by_us: proposal.signed_by.contains_key(&self.copayer_id),
                rejected_by_us: proposal.rejected_by.contains_key(&self.copayer_id),
                finally_rejected: proposal.is_finally_rejected(required, total),
                proposal: proposal.clone(),
            })
            .collect()
    }

    /// Label an address for every copayer; existing labels are kept
    pub async fn set_address_book(&mut self, address: &str, label: &str) -> Result<(), WalletError> {
        let created_ts = Utc::now().timestamp_millis();
        let entry = AddressBookEntry::signed(address, label, &self.messaging, created_ts)?;
        self.address_book.insert(address, entry)?;

        self.commit(Dirty::ADDRESS_BOOK).await?;
        self.send_address_book(Recipients::All).await
    }

    /// Hide or show an entry locally
    pub async fn toggle_address_book_entry(&mut self, address: &str) -> Result<bool, WalletError> {
        let hidden = self.address_book.toggle(address)?;
        self.commit(Dirty::ADDRESS_BOOK).await?;
        Ok(hidden)
    }

    /// Record that our key material is backed up
    pub async fn set_backup_ready(&mut self) -> Result<(), WalletError> {
        if !self.keyring.set_backup_ready(&self.copayer_id)? {
            return Ok(());
        }
        self.commit(Dirty::KEY_RING).await?;
        self.send_public_key_ring(Recipients::All).await
    }

    /// All keys known and every copayer backed up
    pub fn is_ready(&self) -> bool {
        self.keyring.is_fully_backed_up()
    }

    /// Next address on our own branch
    pub async fn generate_address(&mut self, change: bool) -> Result<String, WalletError> {
        let (path, address) = self.keyring.generate_address(&self.copayer_id, change)?;
        log::debug!("Generated {} at {}", address, path);

        self.commit(Dirty::KEY_RING).await?;
        self.send_indexes(Recipients::All).await?;
        Ok(address)
    }

    /// Join secret handed to prospective copayers
    pub fn secret(&self) -> String {
        encode_check(&self.identity_key.public_key.serialize())
    }

    /// Copayer id carried by a join secret
    pub fn decode_secret(secret: &str) -> Result<String, ConfigurationError> {
        let bytes =
            decode_check(secret).map_err(|e| ConfigurationError::InvalidSecret(e.to_string()))?;
        if bytes.len() != 33 {
            return Err(ConfigurationError::InvalidSecret(format!(
                "expected 33 bytes, got {}",
                bytes.len()
            )));
        }
        let copayer_id = hex::encode(&bytes);
        public_key_from_hex(&copayer_id)
            .map_err(|e| ConfigurationError::InvalidSecret(e.to_string()))?;
        Ok(copayer_id)
    }

    /// Serialized snapshot for backups
    pub async fn export(&self) -> Result<Vec<u8>, WalletError> {
        let snapshot = self.snapshot().await;
        Ok(self.storage.export(&snapshot)?)
    }

    /// Every generated address; empty until the ring is complete
    pub fn addresses_info(&mut self) -> Result<Vec<AddressInfo>, WalletError> {
        if !self.keyring.is_complete() {
            return Ok(Vec::new());
        }
        let own = self.keyring.cosigner_index(&self.copayer_id);
        Ok(self
            .keyring
            .addresses()?
            .into_iter()
            .map(|(path, address)| AddressInfo {
                address,
                is_change: path.change,
                owned: Some(path.cosigner) == own,
                path,
            })
            .collect())
    }

    /// The address was generated by this wallet
    pub fn address_is_own(&mut self, address: &str) -> Result<bool, WalletError> {
        if !self.keyring.is_complete() {
            return Ok(false);
        }
        Ok(self.keyring.path_for_address(address)?.is_some())
    }
}

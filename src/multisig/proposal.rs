//! Transaction proposals
//!
//! A proposal wraps a partially signed transaction with the bookkeeping
//! copayers gossip about it: who signed, who rejected, who has seen it and
//! whether it was sent. Signers are never taken from a peer's word; they
//! are recomputed from the verified signatures on the transaction inputs.

use crate::multisig::keyring::{HdPath, KeyRing, KeyRingError};
use crate::multisig::transaction::{OutPoint, PartialTx, TxError};
use chrono::{DateTime, Utc};
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Proposal errors
#[derive(Error, Debug)]
pub enum ProposalError {
    #[error("Unknown proposal: {0}")]
    UnknownProposal(String),
    #[error("Proposal {0} already exists")]
    Duplicate(String),
    #[error("Transaction error: {0}")]
    Tx(#[from] TxError),
    #[error("Key ring error: {0}")]
    KeyRing(#[from] KeyRingError),
    #[error("Proposal has {paths} paths for {inputs} inputs")]
    PathCount { inputs: usize, paths: usize },
    #[error("Input {0} does not match the script of its path")]
    ScriptMismatch(usize),
    #[error("Creator {0} is not a copayer")]
    UnknownCreator(String),
    #[error("Signature on input {input} by unknown key {public_key}")]
    UnknownSigner { input: usize, public_key: String },
    #[error("Inputs are signed by different copayers")]
    InconsistentSigners,
    #[error("Copayer {0} already signed this proposal")]
    AlreadySigned(String),
    #[error("Copayer {0} already rejected this proposal")]
    AlreadyRejected(String),
    #[error("Proposal was already sent")]
    AlreadySent,
}

/// Derived lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    /// Signed by at most its creator
    Drafted,
    PartiallySigned,
    RejectedByQuorum,
    Complete,
    Sent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub input_paths: Vec<HdPath>,
    pub tx: PartialTx,
    #[serde(default)]
    pub signed_by: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub rejected_by: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub seen_by: BTreeMap<String, DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Proposal {
    /// Create a new unsigned proposal
    pub fn new(
        creator: impl Into<String>,
        tx: PartialTx,
        input_paths: Vec<HdPath>,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            creator: creator.into(),
            created_at: now,
            input_paths,
            tx,
            signed_by: BTreeMap::new(),
            rejected_by: BTreeMap::new(),
            seen_by: BTreeMap::new(),
            sent_txid: None,
            sent_at: None,
            comment,
        }
    }

    pub fn ntxid(&self) -> Result<String, ProposalError> {
        Ok(self.tx.ntxid()?)
    }

    /// Skeleton a peer's proposal is merged into on first receipt
    fn skeleton(&self) -> Self {
        Self::new(
            self.creator.clone(),
            self.tx.strip_signatures(),
            self.input_paths.clone(),
            self.comment.clone(),
            self.created_at,
        )
    }

    /// Every input spends exactly the script the ring derives for its path
    pub fn check_inputs(&self, keyring: &KeyRing) -> Result<(), ProposalError> {
        if self.input_paths.len() != self.tx.inputs.len() || self.tx.inputs.is_empty() {
            return Err(ProposalError::PathCount {
                inputs: self.tx.inputs.len(),
                paths: self.input_paths.len(),
            });
        }
        for (index, (input, path)) in self.tx.inputs.iter().zip(&self.input_paths).enumerate() {
            let script = keyring.redeem_script_for(path)?;
            if input.redeem_script != script
                || input.address != script.address(keyring.network()).to_string()
            {
                return Err(ProposalError::ScriptMismatch(index));
            }
        }
        Ok(())
    }

    /// Copayers whose signatures are on the inputs
    ///
    /// Every input must be signed by the same set of copayers.
    pub fn signers_from_signatures(
        &self,
        keyring: &KeyRing,
    ) -> Result<BTreeSet<String>, ProposalError> {
        let mut signers: Option<BTreeSet<String>> = None;
        for (index, (input, path)) in self.tx.inputs.iter().zip(&self.input_paths).enumerate() {
            let mut input_signers = BTreeSet::new();
            for public_key in input.signatures.keys() {
                let copayer = keyring.copayer_for_pubkey_at(path, public_key)?.ok_or_else(|| {
                    ProposalError::UnknownSigner {
                        input: index,
                        public_key: public_key.clone(),
                    }
                })?;
                input_signers.insert(copayer);
            }

            match &signers {
                Some(previous) if *previous != input_signers => {
                    return Err(ProposalError::InconsistentSigners);
                }
                Some(_) => {}
                None => signers = Some(input_signers),
            }
        }
        Ok(signers.unwrap_or_default())
    }

    pub fn is_sent(&self) -> bool {
        self.sent_txid.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.tx.is_complete()
    }

    pub fn reject_count(&self) -> usize {
        self.rejected_by.len()
    }

    /// Not enough copayers are left to reach the threshold
    pub fn is_finally_rejected(&self, required: u8, total: u8) -> bool {
        (total as usize).saturating_sub(self.reject_count()) < required as usize
    }

    pub fn status(&self, required: u8, total: u8) -> ProposalStatus {
        if self.is_sent() {
            ProposalStatus::Sent
        } else if self.is_complete() {
            ProposalStatus::Complete
        } else if self.is_finally_rejected(required, total) {
            ProposalStatus::RejectedByQuorum
        } else if self.signed_by.len() > 1 {
            ProposalStatus::PartiallySigned
        } else {
            ProposalStatus::Drafted
        }
    }

    /// Sign with the given keys on behalf of `copayer`
    ///
    /// Returns `false` without touching anything when no new signature
    /// could be added.
    pub fn sign(
        &mut self,
        copayer: &str,
        keys: &[SecretKey],
        now: DateTime<Utc>,
    ) -> Result<bool, ProposalError> {
        if self.is_sent() {
            return Err(ProposalError::AlreadySent);
        }
        if self.rejected_by.contains_key(copayer) {
            return Err(ProposalError::AlreadyRejected(copayer.to_string()));
        }

        let mut tx = self.tx.clone();
        if tx.sign(keys)? == 0 {
            return Ok(false);
        }
        self.tx = tx;
        self.signed_by.entry(copayer.to_string()).or_insert(now);
        Ok(true)
    }

    /// Record a rejection; refused once the copayer has signed
    pub fn set_rejected(
        &mut self,
        copayer: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, ProposalError> {
        if self.signed_by.contains_key(copayer) {
            return Err(ProposalError::AlreadySigned(copayer.to_string()));
        }
        if self.is_sent() {
            return Err(ProposalError::AlreadySent);
        }
        if self.rejected_by.contains_key(copayer) {
            return Ok(false);
        }
        self.rejected_by.insert(copayer.to_string(), now);
        Ok(true)
    }

    pub fn set_seen(&mut self, copayer: &str, now: DateTime<Utc>) -> bool {
        if self.seen_by.contains_key(copayer) {
            return false;
        }
        self.seen_by.insert(copayer.to_string(), now);
        true
    }

    /// Mark as sent; a no-op when already sent
    pub fn set_sent(&mut self, txid: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.is_sent() {
            return false;
        }
        self.sent_txid = Some(txid.into());
        self.sent_at = Some(now);
        true
    }

    pub fn outpoints(&self) -> impl Iterator<Item = &OutPoint> {
        self.tx.inputs.iter().map(|input| &input.outpoint)
    }
}

/// Result of merging a peer's proposal
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub ntxid: String,
    pub is_new: bool,
    /// Signatures, rejections or the sent marker changed
    pub changed: bool,
    /// Only audit bookkeeping changed
    pub seen_changed: bool,
    pub new_signers: Vec<String>,
}

impl MergeOutcome {
    pub fn has_changes(&self) -> bool {
        self.changed || self.seen_changed
    }
}

/// All proposals of a wallet, by ntxid
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalSet {
    proposals: BTreeMap<String, Proposal>,
}

impl ProposalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a locally created proposal
    pub fn add(&mut self, proposal: Proposal) -> Result<String, ProposalError> {
        let ntxid = proposal.ntxid()?;
        if self.proposals.contains_key(&ntxid) {
            return Err(ProposalError::Duplicate(ntxid));
        }
        self.proposals.insert(ntxid.clone(), proposal);
        Ok(ntxid)
    }

    pub fn get(&self, ntxid: &str) -> Option<&Proposal> {
        self.proposals.get(ntxid)
    }

    pub fn get_mut(&mut self, ntxid: &str) -> Option<&mut Proposal> {
        self.proposals.get_mut(ntxid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Proposal)> {
        self.proposals.iter()
    }

    pub fn ntxids(&self) -> Vec<String> {
        self.proposals.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    /// Outputs spent by proposals that can still reach the threshold
    pub fn reserved_outpoints(&self, required: u8, total: u8) -> BTreeSet<OutPoint> {
        self.proposals
            .values()
            .filter(|p| !p.is_finally_rejected(required, total))
            .flat_map(|p| p.outpoints().cloned())
            .collect()
    }

    /// Merge a proposal received from a peer
    ///
    /// The merge is computed on a copy and committed only if every check
    /// passes, so a rejected proposal leaves the set untouched.
    pub fn merge(
        &mut self,
        inbound: &Proposal,
        keyring: &KeyRing,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome, ProposalError> {
        let ntxid = inbound.ntxid()?;
        inbound.check_inputs(keyring)?;

        let existing = self.proposals.get(&ntxid);
        let is_new = existing.is_none();
        if is_new && !keyring.contains(&inbound.creator) {
            return Err(ProposalError::UnknownCreator(inbound.creator.clone()));
        }
        let mut merged = match existing {
            Some(proposal) => proposal.clone(),
            None => inbound.skeleton(),
        };

        let mut changed = is_new;
        let mut new_signers = Vec::new();

        if !merged.is_sent() {
            changed |= merged.tx.merge_signatures(&inbound.tx)?;

            let signers = merged.signers_from_signatures(keyring)?;
            for signer in signers {
                if merged.signed_by.contains_key(&signer) {
                    continue;
                }
                let signed_at = inbound.signed_by.get(&signer).copied().unwrap_or(now);
                merged.signed_by.insert(signer.clone(), signed_at);
                new_signers.push(signer);
                changed = true;
            }

            for (copayer, rejected_at) in &inbound.rejected_by {
                if keyring.contains(copayer)
                    && !merged.signed_by.contains_key(copayer)
                    && !merged.rejected_by.contains_key(copayer)
                {
                    merged.rejected_by.insert(copayer.clone(), *rejected_at);
                    changed = true;
                }
            }

            if let Some(txid) = &inbound.sent_txid {
                if merged.is_complete() && merged.tx.txid()? == *txid {
                    merged.set_sent(txid.clone(), inbound.sent_at.unwrap_or(now));
                    changed = true;
                }
            }
        }

        let mut seen_changed = false;
        for (copayer, seen_at) in &inbound.seen_by {
            if keyring.contains(copayer) && !merged.seen_by.contains_key(copayer) {
                merged.seen_by.insert(copayer.clone(), *seen_at);
                seen_changed = true;
            }
        }

        if changed || seen_changed {
            self.proposals.insert(ntxid.clone(), merged);
        }

        Ok(MergeOutcome {
            ntxid,
            is_new,
            changed,
            seen_changed,
            new_signers,
        })
    }
}

//! Shared address book
//!
//! Labels for destination addresses, authored by a copayer and signed with
//! its identity key. Entries are write-once: an address already in the
//! book is never overwritten, neither locally nor by a peer.

use crate::crypto::{TrustedError, TrustedMessaging};
use crate::multisig::address::{Address, AddressError, NetworkKind};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Address book errors
#[derive(Error, Debug)]
pub enum AddressBookError {
    #[error("Address {0} is already in the address book")]
    AlreadyExists(String),
    #[error("Address {0} is not in the address book")]
    UnknownEntry(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddressError),
    #[error("Signing failed: {0}")]
    Signing(#[from] TrustedError),
}

/// Fields covered by an entry's signature
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedFields<'a> {
    address: &'a str,
    label: &'a str,
    copayer_id: &'a str,
    created_ts: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressBookEntry {
    pub label: String,
    pub copayer_id: String,
    /// Creation time in milliseconds since the epoch
    pub created_ts: i64,
    pub signature: String,
    /// Local display flag, not covered by the signature
    #[serde(default)]
    pub hidden: bool,
}

impl AddressBookEntry {
    /// Create an entry signed by the local identity
    pub fn signed(
        address: &str,
        label: &str,
        messaging: &TrustedMessaging,
        created_ts: i64,
    ) -> Result<Self, AddressBookError> {
        let copayer_id = messaging.identity_id();
        let signature = messaging.sign(&SignedFields {
            address,
            label,
            copayer_id: &copayer_id,
            created_ts,
        })?;

        Ok(Self {
            label: label.to_string(),
            copayer_id,
            created_ts,
            signature,
            hidden: false,
        })
    }

    /// Check the signature against the entry's author
    pub fn verify(&self, address: &str) -> bool {
        let fields = SignedFields {
            address,
            label: &self.label,
            copayer_id: &self.copayer_id,
            created_ts: self.created_ts,
        };
        TrustedMessaging::verify(&self.copayer_id, &fields, &self.signature)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressBook {
    entries: BTreeMap<String, AddressBookEntry>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a locally authored entry
    pub fn insert(
        &mut self,
        address: &str,
        entry: AddressBookEntry,
    ) -> Result<(), AddressBookError> {
        Address::parse(address)?;
        if self.entries.contains_key(address) {
            return Err(AddressBookError::AlreadyExists(address.to_string()));
        }
        self.entries.insert(address.to_string(), entry);
        Ok(())
    }

    /// Merge entries received from a peer
    ///
    /// Entries for known addresses, for addresses that are malformed or
    /// not on `network`, by non-members, or with a signature that does not
    /// verify are dropped. Returns the addresses added.
    pub fn merge<F>(
        &mut self,
        inbound: &BTreeMap<String, AddressBookEntry>,
        network: NetworkKind,
        is_member: F,
    ) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let mut added = Vec::new();
        for (address, entry) in inbound {
            if self.entries.contains_key(address) {
                continue;
            }
            match Address::parse(address) {
                Ok(parsed) if parsed.network == network => {}
                _ => {
                    debug!("Dropping address book entry for foreign address {}", address);
                    continue;
                }
            }
            if !is_member(&entry.copayer_id) || !entry.verify(address) {
                debug!("Dropping unverifiable address book entry for {}", address);
                continue;
            }

            let mut entry = entry.clone();
            entry.hidden = false;
            self.entries.insert(address.clone(), entry);
            added.push(address.clone());
        }
        added
    }

    /// Flip the hidden flag, returning the new value
    pub fn toggle(&mut self, address: &str) -> Result<bool, AddressBookError> {
        let entry = self
            .entries
            .get_mut(address)
            .ok_or_else(|| AddressBookError::UnknownEntry(address.to_string()))?;
        entry.hidden = !entry.hidden;
        Ok(entry.hidden)
    }

    pub fn get(&self, address: &str) -> Option<&AddressBookEntry> {
        self.entries.get(address)
    }

    pub fn entries(&self) -> &BTreeMap<String, AddressBookEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

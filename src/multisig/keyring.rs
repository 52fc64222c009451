//! Public key ring
//!
//! The shared, replicated set of copayer extended public keys plus the
//! per-copayer derivation indexes and backup confirmations. Merges are
//! monotonic unions: keys are never removed, indexes never go backwards,
//! and any conflicting input is rejected before anything is touched.

use crate::crypto::{ExtendedPublicKey, HdError};
use crate::multisig::address::NetworkKind;
use crate::multisig::script::{RedeemScript, ScriptError, MAX_MULTISIG_KEYS};
use crate::multisig::signer::copayer_id_for;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Highest index any branch may reach
pub const MAX_BRANCH_INDEX: u32 = 10_000;

/// Key ring errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyRingError {
    #[error("Invalid ring parameters: {0}")]
    InvalidParameters(String),
    #[error("Ring parameters differ: local {local}, remote {remote}")]
    ParameterMismatch { local: String, remote: String },
    #[error("Too many keys: {count} for a {total}-key ring")]
    TooManyKeys { count: usize, total: u8 },
    #[error("Key slot {0} does not match its key")]
    CorruptKey(String),
    #[error("Unknown copayer: {0}")]
    UnknownCopayer(String),
    #[error("Key ring is incomplete")]
    Incomplete,
    #[error("Index {index} of copayer {copayer} is past the limit {limit}")]
    IndexOutOfRange {
        copayer: String,
        index: u32,
        limit: u32,
    },
    #[error("Address {0} was not generated by this ring")]
    UnknownAddress(String),
    #[error("Derivation failed: {0}")]
    Derivation(#[from] HdError),
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),
}

/// Position of an address below the ring key: `cosigner/change/index`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HdPath {
    pub cosigner: u32,
    pub change: bool,
    pub index: u32,
}

impl HdPath {
    pub fn new(cosigner: u32, change: bool, index: u32) -> Self {
        Self {
            cosigner,
            change,
            index,
        }
    }

    pub fn to_indexes(&self) -> [u32; 3] {
        [self.cosigner, self.change as u32, self.index]
    }
}

impl fmt::Display for HdPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "m/45'/{}/{}/{}",
            self.cosigner, self.change as u32, self.index
        )
    }
}

/// A copayer's slot in the ring
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopayerKey {
    pub xpub: ExtendedPublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

/// Next unused index on each chain of one copayer branch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchIndexes {
    pub receive: u32,
    pub change: u32,
}

impl BranchIndexes {
    pub fn get(&self, change: bool) -> u32 {
        if change {
            self.change
        } else {
            self.receive
        }
    }

    /// Raise `change` chain to at least `next`
    pub fn advance(&mut self, change: bool, next: u32) -> bool {
        let slot = if change {
            &mut self.change
        } else {
            &mut self.receive
        };
        if next > *slot {
            *slot = next;
            true
        } else {
            false
        }
    }

    /// Per-chain maximum
    pub fn merge(&mut self, other: &BranchIndexes) -> bool {
        let receive = self.advance(false, other.receive);
        let change = self.advance(true, other.change);
        receive || change
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRing {
    network: NetworkKind,
    required: u8,
    total: u8,
    copayers: BTreeMap<String, CopayerKey>,
    #[serde(default)]
    indexes: BTreeMap<String, BranchIndexes>,
    #[serde(default)]
    backups: BTreeSet<String>,
    #[serde(skip)]
    cache: BTreeMap<HdPath, String>,
}

impl KeyRing {
    /// Create an empty M-of-N ring
    pub fn new(network: NetworkKind, required: u8, total: u8) -> Result<Self, KeyRingError> {
        check_parameters(required, total)?;
        Ok(Self {
            network,
            required,
            total,
            copayers: BTreeMap::new(),
            indexes: BTreeMap::new(),
            backups: BTreeSet::new(),
            cache: BTreeMap::new(),
        })
    }

    pub fn network(&self) -> NetworkKind {
        self.network
    }

    pub fn required(&self) -> u8 {
        self.required
    }

    pub fn total(&self) -> u8 {
        self.total
    }

    fn describe(&self) -> String {
        format!("{} {}-of-{}", self.network, self.required, self.total)
    }

    /// Structural checks for a ring received from a peer
    pub fn validate(&self) -> Result<(), KeyRingError> {
        check_parameters(self.required, self.total)?;
        if self.copayers.len() > self.total as usize {
            return Err(KeyRingError::TooManyKeys {
                count: self.copayers.len(),
                total: self.total,
            });
        }
        for (id, key) in &self.copayers {
            if copayer_id_for(&key.xpub)? != *id {
                return Err(KeyRingError::CorruptKey(id.clone()));
            }
        }
        let unknown = self
            .indexes
            .keys()
            .chain(self.backups.iter())
            .find(|id| !self.copayers.contains_key(*id));
        if let Some(id) = unknown {
            return Err(KeyRingError::UnknownCopayer(id.clone()));
        }
        Ok(())
    }

    /// Add a copayer key, returning its id
    ///
    /// Adding a key that is already present is a no-op.
    pub fn add_copayer(
        &mut self,
        xpub: ExtendedPublicKey,
        nickname: Option<String>,
    ) -> Result<String, KeyRingError> {
        let id = copayer_id_for(&xpub)?;
        if self.copayers.contains_key(&id) {
            return Ok(id);
        }
        if self.is_complete() {
            return Err(KeyRingError::TooManyKeys {
                count: self.copayers.len() + 1,
                total: self.total,
            });
        }

        self.copayers.insert(id.clone(), CopayerKey { xpub, nickname });
        self.indexes.entry(id.clone()).or_default();
        self.cache.clear();
        Ok(id)
    }

    /// Merge a peer's ring into this one
    ///
    /// Indexes may move at most `window` past ours. Returns whether
    /// anything changed. On error nothing is modified.
    pub fn merge(&mut self, other: &KeyRing, window: u32) -> Result<bool, KeyRingError> {
        other.validate()?;
        if other.network != self.network
            || other.required != self.required
            || other.total != self.total
        {
            return Err(KeyRingError::ParameterMismatch {
                local: self.describe(),
                remote: other.describe(),
            });
        }

        let mut new_keys = Vec::new();
        for (id, key) in &other.copayers {
            match self.copayers.get(id) {
                Some(existing) if existing.xpub != key.xpub => {
                    return Err(KeyRingError::CorruptKey(id.clone()));
                }
                Some(_) => {}
                None => new_keys.push((id.clone(), key.clone())),
            }
        }
        let count = self.copayers.len() + new_keys.len();
        if count > self.total as usize {
            return Err(KeyRingError::TooManyKeys {
                count,
                total: self.total,
            });
        }
        self.check_indexes(&other.indexes, window)?;

        let mut changed = !new_keys.is_empty();
        if changed {
            self.cache.clear();
        }
        for (id, key) in new_keys {
            self.copayers.insert(id, key);
        }
        for (id, key) in &other.copayers {
            if let Some(local) = self.copayers.get_mut(id) {
                if local.nickname.is_none() && key.nickname.is_some() {
                    local.nickname = key.nickname.clone();
                    changed = true;
                }
            }
        }
        for id in self.copayers.keys() {
            self.indexes.entry(id.clone()).or_default();
        }

        changed |= self.merge_indexes(&other.indexes, window)?;
        for id in &other.backups {
            changed |= self.backups.insert(id.clone());
        }

        Ok(changed)
    }

    /// Every index of a known copayer stays within `window` of ours and
    /// below `MAX_BRANCH_INDEX`
    pub fn check_indexes(
        &self,
        indexes: &BTreeMap<String, BranchIndexes>,
        window: u32,
    ) -> Result<(), KeyRingError> {
        for (id, remote) in indexes {
            if !self.copayers.contains_key(id) {
                continue;
            }
            for change in [false, true] {
                let limit = self
                    .index_for(id, change)
                    .saturating_add(window)
                    .min(MAX_BRANCH_INDEX);
                let index = remote.get(change);
                if index > limit {
                    return Err(KeyRingError::IndexOutOfRange {
                        copayer: id.clone(),
                        index,
                        limit,
                    });
                }
            }
        }
        Ok(())
    }

    /// Advance indexes of known copayers to the per-chain maximum
    ///
    /// Nothing moves if any index fails `check_indexes`.
    pub fn merge_indexes(
        &mut self,
        indexes: &BTreeMap<String, BranchIndexes>,
        window: u32,
    ) -> Result<bool, KeyRingError> {
        self.check_indexes(indexes, window)?;
        let mut changed = false;
        for (id, remote) in indexes {
            if !self.copayers.contains_key(id) {
                continue;
            }
            changed |= self.indexes.entry(id.clone()).or_default().merge(remote);
        }
        Ok(changed)
    }

    pub fn indexes(&self) -> &BTreeMap<String, BranchIndexes> {
        &self.indexes
    }

    pub fn index_for(&self, copayer_id: &str, change: bool) -> u32 {
        self.indexes
            .get(copayer_id)
            .map(|i| i.get(change))
            .unwrap_or(0)
    }

    pub fn advance_index(&mut self, copayer_id: &str, change: bool, next: u32) -> bool {
        if !self.copayers.contains_key(copayer_id) {
            return false;
        }
        self.indexes
            .entry(copayer_id.to_string())
            .or_default()
            .advance(change, next.min(MAX_BRANCH_INDEX))
    }

    /// All N keys are known
    pub fn is_complete(&self) -> bool {
        self.copayers.len() == self.total as usize
    }

    pub fn is_fully_backed_up(&self) -> bool {
        self.is_complete() && self.copayers.keys().all(|id| self.backups.contains(id))
    }

    pub fn is_backed_up(&self, copayer_id: &str) -> bool {
        self.backups.contains(copayer_id)
    }

    pub fn set_backup_ready(&mut self, copayer_id: &str) -> Result<bool, KeyRingError> {
        if !self.copayers.contains_key(copayer_id) {
            return Err(KeyRingError::UnknownCopayer(copayer_id.to_string()));
        }
        Ok(self.backups.insert(copayer_id.to_string()))
    }

    pub fn contains(&self, copayer_id: &str) -> bool {
        self.copayers.contains_key(copayer_id)
    }

    pub fn copayer_ids(&self) -> Vec<String> {
        self.copayers.keys().cloned().collect()
    }

    pub fn copayer_count(&self) -> usize {
        self.copayers.len()
    }

    pub fn nickname(&self, copayer_id: &str) -> Option<&str> {
        self.copayers
            .get(copayer_id)
            .and_then(|key| key.nickname.as_deref())
    }

    /// Position of the copayer in the sorted ring, used as BIP45 cosigner index
    pub fn cosigner_index(&self, copayer_id: &str) -> Option<u32> {
        self.copayers
            .keys()
            .position(|id| id == copayer_id)
            .map(|pos| pos as u32)
    }

    fn public_keys_at(&self, path: &HdPath) -> Result<Vec<(String, String)>, KeyRingError> {
        if !self.is_complete() {
            return Err(KeyRingError::Incomplete);
        }
        let indexes = path.to_indexes();
        self.copayers
            .iter()
            .map(|(id, key)| {
                let child = key.xpub.derive_path(&indexes)?;
                Ok((id.clone(), child.public_key_hex()))
            })
            .collect::<Result<Vec<_>, HdError>>()
            .map_err(KeyRingError::from)
    }

    /// Redeem script of the address at `path`
    pub fn redeem_script_for(&self, path: &HdPath) -> Result<RedeemScript, KeyRingError> {
        let keys = self
            .public_keys_at(path)?
            .into_iter()
            .map(|(_, pk)| pk)
            .collect();
        Ok(RedeemScript::new(self.required, keys)?)
    }

    pub fn derive_address(&self, path: &HdPath) -> Result<String, KeyRingError> {
        Ok(self
            .redeem_script_for(path)?
            .address(self.network)
            .to_string())
    }

    /// The copayer owning `public_key` at `path`
    pub fn copayer_for_pubkey_at(
        &self,
        path: &HdPath,
        public_key: &str,
    ) -> Result<Option<String>, KeyRingError> {
        Ok(self
            .public_keys_at(path)?
            .into_iter()
            .find(|(_, pk)| pk == public_key)
            .map(|(id, _)| id))
    }

    /// Derive the next address on a copayer's chain and advance its index
    pub fn generate_address(
        &mut self,
        copayer_id: &str,
        change: bool,
    ) -> Result<(HdPath, String), KeyRingError> {
        let cosigner = self
            .cosigner_index(copayer_id)
            .ok_or_else(|| KeyRingError::UnknownCopayer(copayer_id.to_string()))?;
        let index = self.index_for(copayer_id, change);
        if index >= MAX_BRANCH_INDEX {
            return Err(KeyRingError::IndexOutOfRange {
                copayer: copayer_id.to_string(),
                index,
                limit: MAX_BRANCH_INDEX,
            });
        }
        let path = HdPath::new(cosigner, change, index);
        let address = self.derive_address(&path)?;

        self.advance_index(copayer_id, change, index + 1);
        self.cache.insert(path, address.clone());
        Ok((path, address))
    }

    /// Paths of every generated address, branch by branch
    pub fn address_paths(&self) -> impl Iterator<Item = HdPath> + '_ {
        self.copayers
            .keys()
            .enumerate()
            .flat_map(move |(cosigner, id)| {
                let indexes = self.indexes.get(id).copied().unwrap_or_default();
                let cosigner = cosigner as u32;
                (0..indexes.receive)
                    .map(move |index| HdPath::new(cosigner, false, index))
                    .chain((0..indexes.change).map(move |index| HdPath::new(cosigner, true, index)))
            })
    }

    /// Address at `path`, derived once
    pub fn address_at(&mut self, path: HdPath) -> Result<String, KeyRingError> {
        if let Some(address) = self.cache.get(&path) {
            return Ok(address.clone());
        }
        let address = self.derive_address(&path)?;
        self.cache.insert(path, address.clone());
        Ok(address)
    }

    /// Every generated address on every branch, with its path
    pub fn addresses(&mut self) -> Result<Vec<(HdPath, String)>, KeyRingError> {
        let paths: Vec<HdPath> = self.address_paths().collect();
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            out.push((path, self.address_at(path)?));
        }
        Ok(out)
    }

    pub fn path_for_address(&mut self, address: &str) -> Result<Option<HdPath>, KeyRingError> {
        let paths: Vec<HdPath> = self.address_paths().collect();
        for path in paths {
            if self.address_at(path)? == address {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

fn check_parameters(required: u8, total: u8) -> Result<(), KeyRingError> {
    if required == 0 || required > total || total as usize > MAX_MULTISIG_KEYS {
        return Err(KeyRingError::InvalidParameters(format!(
            "{}-of-{}",
            required, total
        )));
    }
    Ok(())
}

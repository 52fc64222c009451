//! Local signing capability
//!
//! The copayer's master HD key. Everything the other copayers need is
//! derived from it: the ring key at `m/45'`, the copayer id and the
//! message-signing identity.

use crate::crypto::{ExtendedPrivateKey, ExtendedPublicKey, HdError, KeyPair, HARDENED};
use crate::multisig::keyring::HdPath;
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};

/// Purpose index of the shared multisig branch
pub const PURPOSE: u32 = 45;

/// Branch of the identity key below the ring key
pub const IDENTITY_BRANCH: u32 = 2_147_483_646;

/// Path of the identity key relative to the ring key
pub const IDENTITY_PATH: [u32; 3] = [IDENTITY_BRANCH, 0, 0];

/// Copayer id: the identity public key derived from a ring key
pub fn copayer_id_for(xpub: &ExtendedPublicKey) -> Result<String, HdError> {
    Ok(xpub.derive_path(&IDENTITY_PATH)?.public_key_hex())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CopayerSigner {
    master: ExtendedPrivateKey,
}

impl CopayerSigner {
    pub fn new(master: ExtendedPrivateKey) -> Self {
        Self { master }
    }

    /// Fresh random signer
    pub fn generate() -> Self {
        Self::new(ExtendedPrivateKey::generate())
    }

    fn branch(&self) -> Result<ExtendedPrivateKey, HdError> {
        self.master.derive_child(PURPOSE + HARDENED)
    }

    /// Extended public key contributed to the ring
    pub fn xpub(&self) -> Result<ExtendedPublicKey, HdError> {
        Ok(self.branch()?.public_key())
    }

    pub fn copayer_id(&self) -> Result<String, HdError> {
        copayer_id_for(&self.xpub()?)
    }

    /// Key used to sign gossip and transport handshakes
    pub fn identity_key_pair(&self) -> Result<KeyPair, HdError> {
        Ok(self.branch()?.derive_path(&IDENTITY_PATH)?.key_pair())
    }

    /// Private keys for the given address paths
    pub fn keys_for_paths(&self, paths: &[HdPath]) -> Result<Vec<SecretKey>, HdError> {
        let branch = self.branch()?;
        let mut keys = Vec::with_capacity(paths.len());
        for path in paths {
            let key = branch.derive_path(&path.to_indexes())?;
            if !keys.contains(key.secret_key()) {
                keys.push(*key.secret_key());
            }
        }
        Ok(keys)
    }
}

impl TryFrom<String> for CopayerSigner {
    type Error = HdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Self::new(ExtendedPrivateKey::from_hex(&value)?))
    }
}

impl From<CopayerSigner> for String {
    fn from(signer: CopayerSigner) -> Self {
        signer.master.to_hex()
    }
}

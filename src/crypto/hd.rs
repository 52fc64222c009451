//! Hierarchical-deterministic keys (BIP32)
//!
//! Child-key derivation with HMAC-SHA512. Copayers only ever exchange
//! extended *public* keys; extended private keys never leave the local
//! signer.

use crate::crypto::keys::KeyPair;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::fmt;
use thiserror::Error;

type HmacSha512 = Hmac<Sha512>;

/// Offset of hardened child indexes
pub const HARDENED: u32 = 0x8000_0000;

/// HMAC key for master key generation
const MASTER_KEY_SALT: &[u8] = b"Bitcoin seed";

/// HD derivation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HdError {
    #[error("Seed must be between 16 and 64 bytes")]
    InvalidSeed,
    #[error("Invalid extended key encoding: {0}")]
    InvalidEncoding(String),
    #[error("Cannot derive hardened child {0} from a public key")]
    HardenedFromPublic(u32),
    #[error("Child {0} is not a valid key")]
    InvalidChild(u32),
}

fn hmac_sha512(key: &[u8], data: &[u8]) -> Result<([u8; 32], [u8; 32]), HdError> {
    let mut mac = HmacSha512::new_from_slice(key).map_err(|_| HdError::InvalidSeed)?;
    mac.update(data);
    let out = mac.finalize().into_bytes();

    let mut left = [0u8; 32];
    let mut right = [0u8; 32];
    left.copy_from_slice(&out[..32]);
    right.copy_from_slice(&out[32..]);
    Ok((left, right))
}

/// Extended private key: secret scalar plus chain code
#[derive(Clone, PartialEq, Eq)]
pub struct ExtendedPrivateKey {
    secret_key: SecretKey,
    chain_code: [u8; 32],
}

impl fmt::Debug for ExtendedPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedPrivateKey")
            .field("public", &self.public_key().public_key_hex())
            .finish_non_exhaustive()
    }
}

impl ExtendedPrivateKey {
    /// Master key from seed bytes
    pub fn from_seed(seed: &[u8]) -> Result<Self, HdError> {
        if seed.len() < 16 || seed.len() > 64 {
            return Err(HdError::InvalidSeed);
        }

        let (left, chain_code) = hmac_sha512(MASTER_KEY_SALT, seed)?;
        let secret_key = SecretKey::from_slice(&left).map_err(|_| HdError::InvalidSeed)?;

        Ok(Self {
            secret_key,
            chain_code,
        })
    }

    /// Fresh master key from OS randomness
    pub fn generate() -> Self {
        loop {
            let mut seed = [0u8; 32];
            OsRng.fill_bytes(&mut seed);
            // Invalid master keys have probability ~2^-127
            if let Ok(key) = Self::from_seed(&seed) {
                return key;
            }
        }
    }

    /// Derive a child key (hardened when `index >= HARDENED`)
    pub fn derive_child(&self, index: u32) -> Result<Self, HdError> {
        let secp = Secp256k1::new();

        let mut data = Vec::with_capacity(37);
        if index >= HARDENED {
            data.push(0);
            data.extend_from_slice(&self.secret_key.secret_bytes());
        } else {
            data.extend_from_slice(&PublicKey::from_secret_key(&secp, &self.secret_key).serialize());
        }
        data.extend_from_slice(&index.to_be_bytes());

        let (left, chain_code) = hmac_sha512(&self.chain_code, &data)?;
        let tweak = Scalar::from_be_bytes(left).map_err(|_| HdError::InvalidChild(index))?;
        let secret_key = self
            .secret_key
            .add_tweak(&tweak)
            .map_err(|_| HdError::InvalidChild(index))?;

        Ok(Self {
            secret_key,
            chain_code,
        })
    }

    /// Derive along a sequence of child indexes
    pub fn derive_path(&self, path: &[u32]) -> Result<Self, HdError> {
        path.iter()
            .try_fold(self.clone(), |key, index| key.derive_child(*index))
    }

    /// The matching extended public key
    pub fn public_key(&self) -> ExtendedPublicKey {
        let secp = Secp256k1::new();
        ExtendedPublicKey {
            public_key: PublicKey::from_secret_key(&secp, &self.secret_key),
            chain_code: self.chain_code,
        }
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub fn key_pair(&self) -> KeyPair {
        KeyPair::from_secret_key(self.secret_key)
    }

    /// Hex of `chain_code || secret`
    pub fn to_hex(&self) -> String {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&self.chain_code);
        bytes.extend_from_slice(&self.secret_key.secret_bytes());
        hex::encode(bytes)
    }

    pub fn from_hex(encoded: &str) -> Result<Self, HdError> {
        let bytes = hex::decode(encoded).map_err(|e| HdError::InvalidEncoding(e.to_string()))?;
        if bytes.len() != 64 {
            return Err(HdError::InvalidEncoding(format!(
                "expected 64 bytes, got {}",
                bytes.len()
            )));
        }

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&bytes[..32]);
        let secret_key = SecretKey::from_slice(&bytes[32..])
            .map_err(|e| HdError::InvalidEncoding(e.to_string()))?;

        Ok(Self {
            secret_key,
            chain_code,
        })
    }
}

/// Extended public key: point plus chain code
///
/// Serialized as hex of `chain_code || compressed point`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExtendedPublicKey {
    public_key: PublicKey,
    chain_code: [u8; 32],
}

impl ExtendedPublicKey {
    /// Derive a non-hardened child key
    pub fn derive_child(&self, index: u32) -> Result<Self, HdError> {
        if index >= HARDENED {
            return Err(HdError::HardenedFromPublic(index));
        }

        let secp = Secp256k1::new();
        let mut data = Vec::with_capacity(37);
        data.extend_from_slice(&self.public_key.serialize());
        data.extend_from_slice(&index.to_be_bytes());

        let (left, chain_code) = hmac_sha512(&self.chain_code, &data)?;
        let tweak = Scalar::from_be_bytes(left).map_err(|_| HdError::InvalidChild(index))?;
        let public_key = self
            .public_key
            .add_exp_tweak(&secp, &tweak)
            .map_err(|_| HdError::InvalidChild(index))?;

        Ok(Self {
            public_key,
            chain_code,
        })
    }

    pub fn derive_path(&self, path: &[u32]) -> Result<Self, HdError> {
        path.iter()
            .try_fold(self.clone(), |key, index| key.derive_child(*index))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    pub fn to_hex(&self) -> String {
        let mut bytes = Vec::with_capacity(65);
        bytes.extend_from_slice(&self.chain_code);
        bytes.extend_from_slice(&self.public_key.serialize());
        hex::encode(bytes)
    }

    pub fn from_hex(encoded: &str) -> Result<Self, HdError> {
        let bytes = hex::decode(encoded).map_err(|e| HdError::InvalidEncoding(e.to_string()))?;
        if bytes.len() != 65 {
            return Err(HdError::InvalidEncoding(format!(
                "expected 65 bytes, got {}",
                bytes.len()
            )));
        }

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&bytes[..32]);
        let public_key = PublicKey::from_slice(&bytes[32..])
            .map_err(|e| HdError::InvalidEncoding(e.to_string()))?;

        Ok(Self {
            public_key,
            chain_code,
        })
    }
}

impl TryFrom<String> for ExtendedPublicKey {
    type Error = HdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<ExtendedPublicKey> for String {
    fn from(key: ExtendedPublicKey) -> Self {
        key.to_hex()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bip32_master_vector() {
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let master = ExtendedPrivateKey::from_seed(&seed).unwrap();
        let xpub = master.public_key();

        assert_eq!(
            xpub.public_key_hex(),
            "0339a36013301597daef41fbe593a02cc513d0b55527ec2df1050e2e8ff49c85c2"
        );
        assert!(xpub
            .to_hex()
            .starts_with("873dff81c02f525623fd1fe5167eac3a55a049de3d314bb42ee227ffed37d508"));
    }

    #[test]
    fn test_public_derivation_matches_private() {
        let master = ExtendedPrivateKey::generate();
        let branch = master.derive_child(45 + HARDENED).unwrap();

        let from_private = branch.derive_path(&[0, 1, 7]).unwrap().public_key();
        let from_public = branch.public_key().derive_path(&[0, 1, 7]).unwrap();
        assert_eq!(from_private, from_public);
    }

    #[test]
    fn test_hardened_from_public_fails() {
        let xpub = ExtendedPrivateKey::generate().public_key();
        assert_eq!(
            xpub.derive_child(HARDENED + 1),
            Err(HdError::HardenedFromPublic(HARDENED + 1))
        );
    }

    #[test]
    fn test_hex_encoding() {
        let master = ExtendedPrivateKey::generate();
        let restored = ExtendedPrivateKey::from_hex(&master.to_hex()).unwrap();
        assert_eq!(master, restored);

        let xpub = master.public_key();
        let json = serde_json::to_string(&xpub).unwrap();
        let decoded: ExtendedPublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(xpub, decoded);

        assert!(ExtendedPublicKey::from_hex("abcd").is_err());
    }
}

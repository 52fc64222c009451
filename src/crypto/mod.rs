//! Cryptographic primitives
//!
//! This module provides:
//! - SHA-256 / HASH160 digests
//! - Base58Check encoding
//! - ECDSA key management (secp256k1)
//! - BIP32 hierarchical-deterministic keys
//! - Signed gossip payloads

pub mod base58;
pub mod hash;
pub mod hd;
pub mod keys;
pub mod trusted;

pub use base58::{decode_check, encode_check, Base58Error};
pub use hash::{double_sha256, double_sha256_hex, hash160, sha256, sha256_hex};
pub use hd::{ExtendedPrivateKey, ExtendedPublicKey, HdError, HARDENED};
pub use keys::{
    public_key_from_hex, sign_compact, sign_der, verify_compact, verify_der, KeyError, KeyPair,
};
pub use trusted::{canonical_encoding, TrustedError, TrustedMessaging};

//! Signed gossip payloads
//!
//! Payloads relayed between copayers (address-book entries, transport
//! hellos) carry a signature by the author's identity key. The signed bytes
//! are a canonical JSON encoding: object keys sorted, no whitespace, so every
//! copayer recomputes exactly the same digest from the same fields.

use crate::crypto::hash::sha256;
use crate::crypto::keys::{public_key_from_hex, verify_compact, KeyPair};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while producing a signature
#[derive(Error, Debug)]
pub enum TrustedError {
    #[error("Payload cannot be encoded: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Signing failed: {0}")]
    Signing(#[from] crate::crypto::KeyError),
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key, canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Stable byte encoding of a payload
pub fn canonical_encoding<T: Serialize>(payload: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = canonicalize(serde_json::to_value(payload)?);
    serde_json::to_vec(&value)
}

/// Signs payloads with the local copayer identity
#[derive(Clone, Debug)]
pub struct TrustedMessaging {
    identity: KeyPair,
}

impl TrustedMessaging {
    pub fn new(identity: KeyPair) -> Self {
        Self { identity }
    }

    /// Hex id of the signing identity (compressed public key)
    pub fn identity_id(&self) -> String {
        self.identity.public_key_hex()
    }

    /// Sign the canonical encoding of `payload`, returning hex
    pub fn sign<T: Serialize>(&self, payload: &T) -> Result<String, TrustedError> {
        let digest = sha256(&canonical_encoding(payload)?);
        let signature = self.identity.sign(&digest)?;
        Ok(hex::encode(signature))
    }

    /// Verify `signature` over `payload` against the claimed sender identity
    ///
    /// Any malformed input (bad hex, bad key, bad signature) is simply `false`.
    pub fn verify<T: Serialize>(sender_id: &str, payload: &T, signature: &str) -> bool {
        let Ok(public_key) = public_key_from_hex(sender_id) else {
            return false;
        };
        let Ok(signature) = hex::decode(signature) else {
            return false;
        };
        let Ok(encoded) = canonical_encoding(payload) else {
            return false;
        };

        let digest = sha256(&encoded);
        verify_compact(&public_key, &digest, &signature).unwrap_or(false)
    }
}

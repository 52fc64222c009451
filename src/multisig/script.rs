//! Multisig redeem scripts
//!
//! `OP_M <pubkey_1> ... <pubkey_N> OP_N OP_CHECKMULTISIG` with the public
//! keys sorted, so every copayer derives the same script and P2SH address
//! from the same set of keys.

use crate::crypto::public_key_from_hex;
use crate::multisig::address::{Address, NetworkKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest N allowed in a standard bare multisig script
pub const MAX_MULTISIG_KEYS: usize = 15;

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_1: u8 = 0x51;
const OP_CHECKMULTISIG: u8 = 0xae;

/// Errors related to redeem scripts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),
    #[error("Too many keys for a multisig script: {0}")]
    TooManyKeys(usize),
    #[error("Duplicate public key in script")]
    DuplicateKey,
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// Append a minimal push of `data` to a script
pub(crate) fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(OP_0),
        len if len < OP_PUSHDATA1 as usize => script.push(len as u8),
        len if len <= 0xff => {
            script.push(OP_PUSHDATA1);
            script.push(len as u8);
        }
        len => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(len as u16).to_le_bytes());
        }
    }
    if !data.is_empty() {
        script.extend_from_slice(data);
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRedeemScript {
    threshold: u8,
    public_keys: Vec<String>,
}

/// M-of-N redeem script
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRedeemScript", into = "RawRedeemScript")]
pub struct RedeemScript {
    threshold: u8,
    public_keys: Vec<String>,
}

impl RedeemScript {
    /// Validate and sort the keys of an M-of-N script
    pub fn new(threshold: u8, public_keys: Vec<String>) -> Result<Self, ScriptError> {
        if threshold == 0 {
            return Err(ScriptError::InvalidThreshold(
                "threshold must be at least 1".to_string(),
            ));
        }
        if public_keys.len() > MAX_MULTISIG_KEYS {
            return Err(ScriptError::TooManyKeys(public_keys.len()));
        }
        if threshold as usize > public_keys.len() {
            return Err(ScriptError::InvalidThreshold(format!(
                "threshold {} exceeds key count {}",
                threshold,
                public_keys.len()
            )));
        }

        let mut sorted = Vec::with_capacity(public_keys.len());
        for key in public_keys {
            let parsed = public_key_from_hex(&key)
                .map_err(|_| ScriptError::InvalidPublicKey(key.clone()))?;
            sorted.push(hex::encode(parsed.serialize()));
        }
        sorted.sort();
        if sorted.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(ScriptError::DuplicateKey);
        }

        Ok(Self {
            threshold,
            public_keys: sorted,
        })
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn total(&self) -> usize {
        self.public_keys.len()
    }

    pub fn public_keys(&self) -> &[String] {
        &self.public_keys
    }

    pub fn contains(&self, public_key: &str) -> bool {
        self.public_keys.iter().any(|k| k == public_key)
    }

    /// Serialized script bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut script = Vec::with_capacity(3 + self.public_keys.len() * 34);
        script.push(OP_1 + self.threshold - 1);
        for key in &self.public_keys {
            // Keys were validated on construction
            let bytes = hex::decode(key).unwrap_or_default();
            push_data(&mut script, &bytes);
        }
        script.push(OP_1 + self.public_keys.len() as u8 - 1);
        script.push(OP_CHECKMULTISIG);
        script
    }

    /// P2SH address of this script on `network`
    pub fn address(&self, network: NetworkKind) -> Address {
        Address::for_script(network, &self.to_bytes())
    }

    /// Upper bound of a fully signed script-sig spending this script
    pub fn estimated_script_sig_size(&self) -> usize {
        let script_len = self.to_bytes().len();
        // OP_0 + M * (push + 72-byte DER + sighash) + push of the script
        1 + self.threshold as usize * 74 + 3 + script_len
    }

    /// Get description like "2-of-3"
    pub fn description(&self) -> String {
        format!("{}-of-{}", self.threshold, self.public_keys.len())
    }
}

impl TryFrom<RawRedeemScript> for RedeemScript {
    type Error = ScriptError;

    fn try_from(raw: RawRedeemScript) -> Result<Self, Self::Error> {
        RedeemScript::new(raw.threshold, raw.public_keys)
    }
}

impl From<RedeemScript> for RawRedeemScript {
    fn from(script: RedeemScript) -> Self {
        RawRedeemScript {
            threshold: script.threshold,
            public_keys: script.public_keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn sample_pubkeys(n: usize) -> Vec<String> {
        (0..n).map(|_| KeyPair::generate().public_key_hex()).collect()
    }

    #[test]
    fn test_script_creation() {
        let script = RedeemScript::new(2, sample_pubkeys(3)).unwrap();
        assert_eq!(script.threshold(), 2);
        assert_eq!(script.total(), 3);
        assert_eq!(script.description(), "2-of-3");

        let bytes = script.to_bytes();
        assert_eq!(bytes.len(), 1 + 3 * 34 + 2);
        assert_eq!(bytes[0], 0x52);
        assert_eq!(bytes[bytes.len() - 2], 0x53);
        assert_eq!(bytes[bytes.len() - 1], OP_CHECKMULTISIG);
    }

    #[test]
    fn test_validation() {
        assert!(RedeemScript::new(0, sample_pubkeys(3)).is_err());
        assert!(RedeemScript::new(4, sample_pubkeys(3)).is_err());
        assert_eq!(
            RedeemScript::new(1, sample_pubkeys(16)),
            Err(ScriptError::TooManyKeys(16))
        );

        let key = KeyPair::generate().public_key_hex();
        assert_eq!(
            RedeemScript::new(1, vec![key.clone(), key]),
            Err(ScriptError::DuplicateKey)
        );
        assert!(matches!(
            RedeemScript::new(1, vec!["zz".to_string()]),
            Err(ScriptError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_address_determinism() {
        let mut keys = sample_pubkeys(3);
        let a = RedeemScript::new(2, keys.clone()).unwrap();
        keys.reverse();
        let b = RedeemScript::new(2, keys).unwrap();

        // Key order does not matter
        assert_eq!(
            a.address(NetworkKind::Testnet),
            b.address(NetworkKind::Testnet)
        );
        assert!(a.address(NetworkKind::Livenet).to_string().starts_with('3'));
    }

    #[test]
    fn test_serde_validates() {
        let script = RedeemScript::new(2, sample_pubkeys(2)).unwrap();
        let json = serde_json::to_string(&script).unwrap();
        let decoded: RedeemScript = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, script);

        let bad = r#"{"threshold":3,"publicKeys":[]}"#;
        assert!(serde_json::from_str::<RedeemScript>(bad).is_err());
    }

    #[test]
    fn test_push_data_lengths() {
        let mut script = Vec::new();
        push_data(&mut script, &[0u8; 33]);
        assert_eq!(script[0], 33);

        let mut script = Vec::new();
        push_data(&mut script, &[0u8; 105]);
        assert_eq!(&script[..2], &[OP_PUSHDATA1, 105]);

        let mut script = Vec::new();
        push_data(&mut script, &[0u8; 300]);
        assert_eq!(&script[..3], &[OP_PUSHDATA2, 0x2c, 0x01]);
    }
}

//! Partially signed multisig transactions
//!
//! A `PartialTx` spends P2SH multisig outputs. Each input carries the redeem
//! script it spends and the signatures collected so far, keyed by the
//! signing public key. Signatures are only ever added after verification,
//! so the map of every input holds valid signatures only.

use crate::crypto::{double_sha256, public_key_from_hex, sign_der, verify_der, KeyError};
use crate::multisig::address::{Address, AddressError};
use crate::multisig::script::{push_data, RedeemScript};
use bytes::BufMut;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Signature hash type appended to every input signature
pub const SIGHASH_ALL: u8 = 0x01;

/// Default fee rate in satoshis per started kilobyte
pub const DEFAULT_FEE_PER_KB: u64 = 10_000;

/// Change outputs smaller than this are folded into the fee
pub const DUST_THRESHOLD: u64 = 5_430;

/// Every satoshi that will ever exist
pub const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

const DEFAULT_SEQUENCE: u32 = 0xffff_ffff;

/// Transaction errors
#[derive(Error, Debug)]
pub enum TxError {
    #[error("Input {0} does not exist")]
    InputOutOfRange(usize),
    #[error("Invalid output address: {0}")]
    Address(#[from] AddressError),
    #[error("Invalid transaction id: {0}")]
    InvalidTxid(String),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Transactions differ: expected {expected}, found {found}")]
    Mismatch { expected: String, found: String },
    #[error("Invalid signature on input {input} for key {public_key}")]
    InvalidSignature { input: usize, public_key: String },
    #[error("Transaction has no inputs")]
    NoInputs,
}

/// Reference to a previous transaction output
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: String,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }
}

/// Input spending a multisig output
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInput {
    pub outpoint: OutPoint,
    /// Value of the spent output in satoshis
    pub amount: u64,
    /// Address of the spent output
    pub address: String,
    pub redeem_script: RedeemScript,
    /// public key hex -> DER signature + hashtype, hex
    #[serde(default)]
    pub signatures: BTreeMap<String, String>,
    pub sequence: u32,
}

impl TxInput {
    pub fn new(
        outpoint: OutPoint,
        amount: u64,
        address: impl Into<String>,
        redeem_script: RedeemScript,
    ) -> Self {
        Self {
            outpoint,
            amount,
            address: address.into(),
            redeem_script,
            signatures: BTreeMap::new(),
            sequence: DEFAULT_SEQUENCE,
        }
    }

    /// Script-sig once signatures exist: `OP_0 <sig...> <redeemScript>`
    fn script_sig(&self) -> Vec<u8> {
        if self.signatures.is_empty() {
            return Vec::new();
        }

        let mut script = vec![0x00];
        // CHECKMULTISIG expects signatures in public key order
        let ordered = self
            .redeem_script
            .public_keys()
            .iter()
            .filter_map(|pk| self.signatures.get(pk))
            .take(self.redeem_script.threshold() as usize);
        for signature in ordered {
            push_data(&mut script, &hex::decode(signature).unwrap_or_default());
        }
        push_data(&mut script, &self.redeem_script.to_bytes());
        script
    }

    pub fn is_fully_signed(&self) -> bool {
        self.signatures.len() >= self.redeem_script.threshold() as usize
    }
}

/// Transaction output
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount: u64,
}

impl TxOutput {
    pub fn new(address: impl Into<String>, amount: u64) -> Self {
        Self {
            address: address.into(),
            amount,
        }
    }
}

/// A transaction collecting multisig signatures
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialTx {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

fn write_varint(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.put_u8(n as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(n as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(n as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(n);
        }
    }
}

fn txid_bytes(txid: &str) -> Result<[u8; 32], TxError> {
    let bytes = hex::decode(txid).map_err(|_| TxError::InvalidTxid(txid.to_string()))?;
    if bytes.len() != 32 {
        return Err(TxError::InvalidTxid(txid.to_string()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    // Transaction ids are displayed byte-reversed
    out.reverse();
    Ok(out)
}

impl PartialTx {
    /// Create a new unsigned transaction
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: 1,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    fn serialize_with<F>(&self, script_sig: F) -> Result<Vec<u8>, TxError>
    where
        F: Fn(usize, &TxInput) -> Vec<u8>,
    {
        let mut buf = Vec::with_capacity(self.estimated_size());
        buf.put_u32_le(self.version);

        write_varint(&mut buf, self.inputs.len() as u64);
        for (i, input) in self.inputs.iter().enumerate() {
            buf.put_slice(&txid_bytes(&input.outpoint.txid)?);
            buf.put_u32_le(input.outpoint.vout);
            let script = script_sig(i, input);
            write_varint(&mut buf, script.len() as u64);
            buf.put_slice(&script);
            buf.put_u32_le(input.sequence);
        }

        write_varint(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.put_u64_le(output.amount);
            let script = Address::parse(&output.address)?.script_pubkey();
            write_varint(&mut buf, script.len() as u64);
            buf.put_slice(&script);
        }

        buf.put_u32_le(self.lock_time);
        Ok(buf)
    }

    /// Legacy SIGHASH_ALL digest for input `index`
    pub fn sighash(&self, index: usize) -> Result<[u8; 32], TxError> {
        if index >= self.inputs.len() {
            return Err(TxError::InputOutOfRange(index));
        }

        let mut data = self.serialize_with(|i, input| {
            if i == index {
                input.redeem_script.to_bytes()
            } else {
                Vec::new()
            }
        })?;
        data.put_u32_le(SIGHASH_ALL as u32);
        Ok(double_sha256(&data))
    }

    /// Stable id that ignores script-sigs, so it does not change as
    /// signatures are collected
    pub fn ntxid(&self) -> Result<String, TxError> {
        let data = self.serialize_with(|_, _| Vec::new())?;
        Ok(hex::encode(double_sha256(&data)))
    }

    /// Fully serialized transaction with the collected script-sigs
    pub fn raw(&self) -> Result<Vec<u8>, TxError> {
        self.serialize_with(|_, input| input.script_sig())
    }

    pub fn raw_hex(&self) -> Result<String, TxError> {
        Ok(hex::encode(self.raw()?))
    }

    /// Network transaction id
    pub fn txid(&self) -> Result<String, TxError> {
        let mut hash = double_sha256(&self.raw()?);
        hash.reverse();
        Ok(hex::encode(hash))
    }

    /// Sign every input that one of `keys` belongs to
    ///
    /// Keys already present on an input are skipped. Returns the number of
    /// signatures added.
    pub fn sign(&mut self, keys: &[SecretKey]) -> Result<usize, TxError> {
        let secp = Secp256k1::new();
        let mut added = 0;

        for index in 0..self.inputs.len() {
            let sighash = self.sighash(index)?;
            for secret_key in keys {
                let public_key = hex::encode(PublicKey::from_secret_key(&secp, secret_key).serialize());
                let input = &self.inputs[index];
                if !input.redeem_script.contains(&public_key)
                    || input.signatures.contains_key(&public_key)
                {
                    continue;
                }

                let mut signature = sign_der(secret_key, &sighash)?;
                signature.push(SIGHASH_ALL);
                self.inputs[index]
                    .signatures
                    .insert(public_key, hex::encode(signature));
                added += 1;
            }
        }

        Ok(added)
    }

    /// Check one signature against input `index`
    pub fn verify_input_signature(&self, index: usize, public_key: &str, signature: &str) -> bool {
        let Some(input) = self.inputs.get(index) else {
            return false;
        };
        if !input.redeem_script.contains(public_key) {
            return false;
        }
        let Ok(key) = public_key_from_hex(public_key) else {
            return false;
        };
        let Ok(bytes) = hex::decode(signature) else {
            return false;
        };
        let Some((hash_type, der)) = bytes.split_last() else {
            return false;
        };
        if *hash_type != SIGHASH_ALL {
            return false;
        }
        let Ok(sighash) = self.sighash(index) else {
            return false;
        };

        verify_der(&key, &sighash, der).unwrap_or(false)
    }

    /// Import the signatures of `other` that this transaction lacks
    ///
    /// Both transactions must be the same (same ntxid and redeem scripts).
    /// Every imported signature is verified first; nothing is imported if
    /// any of them is invalid. Returns whether a signature was added.
    pub fn merge_signatures(&mut self, other: &PartialTx) -> Result<bool, TxError> {
        let expected = self.ntxid()?;
        let found = other.ntxid()?;
        if expected != found {
            return Err(TxError::Mismatch { expected, found });
        }

        let mut additions = Vec::new();
        for (index, (mine, theirs)) in self.inputs.iter().zip(&other.inputs).enumerate() {
            if mine.redeem_script != theirs.redeem_script {
                return Err(TxError::Mismatch {
                    expected: mine.redeem_script.description(),
                    found: theirs.redeem_script.description(),
                });
            }

            for (public_key, signature) in &theirs.signatures {
                if mine.signatures.contains_key(public_key) {
                    continue;
                }
                if !self.verify_input_signature(index, public_key, signature) {
                    return Err(TxError::InvalidSignature {
                        input: index,
                        public_key: public_key.clone(),
                    });
                }
                additions.push((index, public_key.clone(), signature.clone()));
            }
        }

        let changed = !additions.is_empty();
        for (index, public_key, signature) in additions {
            self.inputs[index].signatures.insert(public_key, signature);
        }
        Ok(changed)
    }

    /// Copy of this transaction with every signature removed
    pub fn strip_signatures(&self) -> PartialTx {
        let mut stripped = self.clone();
        for input in &mut stripped.inputs {
            input.signatures.clear();
        }
        stripped
    }

    /// Total number of signatures over all inputs
    pub fn signature_count(&self) -> usize {
        self.inputs.iter().map(|i| i.signatures.len()).sum()
    }

    /// Every input carries at least its threshold of signatures
    pub fn is_complete(&self) -> bool {
        !self.inputs.is_empty() && self.inputs.iter().all(TxInput::is_fully_signed)
    }

    pub fn input_total(&self) -> u64 {
        self.inputs.iter().fold(0, |sum, i| sum.saturating_add(i.amount))
    }

    pub fn output_total(&self) -> u64 {
        self.outputs.iter().fold(0, |sum, o| sum.saturating_add(o.amount))
    }

    pub fn fee(&self) -> u64 {
        self.input_total().saturating_sub(self.output_total())
    }

    /// Size estimate of the fully signed transaction in bytes
    pub fn estimated_size(&self) -> usize {
        let inputs: usize = self
            .inputs
            .iter()
            .map(|i| 41 + i.redeem_script.estimated_script_sig_size())
            .sum();
        10 + inputs + self.outputs.len() * 34
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::multisig::address::NetworkKind;

    const PREV_TXID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

    fn setup() -> (Vec<KeyPair>, PartialTx) {
        let keys: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let script =
            RedeemScript::new(2, keys.iter().map(|k| k.public_key_hex()).collect()).unwrap();
        let address = script.address(NetworkKind::Testnet).to_string();

        let input = TxInput::new(OutPoint::new(PREV_TXID, 0), 100_000, &address, script);
        let tx = PartialTx::new(vec![input], vec![TxOutput::new(&address, 90_000)]);
        (keys, tx)
    }

    #[test]
    fn test_serialization_layout() {
        let (_, tx) = setup();
        let raw = tx.raw_hex().unwrap();
        assert!(raw.starts_with("0100000001"));
        assert!(raw.ends_with("00000000"));
        assert_eq!(tx.fee(), 10_000);
    }

    #[test]
    fn test_signing_is_idempotent() {
        let (keys, mut tx) = setup();
        let ntxid = tx.ntxid().unwrap();

        assert_eq!(tx.sign(&[keys[0].secret_key]).unwrap(), 1);
        assert_eq!(tx.sign(&[keys[0].secret_key]).unwrap(), 0);
        assert_eq!(tx.signature_count(), 1);
        assert!(!tx.is_complete());

        // Signatures do not change the ntxid
        assert_eq!(tx.ntxid().unwrap(), ntxid);
    }

    #[test]
    fn test_foreign_key_does_not_sign() {
        let (_, mut tx) = setup();
        let stranger = KeyPair::generate();
        assert_eq!(tx.sign(&[stranger.secret_key]).unwrap(), 0);
    }

    #[test]
    fn test_merge_signatures() {
        let (keys, tx) = setup();

        let mut alice = tx.clone();
        alice.sign(&[keys[0].secret_key]).unwrap();
        let mut bob = tx.clone();
        bob.sign(&[keys[1].secret_key]).unwrap();

        let unsigned_txid = tx.txid().unwrap();
        assert!(alice.merge_signatures(&bob).unwrap());
        assert!(alice.is_complete());
        assert!(!alice.merge_signatures(&bob).unwrap());
        assert_ne!(alice.txid().unwrap(), unsigned_txid);

        let public_key = keys[1].public_key_hex();
        let signature = &alice.inputs[0].signatures[&public_key];
        assert!(alice.verify_input_signature(0, &public_key, signature));
    }

    #[test]
    fn test_merge_rejects_forged_signature() {
        let (keys, tx) = setup();
        let mut local = tx.clone();

        let mut forged = tx.clone();
        forged.sign(&[keys[2].secret_key]).unwrap();
        let key = keys[2].public_key_hex();
        let mut bytes = hex::decode(&forged.inputs[0].signatures[&key]).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0x01;
        forged.inputs[0].signatures.insert(key, hex::encode(bytes));

        assert!(matches!(
            local.merge_signatures(&forged),
            Err(TxError::InvalidSignature { input: 0, .. })
        ));
        assert_eq!(local.signature_count(), 0);
    }

    #[test]
    fn test_merge_rejects_different_transaction() {
        let (keys, tx) = setup();
        let mut other = tx.clone();
        other.outputs[0].amount = 80_000;
        other.sign(&[keys[0].secret_key]).unwrap();

        let mut local = tx;
        assert!(matches!(
            local.merge_signatures(&other),
            Err(TxError::Mismatch { .. })
        ));
    }

    #[test]
    fn test_strip_signatures() {
        let (keys, mut tx) = setup();
        tx.sign(&[keys[0].secret_key, keys[1].secret_key]).unwrap();
        assert!(tx.is_complete());

        let stripped = tx.strip_signatures();
        assert_eq!(stripped.signature_count(), 0);
        assert_eq!(stripped.ntxid().unwrap(), tx.ntxid().unwrap());
    }

    #[test]
    fn test_invalid_txid() {
        let (_, mut tx) = setup();
        tx.inputs[0].outpoint.txid = "abcd".to_string();
        assert!(matches!(tx.ntxid(), Err(TxError::InvalidTxid(_))));
    }
}

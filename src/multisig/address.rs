//! Base58Check addresses
//!
//! Pay-to-script-hash addresses for the shared wallet plus plain
//! pay-to-pubkey-hash destinations, for both livenet and testnet.

use crate::crypto::{decode_check, encode_check, hash160, Base58Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Address errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address encoding: {0}")]
    Encoding(#[from] Base58Error),
    #[error("Invalid address length: {0}")]
    InvalidLength(usize),
    #[error("Unknown address version byte: {0:#04x}")]
    UnknownVersion(u8),
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
}

/// The coin network a wallet lives on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Livenet,
    Testnet,
}

impl NetworkKind {
    pub fn name(&self) -> &'static str {
        match self {
            NetworkKind::Livenet => "livenet",
            NetworkKind::Testnet => "testnet",
        }
    }

    fn pubkey_hash_version(&self) -> u8 {
        match self {
            NetworkKind::Livenet => 0x00,
            NetworkKind::Testnet => 0x6f,
        }
    }

    fn script_hash_version(&self) -> u8 {
        match self {
            NetworkKind::Livenet => 0x05,
            NetworkKind::Testnet => 0xc4,
        }
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NetworkKind {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "livenet" | "mainnet" => Ok(NetworkKind::Livenet),
            "testnet" => Ok(NetworkKind::Testnet),
            other => Err(AddressError::UnknownNetwork(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressKind {
    PubkeyHash,
    ScriptHash,
}

/// A decoded address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub network: NetworkKind,
    pub kind: AddressKind,
    pub hash: [u8; 20],
}

impl Address {
    /// P2SH address committing to a serialized redeem script
    pub fn for_script(network: NetworkKind, script: &[u8]) -> Self {
        Self {
            network,
            kind: AddressKind::ScriptHash,
            hash: hash160(script),
        }
    }

    /// Decode and classify a Base58Check address
    pub fn parse(encoded: &str) -> Result<Self, AddressError> {
        let data = decode_check(encoded)?;
        if data.len() != 21 {
            return Err(AddressError::InvalidLength(data.len()));
        }

        let (network, kind) = match data[0] {
            0x00 => (NetworkKind::Livenet, AddressKind::PubkeyHash),
            0x05 => (NetworkKind::Livenet, AddressKind::ScriptHash),
            0x6f => (NetworkKind::Testnet, AddressKind::PubkeyHash),
            0xc4 => (NetworkKind::Testnet, AddressKind::ScriptHash),
            other => return Err(AddressError::UnknownVersion(other)),
        };

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&data[1..]);
        Ok(Self {
            network,
            kind,
            hash,
        })
    }

    /// Output locking script paying to this address
    pub fn script_pubkey(&self) -> Vec<u8> {
        match self.kind {
            // OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
            AddressKind::PubkeyHash => {
                let mut script = vec![0x76, 0xa9, 0x14];
                script.extend_from_slice(&self.hash);
                script.extend_from_slice(&[0x88, 0xac]);
                script
            }
            // OP_HASH160 <20> OP_EQUAL
            AddressKind::ScriptHash => {
                let mut script = vec![0xa9, 0x14];
                script.extend_from_slice(&self.hash);
                script.push(0x87);
                script
            }
        }
    }

    fn version(&self) -> u8 {
        match self.kind {
            AddressKind::PubkeyHash => self.network.pubkey_hash_version(),
            AddressKind::ScriptHash => self.network.script_hash_version(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut payload = Vec::with_capacity(21);
        payload.push(self.version());
        payload.extend_from_slice(&self.hash);
        f.write_str(&encode_check(&payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_address_prefixes() {
        let livenet = Address::for_script(NetworkKind::Livenet, b"script").to_string();
        let testnet = Address::for_script(NetworkKind::Testnet, b"script").to_string();

        // P2SH addresses start with '3' on livenet and '2' on testnet
        assert!(livenet.starts_with('3'));
        assert!(testnet.starts_with('2'));
    }

    #[test]
    fn test_parse_known_address() {
        // Genesis coinbase address
        let address = Address::parse("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").unwrap();
        assert_eq!(address.network, NetworkKind::Livenet);
        assert_eq!(address.kind, AddressKind::PubkeyHash);
        assert_eq!(address.to_string(), "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa");
        assert_eq!(address.script_pubkey().len(), 25);
    }

    #[test]
    fn test_round_trip_script_hash() {
        let address = Address::for_script(NetworkKind::Testnet, b"redeem");
        let parsed = Address::parse(&address.to_string()).unwrap();
        assert_eq!(parsed, address);
        assert_eq!(parsed.script_pubkey()[0], 0xa9);
    }

    #[test]
    fn test_network_names() {
        assert_eq!("testnet".parse::<NetworkKind>().unwrap(), NetworkKind::Testnet);
        assert_eq!("mainnet".parse::<NetworkKind>().unwrap(), NetworkKind::Livenet);
        assert!("regtest".parse::<NetworkKind>().is_err());
    }
}

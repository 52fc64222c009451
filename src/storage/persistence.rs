//! Wallet persistence layer
//!
//! Provides save/load functionality for wallet snapshots.

use crate::multisig::{AddressBook, CopayerSigner, KeyRing, ProposalSet};
use crate::wallet::identity::WalletIdentity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Wallet {0} not found")]
    NotFound(String),
}

/// Everything needed to bring a wallet back, as stored on disk
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSnapshot {
    pub opts: WalletIdentity,
    /// Our own session nonce, hex
    pub network_nonce: String,
    /// Last session nonce seen per copayer, hex
    #[serde(default)]
    pub network_nonces: BTreeMap<String, String>,
    pub public_key_ring: KeyRing,
    #[serde(default)]
    pub tx_proposals: ProposalSet,
    pub private_key: CopayerSigner,
    #[serde(default)]
    pub address_book: AddressBook,
}

/// Where wallet snapshots live
///
/// Persisting the same snapshot twice must be harmless.
pub trait Storage: Send + Sync {
    fn persist(&self, wallet_id: &str, snapshot: &WalletSnapshot) -> Result<(), StorageError>;

    fn load(&self, wallet_id: &str) -> Result<WalletSnapshot, StorageError>;

    /// Ids of all stored wallets
    fn list(&self) -> Result<Vec<String>, StorageError>;

    /// Portable backup of a snapshot
    fn export(&self, snapshot: &WalletSnapshot) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec_pretty(snapshot)?)
    }
}

fn check_wallet_id(wallet_id: &str) -> Result<(), StorageError> {
    let valid = !wallet_id.is_empty()
        && wallet_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidData(format!(
            "Invalid wallet id: {:?}",
            wallet_id
        )))
    }
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".cosigner_data"),
            backup_enabled: true,
            max_backups: 5,
        }
    }
}

/// One JSON file per wallet
pub struct FileStorage {
    config: StorageConfig,
}

impl FileStorage {
    /// Create a new storage manager
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self { config })
    }

    /// Create with default configuration
    pub fn with_defaults() -> Result<Self, StorageError> {
        Self::new(StorageConfig::default())
    }

    fn wallet_path(&self, wallet_id: &str) -> PathBuf {
        self.config.data_dir.join(format!("{}.json", wallet_id))
    }

    fn backup_path(&self, wallet_id: &str, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.json.backup.{}", wallet_id, index))
    }

    pub fn exists(&self, wallet_id: &str) -> bool {
        self.wallet_path(wallet_id).exists()
    }

    /// Delete a stored wallet and its backups
    pub fn delete(&self, wallet_id: &str) -> Result<(), StorageError> {
        check_wallet_id(wallet_id)?;
        let path = self.wallet_path(wallet_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        for index in self.list_backups(wallet_id) {
            fs::remove_file(self.backup_path(wallet_id, index))?;
        }
        Ok(())
    }

    /// Rotate backup files
    fn rotate_backups(&self, wallet_id: &str) -> Result<(), StorageError> {
        if self.config.max_backups == 0 {
            return Ok(());
        }

        // Delete oldest backup
        let oldest = self.backup_path(wallet_id, self.config.max_backups - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        // Shift existing backups
        for i in (0..self.config.max_backups - 1).rev() {
            let current = self.backup_path(wallet_id, i);
            if current.exists() {
                fs::rename(&current, self.backup_path(wallet_id, i + 1))?;
            }
        }

        Ok(())
    }

    /// Load a backup, 0 being the most recent
    pub fn restore_backup(
        &self,
        wallet_id: &str,
        index: usize,
    ) -> Result<WalletSnapshot, StorageError> {
        check_wallet_id(wallet_id)?;
        let path = self.backup_path(wallet_id, index);
        if !path.exists() {
            return Err(StorageError::InvalidData(format!(
                "Backup {} of {} not found",
                index, wallet_id
            )));
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// List available backups
    pub fn list_backups(&self, wallet_id: &str) -> Vec<usize> {
        (0..self.config.max_backups)
            .filter(|i| self.backup_path(wallet_id, *i).exists())
            .collect()
    }
}

impl Storage for FileStorage {
    fn persist(&self, wallet_id: &str, snapshot: &WalletSnapshot) -> Result<(), StorageError> {
        check_wallet_id(wallet_id)?;
        let path = self.wallet_path(wallet_id);

        if self.config.backup_enabled && self.config.max_backups > 0 && path.exists() {
            self.rotate_backups(wallet_id)?;
            fs::copy(&path, self.backup_path(wallet_id, 0))?;
        }

        // Write to temporary file first
        let temp_path = self.config.data_dir.join(format!("{}.tmp", wallet_id));
        let writer = BufWriter::new(fs::File::create(&temp_path)?);
        serde_json::to_writer_pretty(writer, snapshot)?;

        // Atomic rename
        fs::rename(&temp_path, &path)?;
        log::debug!("Wallet {} stored at {}", wallet_id, path.display());

        Ok(())
    }

    fn load(&self, wallet_id: &str) -> Result<WalletSnapshot, StorageError> {
        check_wallet_id(wallet_id)?;
        let path = self.wallet_path(wallet_id);
        if !path.exists() {
            return Err(StorageError::NotFound(wallet_id.to_string()));
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.config.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// In-process storage, keeps the serialized form
#[derive(Default)]
pub struct MemoryStorage {
    wallets: Mutex<HashMap<String, String>>,
    writes: Mutex<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `persist` calls
    pub fn write_count(&self) -> usize {
        self.writes.lock().map(|n| *n).unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::InvalidData("storage lock poisoned".to_string())
}

impl Storage for MemoryStorage {
    fn persist(&self, wallet_id: &str, snapshot: &WalletSnapshot) -> Result<(), StorageError> {
        let json = serde_json::to_string(snapshot)?;
        self.wallets
            .lock()
            .map_err(poisoned)?
            .insert(wallet_id.to_string(), json);
        *self.writes.lock().map_err(poisoned)? += 1;
        Ok(())
    }

    fn load(&self, wallet_id: &str) -> Result<WalletSnapshot, StorageError> {
        let wallets = self.wallets.lock().map_err(poisoned)?;
        let json = wallets
            .get(wallet_id)
            .ok_or_else(|| StorageError::NotFound(wallet_id.to_string()))?;
        Ok(serde_json::from_str(json)?)
    }

    fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut ids: Vec<String> = self
            .wallets
            .lock()
            .map_err(poisoned)?
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multisig::NetworkKind;

    fn snapshot(id: &str) -> WalletSnapshot {
        let signer = CopayerSigner::generate();
        let mut ring = KeyRing::new(NetworkKind::Testnet, 1, 2).unwrap();
        ring.add_copayer(signer.xpub().unwrap(), Some("alice".to_string()))
            .unwrap();
        WalletSnapshot {
            opts: WalletIdentity {
                id: id.to_string(),
                name: None,
                required_copayers: 1,
                total_copayers: 2,
                spend_unconfirmed: false,
                version: "1.0.0".to_string(),
                reconnect_delay_ms: 100,
            },
            network_nonce: "0000000000000001".to_string(),
            network_nonces: BTreeMap::new(),
            public_key_ring: ring,
            tx_proposals: ProposalSet::new(),
            private_key: signer,
            address_book: AddressBook::new(),
        }
    }

    #[test]
    fn test_save_load_wallet() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();

        let snap = snapshot("a1b2c3");
        storage.persist("a1b2c3", &snap).unwrap();
        assert!(storage.exists("a1b2c3"));

        let loaded = storage.load("a1b2c3").unwrap();
        assert_eq!(loaded.opts, snap.opts);
        assert_eq!(loaded.private_key, snap.private_key);
        assert_eq!(loaded.public_key_ring.copayer_ids(), snap.public_key_ring.copayer_ids());
        assert_eq!(storage.list().unwrap(), vec!["a1b2c3".to_string()]);

        assert!(matches!(storage.load("ffff"), Err(StorageError::NotFound(_))));
        assert!(matches!(
            storage.persist("../evil", &snap),
            Err(StorageError::InvalidData(_))
        ));
    }

    #[test]
    fn test_backup_rotation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            max_backups: 3,
            ..Default::default()
        })
        .unwrap();

        let snap = snapshot("w1");
        for _ in 0..5 {
            storage.persist("w1", &snap).unwrap();
        }
        assert_eq!(storage.list_backups("w1"), vec![0, 1, 2]);
        assert_eq!(storage.restore_backup("w1", 2).unwrap().opts.id, "w1");

        storage.delete("w1").unwrap();
        assert!(!storage.exists("w1"));
        assert!(storage.list_backups("w1").is_empty());
    }

    #[test]
    fn test_memory_storage() {
        let storage = MemoryStorage::new();
        let snap = snapshot("w2");
        storage.persist("w2", &snap).unwrap();
        storage.persist("w2", &snap).unwrap();
        assert_eq!(storage.write_count(), 2);
        assert_eq!(storage.load("w2").unwrap().opts, snap.opts);
        assert!(!storage.export(&snap).unwrap().is_empty());
    }
}

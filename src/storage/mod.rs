//! Storage module for wallet persistence

pub mod persistence;

pub use persistence::{
    FileStorage, MemoryStorage, Storage, StorageConfig, StorageError, WalletSnapshot,
};

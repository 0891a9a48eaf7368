//! Database Persistence Layer for Example Reuse and Regression Prevention
//!
//! Interesting buffers are saved so a later run can replay them before generating anything
//! new. A failure found once is then reproduced immediately on every run until it is fixed.
//!
//! # Architecture
//!
//! - `ExampleDatabase` trait: save/fetch/delete/move of raw byte values under a key
//! - `DirectoryDatabase`: one directory per key, one file per value, atomic writes
//! - `InMemoryDatabase`: shared in-process storage for tests and ephemeral runs
//! - `DatabaseKey`: SHA-256 fingerprint of the test identity plus an optional sub-key
//!
//! The runner stores its current best buffers under the primary key and demotes buffers
//! it has improved on to the `secondary` sub-key.
//!
//! # Example Usage
//!
//! ```rust
//! use conjecture_core::persistence::{DatabaseKey, ExampleDatabase, InMemoryDatabase};
//!
//! let mut db = InMemoryDatabase::new();
//! let key = DatabaseKey::from_function("test_my_function", &[]);
//! db.save(&key, &[1, 2, 3]).unwrap();
//! assert_eq!(db.fetch(&key).unwrap(), vec![vec![1, 2, 3]]);
//! ```

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Type alias for database operation results
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Sub-key holding buffers that used to be the best for their key
pub const SECONDARY_SUB_KEY: &str = "secondary";

const EXAMPLE_EXTENSION: &str = "example";

/// Error types for database operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Database corruption: {0}")]
    Corruption(String),
}

/// Database key for identifying test functions and their examples
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseKey {
    /// SHA-256 of the test identity
    pub primary_hash: [u8; 32],
    /// Optional sub-key for a separate corpus of the same test
    pub sub_key: Option<String>,
}

impl DatabaseKey {
    /// Create a key from a test function name and any additional identifying data
    pub fn from_function(function_name: &str, additional_data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(function_name.as_bytes());
        hasher.update(additional_data);

        DatabaseKey {
            primary_hash: hasher.finalize().into(),
            sub_key: None,
        }
    }

    /// Same test, different corpus
    pub fn with_sub_key(&self, sub_key: &str) -> Self {
        DatabaseKey {
            primary_hash: self.primary_hash,
            sub_key: Some(sub_key.to_string()),
        }
    }

    /// The `secondary` corpus of this key
    pub fn secondary(&self) -> Self {
        self.with_sub_key(SECONDARY_SUB_KEY)
    }

    /// Hex representation used as the directory name
    pub fn to_hex(&self) -> String {
        let primary_hex = hex::encode(self.primary_hash);
        match &self.sub_key {
            Some(sub) => format!("{}.{}", primary_hex, sub),
            None => primary_hex,
        }
    }

    /// Parse a key produced by [`DatabaseKey::to_hex`]
    pub fn from_hex(hex_str: &str) -> DatabaseResult<Self> {
        let (primary_hex, sub_key) = match hex_str.split_once('.') {
            Some((primary, sub)) => (primary, Some(sub.to_string())),
            None => (hex_str, None),
        };

        if primary_hex.len() != 64 {
            return Err(DatabaseError::InvalidKey(format!(
                "Invalid primary key length: {}",
                primary_hex.len()
            )));
        }

        let primary_hash: [u8; 32] = hex::decode(primary_hex)
            .map_err(|e| DatabaseError::InvalidKey(format!("Invalid hex: {}", e)))?
            .try_into()
            .map_err(|_| DatabaseError::InvalidKey("Hash wrong length".to_string()))?;

        Ok(DatabaseKey { primary_hash, sub_key })
    }
}

/// Storage interface for example buffers
pub trait ExampleDatabase {
    /// Save a value under a key. Saving an existing value is a no-op.
    fn save(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()>;

    /// Fetch all values stored under a key, in no particular order
    fn fetch(&self, key: &DatabaseKey) -> DatabaseResult<Vec<Vec<u8>>>;

    /// Delete a value from a key. Deleting a missing value is a no-op.
    fn delete(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()>;

    /// Move a value from one key to another
    fn move_value(&mut self, src_key: &DatabaseKey, dest_key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()> {
        self.delete(src_key, value)?;
        self.save(dest_key, value)?;
        Ok(())
    }
}

/// In-memory database. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    data: Arc<RwLock<HashMap<DatabaseKey, HashSet<Vec<u8>>>>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key that currently holds at least one value
    pub fn keys(&self) -> DatabaseResult<Vec<DatabaseKey>> {
        Ok(self.read()?.keys().cloned().collect())
    }

    /// Total number of stored values across all keys
    pub fn example_count(&self) -> DatabaseResult<usize> {
        Ok(self.read()?.values().map(|set| set.len()).sum())
    }

    fn read(&self) -> DatabaseResult<std::sync::RwLockReadGuard<'_, HashMap<DatabaseKey, HashSet<Vec<u8>>>>> {
        self.data
            .read()
            .map_err(|_| DatabaseError::Corruption("in-memory database lock poisoned".to_string()))
    }

    fn write(&self) -> DatabaseResult<std::sync::RwLockWriteGuard<'_, HashMap<DatabaseKey, HashSet<Vec<u8>>>>> {
        self.data
            .write()
            .map_err(|_| DatabaseError::Corruption("in-memory database lock poisoned".to_string()))
    }
}

impl ExampleDatabase for InMemoryDatabase {
    fn save(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()> {
        self.write()?.entry(key.clone()).or_default().insert(value.to_vec());
        Ok(())
    }

    fn fetch(&self, key: &DatabaseKey) -> DatabaseResult<Vec<Vec<u8>>> {
        Ok(self
            .read()?
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()> {
        let mut data = self.write()?;
        if let Some(set) = data.get_mut(key) {
            set.remove(value);
            if set.is_empty() {
                data.remove(key);
            }
        }
        Ok(())
    }
}

/// File-based database with atomic writes
#[derive(Debug, Clone)]
pub struct DirectoryDatabase {
    base_path: PathBuf,
}

impl DirectoryDatabase {
    /// Open (creating if needed) a database rooted at `base_path`
    pub fn new<P: AsRef<Path>>(base_path: P) -> DatabaseResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(DirectoryDatabase { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn key_dir(&self, key: &DatabaseKey) -> PathBuf {
        self.base_path.join(key.to_hex())
    }

    fn value_path(&self, key: &DatabaseKey, value: &[u8]) -> PathBuf {
        let value_hash = Sha256::digest(value);
        let filename = format!("{}.{}", hex::encode(&value_hash[..16]), EXAMPLE_EXTENSION);
        self.key_dir(key).join(filename)
    }

    /// Write to a temporary file, then rename over the destination
    fn atomic_write(&self, path: &Path, data: &[u8]) -> DatabaseResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        {
            let mut file = BufWriter::new(File::create(&temp_path)?);
            file.write_all(data)?;
            file.flush()?;
        }

        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl ExampleDatabase for DirectoryDatabase {
    fn save(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()> {
        let path = self.value_path(key, value);
        if path.exists() {
            return Ok(());
        }
        self.atomic_write(&path, value)
    }

    fn fetch(&self, key: &DatabaseKey) -> DatabaseResult<Vec<Vec<u8>>> {
        let key_dir = self.key_dir(key);
        if !key_dir.exists() {
            return Ok(Vec::new());
        }

        let mut examples = Vec::new();
        for entry in fs::read_dir(&key_dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == EXAMPLE_EXTENSION) {
                match fs::read(&path) {
                    Ok(data) => examples.push(data),
                    // Another process may have deleted it between listing and reading
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        debug!("example file {:?} vanished during fetch", path);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(examples)
    }

    fn delete(&mut self, key: &DatabaseKey, value: &[u8]) -> DatabaseResult<()> {
        let path = self.value_path(key, value);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let key_dir = self.key_dir(key);
        if let Ok(mut entries) = fs::read_dir(&key_dir) {
            if entries.next().is_none() {
                let _ = fs::remove_dir(&key_dir);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_database_key_creation() {
        let key = DatabaseKey::from_function("test_function", b"additional_data");
        assert_eq!(key.sub_key, None);

        let sub_key = key.secondary();
        assert_eq!(sub_key.sub_key, Some("secondary".to_string()));
        assert_eq!(sub_key.primary_hash, key.primary_hash);
        assert_ne!(key, DatabaseKey::from_function("other_function", b"additional_data"));
    }

    #[test]
    fn test_database_key_hex_conversion() {
        let key = DatabaseKey::from_function("test_function", b"data");
        assert_eq!(DatabaseKey::from_hex(&key.to_hex()).unwrap(), key);

        let sub = key.with_sub_key("secondary");
        assert_eq!(DatabaseKey::from_hex(&sub.to_hex()).unwrap(), sub);

        assert!(matches!(DatabaseKey::from_hex("abcd"), Err(DatabaseError::InvalidKey(_))));
    }

    #[test]
    fn test_in_memory_database() {
        let mut db = InMemoryDatabase::new();
        let key = DatabaseKey::from_function("test", b"");
        let value = b"example_data";

        db.save(&key, value).unwrap();
        db.save(&key, value).unwrap();
        let results = db.fetch(&key).unwrap();
        assert_eq!(results, vec![value.to_vec()]);

        db.delete(&key, value).unwrap();
        assert!(db.fetch(&key).unwrap().is_empty());
        assert!(db.keys().unwrap().is_empty());
    }

    #[test]
    fn test_in_memory_clones_share_storage() {
        let mut db = InMemoryDatabase::new();
        let handle = db.clone();
        let key = DatabaseKey::from_function("test", b"");
        db.save(&key, &[1]).unwrap();
        db.move_value(&key, &key.secondary(), &[1]).unwrap();

        assert!(handle.fetch(&key).unwrap().is_empty());
        assert_eq!(handle.fetch(&key.secondary()).unwrap(), vec![vec![1]]);
        assert_eq!(handle.example_count().unwrap(), 1);
    }

    #[test]
    fn test_directory_database() {
        let temp_dir = tempdir().unwrap();
        let mut db = DirectoryDatabase::new(temp_dir.path()).unwrap();

        let key = DatabaseKey::from_function("test", b"");
        let value = b"example_data";

        db.save(&key, value).unwrap();
        db.save(&key, &[]).unwrap();
        let mut results = db.fetch(&key).unwrap();
        results.sort();
        assert_eq!(results, vec![Vec::new(), value.to_vec()]);

        // Persistence across instances
        let db2 = DirectoryDatabase::new(temp_dir.path()).unwrap();
        assert_eq!(db2.fetch(&key).unwrap().len(), 2);
        assert!(db2.fetch(&key.secondary()).unwrap().is_empty());
    }

    #[test]
    fn test_directory_database_delete_and_move() {
        let temp_dir = tempdir().unwrap();
        let mut db = DirectoryDatabase::new(temp_dir.path()).unwrap();
        let key = DatabaseKey::from_function("test", b"");

        db.save(&key, &[1, 2]).unwrap();
        db.move_value(&key, &key.secondary(), &[1, 2]).unwrap();
        assert!(db.fetch(&key).unwrap().is_empty());
        assert_eq!(db.fetch(&key.secondary()).unwrap(), vec![vec![1, 2]]);

        db.delete(&key.secondary(), &[1, 2]).unwrap();
        db.delete(&key.secondary(), &[1, 2]).unwrap();
        assert!(db.fetch(&key.secondary()).unwrap().is_empty());
    }
}

//! Access token storage
//!
//! The token lives in memory for request signing and is written through to a
//! durable [`TokenStorage`] under a fixed key so it survives a restart.

use log::{debug, error};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::AuthError;

/// Default key the access token is persisted under
pub const DEFAULT_TOKEN_KEY: &str = "jwt";

/// Token-supplying callback handed to the HTTP layer and the push connector
pub type TokenAccessor = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Durable key/value storage for credentials
pub trait TokenStorage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, AuthError>;
    fn store(&self, key: &str, value: &str) -> Result<(), AuthError>;
    fn remove(&self, key: &str) -> Result<(), AuthError>;
}

/// Process-local storage, lost on exit
#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStorage for MemoryTokenStorage {
    fn load(&self, key: &str) -> Result<Option<String>, AuthError> {
        let values = self
            .values
            .lock()
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn store(&self, key: &str, value: &str) -> Result<(), AuthError> {
        let mut values = self
            .values
            .lock()
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), AuthError> {
        let mut values = self
            .values
            .lock()
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        values.remove(key);
        Ok(())
    }
}

/// JSON file holding a flat object of key to value
#[derive(Debug)]
pub struct FileTokenStorage {
    path: PathBuf,
    // serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl FileTokenStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, AuthError> {
        match fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, values: &BTreeMap<String, String>) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, serde_json::to_vec_pretty(values)?)?;
        Ok(())
    }
}

impl TokenStorage for FileTokenStorage {
    fn load(&self, key: &str) -> Result<Option<String>, AuthError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        Ok(self.read_all()?.remove(key))
    }

    fn store(&self, key: &str, value: &str) -> Result<(), AuthError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        let mut values = self.read_all()?;
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values)
    }

    fn remove(&self, key: &str) -> Result<(), AuthError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        let mut values = self.read_all()?;
        if values.remove(key).is_some() {
            self.write_all(&values)?;
        }
        Ok(())
    }
}

/// Current access token, shared by everything that signs requests
#[derive(Clone)]
pub struct TokenStore {
    token: Arc<RwLock<Option<String>>>,
    storage: Arc<dyn TokenStorage>,
    key: String,
}

impl TokenStore {
    pub fn new(storage: Arc<dyn TokenStorage>, key: &str) -> Self {
        Self {
            token: Arc::new(RwLock::new(None)),
            storage,
            key: key.to_string(),
        }
    }

    /// In-memory store using the default key
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryTokenStorage::new()), DEFAULT_TOKEN_KEY)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the persisted token into memory
    pub fn restore(&self) -> Option<String> {
        let persisted = match self.storage.load(&self.key) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to read persisted token: {}", e);
                None
            }
        };
        debug!("Restored token from storage (present: {})", persisted.is_some());
        self.write_memory(persisted.clone());
        persisted
    }

    pub fn get(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the token; `None` also removes the persisted copy
    pub fn set(&self, token: Option<String>) {
        let persisted = match &token {
            Some(value) => self.storage.store(&self.key, value),
            None => self.storage.remove(&self.key),
        };
        if let Err(e) = persisted {
            error!("Failed to persist token change: {}", e);
        }
        self.write_memory(token);
    }

    pub fn clear(&self) {
        self.set(None);
    }

    /// Callback evaluated at call time, so later rotations are observed
    pub fn accessor(&self) -> TokenAccessor {
        let store = self.clone();
        Arc::new(move || store.get())
    }

    fn write_memory(&self, token: Option<String>) {
        match self.token.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("key", &self.key)
            .field("present", &self.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_writes_through_and_clear_removes() {
        let storage = Arc::new(MemoryTokenStorage::new());
        let store = TokenStore::new(storage.clone(), DEFAULT_TOKEN_KEY);

        store.set(Some("abc".to_string()));
        assert_eq!(store.get().as_deref(), Some("abc"));
        assert_eq!(storage.load("jwt").unwrap().as_deref(), Some("abc"));

        store.clear();
        assert!(store.get().is_none());
        assert!(storage.load("jwt").unwrap().is_none());
    }

    #[test]
    fn test_accessor_sees_rotation() {
        let store = TokenStore::in_memory();
        let accessor = store.accessor();
        assert!(accessor().is_none());

        store.set(Some("first".to_string()));
        assert_eq!(accessor().as_deref(), Some("first"));
        store.set(Some("second".to_string()));
        assert_eq!(accessor().as_deref(), Some("second"));
    }

    #[test]
    fn test_file_storage_survives_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tokens.json");

        let store = TokenStore::new(Arc::new(FileTokenStorage::new(&path)), "jwt");
        assert!(store.restore().is_none());
        store.set(Some("persisted".to_string()));

        let reopened = TokenStore::new(Arc::new(FileTokenStorage::new(&path)), "jwt");
        assert!(reopened.get().is_none());
        assert_eq!(reopened.restore().as_deref(), Some("persisted"));

        reopened.clear();
        let again = FileTokenStorage::new(&path);
        assert!(again.load("jwt").unwrap().is_none());
    }

    #[test]
    fn test_file_storage_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileTokenStorage::new(dir.path().join("tokens.json"));
        storage.store("jwt", "a").unwrap();
        storage.store("other", "b").unwrap();
        storage.remove("jwt").unwrap();
        assert_eq!(storage.load("other").unwrap().as_deref(), Some("b"));
    }
}

//! Key dictionary
//!
//! Maps telemetry key names to compact integer ids. Lookups go through an
//! append-only in-memory cache, then the persisted dictionary table. New
//! ids are minted inside a single creation section; the store's uniqueness
//! check is what actually decides, so two dictionaries racing over one
//! store still converge on one id per name.

use crate::storage::{KeyInsertOutcome, StorageBackend};
use crate::{KeyId, Result, TsError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub struct KeyDictionary {
    backend: Arc<dyn StorageBackend>,
    ids: DashMap<String, KeyId>,
    names: DashMap<KeyId, String>,
    /// Next candidate id. Never hands out the same value twice.
    counter: AtomicI32,
    creation_lock: Mutex<()>,
    max_key_length: usize,
}

impl KeyDictionary {
    /// Open over `backend`, continuing after the highest persisted id
    pub fn open(backend: Arc<dyn StorageBackend>, max_key_length: usize) -> Result<Self> {
        let next = match backend.max_key_id()? {
            Some(max) => next_id(max)?,
            None => 0,
        };
        Ok(Self {
            backend,
            ids: DashMap::new(),
            names: DashMap::new(),
            counter: AtomicI32::new(next),
            creation_lock: Mutex::new(()),
            max_key_length,
        })
    }

    /// Reject key names the dictionary will not store
    pub fn validate_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(TsError::validation("key must not be empty"));
        }
        if key.len() > self.max_key_length {
            return Err(TsError::validation(format!(
                "key is {} bytes, limit is {}",
                key.len(),
                self.max_key_length
            )));
        }
        if key.contains('\0') {
            return Err(TsError::validation("key must not contain NUL"));
        }
        Ok(())
    }

    /// Look up an id without creating one
    pub fn resolve(&self, key: &str) -> Result<Option<KeyId>> {
        self.validate_key(key)?;
        if let Some(id) = self.ids.get(key) {
            return Ok(Some(*id));
        }
        let found = self.backend.find_key_id(key)?;
        if let Some(id) = found {
            self.remember(key, id);
        }
        Ok(found)
    }

    /// Return the id of `key`, assigning a new one on first use
    pub fn resolve_or_create(&self, key: &str) -> Result<KeyId> {
        if let Some(id) = self.resolve(key)? {
            return Ok(id);
        }

        let _guard = self.creation_lock.lock();
        if let Some(id) = self.backend.find_key_id(key)? {
            self.remember(key, id);
            return Ok(id);
        }

        for _ in 0..crate::config::MAX_KEY_INSERT_ATTEMPTS {
            let candidate = self.counter.fetch_add(1, Ordering::SeqCst);
            if candidate < 0 {
                return Err(TsError::Storage("key id space exhausted".into()));
            }

            match self.backend.insert_key(key, candidate) {
                KeyInsertOutcome::Inserted => {
                    info!("Created key '{}' with id {}", key, candidate);
                    self.remember(key, candidate);
                    return Ok(candidate);
                }
                KeyInsertOutcome::Conflict => {
                    if let Some(id) = self.backend.find_key_id(key)? {
                        debug!("Key '{}' created concurrently with id {}", key, id);
                        self.remember(key, id);
                        return Ok(id);
                    }
                    // The id went to another name; skip past everything persisted
                    if let Some(max) = self.backend.max_key_id()? {
                        self.counter.fetch_max(next_id(max)?, Ordering::SeqCst);
                    }
                }
                KeyInsertOutcome::Failed(e) => return Err(e),
            }
        }

        Err(TsError::Storage(format!(
            "could not assign an id to key '{}'",
            key
        )))
    }

    /// Reverse lookup used when rebuilding entries from stored rows
    pub fn key_name(&self, key_id: KeyId) -> Result<Option<String>> {
        if let Some(name) = self.names.get(&key_id) {
            return Ok(Some(name.clone()));
        }
        let found = self.backend.find_key_name(key_id)?;
        if let Some(name) = &found {
            self.remember(name, key_id);
        }
        Ok(found)
    }

    /// Number of cached mappings
    pub fn cached(&self) -> usize {
        self.ids.len()
    }

    fn remember(&self, key: &str, key_id: KeyId) {
        self.ids.insert(key.to_string(), key_id);
        self.names.insert(key_id, key.to_string());
    }
}

fn next_id(max: KeyId) -> Result<KeyId> {
    max.checked_add(1)
        .ok_or_else(|| TsError::Storage("key id space exhausted".into()))
}

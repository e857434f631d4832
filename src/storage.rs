// Keyed storage. The consensus core only relies on the KV contract: `has`,
// `get`, upsert `set`, fail-if-present `new_record`, ordered prefix scans,
// and atomic batches. This in-memory backend is the reference
// implementation; an on-disk engine slots in behind the same surface.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::RwLock;

use crate::error::Error;

pub struct Storage {
    inner: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl Storage {
    pub fn new() -> Storage {
        Storage {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.read().unwrap().contains_key(key)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, Error> {
        let map = self.inner.read().unwrap();
        let raw = map.get(key).ok_or(Error::StorageRecordDoesNotExist)?;
        serde_json::from_slice(raw).map_err(|e| Error::MessageNotWellFormed(format!("storage: {}", e)))
    }

    /// Insert-only write; refuses to overwrite.
    pub fn new_record<T: Serialize>(&self, key: &str, value: &T) -> Result<(), Error> {
        let encoded = encode(value)?;
        let mut map = self.inner.write().unwrap();
        if map.contains_key(key) {
            return Err(Error::StorageRecordAlreadyExists);
        }
        map.insert(key.to_string(), encoded);
        Ok(())
    }

    /// Upsert.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), Error> {
        let encoded = encode(value)?;
        self.inner.write().unwrap().insert(key.to_string(), encoded);
        Ok(())
    }

    /// Greatest key under `prefix`, exploiting lexicographic key layout.
    pub fn last_with_prefix(&self, prefix: &str) -> Option<(String, Vec<u8>)> {
        let map = self.inner.read().unwrap();
        map.range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .last()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let map = self.inner.read().unwrap();
        map.range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Opens a write batch. Staged writes see each other and read through to
    /// committed state; dropping the batch aborts it.
    pub fn batch(&self) -> Batch<'_> {
        Batch {
            storage: self,
            staged: BTreeMap::new(),
            insert_only: HashSet::new(),
        }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Batch<'a> {
    storage: &'a Storage,
    staged: BTreeMap<String, Vec<u8>>,
    insert_only: HashSet<String>,
}

impl<'a> Batch<'a> {
    pub fn has(&self, key: &str) -> bool {
        self.staged.contains_key(key) || self.storage.has(key)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, Error> {
        if let Some(raw) = self.staged.get(key) {
            return serde_json::from_slice(raw)
                .map_err(|e| Error::MessageNotWellFormed(format!("storage: {}", e)));
        }
        self.storage.get(key)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), Error> {
        let encoded = encode(value)?;
        self.staged.insert(key.to_string(), encoded);
        Ok(())
    }

    pub fn new_record<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), Error> {
        if self.has(key) {
            return Err(Error::StorageRecordAlreadyExists);
        }
        let encoded = encode(value)?;
        self.staged.insert(key.to_string(), encoded);
        self.insert_only.insert(key.to_string());
        Ok(())
    }

    /// Applies every staged write under one write lock. Insert-only keys are
    /// re-validated so two racing batches cannot both create the same record.
    pub fn commit(self) -> Result<(), Error> {
        let mut map = self.storage.inner.write().unwrap();
        for key in &self.insert_only {
            if map.contains_key(key) {
                return Err(Error::StorageTransactionConflict);
            }
        }
        for (key, value) in self.staged {
            map.insert(key, value);
        }
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(value).map_err(|e| Error::MessageNotWellFormed(format!("encode: {}", e)))
}

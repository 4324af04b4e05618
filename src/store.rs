//! Persistent key/value store used for trace identity persistence

use dashmap::DashMap;

use crate::errors::{EventsError, EventsResult};

/// String key/value store
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> EventsResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> EventsResult<()>;
    fn remove(&self, key: &str) -> EventsResult<()>;
}

/// Process-local store; contents are lost with the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> EventsResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> EventsResult<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> EventsResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(feature = "sled-store")]
const SLED_FLUSH_EVERY_MS: u64 = 500;

/// Store backed by an on-disk sled database
#[cfg(feature = "sled-store")]
#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
}

#[cfg(feature = "sled-store")]
impl SledStore {
    /// Open (or create) the database at `path`. Writes reach disk on sled's
    /// background flush, never on the caller's thread.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> EventsResult<Self> {
        let db = sled::Config::new()
            .path(path)
            .flush_every_ms(Some(SLED_FLUSH_EVERY_MS))
            .open()
            .map_err(|e| EventsError::Storage(e.to_string()))?;
        Ok(Self { db })
    }
}

#[cfg(feature = "sled-store")]
impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> EventsResult<Option<String>> {
        let value = self
            .db
            .get(key.as_bytes())
            .map_err(|e| EventsError::Storage(e.to_string()))?;

        match value {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| EventsError::Storage(format!("Non UTF-8 value for {}: {}", key, e))),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> EventsResult<()> {
        // Durability comes from sled's background flush
        self.db
            .insert(key.as_bytes(), value.as_bytes())
            .map_err(|e| EventsError::Storage(e.to_string()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> EventsResult<()> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| EventsError::Storage(e.to_string()))?;
        Ok(())
    }
}

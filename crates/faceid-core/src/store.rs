//! Template store: durable per-identity descriptor sets over a key-value backend.
//!
//! Records are JSON-encoded under `identity/<name>`. Saving replaces any
//! previous record for the name. Operations on the same name are serialized
//! through a per-name lock; different names never contend.

use crate::matcher::Gallery;
use crate::types::{normalize_name, Descriptor, Identity};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

const KEY_PREFIX: &str = "identity/";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("identity name must be non-empty")]
    InvalidName,
    #[error("identity '{0}' has no descriptors")]
    EmptyDescriptors(String),
    #[error("identity '{name}': descriptor {index} has {found} dims, expected {expected}")]
    InconsistentDimensions {
        name: String,
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error("identity '{name}': descriptor {index} has a non-finite value at position {position}")]
    NonFiniteValue {
        name: String,
        index: usize,
        position: usize,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Minimal synchronous key-value persistence used by [`TemplateStore`].
pub trait KeyValue: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    /// Returns whether a value was present.
    fn remove(&self, key: &str) -> Result<bool, StoreError>;
    /// All keys starting with `prefix`, in ascending order.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory backend. Contents are lost when dropped.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValue for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        lock(&self.entries).insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.entries).remove(key).is_some())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(lock(&self.entries)
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// SQLite backend: a single `kv` table keyed by text.
pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
              key TEXT PRIMARY KEY NOT NULL,
              value BLOB NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValue for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = lock(&self.conn);
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        lock(&self.conn).execute(
            "INSERT OR REPLACE INTO kv(key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let changed = lock(&self.conn).execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(changed > 0)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for key in rows {
            let key = key?;
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn close(&self) -> Result<(), StoreError> {
        lock(&self.conn).execute_batch("PRAGMA optimize;")?;
        Ok(())
    }
}

/// Persisted form of an identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub name: String,
    pub dimension: usize,
    pub descriptors: Vec<Descriptor>,
    pub enrolled_at: DateTime<Utc>,
}

/// Listing entry returned by [`TemplateStore::list`].
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub name: String,
    pub templates: usize,
    pub dimension: usize,
    pub enrolled_at: DateTime<Utc>,
}

/// Owner of all persisted identities.
pub struct TemplateStore {
    kv: Box<dyn KeyValue>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TemplateStore {
    pub fn open(kv: Box<dyn KeyValue>) -> Self {
        Self {
            kv,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Store backed by [`MemoryKv`].
    pub fn in_memory() -> Self {
        Self::open(Box::new(MemoryKv::new()))
    }

    /// Flush and release the backend.
    pub fn close(self) -> Result<(), StoreError> {
        self.kv.close()
    }

    /// Run `op` holding the lock for `name`. The table entry is dropped once
    /// no other caller holds or waits on it.
    fn with_key_lock<T>(&self, name: &str, op: impl FnOnce() -> T) -> T {
        let key_lock = lock(&self.key_locks)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock(&key_lock);
            op()
        };

        let mut locks = lock(&self.key_locks);
        // Clones are only taken under the table lock: two owners means the
        // table and this call.
        if Arc::strong_count(&key_lock) == 2 {
            locks.remove(name);
        }
        result
    }

    /// Replace the templates stored for `name`.
    pub fn save(&self, name: &str, descriptors: &[Descriptor]) -> Result<(), StoreError> {
        let name = normalize_name(name).ok_or(StoreError::InvalidName)?;
        let dimension = validate_descriptors(name, descriptors)?;

        let record = IdentityRecord {
            name: name.to_string(),
            dimension,
            descriptors: descriptors.to_vec(),
            enrolled_at: Utc::now(),
        };
        let encoded = serde_json::to_vec(&record)?;

        self.with_key_lock(name, || self.kv.set(&storage_key(name), &encoded))?;

        tracing::debug!(name, templates = descriptors.len(), dimension, "identity saved");
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Vec<Descriptor>, StoreError> {
        Ok(self.load_record(name)?.descriptors)
    }

    pub fn load_record(&self, name: &str) -> Result<IdentityRecord, StoreError> {
        let name = normalize_name(name).ok_or(StoreError::InvalidName)?;
        let raw = self
            .with_key_lock(name, || self.kv.get(&storage_key(name)))?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn load_identity(&self, name: &str) -> Result<Identity, StoreError> {
        let record = self.load_record(name)?;
        Ok(Identity {
            name: record.name,
            descriptors: record.descriptors,
        })
    }

    /// Whether `name` is registered. Backend failures read as absent.
    pub fn exists(&self, name: &str) -> bool {
        let Some(name) = normalize_name(name) else {
            return false;
        };
        match self.kv.get(&storage_key(name)) {
            Ok(value) => value.is_some(),
            Err(e) => {
                tracing::warn!(name, error = %e, "exists check failed");
                false
            }
        }
    }

    /// Remove `name`. Returns whether it was registered.
    pub fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let name = normalize_name(name).ok_or(StoreError::InvalidName)?;
        let removed = self.with_key_lock(name, || self.kv.remove(&storage_key(name)))?;
        if removed {
            tracing::info!(name, "identity deleted");
        }
        Ok(removed)
    }

    /// Registered names in ascending key order.
    pub fn names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .kv
            .keys(KEY_PREFIX)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(KEY_PREFIX).map(str::to_string))
            .collect())
    }

    pub fn list(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        self.names()?
            .iter()
            .map(|name| {
                let record = self.load_record(name)?;
                Ok(IdentitySummary {
                    name: record.name,
                    templates: record.descriptors.len(),
                    dimension: record.dimension,
                    enrolled_at: record.enrolled_at,
                })
            })
            .collect()
    }

    /// Gallery of every registered identity, in [`names`](Self::names) order.
    /// Unreadable records are skipped so one bad entry cannot lock out the rest.
    pub fn gallery(&self) -> Result<Gallery, StoreError> {
        let mut gallery = Gallery::new();
        for name in self.names()? {
            match self.load(&name) {
                Ok(descriptors) => gallery.insert(name, descriptors),
                // Deleted between listing and loading.
                Err(StoreError::NotFound(_)) => continue,
                Err(StoreError::Serialization(e)) => {
                    tracing::warn!(name = %name, error = %e, "skipping unreadable identity record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(gallery)
    }
}

fn storage_key(name: &str) -> String {
    format!("{KEY_PREFIX}{name}")
}

fn validate_descriptors(name: &str, descriptors: &[Descriptor]) -> Result<usize, StoreError> {
    let first = descriptors
        .first()
        .ok_or_else(|| StoreError::EmptyDescriptors(name.to_string()))?;
    let expected = first.len();
    if expected == 0 {
        return Err(StoreError::EmptyDescriptors(name.to_string()));
    }
    for (index, d) in descriptors.iter().enumerate() {
        if d.len() != expected {
            return Err(StoreError::InconsistentDimensions {
                name: name.to_string(),
                index,
                expected,
                found: d.len(),
            });
        }
        // JSON has no encoding for NaN or infinity.
        if let Some(position) = d.first_non_finite() {
            return Err(StoreError::NonFiniteValue {
                name: name.to_string(),
                index,
                position,
            });
        }
    }
    Ok(expected)
}

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::model::UnixTimeMs;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

// ============================================================================
// Keys and values
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        let invalid = |reason: &str| {
            Err(KvError::InvalidKey {
                key: key.chars().take(50).collect(),
                reason: reason.to_string(),
            })
        };

        if key.trim().is_empty() {
            return invalid("key cannot be empty");
        }
        if key.len() > MAX_KEY_LENGTH {
            return invalid("key exceeds maximum length");
        }
        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return invalid("key cannot look like a path");
        }
        if key.chars().any(char::is_control) {
            return invalid("key contains control characters");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyNamespace {
    /// Credentials and other per-login state.
    Session,
    /// Objects stored remotely whose registration has not succeeded yet.
    PendingRegistrations,
    Settings,
}

impl KeyNamespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            KeyNamespace::Session => "session",
            KeyNamespace::PendingRegistrations => "pending_registrations",
            KeyNamespace::Settings => "settings",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvValue {
    data: Vec<u8>,
    version: u64,
    created_at: u64,
    updated_at: u64,
}

impl KvValue {
    pub fn new(data: Vec<u8>, now_ms: u64) -> Result<Self, KvError> {
        check_size(&data)?;
        Ok(Self {
            data,
            version: 1,
            created_at: now_ms,
            updated_at: now_ms,
        })
    }

    pub(crate) fn from_parts(data: Vec<u8>, version: u64, created_at: u64, updated_at: u64) -> Self {
        Self {
            data,
            version,
            created_at,
            updated_at,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, KvError> {
        serde_json::from_slice(&self.data).map_err(|e| KvError::Serialization {
            message: e.to_string(),
        })
    }

    fn replace(&mut self, data: Vec<u8>, now_ms: u64) {
        self.data = data;
        self.version = self.version.saturating_add(1);
        self.updated_at = now_ms;
    }
}

fn check_size(data: &[u8]) -> Result<(), KvError> {
    if data.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: data.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Storage { retryable: true, .. })
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    ConnectionFailed,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorCode::ConnectionFailed | StorageErrorCode::Busy | StorageErrorCode::Locked
        )
    }
}

// ============================================================================
// Store trait and in-memory implementation
// ============================================================================

#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<KvValue>, KvError>;
    /// Returns the new version.
    async fn set(&self, key: &KvKey, data: Vec<u8>) -> Result<u64, KvError>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &KvKey) -> Result<bool, KvError>;
    /// All entries of one namespace, ordered by key.
    async fn list(&self, namespace: &KeyNamespace) -> Result<Vec<(KvKey, KvValue)>, KvError>;
}

#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<KvKey, KvValue>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<KvValue>, KvError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &KvKey, data: Vec<u8>) -> Result<u64, KvError> {
        check_size(&data)?;
        let now = UnixTimeMs::now().0;
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(existing) => {
                existing.replace(data, now);
                Ok(existing.version())
            }
            None => {
                entries.insert(key.clone(), KvValue::new(data, now)?);
                Ok(1)
            }
        }
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn list(&self, namespace: &KeyNamespace) -> Result<Vec<(KvKey, KvValue)>, KvError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.namespace() == namespace)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// ============================================================================
// SQLite implementation
// ============================================================================

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKvStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::*;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::path::Path;
    use std::sync::Mutex;

    /// Single-connection SQLite store. Statements run on the blocking pool.
    pub struct SqliteKvStore {
        conn: Arc<Mutex<Connection>>,
    }

    impl SqliteKvStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
            let conn = Connection::open(path).map_err(map_sqlite_error)?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv_entries (
                    namespace TEXT NOT NULL,
                    key TEXT NOT NULL,
                    data BLOB NOT NULL,
                    version INTEGER NOT NULL DEFAULT 1,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (namespace, key)
                );
                "#,
            )
            .map_err(map_sqlite_error)?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        async fn with_conn<T, F>(&self, f: F) -> Result<T, KvError>
        where
            T: Send + 'static,
            F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || {
                let guard = conn.lock().map_err(|_| {
                    KvError::storage(StorageErrorCode::Corrupted, "connection mutex poisoned")
                })?;
                f(&guard).map_err(map_sqlite_error)
            })
            .await
            .map_err(|e| KvError::storage(StorageErrorCode::Unknown, e.to_string()))?
        }
    }

    #[async_trait::async_trait]
    impl KeyValueStore for SqliteKvStore {
        async fn get(&self, key: &KvKey) -> Result<Option<KvValue>, KvError> {
            let namespace = key.namespace().prefix();
            let key = key.key().to_string();
            self.with_conn(move |conn| {
                conn.query_row(
                    "SELECT data, version, created_at, updated_at FROM kv_entries
                     WHERE namespace = ?1 AND key = ?2",
                    params![namespace, key],
                    |row| {
                        Ok(KvValue::from_parts(
                            row.get(0)?,
                            row.get::<_, i64>(1)? as u64,
                            row.get::<_, i64>(2)? as u64,
                            row.get::<_, i64>(3)? as u64,
                        ))
                    },
                )
                .optional()
            })
            .await
        }

        async fn set(&self, key: &KvKey, data: Vec<u8>) -> Result<u64, KvError> {
            check_size(&data)?;
            let namespace = key.namespace().prefix();
            let key = key.key().to_string();
            let now = UnixTimeMs::now().0 as i64;
            self.with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO kv_entries (namespace, key, data, version, created_at, updated_at)
                    VALUES (?1, ?2, ?3, 1, ?4, ?4)
                    ON CONFLICT(namespace, key) DO UPDATE SET
                        data = excluded.data,
                        version = kv_entries.version + 1,
                        updated_at = excluded.updated_at
                    "#,
                    params![namespace, key, data, now],
                )?;
                conn.query_row(
                    "SELECT version FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                    params![namespace, key],
                    |row| row.get::<_, i64>(0),
                )
                .map(|v| v as u64)
            })
            .await
        }

        async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
            let namespace = key.namespace().prefix();
            let key = key.key().to_string();
            self.with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                    params![namespace, key],
                )
                .map(|n| n > 0)
            })
            .await
        }

        async fn list(&self, namespace: &KeyNamespace) -> Result<Vec<(KvKey, KvValue)>, KvError> {
            let prefix = namespace.prefix();
            let rows: Vec<(String, KvValue)> = self
                .with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT key, data, version, created_at, updated_at FROM kv_entries
                         WHERE namespace = ?1 ORDER BY key",
                    )?;
                    let rows = stmt.query_map(params![prefix], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            KvValue::from_parts(
                                row.get(1)?,
                                row.get::<_, i64>(2)? as u64,
                                row.get::<_, i64>(3)? as u64,
                                row.get::<_, i64>(4)? as u64,
                            ),
                        ))
                    })?;
                    rows.collect()
                })
                .await?;

            rows.into_iter()
                .map(|(key, value)| Ok((KvKey::new(namespace.clone(), key)?, value)))
                .collect()
        }
    }

    fn map_sqlite_error(e: rusqlite::Error) -> KvError {
        use rusqlite::ErrorCode;

        let code = match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                ErrorCode::DiskFull => StorageErrorCode::DiskFull,
                ErrorCode::PermissionDenied | ErrorCode::ReadOnly => {
                    StorageErrorCode::PermissionDenied
                }
                ErrorCode::CannotOpen => StorageErrorCode::ConnectionFailed,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => StorageErrorCode::Corrupted,
                _ => StorageErrorCode::Unknown,
            },
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, e.to_string())
    }
}

// ============================================================================
// Typed view over one namespace
// ============================================================================

/// JSON-encoded values of one type, all under one namespace.
pub struct TypedKvStore<T> {
    store: Arc<dyn KeyValueStore>,
    namespace: KeyNamespace,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> TypedKvStore<T> {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: KeyNamespace) -> Self {
        Self {
            store,
            namespace,
            _phantom: PhantomData,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>, KvError> {
        let key = KvKey::new(self.namespace.clone(), key)?;
        match self.store.get(&key).await? {
            Some(value) => Ok(Some(value.deserialize()?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, value: &T) -> Result<u64, KvError> {
        let key = KvKey::new(self.namespace.clone(), key)?;
        let data = serde_json::to_vec(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
        })?;
        self.store.set(&key, data).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool, KvError> {
        let key = KvKey::new(self.namespace.clone(), key)?;
        self.store.delete(&key).await
    }

    /// Entries that fail to decode are skipped with a warning rather than
    /// failing the whole listing.
    pub async fn values(&self) -> Result<Vec<(String, T)>, KvError> {
        let entries = self.store.list(&self.namespace).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, value)| match value.deserialize() {
                Ok(v) => Some((key.key().to_string(), v)),
                Err(e) => {
                    tracing::warn!(key = %key.raw(), error = %e, "skipping undecodable entry");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(matches!(
            KvKey::new(KeyNamespace::Session, ""),
            Err(KvError::InvalidKey { .. })
        ));
        assert!(KvKey::new(KeyNamespace::Session, "   ").is_err());
        assert!(KvKey::new(KeyNamespace::Session, "key\0value").is_err());
        assert!(KvKey::new(KeyNamespace::Session, "../etc/passwd").is_err());
        assert!(KvKey::new(KeyNamespace::Session, "a".repeat(MAX_KEY_LENGTH + 1)).is_err());
        assert!(KvKey::new(KeyNamespace::Session, "jwt").is_ok());
    }

    #[test]
    fn test_key_namespace_prefix() {
        let key = KvKey::new(KeyNamespace::PendingRegistrations, "job-1").unwrap();
        assert_eq!(key.raw(), "pending_registrations:job-1");
    }

    #[test]
    fn test_value_size_limit() {
        let result = KvValue::new(vec![0u8; MAX_VALUE_SIZE + 1], 0);
        assert!(matches!(result, Err(KvError::ValueTooLarge { .. })));
    }

    #[test]
    fn test_error_retryable() {
        assert!(KvError::storage(StorageErrorCode::Busy, "busy").is_retryable());
        assert!(!KvError::storage(StorageErrorCode::Corrupted, "bad").is_retryable());
    }

    #[tokio::test]
    async fn test_memory_store_versions_and_namespaces() {
        let store = MemoryKvStore::new();
        let token = KvKey::new(KeyNamespace::Session, "jwt").unwrap();
        let other = KvKey::new(KeyNamespace::Settings, "jwt").unwrap();

        assert_eq!(store.set(&token, b"a".to_vec()).await.unwrap(), 1);
        assert_eq!(store.set(&token, b"b".to_vec()).await.unwrap(), 2);
        store.set(&other, b"c".to_vec()).await.unwrap();

        let value = store.get(&token).await.unwrap().unwrap();
        assert_eq!(value.data(), b"b");
        assert_eq!(value.version(), 2);

        let session = store.list(&KeyNamespace::Session).await.unwrap();
        assert_eq!(session.len(), 1);

        assert!(store.delete(&token).await.unwrap());
        assert!(!store.delete(&token).await.unwrap());
        assert!(store.get(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteKvStore::open(dir.path().join("kv.db")).unwrap();
        let key = KvKey::new(KeyNamespace::Session, "jwt").unwrap();

        assert_eq!(store.set(&key, b"one".to_vec()).await.unwrap(), 1);
        assert_eq!(store.set(&key, b"two".to_vec()).await.unwrap(), 2);
        let value = store.get(&key).await.unwrap().unwrap();
        assert_eq!(value.data(), b"two");

        let listed = store.list(&KeyNamespace::Session).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, key);

        assert!(store.delete(&key).await.unwrap());
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_typed_store_skips_corrupt_entries() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Entry {
            url: String,
        }

        let raw: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let typed: TypedKvStore<Entry> =
            TypedKvStore::new(Arc::clone(&raw), KeyNamespace::PendingRegistrations);

        typed
            .put("a", &Entry { url: "https://cdn.example.com/a".into() })
            .await
            .unwrap();
        let corrupt = KvKey::new(KeyNamespace::PendingRegistrations, "b").unwrap();
        raw.set(&corrupt, b"not json".to_vec()).await.unwrap();

        let values = typed.values().await.unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].0, "a");
        assert!(typed.remove("a").await.unwrap());
        assert!(typed.get("a").await.unwrap().is_none());
    }
}

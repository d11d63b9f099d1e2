use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// An error type for key store backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend io error: {0}")]
    Io(String),
    #[error("backend codec error: {0}")]
    Codec(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Raw string-map storage, abstracting over the four backend kinds named in
/// the configuration surface (`memory`, `persistent`, `scoped_persistent`,
/// `indexed_persistent`). [`crate::keystore::KeyStore`] layers validation,
/// fingerprinting, encryption and mutex-serialization on top of this.
#[async_trait]
pub trait KeyStoreBackend: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;
    async fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError>;
    async fn remove_raw(&self, key: &str) -> Result<(), BackendError>;
    async fn list_raw(&self) -> Result<Vec<String>, BackendError>;
    async fn clear(&self) -> Result<(), BackendError>;
    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// In-process map, cleared on `destroy`/drop. Default fallback backend.
#[derive(Default)]
pub struct EphemeralBackend {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl EphemeralBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStoreBackend for EphemeralBackend {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.map.lock().await.get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError> {
        self.map.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_raw(&self, key: &str) -> Result<(), BackendError> {
        self.map.lock().await.remove(key);
        Ok(())
    }

    async fn list_raw(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.map.lock().await.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.map.lock().await.clear();
        Ok(())
    }
}

/// Device-local, file-backed persistence. The native-Rust analogue of a
/// `localStorage`-style backend: one JSON object per directory, keyed by
/// the record key.
pub struct PersistentBackend {
    path: PathBuf,
    cache: Mutex<HashMap<String, Vec<u8>>>,
}

impl PersistentBackend {
    pub async fn open(path: PathBuf) -> Result<Self, BackendError> {
        let cache = load_json_map(&path).await?;
        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    async fn flush(&self, map: &HashMap<String, Vec<u8>>) -> Result<(), BackendError> {
        save_json_map(&self.path, map).await
    }
}

#[async_trait]
impl KeyStoreBackend for PersistentBackend {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.cache.lock().await.get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError> {
        let mut guard = self.cache.lock().await;
        guard.insert(key.to_string(), value);
        self.flush(&guard).await
    }

    async fn remove_raw(&self, key: &str) -> Result<(), BackendError> {
        let mut guard = self.cache.lock().await;
        guard.remove(key);
        self.flush(&guard).await
    }

    async fn list_raw(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.cache.lock().await.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        let mut guard = self.cache.lock().await;
        guard.clear();
        self.flush(&guard).await
    }
}

/// Same storage mechanics as [`PersistentBackend`], but scoped to the
/// lifetime of one `KeyStore` instance rather than the whole device — there
/// is no browser-tab-session concept natively, so the scope boundary is the
/// `KeyStore` object itself. `destroy()` truncates the backing file.
pub struct ScopedPersistentBackend {
    inner: PersistentBackend,
}

impl ScopedPersistentBackend {
    pub async fn open(path: PathBuf) -> Result<Self, BackendError> {
        Ok(Self {
            inner: PersistentBackend::open(path).await?,
        })
    }
}

#[async_trait]
impl KeyStoreBackend for ScopedPersistentBackend {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.inner.get_raw(key).await
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError> {
        self.inner.set_raw(key, value).await
    }

    async fn remove_raw(&self, key: &str) -> Result<(), BackendError> {
        self.inner.remove_raw(key).await
    }

    async fn list_raw(&self) -> Result<Vec<String>, BackendError> {
        self.inner.list_raw().await
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.inner.clear().await
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.inner.clear().await
    }
}

/// Structured, larger-record store backed by an embedded `sled` database.
/// The native-Rust analogue of an `indexedDB` backend; explicitly owns a
/// file handle that must be closed in `destroy`.
pub struct IndexedPersistentBackend {
    db: Arc<sled::Db>,
}

impl IndexedPersistentBackend {
    pub fn open(path: PathBuf) -> Result<Self, BackendError> {
        let db = sled::open(path).map_err(|e| BackendError::Io(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl KeyStoreBackend for IndexedPersistentBackend {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.db
            .get(key)
            .map(|opt| opt.map(|v| v.to_vec()))
            .map_err(|e| BackendError::Io(e.to_string()))
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<(), BackendError> {
        self.db
            .insert(key, value)
            .map_err(|e| BackendError::Io(e.to_string()))?;
        Ok(())
    }

    async fn remove_raw(&self, key: &str) -> Result<(), BackendError> {
        self.db
            .remove(key)
            .map_err(|e| BackendError::Io(e.to_string()))?;
        Ok(())
    }

    async fn list_raw(&self) -> Result<Vec<String>, BackendError> {
        self.db
            .iter()
            .keys()
            .map(|k| {
                k.map(|k| String::from_utf8_lossy(&k).to_string())
                    .map_err(|e| BackendError::Io(e.to_string()))
            })
            .collect()
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.db.clear().map_err(|e| BackendError::Io(e.to_string()))
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| BackendError::Io(e.to_string()))
    }
}

async fn load_json_map(path: &PathBuf) -> Result<HashMap<String, Vec<u8>>, BackendError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let encoded: HashMap<String, String> =
                serde_json::from_slice(&bytes).map_err(|e| BackendError::Codec(e.to_string()))?;
            let mut map = HashMap::with_capacity(encoded.len());
            for (k, v) in encoded {
                let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, v)
                    .map_err(|e| BackendError::Codec(e.to_string()))?;
                map.insert(k, bytes);
            }
            Ok(map)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(BackendError::Io(e.to_string())),
    }
}

async fn save_json_map(path: &PathBuf, map: &HashMap<String, Vec<u8>>) -> Result<(), BackendError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BackendError::Io(e.to_string()))?;
    }
    let encoded: HashMap<String, String> = map
        .iter()
        .map(|(k, v)| {
            (
                k.clone(),
                base64::Engine::encode(&base64::engine::general_purpose::STANDARD, v),
            )
        })
        .collect();
    let bytes = serde_json::to_vec(&encoded).map_err(|e| BackendError::Codec(e.to_string()))?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| BackendError::Io(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_roundtrips() {
        let backend = EphemeralBackend::new();
        backend.set_raw("openai", b"secret".to_vec()).await.unwrap();
        assert_eq!(
            backend.get_raw("openai").await.unwrap(),
            Some(b"secret".to_vec())
        );
        backend.remove_raw("openai").await.unwrap();
        assert_eq!(backend.get_raw("openai").await.unwrap(), None);
    }

    #[tokio::test]
    async fn persistent_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        {
            let backend = PersistentBackend::open(path.clone()).await.unwrap();
            backend.set_raw("anthropic", b"abc".to_vec()).await.unwrap();
        }
        let reopened = PersistentBackend::open(path).await.unwrap();
        assert_eq!(
            reopened.get_raw("anthropic").await.unwrap(),
            Some(b"abc".to_vec())
        );
    }
}

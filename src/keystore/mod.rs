pub mod backend;
pub mod crypto;

use crate::error::{ErrorKind, LlmError};
use crate::event::EventKind;
use crate::event_bus::EventBus;
use backend::{BackendError, KeyStoreBackend};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

impl From<BackendError> for LlmError {
    fn from(err: BackendError) -> Self {
        LlmError::new(ErrorKind::StorageError, err.to_string())
    }
}

/// Metadata kept alongside a stored credential. The secret itself is held
/// separately (encrypted, if configured) and is never part of this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialMeta {
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub encrypted: bool,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    meta: CredentialMeta,
    /// Either the raw secret bytes or a serialized `EncryptedRecord`,
    /// depending on `meta.encrypted`.
    payload: Vec<u8>,
}

/// Provider-specific key-format conventions used by `validate`. Providers
/// with no known convention (e.g. local-inference) accept any non-empty
/// string, or no key at all.
fn expected_prefix(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" | "groq" | "together" | "fireworks" | "perplexity" | "deepseek" => Some("sk-"),
        "anthropic" => Some("sk-ant-"),
        "google" => Some("AIza"),
        _ => None,
    }
}

fn validate_key(provider: &str, key: &str) -> Result<(), LlmError> {
    if key.is_empty() || key.len() < 8 || key.len() > 512 {
        return Err(LlmError::new(
            ErrorKind::KeyInvalid,
            "key must be between 8 and 512 characters",
        )
        .with_provider(provider));
    }
    if let Some(prefix) = expected_prefix(provider) {
        if !key.starts_with(prefix) {
            return Err(LlmError::new(
                ErrorKind::KeyInvalid,
                format!("key for provider '{provider}' must start with '{prefix}'"),
            )
            .with_provider(provider));
        }
    }
    Ok(())
}

/// Optional at-rest encryption configuration. When absent, credentials are
/// stored as plaintext bytes in the chosen backend.
pub struct EncryptionConfig {
    pub password: Zeroizing<String>,
}

pub struct KeyStoreOptions {
    pub auto_expire_after: Option<Duration>,
    pub encryption: Option<EncryptionConfig>,
}

impl Default for KeyStoreOptions {
    fn default() -> Self {
        Self {
            auto_expire_after: None,
            encryption: None,
        }
    }
}

/// Credential custody: validation, fingerprinting, optional AES-256-GCM
/// encryption, rotation and auto-expiry, layered over a pluggable
/// [`KeyStoreBackend`]. All mutating operations are serialized by an
/// internal mutex so rotation is observed atomically.
pub struct KeyStore {
    backend: Arc<dyn KeyStoreBackend>,
    events: Option<Arc<EventBus>>,
    options: KeyStoreOptions,
    write_lock: Mutex<()>,
}

impl KeyStore {
    pub fn new(backend: Arc<dyn KeyStoreBackend>, options: KeyStoreOptions) -> Self {
        Self {
            backend,
            events: None,
            options,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn set(&self, provider: &str, key: &str) -> Result<(), LlmError> {
        validate_key(provider, key)?;
        let _guard = self.write_lock.lock().await;

        let fp = crypto::fingerprint(key);
        let meta = CredentialMeta {
            provider: provider.to_string(),
            created_at: Utc::now(),
            last_used_at: None,
            expires_at: self.options.auto_expire_after.map(|d| Utc::now() + d),
            encrypted: self.options.encryption.is_some(),
            fingerprint: fp.clone(),
        };
        let payload = self.encode_payload(key)?;
        let record = StoredRecord { meta, payload };
        let bytes = serde_json::to_vec(&record)?;
        self.backend.set_raw(provider, bytes).await?;

        if let Some(events) = &self.events {
            events.publish(
                provider,
                EventKind::KeySet {
                    provider: provider.to_string(),
                    fingerprint: fp,
                },
            );
        }
        Ok(())
    }

    pub async fn get(&self, provider: &str) -> Result<Option<Zeroizing<String>>, LlmError> {
        let Some(bytes) = self.backend.get_raw(provider).await? else {
            return Ok(None);
        };
        let record: StoredRecord = serde_json::from_slice(&bytes)?;

        if let Some(expires_at) = record.meta.expires_at {
            if Utc::now() > expires_at {
                if let Some(events) = &self.events {
                    events.publish(
                        provider,
                        EventKind::KeyExpired {
                            provider: provider.to_string(),
                        },
                    );
                }
                return Ok(None);
            }
        }

        let secret = self.decode_payload(&record)?;
        Ok(Some(secret))
    }

    pub async fn has(&self, provider: &str) -> Result<bool, LlmError> {
        Ok(self.get(provider).await?.is_some())
    }

    pub async fn remove(&self, provider: &str) -> Result<(), LlmError> {
        let _guard = self.write_lock.lock().await;
        self.backend.remove_raw(provider).await?;
        if let Some(events) = &self.events {
            events.publish(
                provider,
                EventKind::KeyRemove {
                    provider: provider.to_string(),
                },
            );
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<String>, LlmError> {
        Ok(self.backend.list_raw().await?)
    }

    /// Validates and atomically replaces the key for `provider`. On
    /// validation failure the previously stored key is left untouched.
    /// Returns (old_fingerprint, new_fingerprint).
    pub async fn rotate(&self, provider: &str, new_key: &str) -> Result<(String, String), LlmError> {
        validate_key(provider, new_key)?;
        let _guard = self.write_lock.lock().await;

        let old_fp = match self.backend.get_raw(provider).await? {
            Some(bytes) => {
                let record: StoredRecord = serde_json::from_slice(&bytes)?;
                record.meta.fingerprint
            }
            None => String::new(),
        };

        let new_fp = crypto::fingerprint(new_key);
        let meta = CredentialMeta {
            provider: provider.to_string(),
            created_at: Utc::now(),
            last_used_at: None,
            expires_at: self.options.auto_expire_after.map(|d| Utc::now() + d),
            encrypted: self.options.encryption.is_some(),
            fingerprint: new_fp.clone(),
        };
        let payload = self.encode_payload(new_key)?;
        let bytes = serde_json::to_vec(&StoredRecord { meta, payload })?;
        self.backend.set_raw(provider, bytes).await?;

        if let Some(events) = &self.events {
            events.publish(
                provider,
                EventKind::KeyRotate {
                    provider: provider.to_string(),
                    old_fingerprint: old_fp.clone(),
                    new_fingerprint: new_fp.clone(),
                },
            );
        }
        Ok((old_fp, new_fp))
    }

    pub async fn clear(&self) -> Result<(), LlmError> {
        let _guard = self.write_lock.lock().await;
        Ok(self.backend.clear().await?)
    }

    pub async fn destroy(&self) -> Result<(), LlmError> {
        let _guard = self.write_lock.lock().await;
        self.backend.clear().await?;
        Ok(self.backend.close().await?)
    }

    fn encode_payload(&self, key: &str) -> Result<Vec<u8>, LlmError> {
        match &self.options.encryption {
            Some(cfg) => {
                let record = crypto::encrypt(cfg.password.as_bytes(), key.as_bytes())
                    .map_err(|e| LlmError::new(ErrorKind::EncryptionError, e.to_string()))?;
                Ok(serde_json::to_vec(&record)?)
            }
            None => Ok(key.as_bytes().to_vec()),
        }
    }

    fn decode_payload(&self, record: &StoredRecord) -> Result<Zeroizing<String>, LlmError> {
        if record.meta.encrypted {
            let cfg = self.options.encryption.as_ref().ok_or_else(|| {
                LlmError::new(
                    ErrorKind::EncryptionError,
                    "record is encrypted but no encryption password is configured",
                )
            })?;
            let encrypted: crypto::EncryptedRecord = serde_json::from_slice(&record.payload)?;
            let plaintext = crypto::decrypt(cfg.password.as_bytes(), &encrypted)
                .map_err(|e| LlmError::new(ErrorKind::EncryptionError, e.to_string()))?;
            let s = String::from_utf8(plaintext.to_vec())
                .map_err(|e| LlmError::new(ErrorKind::EncryptionError, e.to_string()))?;
            Ok(Zeroizing::new(s))
        } else {
            let s = String::from_utf8(record.payload.clone())
                .map_err(|e| LlmError::new(ErrorKind::StorageError, e.to_string()))?;
            Ok(Zeroizing::new(s))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::EphemeralBackend;

    fn store() -> KeyStore {
        KeyStore::new(Arc::new(EphemeralBackend::new()), KeyStoreOptions::default())
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = store();
        store.set("openai", "sk-abcdefghij").await.unwrap();
        let key = store.get("openai").await.unwrap().unwrap();
        assert_eq!(&*key, "sk-abcdefghij");
    }

    #[tokio::test]
    async fn set_rejects_wrong_prefix() {
        let store = store();
        let err = store.set("openai", "wrong-prefix-key").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::KeyInvalid);
    }

    #[tokio::test]
    async fn set_rejects_too_short_key() {
        let store = store();
        let err = store.set("ollama", "short").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::KeyInvalid);
    }

    #[tokio::test]
    async fn rotate_fails_validation_leaves_old_key_intact() {
        let store = store();
        store.set("openai", "sk-original12345").await.unwrap();
        let err = store.rotate("openai", "bad").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::KeyInvalid);
        let key = store.get("openai").await.unwrap().unwrap();
        assert_eq!(&*key, "sk-original12345");
    }

    #[tokio::test]
    async fn rotate_returns_old_and_new_fingerprints() {
        let store = store();
        store.set("openai", "sk-original12345").await.unwrap();
        let (old_fp, new_fp) = store.rotate("openai", "sk-rotated6789012").await.unwrap();
        assert_ne!(old_fp, new_fp);
        let key = store.get("openai").await.unwrap().unwrap();
        assert_eq!(&*key, "sk-rotated6789012");
    }

    #[tokio::test]
    async fn encrypted_store_roundtrips_and_never_stores_plaintext() {
        let store = KeyStore::new(
            Arc::new(EphemeralBackend::new()),
            KeyStoreOptions {
                auto_expire_after: None,
                encryption: Some(EncryptionConfig {
                    password: Zeroizing::new("hunter2".to_string()),
                }),
            },
        );
        store.set("anthropic", "sk-ant-abcdefghij").await.unwrap();
        let key = store.get("anthropic").await.unwrap().unwrap();
        assert_eq!(&*key, "sk-ant-abcdefghij");
    }

    #[tokio::test]
    async fn auto_expire_hides_key_after_duration_elapses() {
        let store = KeyStore::new(
            Arc::new(EphemeralBackend::new()),
            KeyStoreOptions {
                auto_expire_after: Some(Duration::milliseconds(-1)),
                encryption: None,
            },
        );
        store.set("openai", "sk-abcdefghij").await.unwrap();
        assert!(store.get("openai").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_then_get_returns_none() {
        let store = store();
        store.set("openai", "sk-abcdefghij").await.unwrap();
        store.remove("openai").await.unwrap();
        assert!(store.get("openai").await.unwrap().is_none());
    }
}

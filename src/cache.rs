use crate::chat::ChatRequest;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

/// Deterministic content-hash key for a chat request, over exactly the
/// fields that affect the response: provider, model, messages, tools,
/// response_format, temperature, top_p, stop, seed, max_tokens, and the
/// penalty params. `signal`, `metadata`, `priority` and `skip_cache` are
/// excluded, and streaming requests never reach this function.
pub fn fingerprint(req: &ChatRequest) -> String {
    #[derive(Serialize)]
    struct Canonical<'a> {
        provider: &'a str,
        model: &'a str,
        messages: &'a [crate::chat::Message],
        tools: &'a Option<Vec<crate::chat::Tool>>,
        response_format: &'a Option<crate::chat::ResponseFormat>,
        temperature: Option<f32>,
        top_p: Option<f32>,
        stop: &'a Option<either::Either<String, Vec<String>>>,
        seed: Option<i64>,
        max_tokens: Option<u32>,
        presence_penalty: Option<f32>,
        frequency_penalty: Option<f32>,
    }
    let canonical = Canonical {
        provider: &req.provider,
        model: &req.model,
        messages: &req.messages,
        tools: &req.tools,
        response_format: &req.response_format,
        temperature: req.temperature,
        top_p: req.top_p,
        stop: &req.stop,
        seed: req.seed,
        max_tokens: req.max_tokens,
        presence_penalty: req.presence_penalty,
        frequency_penalty: req.frequency_penalty,
    };
    let bytes = serde_json::to_vec(&canonical).expect("ChatRequest fields are JSON-serializable");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

struct Entry<V> {
    value: V,
    inserted_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    hits: u64,
    size: usize,
}

pub struct CacheOptions {
    pub max_entries: usize,
    pub max_size: usize,
    pub ttl: Option<Duration>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_size: 50 * 1024 * 1024,
            ttl: Some(Duration::minutes(10)),
        }
    }
}

/// Fingerprint → response cache with LRU eviction plus a TTL and an
/// aggregate size cap. Single-writer per key in practice, since the Dedup
/// Coalescer ensures no two callers race a write for the same fingerprint.
pub struct Cache<V: Clone> {
    entries: Mutex<HashMap<String, Entry<V>>>,
    recency: Mutex<VecDeque<String>>,
    total_size: Mutex<usize>,
    opts: CacheOptions,
}

impl<V: Clone> Cache<V> {
    pub fn new(opts: CacheOptions) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            recency: Mutex::new(VecDeque::new()),
            total_size: Mutex::new(0),
            opts,
        }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        let stale = match entries.get(key) {
            Some(entry) => entry.expires_at.map(|exp| Utc::now() > exp).unwrap_or(false),
            None => return None,
        };
        if stale {
            let entry = entries.remove(key).expect("checked above");
            *self.total_size.lock().await -= entry.size;
            return None;
        }
        let entry = entries.get_mut(key).expect("checked above");
        entry.hits += 1;
        let value = entry.value.clone();
        drop(entries);
        self.touch_recency(key).await;
        Some(value)
    }

    pub async fn set(&self, key: String, value: V, size: usize) {
        let expires_at = self.opts.ttl.map(|ttl| Utc::now() + ttl);
        {
            let mut entries = self.entries.lock().await;
            let mut total = self.total_size.lock().await;
            if let Some(old) = entries.remove(&key) {
                *total -= old.size;
            }
            entries.insert(
                key.clone(),
                Entry {
                    value,
                    inserted_at: Utc::now(),
                    expires_at,
                    hits: 0,
                    size,
                },
            );
            *total += size;
        }
        self.touch_recency(&key).await;
        self.evict_if_needed().await;
    }

    async fn touch_recency(&self, key: &str) {
        let mut recency = self.recency.lock().await;
        recency.retain(|k| k != key);
        recency.push_back(key.to_string());
    }

    async fn evict_if_needed(&self) {
        loop {
            let over_count = self.entries.lock().await.len() > self.opts.max_entries;
            let over_size = *self.total_size.lock().await > self.opts.max_size;
            if !over_count && !over_size {
                break;
            }
            let oldest = {
                let mut recency = self.recency.lock().await;
                recency.pop_front()
            };
            let Some(oldest) = oldest else { break };
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.remove(&oldest) {
                *self.total_size.lock().await -= entry.size;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    #[cfg(test)]
    async fn hits(&self, key: &str) -> Option<u64> {
        self.entries.lock().await.get(key).map(|e| e.hits)
    }

    #[cfg(test)]
    async fn inserted_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.lock().await.get(key).map(|e| e.inserted_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Message;

    fn request(model: &str) -> ChatRequest {
        ChatRequest::new("openai", model, vec![Message::user("hi")])
    }

    #[test]
    fn fingerprint_is_stable_for_identical_requests() {
        let a = fingerprint(&request("gpt-4-turbo"));
        let b = fingerprint(&request("gpt-4-turbo"));
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_when_model_differs() {
        let a = fingerprint(&request("gpt-4-turbo"));
        let b = fingerprint(&request("gpt-3.5-turbo"));
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_ignores_skip_cache_and_priority() {
        let mut a = request("gpt-4-turbo");
        let mut b = request("gpt-4-turbo");
        a.skip_cache = true;
        a.priority = crate::chat::Priority::Critical;
        b.skip_cache = false;
        b.priority = crate::chat::Priority::Background;
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[tokio::test]
    async fn get_after_set_returns_the_stored_value() {
        let cache: Cache<String> = Cache::new(CacheOptions::default());
        cache.set("k".into(), "v".into(), 1).await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));
        assert_eq!(cache.hits("k").await, Some(1));
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_used_entry_once_over_capacity() {
        let cache: Cache<String> = Cache::new(CacheOptions {
            max_entries: 2,
            max_size: usize::MAX,
            ttl: None,
        });
        cache.set("a".into(), "1".into(), 1).await;
        cache.set("b".into(), "2".into(), 1).await;
        cache.get("a").await;
        cache.set("c".into(), "3".into(), 1).await;
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.get("a").await, Some("1".to_string()));
    }

    #[tokio::test]
    async fn entries_older_than_ttl_are_treated_as_absent() {
        let cache: Cache<String> = Cache::new(CacheOptions {
            max_entries: 10,
            max_size: usize::MAX,
            ttl: Some(Duration::milliseconds(-1)),
        });
        cache.set("k".into(), "v".into(), 1).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn size_cap_evicts_entries() {
        let cache: Cache<String> = Cache::new(CacheOptions {
            max_entries: 100,
            max_size: 5,
            ttl: None,
        });
        cache.set("a".into(), "1".into(), 3).await;
        cache.set("b".into(), "2".into(), 3).await;
        assert!(cache.len().await <= 1);
    }
}

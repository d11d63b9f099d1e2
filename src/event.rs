use serde::{Deserialize, Serialize};

/// A single published event. `seq` is a bus-wide monotonic sequence number;
/// `request_id` correlates events belonging to the same call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub request_id: String,
    pub kind: EventKind,
}

/// Tag identifying which [`EventKind`] variant an event carries, used for
/// per-kind listener registration and for the listener count limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKindTag {
    RequestStart,
    RequestEnd,
    RequestError,
    RequestRetry,
    StreamStart,
    StreamChunk,
    StreamEnd,
    StreamError,
    StreamAbort,
    KeySet,
    KeyRemove,
    KeyExpired,
    KeyRotate,
    KeyValidate,
    KeyError,
    CacheHit,
    CacheMiss,
    CacheSet,
    RetryAttempt,
    RateLimited,
    MiddlewareBefore,
    MiddlewareAfter,
    BatchProgress,
    BatchComplete,
    SecurityWarning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RequestStart { provider: String, model: String },
    RequestEnd { provider: String, model: String, duration_ms: u64 },
    RequestError { provider: String, kind: String, retryable: bool },
    RequestRetry { provider: String, attempt: u32, delay_ms: u64 },
    StreamStart { provider: String, model: String },
    StreamChunk { provider: String, index: u64 },
    StreamEnd { provider: String, chunk_count: u64 },
    StreamError { provider: String, kind: String },
    StreamAbort { provider: String },
    KeySet { provider: String, fingerprint: String },
    KeyRemove { provider: String },
    KeyExpired { provider: String },
    KeyRotate { provider: String, old_fingerprint: String, new_fingerprint: String },
    KeyValidate { provider: String, valid: bool },
    KeyError { provider: String, message: String },
    CacheHit { provider: String, model: String, fingerprint: String },
    CacheMiss { provider: String, model: String, fingerprint: String },
    CacheSet { provider: String, model: String, fingerprint: String },
    RetryAttempt { provider: String, attempt: u32 },
    RateLimited { provider: String, retry_after_ms: u64 },
    MiddlewareBefore { name: String },
    MiddlewareAfter { name: String },
    BatchProgress { completed: usize, total: usize },
    BatchComplete { completed: usize, failed: usize },
    SecurityWarning { message: String },
}

impl EventKind {
    pub fn tag(&self) -> EventKindTag {
        match self {
            EventKind::RequestStart { .. } => EventKindTag::RequestStart,
            EventKind::RequestEnd { .. } => EventKindTag::RequestEnd,
            EventKind::RequestError { .. } => EventKindTag::RequestError,
            EventKind::RequestRetry { .. } => EventKindTag::RequestRetry,
            EventKind::StreamStart { .. } => EventKindTag::StreamStart,
            EventKind::StreamChunk { .. } => EventKindTag::StreamChunk,
            EventKind::StreamEnd { .. } => EventKindTag::StreamEnd,
            EventKind::StreamError { .. } => EventKindTag::StreamError,
            EventKind::StreamAbort { .. } => EventKindTag::StreamAbort,
            EventKind::KeySet { .. } => EventKindTag::KeySet,
            EventKind::KeyRemove { .. } => EventKindTag::KeyRemove,
            EventKind::KeyExpired { .. } => EventKindTag::KeyExpired,
            EventKind::KeyRotate { .. } => EventKindTag::KeyRotate,
            EventKind::KeyValidate { .. } => EventKindTag::KeyValidate,
            EventKind::KeyError { .. } => EventKindTag::KeyError,
            EventKind::CacheHit { .. } => EventKindTag::CacheHit,
            EventKind::CacheMiss { .. } => EventKindTag::CacheMiss,
            EventKind::CacheSet { .. } => EventKindTag::CacheSet,
            EventKind::RetryAttempt { .. } => EventKindTag::RetryAttempt,
            EventKind::RateLimited { .. } => EventKindTag::RateLimited,
            EventKind::MiddlewareBefore { .. } => EventKindTag::MiddlewareBefore,
            EventKind::MiddlewareAfter { .. } => EventKindTag::MiddlewareAfter,
            EventKind::BatchProgress { .. } => EventKindTag::BatchProgress,
            EventKind::BatchComplete { .. } => EventKindTag::BatchComplete,
            EventKind::SecurityWarning { .. } => EventKindTag::SecurityWarning,
        }
    }
}

/// Implemented by anything that wants to observe bus events out-of-band
/// from the broadcast channel (e.g. a metrics sink).
#[async_trait::async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &Event) -> Result<(), crate::error::LlmError>;
}

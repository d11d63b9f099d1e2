use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Closed set of error classifications. Every failure the library surfaces,
/// whatever its original cause, is mapped onto exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ProviderNotFound,
    ModelNotFound,
    KeyNotSet,
    KeyInvalid,
    KeyExpired,
    RequestFailed,
    RateLimited,
    Timeout,
    Aborted,
    NetworkError,
    StreamError,
    ValidationError,
    EncryptionError,
    StorageError,
    MiddlewareError,
    TemplateError,
    BatchError,
    QuotaExceeded,
    ContentFiltered,
    ContextLengthExceeded,
    UnknownError,
}

/// The library's single public error type. `cause` is never serialized —
/// `toJSON`-equivalent output (`Serialize`) must never leak the original
/// error's `Display`, only the classified fields below. `cause` is an `Arc`
/// rather than a `Box` so the whole error is cheaply `Clone`, which the
/// Dedup Coalescer relies on to hand every waiting caller a full-fidelity
/// copy of the one settlement instead of a degraded reconstruction.
#[derive(Debug, Clone, Serialize)]
pub struct LlmError {
    pub kind: ErrorKind,
    pub message: String,
    pub provider: Option<String>,
    pub status: Option<u16>,
    pub retryable: bool,
    pub retry_after_ms: Option<u64>,
    pub details: Option<serde_json::Value>,
    pub request_id: Option<String>,
    #[serde(skip)]
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl LlmError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retryable = default_retryable(kind);
        Self {
            kind,
            message: message.into(),
            provider: None,
            status: None,
            retryable,
            retry_after_ms: None,
            details: None,
            request_id: None,
            cause: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Whether the Retry Engine is allowed to retry this error at all.
    /// Key errors are never retryable regardless of the `retryable` flag,
    /// since retrying cannot fix a missing/invalid/expired credential.
    pub fn can_retry(&self) -> bool {
        self.retryable
            && !matches!(
                self.kind,
                ErrorKind::KeyInvalid | ErrorKind::KeyNotSet | ErrorKind::KeyExpired
            )
    }

    /// Scheduled delay for the next retry attempt, honoring an observed
    /// `retry_after_ms` and otherwise falling back to capped exponential
    /// backoff with jitter. `attempt` is zero-based. `jitter` is the
    /// fractional amount of random slack added on top of the base delay
    /// (e.g. `0.1` allows up to +10%).
    pub fn retry_delay_ms(&self, attempt: u32, base_ms: u64, max_ms: u64, jitter: f64) -> u64 {
        if let Some(retry_after) = self.retry_after_ms {
            let jittered = retry_after as f64 * (1.0 + rand::random::<f64>() * jitter);
            return (jittered as u64).min(max_ms);
        }
        let exp = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped = exp.min(max_ms);
        let slack = (capped as f64 * rand::random::<f64>() * jitter) as u64;
        (capped + slack).min(max_ms)
    }

    /// Maps an HTTP status (plus an optional parsed JSON body, used to
    /// disambiguate 400s into content-filter/quota/context-length variants)
    /// into a classified error. Generalizes the status table exercised by
    /// the provider HTTP error-handling macros.
    pub fn from_http_status(status: u16, body: &str, provider: &str) -> Self {
        let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
        let message = parsed
            .as_ref()
            .and_then(|v| v.pointer("/error/message"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string());

        let kind = match status {
            400 => classify_bad_request(&message),
            401 | 403 => ErrorKind::KeyInvalid,
            404 => ErrorKind::ModelNotFound,
            408 => ErrorKind::Timeout,
            413 => ErrorKind::ContextLengthExceeded,
            429 => ErrorKind::RateLimited,
            451 => ErrorKind::ContentFiltered,
            500 | 502 | 503 | 504 | 529 => ErrorKind::RequestFailed,
            _ => ErrorKind::RequestFailed,
        };

        let mut err = LlmError::new(kind, message)
            .with_provider(provider)
            .with_status(status);
        if let Some(raw) = parsed {
            err = err.with_details(raw);
        }
        err
    }
}

fn classify_bad_request(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("context") && (lower.contains("length") || lower.contains("token")) {
        ErrorKind::ContextLengthExceeded
    } else if lower.contains("content") && (lower.contains("filter") || lower.contains("policy")) {
        ErrorKind::ContentFiltered
    } else if lower.contains("quota") || lower.contains("billing") {
        ErrorKind::QuotaExceeded
    } else {
        ErrorKind::ValidationError
    }
}

fn default_retryable(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::RequestFailed
            | ErrorKind::RateLimited
            | ErrorKind::Timeout
            | ErrorKind::NetworkError
    )
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(provider) = &self.provider {
            write!(f, " (provider: {provider})")?;
        }
        if let Some(status) = self.status {
            write!(f, " (status: {status})")?;
        }
        Ok(())
    }
}

impl std::error::Error for LlmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::new(ErrorKind::Timeout, err.to_string())
        } else {
            LlmError::new(ErrorKind::NetworkError, err.to_string())
        }
    }
}

impl From<http::Error> for LlmError {
    fn from(err: http::Error) -> Self {
        LlmError::new(ErrorKind::RequestFailed, err.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::new(
            ErrorKind::StreamError,
            format!("{err} at line {} column {}", err.line(), err.column()),
        )
    }
}

impl From<url::ParseError> for LlmError {
    fn from(err: url::ParseError) -> Self {
        LlmError::new(ErrorKind::ValidationError, format!("invalid url: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_errors_are_never_retryable_even_if_flagged() {
        let mut err = LlmError::new(ErrorKind::KeyInvalid, "bad key");
        err.retryable = true;
        assert!(!err.can_retry());
    }

    #[test]
    fn rate_limited_is_retryable_by_default() {
        let err = LlmError::new(ErrorKind::RateLimited, "too many requests");
        assert!(err.can_retry());
    }

    #[test]
    fn status_429_maps_to_rate_limited() {
        let err = LlmError::from_http_status(429, "{}", "openai");
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert!(err.can_retry());
    }

    #[test]
    fn status_401_maps_to_key_invalid_and_is_not_retryable() {
        let err = LlmError::from_http_status(401, "{}", "openai");
        assert_eq!(err.kind, ErrorKind::KeyInvalid);
        assert!(!err.can_retry());
    }

    #[test]
    fn status_413_maps_to_context_length_exceeded() {
        let err = LlmError::from_http_status(413, "{}", "openai");
        assert_eq!(err.kind, ErrorKind::ContextLengthExceeded);
    }

    #[test]
    fn error_message_extracted_from_json_body() {
        let err = LlmError::from_http_status(
            400,
            r#"{"error":{"message":"model not found"}}"#,
            "openai",
        );
        assert_eq!(err.message, "model not found");
    }

    #[test]
    fn retry_delay_honors_retry_after() {
        let err = LlmError::new(ErrorKind::RateLimited, "x").with_retry_after_ms(2000);
        let delay = err.retry_delay_ms(0, 1000, 60000, 0.1);
        assert!(delay >= 2000 && delay <= 2200);
    }

    #[test]
    fn retry_delay_caps_at_max() {
        let err = LlmError::new(ErrorKind::RequestFailed, "x");
        let delay = err.retry_delay_ms(10, 1000, 5000, 0.1);
        assert!(delay <= 5000);
    }

    #[test]
    fn retry_delay_zero_jitter_is_deterministic() {
        let err = LlmError::new(ErrorKind::RequestFailed, "x");
        let delay = err.retry_delay_ms(2, 1000, 60000, 0.0);
        assert_eq!(delay, 4000);
    }

    #[test]
    fn serialization_never_includes_cause() {
        let err = LlmError::new(ErrorKind::NetworkError, "boom")
            .with_cause(std::io::Error::other("inner"));
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("inner"));
    }
}

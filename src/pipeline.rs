use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Per-request state threaded through the middleware chain and the
/// orchestrator for one call. Single-owner: one in-flight request never
/// shares its context with another, so the hint bag needs no lock.
pub struct PipelineContext {
    pub request_id: String,
    pub start: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub data: HashMap<String, serde_json::Value>,
    pub should_retry: bool,
    pub retry_attempt: u32,
    pub should_fallback: bool,
    pub fallback_provider: Option<String>,
    pub fallback_model: Option<String>,
}

impl PipelineContext {
    pub fn new(request_id: impl Into<String>, parent_cancel: Option<&CancellationToken>) -> Self {
        let cancel = match parent_cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        Self {
            request_id: request_id.into(),
            start: Utc::now(),
            cancel,
            data: HashMap::new(),
            should_retry: false,
            retry_attempt: 0,
            should_fallback: false,
            fallback_provider: None,
            fallback_model: None,
        }
    }
}

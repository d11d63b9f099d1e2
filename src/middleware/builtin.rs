use crate::chat::ChatResponse;
use crate::error::{ErrorKind, LlmError};
use crate::pipeline::PipelineContext;
use crate::validation::{sanitize_request, validate_request, ValidationOptions};
use crate::{chat::ChatRequest, registry::ModelRegistry};
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;

use super::Middleware;

/// Clamps numeric params and trims strings before the request goes further
/// down the chain. Runs first so every later middleware sees clean input.
pub struct SanitizingMiddleware;

#[async_trait]
impl Middleware for SanitizingMiddleware {
    fn name(&self) -> &str {
        "sanitizing"
    }

    fn priority(&self) -> i32 {
        -1
    }

    async fn before_request(
        &self,
        request: ChatRequest,
        _ctx: &mut PipelineContext,
    ) -> Result<ChatRequest, LlmError> {
        Ok(sanitize_request(request))
    }
}

/// Runs the [`validate_request`] rule set. In strict mode a violation
/// becomes a `VALIDATION_ERROR` aggregating every field; otherwise issues
/// are logged and the request passes through unchanged.
pub struct ValidationMiddleware {
    pub options: ValidationOptions,
    pub registry: Arc<ModelRegistry>,
    pub strict: bool,
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    fn name(&self) -> &str {
        "validation"
    }

    fn priority(&self) -> i32 {
        0
    }

    async fn before_request(
        &self,
        request: ChatRequest,
        _ctx: &mut PipelineContext,
    ) -> Result<ChatRequest, LlmError> {
        let issues = validate_request(&request, &self.options, &self.registry);
        if issues.is_empty() {
            return Ok(request);
        }
        if self.strict {
            let summary = issues
                .iter()
                .map(|i| format!("{}: {}", i.field, i.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(LlmError::new(ErrorKind::ValidationError, summary));
        }
        for issue in &issues {
            log::warn!("validation issue on {}: {}", issue.field, issue.message);
        }
        Ok(request)
    }
}

/// Structured begin/end logging. Never includes credential material or full
/// message bodies — only an optional character-counted preview.
pub struct LoggingMiddleware {
    pub preview_chars: usize,
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self { preview_chars: 0 }
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn before_request(
        &self,
        request: ChatRequest,
        ctx: &mut PipelineContext,
    ) -> Result<ChatRequest, LlmError> {
        log::info!(
            "[{}] request begin provider={} model={}",
            ctx.request_id, request.provider, request.model
        );
        Ok(request)
    }

    async fn after_response(
        &self,
        response: ChatResponse,
        ctx: &mut PipelineContext,
    ) -> Result<ChatResponse, LlmError> {
        log::info!(
            "[{}] request end duration_ms={}",
            ctx.request_id,
            (chrono::Utc::now() - ctx.start).num_milliseconds()
        );
        Ok(response)
    }

    async fn on_error(
        &self,
        err: LlmError,
        ctx: &mut PipelineContext,
    ) -> Result<Option<ChatResponse>, LlmError> {
        log::warn!("[{}] request error kind={:?}", ctx.request_id, err.kind);
        Err(err)
    }
}

/// Installs a deadline by cancelling `ctx.cancel` once `duration` elapses.
/// The spawned timer is detached; the pipeline's own cancellation check
/// (in the Retry Engine and provider adapters) is what actually aborts work.
pub struct TimeoutMiddleware {
    pub duration: std::time::Duration,
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &str {
        "timeout"
    }

    fn priority(&self) -> i32 {
        1
    }

    async fn before_request(
        &self,
        request: ChatRequest,
        ctx: &mut PipelineContext,
    ) -> Result<ChatRequest, LlmError> {
        let cancel = ctx.cancel.clone();
        let duration = self.duration;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            cancel.cancel();
        });
        ctx.data.insert(
            "timeout_handle_id".to_string(),
            serde_json::Value::String(format!("{:?}", handle.id())),
        );
        Ok(request)
    }
}

/// Rejects requests whose content matches a configured blocked pattern and
/// optionally transforms passing requests/responses.
pub struct ContentFilterMiddleware {
    pub blocked_patterns: Vec<Regex>,
}

#[async_trait]
impl Middleware for ContentFilterMiddleware {
    fn name(&self) -> &str {
        "content_filter"
    }

    fn priority(&self) -> i32 {
        2
    }

    async fn before_request(
        &self,
        request: ChatRequest,
        _ctx: &mut PipelineContext,
    ) -> Result<ChatRequest, LlmError> {
        for message in &request.messages {
            if let Some(either::Either::Left(text)) = &message.content {
                if self.blocked_patterns.iter().any(|p| p.is_match(text)) {
                    return Err(LlmError::new(
                        ErrorKind::ContentFiltered,
                        "request content matched a blocked pattern",
                    ));
                }
            }
        }
        Ok(request)
    }
}

/// On a retryable-looking failure, records a fallback hint in the context
/// for the Orchestrator to act on after the chain unwinds.
pub struct FallbackMiddleware {
    pub fallback_provider: String,
    pub fallback_model: String,
}

#[async_trait]
impl Middleware for FallbackMiddleware {
    fn name(&self) -> &str {
        "fallback"
    }

    fn priority(&self) -> i32 {
        10
    }

    async fn on_error(
        &self,
        err: LlmError,
        ctx: &mut PipelineContext,
    ) -> Result<Option<ChatResponse>, LlmError> {
        if err.can_retry() || err.kind == ErrorKind::RequestFailed {
            ctx.should_fallback = true;
            ctx.fallback_provider = Some(self.fallback_provider.clone());
            ctx.fallback_model = Some(self.fallback_model.clone());
        }
        Err(err)
    }
}

/// Records a begin timestamp and, on completion or failure, a single metric
/// record via the injected sink.
pub struct MetricsMiddleware {
    pub sink: Arc<dyn Fn(MetricRecord) + Send + Sync>,
}

pub struct MetricRecord {
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub success: bool,
    pub duration_ms: i64,
    pub error_kind: Option<ErrorKind>,
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    fn priority(&self) -> i32 {
        20
    }

    async fn before_request(
        &self,
        request: ChatRequest,
        ctx: &mut PipelineContext,
    ) -> Result<ChatRequest, LlmError> {
        ctx.data.insert(
            "metrics_provider".to_string(),
            serde_json::Value::String(request.provider.clone()),
        );
        ctx.data.insert(
            "metrics_model".to_string(),
            serde_json::Value::String(request.model.clone()),
        );
        Ok(request)
    }

    async fn after_response(
        &self,
        response: ChatResponse,
        ctx: &mut PipelineContext,
    ) -> Result<ChatResponse, LlmError> {
        (self.sink)(MetricRecord {
            request_id: ctx.request_id.clone(),
            provider: response.provider.clone(),
            model: response.model.clone(),
            success: true,
            duration_ms: (chrono::Utc::now() - ctx.start).num_milliseconds(),
            error_kind: None,
        });
        Ok(response)
    }

    async fn on_error(
        &self,
        err: LlmError,
        ctx: &mut PipelineContext,
    ) -> Result<Option<ChatResponse>, LlmError> {
        (self.sink)(MetricRecord {
            request_id: ctx.request_id.clone(),
            provider: err.provider.clone().unwrap_or_default(),
            model: String::new(),
            success: false,
            duration_ms: (chrono::Utc::now() - ctx.start).num_milliseconds(),
            error_kind: Some(err.kind),
        });
        Err(err)
    }
}

/// Records retry intent in the context; the Retry Engine performs the
/// actual backoff, this middleware only surfaces the decision upstream.
pub struct RetryHintMiddleware;

#[async_trait]
impl Middleware for RetryHintMiddleware {
    fn name(&self) -> &str {
        "retry_hint"
    }

    fn priority(&self) -> i32 {
        30
    }

    async fn on_error(
        &self,
        err: LlmError,
        ctx: &mut PipelineContext,
    ) -> Result<Option<ChatResponse>, LlmError> {
        if err.can_retry() {
            ctx.should_retry = true;
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Message;

    fn request() -> ChatRequest {
        ChatRequest::new("openai", "gpt-4-turbo", vec![Message::user("  hi  ")])
    }

    #[tokio::test]
    async fn sanitizing_middleware_trims_content() {
        let mw = SanitizingMiddleware;
        let mut ctx = PipelineContext::new("req-1", None);
        let sanitized = mw.before_request(request(), &mut ctx).await.unwrap();
        assert_eq!(
            sanitized.messages[0].content,
            Some(either::Either::Left("hi".to_string()))
        );
    }

    #[tokio::test]
    async fn validation_middleware_strict_mode_rejects_invalid_request() {
        let mw = ValidationMiddleware {
            options: ValidationOptions::default(),
            registry: Arc::new(ModelRegistry::new_for_test()),
            strict: true,
        };
        let mut req = request();
        req.messages.clear();
        let mut ctx = PipelineContext::new("req-1", None);
        let err = mw.before_request(req, &mut ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn content_filter_rejects_blocked_pattern() {
        let mw = ContentFilterMiddleware {
            blocked_patterns: vec![Regex::new("(?i)forbidden").unwrap()],
        };
        let mut req = request();
        req.messages[0].content = Some(either::Either::Left("this is forbidden".into()));
        let mut ctx = PipelineContext::new("req-1", None);
        let err = mw.before_request(req, &mut ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContentFiltered);
    }

    #[tokio::test]
    async fn fallback_middleware_sets_hint_on_retryable_error() {
        let mw = FallbackMiddleware {
            fallback_provider: "anthropic".into(),
            fallback_model: "claude-3-opus-20240229".into(),
        };
        let mut ctx = PipelineContext::new("req-1", None);
        let err = LlmError::new(ErrorKind::RequestFailed, "boom").with_provider("openai");
        let _ = mw.on_error(err, &mut ctx).await;
        assert!(ctx.should_fallback);
        assert_eq!(ctx.fallback_provider.as_deref(), Some("anthropic"));
    }

    #[tokio::test]
    async fn retry_hint_middleware_sets_flag_only_for_retryable_errors() {
        let mw = RetryHintMiddleware;
        let mut ctx = PipelineContext::new("req-1", None);
        let err = LlmError::new(ErrorKind::KeyInvalid, "bad key").with_retryable(true);
        let _ = mw.on_error(err, &mut ctx).await;
        assert!(!ctx.should_retry);
    }
}

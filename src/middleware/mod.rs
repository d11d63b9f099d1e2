pub mod builtin;

use crate::chat::{ChatRequest, ChatResponse};
use crate::error::LlmError;
use crate::pipeline::PipelineContext;
use async_trait::async_trait;
use std::sync::Arc;

/// Outcome of a middleware stage. `request`/`response` carry a transformed
/// value; `Stop` short-circuits the chain entirely (`onError` may also
/// synthesize a successful response this way via `response`).
#[derive(Default)]
pub struct MiddlewareOutcome<T> {
    pub value: Option<T>,
    pub stop: bool,
}

impl<T> MiddlewareOutcome<T> {
    pub fn cont(value: T) -> Self {
        Self {
            value: Some(value),
            stop: false,
        }
    }

    pub fn stop(value: T) -> Self {
        Self {
            value: Some(value),
            stop: true,
        }
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        0
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn before_request(
        &self,
        request: ChatRequest,
        _ctx: &mut PipelineContext,
    ) -> Result<ChatRequest, LlmError> {
        Ok(request)
    }

    async fn after_response(
        &self,
        response: ChatResponse,
        _ctx: &mut PipelineContext,
    ) -> Result<ChatResponse, LlmError> {
        Ok(response)
    }

    /// Returning `Ok(Some(response))` short-circuits the error with a
    /// synthesized success; `Ok(None)` re-raises `err` unchanged (after any
    /// side effects, e.g. setting a fallback hint in `ctx`); `Err(_)`
    /// replaces the propagated error.
    async fn on_error(
        &self,
        err: LlmError,
        _ctx: &mut PipelineContext,
    ) -> Result<Option<ChatResponse>, LlmError> {
        Err(err)
    }
}

/// Ordered middleware chain. Insertion is append + stable sort by ascending
/// priority — `Vec::sort_by_key` is stable, so repeated `use()` calls with
/// equal priority preserve registration order. Names are not deduplicated:
/// `use()` twice with the same name yields two active middlewares.
#[derive(Clone, Default)]
pub struct MiddlewarePipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middlewares.push(middleware);
        self.middlewares.sort_by_key(|m| m.priority());
        self
    }

    /// Removes every middleware with this name; returns whether any were
    /// removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.middlewares.len();
        self.middlewares.retain(|m| m.name() != name);
        before != self.middlewares.len()
    }

    pub fn clear(&mut self) {
        self.middlewares.clear();
    }

    pub async fn run_before_request(
        &self,
        mut request: ChatRequest,
        ctx: &mut PipelineContext,
    ) -> Result<ChatRequest, LlmError> {
        for mw in &self.middlewares {
            if !mw.enabled() {
                continue;
            }
            request = mw.before_request(request, ctx).await?;
        }
        Ok(request)
    }

    pub async fn run_after_response(
        &self,
        mut response: ChatResponse,
        ctx: &mut PipelineContext,
    ) -> Result<ChatResponse, LlmError> {
        for mw in &self.middlewares {
            if !mw.enabled() {
                continue;
            }
            response = mw.after_response(response, ctx).await?;
        }
        Ok(response)
    }

    /// Runs `on_error` in ascending priority order. The first middleware to
    /// synthesize a response short-circuits the remaining ones.
    pub async fn run_on_error(
        &self,
        mut err: LlmError,
        ctx: &mut PipelineContext,
    ) -> Result<ChatResponse, LlmError> {
        for mw in &self.middlewares {
            if !mw.enabled() {
                continue;
            }
            match mw.on_error(err, ctx).await {
                Ok(Some(response)) => return Ok(response),
                Ok(None) => unreachable!("on_error's Ok(None) case re-raises via Err below"),
                Err(next_err) => err = next_err,
            }
        }
        Err(err)
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Message;

    struct Recorder {
        name: String,
        priority: i32,
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn before_request(
            &self,
            request: ChatRequest,
            _ctx: &mut PipelineContext,
        ) -> Result<ChatRequest, LlmError> {
            self.log.lock().unwrap().push(self.name.clone());
            Ok(request)
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new("openai", "gpt-4-turbo", vec![Message::user("hi")])
    }

    #[tokio::test]
    async fn middlewares_run_in_ascending_priority_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(Recorder {
            name: "b".into(),
            priority: 5,
            log: log.clone(),
        }));
        pipeline.add(Arc::new(Recorder {
            name: "a".into(),
            priority: -1,
            log: log.clone(),
        }));

        let mut ctx = PipelineContext::new("req-1", None);
        pipeline.run_before_request(request(), &mut ctx).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn repeated_use_with_same_name_is_not_deduplicated() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(Recorder {
            name: "dup".into(),
            priority: 0,
            log: log.clone(),
        }));
        pipeline.add(Arc::new(Recorder {
            name: "dup".into(),
            priority: 0,
            log: log.clone(),
        }));
        assert_eq!(pipeline.len(), 2);

        let mut ctx = PipelineContext::new("req-1", None);
        pipeline.run_before_request(request(), &mut ctx).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn remove_detaches_by_name() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut pipeline = MiddlewarePipeline::new();
        pipeline.add(Arc::new(Recorder {
            name: "x".into(),
            priority: 0,
            log,
        }));
        assert!(pipeline.remove("x"));
        assert!(!pipeline.remove("x"));
        assert_eq!(pipeline.len(), 0);
    }
}

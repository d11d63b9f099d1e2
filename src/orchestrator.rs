use crate::cache::{fingerprint, Cache, CacheOptions};
use crate::chat::{ChatRequest, ChatResponse, ChatStreamDelta, EmbeddingRequest, EmbeddingResponse};
use crate::circuit::{CircuitBreaker, CircuitBreakerOptions};
use crate::dedup::DedupCoalescer;
use crate::error::{ErrorKind, LlmError};
use crate::event::EventKind;
use crate::event_bus::EventBus;
use crate::keystore::KeyStore;
use crate::ledger::{UsageLedger, UsageStats};
use crate::middleware::MiddlewarePipeline;
use crate::pipeline::PipelineContext;
use crate::providers::http::new_request_id;
use crate::providers::{ChatDeltaStream, ProviderAdapter};
use crate::ratelimit::RateLimiter;
use crate::registry::{ModelInfo, ModelRegistry};
use crate::retry::{with_default_retry, RetryOptions};
use futures::stream::{self, StreamExt};
use futures::Stream;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

fn not_destroyed(flag: &AtomicBool) -> Result<(), LlmError> {
    if flag.load(Ordering::SeqCst) {
        Err(LlmError::new(ErrorKind::ValidationError, "orchestrator has been destroyed"))
    } else {
        Ok(())
    }
}

fn response_size(response: &ChatResponse) -> usize {
    serde_json::to_vec(response).map(|b| b.len()).unwrap_or(0)
}

/// Wraps an adapter's raw delta stream to publish the terminal event
/// `chat_stream` needs: exactly one of `StreamEnd`/`StreamAbort` once the
/// stream stops, in addition to a `StreamChunk`/`StreamError` per item.
struct TaggedDeltaStream {
    inner: ChatDeltaStream,
    events: Arc<EventBus>,
    provider: String,
    request_id: String,
    cancel: CancellationToken,
    index: u64,
    done: bool,
}

impl Stream for TaggedDeltaStream {
    type Item = Result<crate::chat::ChatStreamDelta, LlmError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.cancel.is_cancelled() {
            this.done = true;
            this.events
                .publish(&this.request_id, EventKind::StreamAbort { provider: this.provider.clone() });
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(item)) => {
                this.index += 1;
                match &item {
                    Ok(_) => this.events.publish(
                        &this.request_id,
                        EventKind::StreamChunk {
                            provider: this.provider.clone(),
                            index: this.index,
                        },
                    ),
                    Err(err) => {
                        this.done = true;
                        this.events.publish(
                            &this.request_id,
                            EventKind::StreamError {
                                provider: this.provider.clone(),
                                kind: format!("{:?}", err.kind),
                            },
                        );
                    }
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                this.done = true;
                this.events.publish(
                    &this.request_id,
                    EventKind::StreamEnd {
                        provider: this.provider.clone(),
                        chunk_count: this.index,
                    },
                );
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Options controlling a [`Orchestrator::batch`] call.
pub struct BatchOptions {
    pub concurrency: usize,
    pub stop_on_error: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            stop_on_error: false,
        }
    }
}

pub struct BatchOutcome {
    pub results: Vec<Result<ChatResponse, LlmError>>,
    pub completed: usize,
    pub failed: usize,
}

/// Top-level façade composing every other component: a caller never talks
/// to the Key Store, Cache, Dedup Coalescer, Rate Limiter, Middleware Chain
/// or Provider Adapters directly. Mirrors the way `querymt`'s factory
/// registry centralizes provider construction, generalized into a single
/// runtime object that also owns per-request orchestration.
pub struct Orchestrator {
    events: Arc<EventBus>,
    keystore: Arc<KeyStore>,
    cache: Cache<ChatResponse>,
    dedup: DedupCoalescer<ChatResponse>,
    middleware: RwLock<MiddlewarePipeline>,
    rate_limiter: RateLimiter,
    ledger: UsageLedger,
    registry: Arc<ModelRegistry>,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    circuit_breakers: HashMap<String, Arc<CircuitBreaker>>,
    retry_opts: RetryOptions,
    root_cancel: CancellationToken,
    destroyed: AtomicBool,
}

impl Orchestrator {
    pub(crate) fn new(
        events: Arc<EventBus>,
        keystore: Arc<KeyStore>,
        cache_opts: CacheOptions,
        middleware: MiddlewarePipeline,
        rate_limiter: RateLimiter,
        registry: Arc<ModelRegistry>,
        adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
        circuit_opts: CircuitBreakerOptions,
        retry_opts: RetryOptions,
    ) -> Arc<Self> {
        let circuit_breakers = adapters
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    Arc::new(CircuitBreaker::new(CircuitBreakerOptions {
                        failure_threshold: circuit_opts.failure_threshold,
                        reset_timeout: circuit_opts.reset_timeout,
                        half_open_trials: circuit_opts.half_open_trials,
                    })),
                )
            })
            .collect();

        Arc::new(Self {
            events,
            keystore,
            cache: Cache::new(cache_opts),
            dedup: DedupCoalescer::new(),
            middleware: RwLock::new(middleware),
            rate_limiter,
            ledger: UsageLedger::new(),
            registry,
            adapters,
            circuit_breakers,
            retry_opts,
            root_cancel: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
        })
    }

    fn adapter_for(&self, provider: &str) -> Result<Arc<dyn ProviderAdapter>, LlmError> {
        self.adapters
            .get(provider)
            .cloned()
            .ok_or_else(|| LlmError::new(ErrorKind::ProviderNotFound, format!("no adapter registered for '{provider}'")))
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    // ---- Key Store delegation -------------------------------------------------

    pub async fn set_key(&self, provider: &str, key: &str) -> Result<(), LlmError> {
        not_destroyed(&self.destroyed)?;
        self.keystore.set(provider, key).await
    }

    pub async fn set_keys(&self, keys: &HashMap<String, String>) -> Result<(), LlmError> {
        not_destroyed(&self.destroyed)?;
        for (provider, key) in keys {
            self.keystore.set(provider, key).await?;
        }
        Ok(())
    }

    pub async fn remove_key(&self, provider: &str) -> Result<(), LlmError> {
        not_destroyed(&self.destroyed)?;
        self.keystore.remove(provider).await
    }

    pub async fn rotate_key(&self, provider: &str, key: &str) -> Result<(String, String), LlmError> {
        not_destroyed(&self.destroyed)?;
        self.keystore.rotate(provider, key).await
    }

    // ---- Middleware management --------------------------------------------

    pub fn use_middleware(&self, middleware: Arc<dyn crate::middleware::Middleware>) {
        self.middleware.write().add(middleware);
    }

    pub fn remove_middleware(&self, name: &str) -> bool {
        self.middleware.write().remove(name)
    }

    // ---- Usage --------------------------------------------------------------

    pub async fn usage_stats(&self) -> UsageStats {
        self.ledger.stats().await
    }

    // ---- Models ---------------------------------------------------------------

    pub async fn list_models(&self, provider: &str) -> Vec<ModelInfo> {
        match self.adapters.get(provider) {
            Some(adapter) => {
                let live = adapter.list_models().await;
                if live.is_empty() {
                    self.registry.get_models_for_provider(provider)
                } else {
                    live
                }
            }
            None => self.registry.get_models_for_provider(provider),
        }
    }

    // ---- Chat -----------------------------------------------------------------

    pub async fn chat(self: &Arc<Self>, req: ChatRequest) -> Result<ChatResponse, LlmError> {
        not_destroyed(&self.destroyed)?;
        self.chat_inner(req, true).await
    }

    async fn chat_inner(self: &Arc<Self>, mut req: ChatRequest, allow_fallback: bool) -> Result<ChatResponse, LlmError> {
        let request_id = new_request_id();
        let parent = req.cancellation.take().unwrap_or_else(|| self.root_cancel.clone());
        let mut ctx = PipelineContext::new(request_id.clone(), Some(&parent));

        self.events.publish(
            &request_id,
            EventKind::RequestStart {
                provider: req.provider.clone(),
                model: req.model.clone(),
            },
        );

        let middleware = self.middleware.read().clone();

        req = match middleware.run_before_request(req, &mut ctx).await {
            Ok(r) => r,
            Err(err) => return self.settle_error(&middleware, &mut ctx, err, allow_fallback).await,
        };

        let skip_cache = req.skip_cache;
        let fp = fingerprint(&req);

        if !skip_cache {
            if let Some(cached) = self.cache.get(&fp).await {
                self.events.publish(
                    &request_id,
                    EventKind::CacheHit {
                        provider: req.provider.clone(),
                        model: req.model.clone(),
                        fingerprint: fp.clone(),
                    },
                );
                return match middleware.run_after_response(cached, &mut ctx).await {
                    Ok(response) => {
                        self.events.publish(
                            &request_id,
                            EventKind::RequestEnd {
                                provider: response.provider.clone(),
                                model: response.model.clone(),
                                duration_ms: (chrono::Utc::now() - ctx.start).num_milliseconds().max(0) as u64,
                            },
                        );
                        Ok(response)
                    }
                    Err(err) => self.settle_error(&middleware, &mut ctx, err, allow_fallback).await,
                };
            }
            self.events.publish(
                &request_id,
                EventKind::CacheMiss {
                    provider: req.provider.clone(),
                    model: req.model.clone(),
                    fingerprint: fp.clone(),
                },
            );
        }

        let permit = match self.rate_limiter.acquire(&req.provider, 0).await {
            Ok(p) => p,
            Err(err) => return self.settle_error(&middleware, &mut ctx, err, allow_fallback).await,
        };

        let this = self.clone();
        let cancel = ctx.cancel.clone();
        let rid = request_id.clone();
        let result = if skip_cache {
            this.call_with_retry(req, cancel, rid).await
        } else {
            let this2 = this.clone();
            let dedup_req = req.clone();
            self.dedup
                .run(fp.clone(), move || async move { this2.call_with_retry(dedup_req, cancel, rid).await })
                .await
        };
        drop(permit);

        match result {
            Ok(response) => {
                if let Some(usage) = &response.usage {
                    self.ledger.record(&self.registry, &response.provider, &response.model, usage).await;
                }
                if !skip_cache {
                    self.cache.set(fp.clone(), response.clone(), response_size(&response)).await;
                    self.events.publish(
                        &request_id,
                        EventKind::CacheSet {
                            provider: response.provider.clone(),
                            model: response.model.clone(),
                            fingerprint: fp,
                        },
                    );
                }
                let response = match middleware.run_after_response(response, &mut ctx).await {
                    Ok(r) => r,
                    Err(err) => return self.settle_error(&middleware, &mut ctx, err, allow_fallback).await,
                };
                self.events.publish(
                    &request_id,
                    EventKind::RequestEnd {
                        provider: response.provider.clone(),
                        model: response.model.clone(),
                        duration_ms: (chrono::Utc::now() - ctx.start).num_milliseconds().max(0) as u64,
                    },
                );
                Ok(response)
            }
            Err(err) => self.settle_error(&middleware, &mut ctx, err, allow_fallback).await,
        }
    }

    /// Runs the adapter call inside the retry engine, gated by the
    /// provider's circuit breaker. Owns every argument so it can be spawned
    /// from the Dedup Coalescer's `'static` future requirement.
    async fn call_with_retry(
        self: Arc<Self>,
        req: ChatRequest,
        cancel: CancellationToken,
        request_id: String,
    ) -> Result<ChatResponse, LlmError> {
        let provider = req.provider.clone();
        let adapter = self.adapter_for(&provider)?;
        let breaker = self.circuit_breakers.get(&provider).cloned();

        if let Some(breaker) = &breaker {
            breaker.before_call(&provider).await?;
        }

        let key = self
            .keystore
            .get(&provider)
            .await?
            .ok_or_else(|| LlmError::new(ErrorKind::KeyNotSet, "no credential set for provider").with_provider(&provider))?
            .to_string();

        let events = self.events.clone();
        let result = with_default_retry(&self.retry_opts, &cancel, Some((&events, &request_id, &provider)), || {
            let adapter = adapter.clone();
            let req = req.clone();
            let key = key.clone();
            async move { adapter.chat(&req, &key).await }
        })
        .await;

        match (&result, &breaker) {
            (Ok(_), Some(breaker)) => breaker.on_success().await,
            (Err(_), Some(breaker)) => breaker.on_failure().await,
            _ => {}
        }

        result
    }

    /// Runs the middleware `on_error` chain. If the Fallback middleware
    /// recorded a hint and this is the first attempt, restarts the pipeline
    /// once against the hinted provider/model rather than retrying via the
    /// Retry Engine.
    async fn settle_error(
        self: &Arc<Self>,
        middleware: &MiddlewarePipeline,
        ctx: &mut PipelineContext,
        err: LlmError,
        allow_fallback: bool,
    ) -> Result<ChatResponse, LlmError> {
        self.publish_request_error(&ctx.request_id, &err);

        match middleware.run_on_error(err, ctx).await {
            Ok(response) => Ok(response),
            Err(err) => {
                if allow_fallback && ctx.should_fallback {
                    if let (Some(provider), Some(model)) = (ctx.fallback_provider.clone(), ctx.fallback_model.clone()) {
                        let mut retry_req = ChatRequest::new(provider, model, Vec::new());
                        // Fallback only swaps the destination; it cannot
                        // reconstruct the original messages from the error
                        // path, so callers relying on fallback must supply
                        // them again via metadata if needed.
                        retry_req.metadata = ctx.data.clone();
                        return self.chat_inner(retry_req, false).await;
                    }
                }
                Err(err)
            }
        }
    }

    // ---- Streaming --------------------------------------------------------

    pub async fn chat_stream(self: &Arc<Self>, mut req: ChatRequest) -> Result<ChatDeltaStream, LlmError> {
        not_destroyed(&self.destroyed)?;
        let request_id = new_request_id();
        let parent = req.cancellation.take().unwrap_or_else(|| self.root_cancel.clone());
        let mut ctx = PipelineContext::new(request_id.clone(), Some(&parent));

        let middleware = self.middleware.read().clone();
        req = middleware.run_before_request(req, &mut ctx).await?;

        let provider = req.provider.clone();
        let adapter = self.adapter_for(&provider)?;
        let breaker = self.circuit_breakers.get(&provider).cloned();
        if let Some(breaker) = &breaker {
            breaker.before_call(&provider).await?;
        }
        let key = self
            .keystore
            .get(&provider)
            .await?
            .ok_or_else(|| LlmError::new(ErrorKind::KeyNotSet, "no credential set for provider").with_provider(&provider))?
            .to_string();

        let _permit = self.rate_limiter.acquire(&provider, 0).await?;

        self.events.publish(
            &request_id,
            EventKind::StreamStart {
                provider: provider.clone(),
                model: req.model.clone(),
            },
        );

        let inner = match adapter.chat_stream(&req, &key).await {
            Ok(stream) => {
                if let Some(breaker) = &breaker {
                    breaker.on_success().await;
                }
                stream
            }
            Err(err) => {
                if let Some(breaker) = &breaker {
                    breaker.on_failure().await;
                }
                self.events.publish(
                    &request_id,
                    EventKind::StreamError {
                        provider: provider.clone(),
                        kind: format!("{:?}", err.kind),
                    },
                );
                return Err(err);
            }
        };

        let tagged = TaggedDeltaStream {
            inner,
            events: self.events.clone(),
            provider,
            request_id,
            cancel: ctx.cancel.clone(),
            index: 0,
            done: false,
        };
        Ok(Box::pin(tagged) as ChatDeltaStream)
    }

    // ---- Embeddings -------------------------------------------------------

    /// Runs the same circuit-breaker/retry/event/ledger machinery as
    /// `chat()`, minus the cache and dedup stages (embedding calls are
    /// typically made over caller-unique input text, so a shared cache
    /// gives little benefit for the added bookkeeping) and minus the
    /// middleware chain (embeddings have no chat-shaped hints to sanitize,
    /// validate or fall back on).
    pub async fn embed(self: &Arc<Self>, req: EmbeddingRequest) -> Result<EmbeddingResponse, LlmError> {
        not_destroyed(&self.destroyed)?;
        let request_id = new_request_id();
        let start = chrono::Utc::now();
        let provider = req.provider.clone();
        let model = req.model.clone();

        self.events.publish(
            &request_id,
            EventKind::RequestStart {
                provider: provider.clone(),
                model: model.clone(),
            },
        );

        let permit = match self.rate_limiter.acquire(&provider, 0).await {
            Ok(p) => p,
            Err(err) => {
                self.publish_request_error(&request_id, &err);
                return Err(err);
            }
        };

        let this = self.clone();
        let cancel = self.root_cancel.child_token();
        let rid = request_id.clone();
        let result = this.embed_with_retry(req, cancel, rid).await;
        drop(permit);

        match &result {
            Ok(response) => {
                if let Some(usage) = &response.usage {
                    self.ledger.record(&self.registry, &response.provider, &response.model, usage).await;
                }
                self.events.publish(
                    &request_id,
                    EventKind::RequestEnd {
                        provider: response.provider.clone(),
                        model: response.model.clone(),
                        duration_ms: (chrono::Utc::now() - start).num_milliseconds().max(0) as u64,
                    },
                );
            }
            Err(err) => self.publish_request_error(&request_id, err),
        }
        result
    }

    async fn embed_with_retry(
        self: Arc<Self>,
        req: EmbeddingRequest,
        cancel: CancellationToken,
        request_id: String,
    ) -> Result<EmbeddingResponse, LlmError> {
        let provider = req.provider.clone();
        let adapter = self.adapter_for(&provider)?;
        let breaker = self.circuit_breakers.get(&provider).cloned();

        if let Some(breaker) = &breaker {
            breaker.before_call(&provider).await?;
        }

        let key = self
            .keystore
            .get(&provider)
            .await?
            .ok_or_else(|| LlmError::new(ErrorKind::KeyNotSet, "no credential set for provider").with_provider(&provider))?
            .to_string();

        let events = self.events.clone();
        let result = with_default_retry(&self.retry_opts, &cancel, Some((&events, &request_id, &provider)), || {
            let adapter = adapter.clone();
            let req = req.clone();
            let key = key.clone();
            async move { adapter.embed(&req, &key).await }
        })
        .await;

        match (&result, &breaker) {
            (Ok(_), Some(breaker)) => breaker.on_success().await,
            (Err(_), Some(breaker)) => breaker.on_failure().await,
            _ => {}
        }

        result
    }

    fn publish_request_error(&self, request_id: &str, err: &LlmError) {
        self.events.publish(
            request_id,
            EventKind::RequestError {
                provider: err.provider.clone().unwrap_or_default(),
                kind: format!("{:?}", err.kind),
                retryable: err.can_retry(),
            },
        );
    }

    // ---- Batch --------------------------------------------------------------

    pub async fn batch(self: &Arc<Self>, requests: Vec<ChatRequest>, opts: BatchOptions) -> BatchOutcome {
        let stopped = Arc::new(AtomicBool::new(false));
        let concurrency = opts.concurrency.max(1);

        let stop_on_error = opts.stop_on_error;
        let indexed: Vec<(usize, ChatRequest)> = requests.into_iter().enumerate().collect();
        let results = stream::iter(indexed)
            .map(|(i, req)| {
                let this = self.clone();
                let stopped = stopped.clone();
                async move {
                    if stop_on_error && stopped.load(Ordering::SeqCst) {
                        return (i, Err(LlmError::new(ErrorKind::Aborted, "batch aborted after an earlier failure")));
                    }
                    let result = this.chat(req).await;
                    if stop_on_error && result.is_err() {
                        stopped.store(true, Ordering::SeqCst);
                    }
                    (i, result)
                }
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut ordered: Vec<Option<Result<ChatResponse, LlmError>>> = (0..results.len()).map(|_| None).collect();
        for (i, result) in results {
            ordered[i] = Some(result);
        }
        let results: Vec<Result<ChatResponse, LlmError>> = ordered.into_iter().map(|r| r.expect("every index filled")).collect();

        let completed = results.iter().filter(|r| r.is_ok()).count();
        let failed = results.len() - completed;
        self.events.publish(
            "batch",
            EventKind::BatchComplete { completed, failed },
        );
        BatchOutcome { results, completed, failed }
    }

    // ---- Lifecycle ----------------------------------------------------------

    pub async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.root_cancel.cancel();
        self.events.remove_all_listeners();
        self.events.shutdown().await;
    }
}

use crate::cache::CacheOptions;
use crate::circuit::CircuitBreakerOptions;
use crate::error::LlmError;
use crate::event_bus::EventBus;
use crate::keystore::backend::{EphemeralBackend, KeyStoreBackend};
use crate::keystore::{KeyStore, KeyStoreOptions};
use crate::middleware::builtin::{
    ContentFilterMiddleware, LoggingMiddleware, MetricsMiddleware, RetryHintMiddleware,
    SanitizingMiddleware, TimeoutMiddleware, ValidationMiddleware,
};
use crate::middleware::{Middleware, MiddlewarePipeline};
use crate::orchestrator::Orchestrator;
use crate::providers::anthropic::AnthropicAdapter;
use crate::providers::compatible::{known_surrogates, CompatibleAdapter};
use crate::providers::google::GoogleAdapter;
use crate::providers::ollama::OllamaAdapter;
use crate::providers::openai::OpenAiAdapter;
use crate::providers::ProviderAdapter;
use crate::ratelimit::RateLimitOptions;
use crate::ratelimit::RateLimiter;
use crate::registry::ModelRegistry;
use crate::retry::RetryOptions;
use crate::validation::ValidationOptions;
use std::collections::HashMap;
use std::sync::Arc;

/// Typed construction of an [`Orchestrator`]. Mirrors the builder idiom
/// `querymt`'s `LLMParams` uses: `mut self -> Self` chaining methods with
/// sensible defaults, finished off by `build()`.
pub struct OrchestratorBuilder {
    events: Arc<EventBus>,
    keystore_backend: Arc<dyn KeyStoreBackend>,
    keystore_options: KeyStoreOptions,
    cache_options: CacheOptions,
    rate_limit_options: RateLimitOptions,
    circuit_options: CircuitBreakerOptions,
    retry_options: RetryOptions,
    registry: Arc<ModelRegistry>,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    middleware: MiddlewarePipeline,
    with_default_middleware: bool,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            events: Arc::new(EventBus::new()),
            keystore_backend: Arc::new(EphemeralBackend::new()),
            keystore_options: KeyStoreOptions::default(),
            cache_options: CacheOptions::default(),
            rate_limit_options: RateLimitOptions::default(),
            circuit_options: CircuitBreakerOptions::default(),
            retry_options: RetryOptions::default(),
            registry: Arc::new(ModelRegistry::new()),
            adapters: HashMap::new(),
            middleware: MiddlewarePipeline::new(),
            with_default_middleware: true,
        }
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn keystore_backend(mut self, backend: Arc<dyn KeyStoreBackend>) -> Self {
        self.keystore_backend = backend;
        self
    }

    pub fn keystore_options(mut self, options: KeyStoreOptions) -> Self {
        self.keystore_options = options;
        self
    }

    pub fn cache_options(mut self, options: CacheOptions) -> Self {
        self.cache_options = options;
        self
    }

    pub fn rate_limit_options(mut self, options: RateLimitOptions) -> Self {
        self.rate_limit_options = options;
        self
    }

    pub fn circuit_breaker_options(mut self, options: CircuitBreakerOptions) -> Self {
        self.circuit_options = options;
        self
    }

    pub fn retry_options(mut self, options: RetryOptions) -> Self {
        self.retry_options = options;
        self
    }

    pub fn registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.name().to_string(), adapter);
        self
    }

    /// Registers the built-in OpenAI, Anthropic, Google and Ollama adapters
    /// plus every known OpenAI-compatible surrogate (Groq, Together, ...).
    pub fn with_builtin_adapters(mut self) -> Self {
        self = self
            .adapter(Arc::new(OpenAiAdapter::default()))
            .adapter(Arc::new(AnthropicAdapter::default()))
            .adapter(Arc::new(GoogleAdapter::default()))
            .adapter(Arc::new(OllamaAdapter::default()));
        for config in known_surrogates() {
            self = self.adapter(Arc::new(CompatibleAdapter::new(config)));
        }
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.add(middleware);
        self
    }

    /// Skip installing the eight built-in middlewares `build()` would
    /// otherwise add by default.
    pub fn without_default_middleware(mut self) -> Self {
        self.with_default_middleware = false;
        self
    }

    fn install_default_middleware(&mut self) {
        let registry = self.registry.clone();
        self.middleware.add(Arc::new(SanitizingMiddleware));
        self.middleware.add(Arc::new(ValidationMiddleware {
            options: ValidationOptions::default(),
            registry,
            strict: true,
        }));
        self.middleware.add(Arc::new(LoggingMiddleware::default()));
        self.middleware.add(Arc::new(TimeoutMiddleware {
            duration: std::time::Duration::from_secs(120),
        }));
        self.middleware.add(Arc::new(ContentFilterMiddleware { blocked_patterns: Vec::new() }));
        // FallbackMiddleware is opt-in: it needs a real target provider/model,
        // so it is left out of the default chain and added via `.middleware()`.
        self.middleware.add(Arc::new(MetricsMiddleware {
            sink: Arc::new(|_record| {}),
        }));
        self.middleware.add(Arc::new(RetryHintMiddleware));
    }

    pub fn build(mut self) -> Result<Arc<Orchestrator>, LlmError> {
        if self.with_default_middleware {
            self.install_default_middleware();
        }
        let keystore = Arc::new(KeyStore::new(self.keystore_backend, self.keystore_options).with_events(self.events.clone()));
        let rate_limiter = RateLimiter::new(self.rate_limit_options);

        Ok(Orchestrator::new(
            self.events,
            keystore,
            self.cache_options,
            self.middleware,
            rate_limiter,
            self.registry,
            self.adapters,
            self.circuit_options,
            self.retry_options,
        ))
    }
}

use crate::error::{ErrorKind, LlmError};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

/// RPM/TPM/concurrency ceilings for one scope (the orchestrator-wide
/// default, or a single provider's override).
#[derive(Clone)]
pub struct RateLimitOptions {
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: Option<u32>,
    pub max_concurrent: Option<usize>,
    pub strategy: Strategy,
    /// Per-provider overrides. A provider present here uses its own
    /// ceilings and window state entirely in place of the defaults above
    /// — overrides replace, they don't merge field-by-field.
    pub per_provider: HashMap<String, RateLimitOptions>,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            requests_per_minute: None,
            tokens_per_minute: None,
            max_concurrent: None,
            strategy: Strategy::SlidingWindow,
            per_provider: HashMap::new(),
        }
    }
}

struct WindowState {
    request_timestamps: VecDeque<Instant>,
    token_events: VecDeque<(Instant, u32)>,
    fixed_window_start: Instant,
    fixed_window_requests: u32,
    fixed_window_tokens: u32,
    bucket_tokens: f64,
    bucket_updated_at: Instant,
}

impl WindowState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            request_timestamps: VecDeque::new(),
            token_events: VecDeque::new(),
            fixed_window_start: now,
            fixed_window_requests: 0,
            fixed_window_tokens: 0,
            bucket_tokens: 0.0,
            bucket_updated_at: now,
        }
    }
}

/// Guards a request against the configured RPM/TPM ceilings and caps
/// in-flight concurrency with a semaphore. Acquiring a slot is a
/// suspension point for `max_concurrent`; RPM/TPM limits reject instead of
/// waiting, returning a retryable `RATE_LIMITED` with a computed
/// `retry_after_ms`. State and concurrency permits are tracked per
/// provider: a provider with no override shares the default ceilings, but
/// never the default's window state or semaphore, so one noisy provider
/// can't exhaust another's budget.
pub struct RateLimiter {
    opts: RateLimitOptions,
    state: Mutex<HashMap<String, WindowState>>,
    default_concurrency: Option<Arc<Semaphore>>,
    concurrency: HashMap<String, Arc<Semaphore>>,
}

/// RAII guard releasing the concurrency slot acquired by [`RateLimiter::acquire`].
pub struct RateLimitPermit {
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl RateLimiter {
    pub fn new(opts: RateLimitOptions) -> Self {
        let default_concurrency = opts.max_concurrent.map(|n| Arc::new(Semaphore::new(n)));
        let concurrency = opts
            .per_provider
            .iter()
            .filter_map(|(provider, override_opts)| {
                override_opts
                    .max_concurrent
                    .map(|n| (provider.clone(), Arc::new(Semaphore::new(n))))
            })
            .collect();
        Self {
            opts,
            state: Mutex::new(HashMap::new()),
            default_concurrency,
            concurrency,
        }
    }

    /// The effective ceilings for `provider`: its own override if one was
    /// registered, otherwise the orchestrator-wide default.
    fn effective_opts(&self, provider: &str) -> &RateLimitOptions {
        self.opts.per_provider.get(provider).unwrap_or(&self.opts)
    }

    fn concurrency_for(&self, provider: &str) -> Option<Arc<Semaphore>> {
        if self.opts.per_provider.contains_key(provider) {
            self.concurrency.get(provider).cloned()
        } else {
            self.default_concurrency.clone()
        }
    }

    pub async fn acquire(&self, provider: &str, estimated_tokens: u32) -> Result<RateLimitPermit, LlmError> {
        self.check_windows(provider, estimated_tokens).await?;

        let permit = match self.concurrency_for(provider) {
            Some(sem) => Some(sem.acquire_owned().await.expect("semaphore is never closed")),
            None => None,
        };
        Ok(RateLimitPermit { _permit: permit })
    }

    async fn check_windows(&self, provider: &str, estimated_tokens: u32) -> Result<(), LlmError> {
        let opts = self.effective_opts(provider);
        let mut all_state = self.state.lock().await;
        let state = all_state.entry(provider.to_string()).or_insert_with(WindowState::new);
        match opts.strategy {
            Strategy::SlidingWindow => check_sliding_window(opts, state, provider, estimated_tokens),
            Strategy::FixedWindow => check_fixed_window(opts, state, provider, estimated_tokens),
            Strategy::TokenBucket => check_token_bucket(opts, state, provider, estimated_tokens),
        }
    }
}

/// Prunes timestamps/token-events older than the rolling 60s window
/// before comparing against the ceiling — the window slides with
/// every call rather than resetting on a clock boundary.
fn check_sliding_window(
    opts: &RateLimitOptions,
    state: &mut WindowState,
    provider: &str,
    estimated_tokens: u32,
) -> Result<(), LlmError> {
    let now = Instant::now();
    let window = Duration::from_secs(60);

    if let Some(rpm) = opts.requests_per_minute {
        prune_older_than(&mut state.request_timestamps, now, window);
        if state.request_timestamps.len() as u32 >= rpm {
            let oldest = *state.request_timestamps.front().expect("non-empty by len check");
            let retry_after = window.saturating_sub(now.duration_since(oldest));
            return Err(rate_limited_error(provider, retry_after));
        }
    }

    if let Some(tpm) = opts.tokens_per_minute {
        while let Some((ts, _)) = state.token_events.front() {
            if now.duration_since(*ts) > window {
                state.token_events.pop_front();
            } else {
                break;
            }
        }
        let used: u32 = state.token_events.iter().map(|(_, t)| t).sum();
        if used + estimated_tokens > tpm {
            let retry_after = window / 2;
            return Err(rate_limited_error(provider, retry_after));
        }
        state.token_events.push_back((now, estimated_tokens));
    }

    state.request_timestamps.push_back(now);
    Ok(())
}

/// Counters reset to zero whenever a 60s clock boundary (from the first
/// call) is crossed, rather than sliding continuously. Cheaper than the
/// sliding window but lets a burst straddling the boundary briefly
/// exceed the nominal rate.
fn check_fixed_window(
    opts: &RateLimitOptions,
    state: &mut WindowState,
    provider: &str,
    estimated_tokens: u32,
) -> Result<(), LlmError> {
    let now = Instant::now();
    let window = Duration::from_secs(60);
    if now.duration_since(state.fixed_window_start) >= window {
        state.fixed_window_start = now;
        state.fixed_window_requests = 0;
        state.fixed_window_tokens = 0;
    }

    if let Some(rpm) = opts.requests_per_minute {
        if state.fixed_window_requests >= rpm {
            let retry_after = window.saturating_sub(now.duration_since(state.fixed_window_start));
            return Err(rate_limited_error(provider, retry_after));
        }
    }
    if let Some(tpm) = opts.tokens_per_minute {
        if state.fixed_window_tokens + estimated_tokens > tpm {
            let retry_after = window.saturating_sub(now.duration_since(state.fixed_window_start));
            return Err(rate_limited_error(provider, retry_after));
        }
    }

    state.fixed_window_requests += 1;
    state.fixed_window_tokens += estimated_tokens;
    Ok(())
}

/// Bucket capacity equals `requests_per_minute`/`tokens_per_minute`;
/// refills continuously at capacity/60s. A call costs one request token
/// plus `estimated_tokens` token-bucket units.
fn check_token_bucket(
    opts: &RateLimitOptions,
    state: &mut WindowState,
    provider: &str,
    estimated_tokens: u32,
) -> Result<(), LlmError> {
    let capacity = opts
        .tokens_per_minute
        .or(opts.requests_per_minute)
        .unwrap_or(u32::MAX) as f64;
    if capacity == f64::from(u32::MAX) {
        return Ok(());
    }

    let now = Instant::now();
    let elapsed = now.duration_since(state.bucket_updated_at).as_secs_f64();
    let refill_rate = capacity / 60.0;
    state.bucket_tokens = (state.bucket_tokens + elapsed * refill_rate).min(capacity);
    state.bucket_updated_at = now;

    let cost = if opts.tokens_per_minute.is_some() {
        estimated_tokens.max(1) as f64
    } else {
        1.0
    };
    if state.bucket_tokens < cost {
        let deficit = cost - state.bucket_tokens;
        let retry_after = Duration::from_secs_f64(deficit / refill_rate);
        return Err(rate_limited_error(provider, retry_after));
    }
    state.bucket_tokens -= cost;
    Ok(())
}

fn prune_older_than(queue: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = queue.front() {
        if now.duration_since(*front) > window {
            queue.pop_front();
        } else {
            break;
        }
    }
}

fn rate_limited_error(provider: &str, retry_after: Duration) -> LlmError {
    LlmError::new(ErrorKind::RateLimited, "rate limit ceiling reached")
        .with_provider(provider)
        .with_retry_after_ms(retry_after.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_calls_under_the_rpm_ceiling() {
        let limiter = RateLimiter::new(RateLimitOptions {
            requests_per_minute: Some(2),
            ..RateLimitOptions::default()
        });
        limiter.acquire("openai", 0).await.unwrap();
        limiter.acquire("openai", 0).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_once_rpm_ceiling_is_reached() {
        let limiter = RateLimiter::new(RateLimitOptions {
            requests_per_minute: Some(1),
            ..RateLimitOptions::default()
        });
        limiter.acquire("openai", 0).await.unwrap();
        let err = limiter.acquire("openai", 0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert!(err.retry_after_ms.is_some());
    }

    #[tokio::test]
    async fn rejects_once_tpm_ceiling_is_reached() {
        let limiter = RateLimiter::new(RateLimitOptions {
            tokens_per_minute: Some(100),
            ..RateLimitOptions::default()
        });
        limiter.acquire("openai", 80).await.unwrap();
        let err = limiter.acquire("openai", 50).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn fixed_window_rejects_once_ceiling_reached_within_the_window() {
        let limiter = RateLimiter::new(RateLimitOptions {
            requests_per_minute: Some(1),
            strategy: Strategy::FixedWindow,
            ..RateLimitOptions::default()
        });
        limiter.acquire("openai", 0).await.unwrap();
        let err = limiter.acquire("openai", 0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn token_bucket_rejects_once_capacity_exhausted() {
        let limiter = RateLimiter::new(RateLimitOptions {
            requests_per_minute: Some(1),
            strategy: Strategy::TokenBucket,
            ..RateLimitOptions::default()
        });
        limiter.acquire("openai", 0).await.unwrap();
        let err = limiter.acquire("openai", 0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert!(err.retry_after_ms.unwrap() > 0);
    }

    #[tokio::test]
    async fn providers_have_independent_windows_by_default() {
        let limiter = RateLimiter::new(RateLimitOptions {
            requests_per_minute: Some(1),
            ..RateLimitOptions::default()
        });
        limiter.acquire("openai", 0).await.unwrap();
        limiter.acquire("openai", 0).await.unwrap_err();
        // A different provider has its own window and is unaffected.
        limiter.acquire("anthropic", 0).await.unwrap();
    }

    #[tokio::test]
    async fn per_provider_override_replaces_the_default_ceiling() {
        let mut per_provider = HashMap::new();
        per_provider.insert(
            "groq".to_string(),
            RateLimitOptions {
                requests_per_minute: Some(5),
                ..RateLimitOptions::default()
            },
        );
        let limiter = RateLimiter::new(RateLimitOptions {
            requests_per_minute: Some(1),
            per_provider,
            ..RateLimitOptions::default()
        });
        // "openai" uses the tight default ceiling.
        limiter.acquire("openai", 0).await.unwrap();
        limiter.acquire("openai", 0).await.unwrap_err();
        // "groq" uses its own, looser override.
        for _ in 0..5 {
            limiter.acquire("groq", 0).await.unwrap();
        }
        limiter.acquire("groq", 0).await.unwrap_err();
    }

    #[tokio::test]
    async fn max_concurrent_limits_in_flight_permits() {
        let limiter = Arc::new(RateLimiter::new(RateLimitOptions {
            max_concurrent: Some(1),
            ..RateLimitOptions::default()
        }));
        let _permit = limiter.acquire("openai", 0).await.unwrap();

        let limiter2 = limiter.clone();
        let blocked = tokio::time::timeout(
            Duration::from_millis(30),
            tokio::spawn(async move { limiter2.acquire("openai", 0).await }),
        )
        .await;
        assert!(blocked.is_err());
    }
}

use crate::error::{ErrorKind, LlmError};
use crate::event::EventKind;
use crate::event_bus::EventBus;
use regex::Regex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Configuration for [`with_retry`]. Mirrors the retry-loop parameters of
/// the reference agent's LLM retry helper, generalized to any fallible
/// async operation.
pub struct RetryOptions {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: 0.2,
        }
    }
}

fn transient_message_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new("(?i)429|500|502|503|504|network|timeout|econnreset|enotfound|etimedout")
            .expect("static regex is valid")
    })
}

/// Default retry predicate: a classified [`LlmError`] retries when
/// `can_retry()` is true; anything else retries only if its message looks
/// transient (network/timeout/5xx-shaped).
pub fn default_should_retry(err: &LlmError) -> bool {
    err.can_retry() || transient_message_regex().is_match(&err.message)
}

/// Runs `call` up to `opts.max_retries` additional times on failure,
/// honoring any `retry_after_ms` the error carries and otherwise backing
/// off exponentially with jitter, capped at `max_delay_ms`. Cancellation is
/// checked before every attempt and races the backoff sleep.
pub async fn with_retry<F, Fut, T>(
    opts: &RetryOptions,
    cancel: &CancellationToken,
    events: Option<(&EventBus, &str, &str)>,
    mut should_retry: impl FnMut(&LlmError) -> bool,
    mut call: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(LlmError::new(ErrorKind::Aborted, "request was aborted"));
        }

        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= opts.max_retries || !should_retry(&err) {
                    return Err(err);
                }
                let delay_ms = err.retry_delay_ms(attempt, opts.base_delay_ms, opts.max_delay_ms, opts.jitter);
                if let Some((bus, request_id, provider)) = events {
                    bus.publish(
                        request_id,
                        EventKind::RequestRetry {
                            provider: provider.to_string(),
                            attempt: attempt + 1,
                            delay_ms,
                        },
                    );
                }
                if !wait_with_cancellation(Duration::from_millis(delay_ms), cancel).await {
                    return Err(LlmError::new(ErrorKind::Aborted, "request was aborted"));
                }
                attempt += 1;
            }
        }
    }
}

/// Sleeps for `duration` unless `cancel` fires first. Returns `false` when
/// cancellation won the race.
async fn wait_with_cancellation(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Convenience wrapper used by the pipeline: defaults the retry predicate to
/// [`default_should_retry`].
pub async fn with_default_retry<F, Fut, T>(
    opts: &RetryOptions,
    cancel: &CancellationToken,
    events: Option<(&EventBus, &str, &str)>,
    call: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    with_retry(opts, cancel, events, default_should_retry, call).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let attempts = Arc::new(AtomicU32::new(0));
        let opts = RetryOptions {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 10,
            jitter: 0.0,
        };
        let cancel = CancellationToken::new();
        let attempts2 = attempts.clone();
        let result = with_default_retry(&opts, &cancel, None, move || {
            let attempts = attempts2.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(LlmError::new(ErrorKind::RequestFailed, "boom"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let opts = RetryOptions {
            max_retries: 1,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: 0.0,
        };
        let cancel = CancellationToken::new();
        let result: Result<(), LlmError> = with_default_retry(&opts, &cancel, None, || async {
            Err(LlmError::new(ErrorKind::RequestFailed, "boom"))
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let opts = RetryOptions::default();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), LlmError> = with_default_retry(&opts, &cancel, None, move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::new(ErrorKind::KeyInvalid, "bad key"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_cancelled_token_aborts_before_first_call() {
        let opts = RetryOptions::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), LlmError> = with_default_retry(&opts, &cancel, None, move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Aborted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

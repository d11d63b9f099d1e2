use crate::error::{ErrorKind, LlmError};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

pub struct CircuitBreakerOptions {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_trials: u32,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_trials: 3,
        }
    }
}

/// Per-provider closed/open/half-open failure gate. The orchestrator keeps
/// exactly one of these per provider; never shared across providers.
pub struct CircuitBreaker {
    state: Mutex<State>,
    opts: CircuitBreakerOptions,
}

impl CircuitBreaker {
    pub fn new(opts: CircuitBreakerOptions) -> Self {
        Self {
            state: Mutex::new(State::Closed { failures: 0 }),
            opts,
        }
    }

    /// Call before issuing the wire request. Returns an error without
    /// performing any I/O when the circuit is open and the cooldown has
    /// not elapsed; otherwise transitions `open` → `half-open` as needed
    /// and allows the call through.
    pub async fn before_call(&self, provider: &str) -> Result<(), LlmError> {
        let mut state = self.state.lock().await;
        match *state {
            State::Closed { .. } => Ok(()),
            State::HalfOpen { .. } => Ok(()),
            State::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.opts.reset_timeout {
                    *state = State::HalfOpen { successes: 0 };
                    Ok(())
                } else {
                    let retry_after_ms = (self.opts.reset_timeout - elapsed).as_millis() as u64;
                    Err(LlmError::new(ErrorKind::RequestFailed, "circuit breaker is open")
                        .with_provider(provider)
                        .with_retry_after_ms(retry_after_ms))
                }
            }
        }
    }

    pub async fn on_success(&self) {
        let mut state = self.state.lock().await;
        *state = match *state {
            State::Closed { .. } => State::Closed { failures: 0 },
            State::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= self.opts.half_open_trials {
                    State::Closed { failures: 0 }
                } else {
                    State::HalfOpen { successes }
                }
            }
            State::Open { since } => State::Open { since },
        };
    }

    pub async fn on_failure(&self) {
        let mut state = self.state.lock().await;
        *state = match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.opts.failure_threshold {
                    State::Open { since: Instant::now() }
                } else {
                    State::Closed { failures }
                }
            }
            State::HalfOpen { .. } => State::Open { since: Instant::now() },
            State::Open { since } => State::Open { since },
        };
    }

    #[cfg(test)]
    async fn is_open(&self) -> bool {
        matches!(*self.state.lock().await, State::Open { .. })
    }

    #[cfg(test)]
    async fn is_closed(&self) -> bool {
        matches!(*self.state.lock().await, State::Closed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_failure_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerOptions {
            failure_threshold: 3,
            ..CircuitBreakerOptions::default()
        });
        for _ in 0..3 {
            breaker.before_call("openai").await.unwrap();
            breaker.on_failure().await;
        }
        assert!(breaker.is_open().await);
        assert!(breaker.before_call("openai").await.is_err());
    }

    #[tokio::test]
    async fn success_resets_failure_count_while_closed() {
        let breaker = CircuitBreaker::new(CircuitBreakerOptions {
            failure_threshold: 2,
            ..CircuitBreakerOptions::default()
        });
        breaker.on_failure().await;
        breaker.on_success().await;
        breaker.on_failure().await;
        assert!(breaker.is_closed().await);
    }

    #[tokio::test]
    async fn half_open_trial_successes_close_the_circuit() {
        let breaker = CircuitBreaker::new(CircuitBreakerOptions {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(0),
            half_open_trials: 2,
        });
        breaker.on_failure().await;
        assert!(breaker.is_open().await);

        breaker.before_call("openai").await.unwrap();
        breaker.on_success().await;
        breaker.before_call("openai").await.unwrap();
        breaker.on_success().await;
        assert!(breaker.is_closed().await);
    }

    #[tokio::test]
    async fn half_open_failure_reverts_to_open() {
        let breaker = CircuitBreaker::new(CircuitBreakerOptions {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(0),
            half_open_trials: 2,
        });
        breaker.on_failure().await;
        breaker.before_call("openai").await.unwrap();
        breaker.on_failure().await;
        assert!(breaker.is_open().await);
    }
}

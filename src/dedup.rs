use crate::error::LlmError;
use futures::FutureExt;
use futures::future::Shared;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

type SharedResult<T> = Result<T, Arc<LlmError>>;
type InFlight<T> = Shared<Pin<Box<dyn Future<Output = SharedResult<T>> + Send>>>;

/// Coalesces concurrent identical non-streaming requests so the adapter is
/// invoked at most once per fingerprint; every caller attached to the same
/// in-flight fingerprint observes the same settlement (value or error).
pub struct DedupCoalescer<T: Clone + Send + Sync + 'static> {
    in_flight: Mutex<HashMap<String, InFlight<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for DedupCoalescer<T> {
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> DedupCoalescer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `make` to produce the call's future, unless a call for `key` is
    /// already in flight, in which case this attaches to it instead. The
    /// entry is removed once the shared future settles.
    pub async fn run<F, Fut>(&self, key: String, make: F) -> Result<T, LlmError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, LlmError>> + Send + 'static,
    {
        let existing = {
            let guard = self.in_flight.lock().await;
            guard.get(&key).cloned()
        };

        let shared: InFlight<T> = match existing {
            Some(shared) => shared,
            None => {
                let fut: Pin<Box<dyn Future<Output = SharedResult<T>> + Send>> =
                    Box::pin(make().map(|res| res.map_err(Arc::new)));
                let shared = fut.shared();
                self.in_flight.lock().await.insert(key.clone(), shared.clone());
                shared
            }
        };

        let result = shared.await;

        self.in_flight.lock().await.remove(&key);

        // LlmError's cause is Arc-backed, so cloning out of the shared Arc
        // here preserves every field for every waiting caller, not just the
        // one that happens to unwrap the last reference.
        result.map_err(|arc_err| (*arc_err).clone())
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_identical_calls_invoke_the_factory_once() {
        let coalescer = Arc::new(DedupCoalescer::<u32>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let coalescer = coalescer.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .run("fp".to_string(), move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(7u32)
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entry_is_removed_after_settlement() {
        let coalescer = DedupCoalescer::<u32>::new();
        coalescer
            .run("fp".to_string(), || async { Ok(1u32) })
            .await
            .unwrap();
        assert_eq!(coalescer.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_callers_all_observe_the_same_error() {
        let coalescer = Arc::new(DedupCoalescer::<u32>::new());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let coalescer = coalescer.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .run("fp".to_string(), || async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(LlmError::new(ErrorKind::RequestFailed, "boom"))
                    })
                    .await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.kind, ErrorKind::RequestFailed);
        }
    }
}

use crate::error::{ErrorKind, LlmError};
use crate::event::{Event, EventKind, EventKindTag, EventListener};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::broadcast;
use tokio::task;
use tokio::task::JoinSet;

const EVENT_BUS_BUFFER: usize = 1024;
const DEFAULT_SOFT_WARNING: usize = 10;
const DEFAULT_HARD_CAP: usize = 100;

pub type ListenerToken = u64;

type ListenerList = Vec<(ListenerToken, Arc<dyn EventListener>)>;

/// Typed pub/sub for request, stream, key, cache and middleware lifecycle
/// events. A `broadcast::Sender` serves whole-bus subscribers; a separately
/// locked map of per-kind listeners serves typed, hard-capped subscriptions.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    listeners: Arc<Mutex<HashMap<EventKindTag, ListenerList>>>,
    sequence: AtomicU64,
    listener_sequence: AtomicU64,
    listener_tasks: Arc<TokioMutex<JoinSet<()>>>,
    soft_warning: usize,
    hard_cap: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_SOFT_WARNING, DEFAULT_HARD_CAP)
    }

    pub fn with_limits(soft_warning: usize, hard_cap: usize) -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_BUFFER);
        Self {
            sender,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            sequence: AtomicU64::new(1),
            listener_sequence: AtomicU64::new(1),
            listener_tasks: Arc::new(TokioMutex::new(JoinSet::new())),
            soft_warning,
            hard_cap,
        }
    }

    /// Subscribe to the full event stream (all kinds).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Register a listener for one event kind. Fails with
    /// [`ErrorKind::ValidationError`] once `hard_cap` listeners are already
    /// registered for that kind; logs a warning past `soft_warning`.
    pub fn on(
        &self,
        kind: EventKindTag,
        listener: Arc<dyn EventListener>,
    ) -> Result<ListenerToken, LlmError> {
        let mut listeners = self.listeners.lock();
        let bucket = listeners.entry(kind).or_default();
        if bucket.len() >= self.hard_cap {
            return Err(LlmError::new(
                ErrorKind::ValidationError,
                format!(
                    "listener hard cap ({}) exceeded for event kind {:?}",
                    self.hard_cap, kind
                ),
            ));
        }
        if bucket.len() + 1 == self.soft_warning {
            log::warn!(
                "EventBus: listener count for {:?} has reached the soft warning threshold ({})",
                kind,
                self.soft_warning
            );
        }
        let token = self.listener_sequence.fetch_add(1, Ordering::Relaxed);
        bucket.push((token, listener));
        Ok(token)
    }

    /// Remove a previously registered listener. Returns whether one was found.
    pub fn off(&self, kind: EventKindTag, token: ListenerToken) -> bool {
        let mut listeners = self.listeners.lock();
        match listeners.get_mut(&kind) {
            Some(bucket) => {
                let before = bucket.len();
                bucket.retain(|(t, _)| *t != token);
                before != bucket.len()
            }
            None => false,
        }
    }

    /// Remove every listener across every kind.
    pub fn remove_all_listeners(&self) {
        self.listeners.lock().clear();
    }

    pub fn listener_count(&self, kind: EventKindTag) -> usize {
        self.listeners
            .lock()
            .get(&kind)
            .map(|b| b.len())
            .unwrap_or(0)
    }

    /// Publish an event, stamping it with the next sequence number and the
    /// current timestamp.
    pub fn publish(&self, request_id: &str, kind: EventKind) {
        let event = self.build_event(request_id, kind);
        self.publish_raw(event);
    }

    /// Publish a fully materialized event without touching seq/timestamp
    /// (used by replay/test harnesses).
    pub fn publish_raw(&self, event: Event) {
        self.bump_sequence_after_raw(event.seq);
        self.dispatch(event);
    }

    pub async fn shutdown(&self) {
        log::debug!("EventBus: shutting down, aborting pending listener tasks");
        let mut tasks = self.listener_tasks.lock().await;
        tasks.shutdown().await;
    }

    fn dispatch(&self, event: Event) {
        let _ = self.sender.send(event.clone());

        let tag = event.kind.tag();
        let listeners: Vec<_> = {
            let guard = self.listeners.lock();
            guard
                .get(&tag)
                .map(|b| b.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };
        if listeners.is_empty() {
            return;
        }

        let tasks = self.listener_tasks.clone();
        task::spawn(async move {
            let mut guard = tasks.lock().await;
            for listener in listeners {
                let event = event.clone();
                guard.spawn(async move {
                    if let Err(err) = listener.on_event(&event).await {
                        log::error!(
                            "EventBus listener failure: request_id={}, seq={}, error={}",
                            event.request_id,
                            event.seq,
                            err
                        );
                    }
                });
            }
        });
    }

    fn bump_sequence_after_raw(&self, seq: u64) {
        let min_next = seq.saturating_add(1);
        let mut current = self.sequence.load(Ordering::Relaxed);
        while current < min_next {
            match self.sequence.compare_exchange_weak(
                current,
                min_next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn build_event(&self, request_id: &str, kind: EventKind) -> Event {
        Event {
            seq: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: chrono::Utc::now(),
            request_id: request_id.to_string(),
            kind,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as TokioMutex;

    struct MockListener {
        received: Arc<TokioMutex<Vec<Event>>>,
    }

    impl MockListener {
        fn new() -> Self {
            Self {
                received: Arc::new(TokioMutex::new(Vec::new())),
            }
        }
    }

    #[async_trait::async_trait]
    impl EventListener for MockListener {
        async fn on_event(&self, event: &Event) -> Result<(), LlmError> {
            self.received.lock().await.push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn subscribe_receives_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(
            "req-1",
            EventKind::RequestStart {
                provider: "openai".into(),
                model: "gpt-4-turbo".into(),
            },
        );
        let event = tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv())
            .await
            .expect("timeout")
            .expect("event");
        assert_eq!(event.request_id, "req-1");
    }

    #[tokio::test]
    async fn typed_listener_gets_notified_for_matching_kind_only() {
        let bus = EventBus::new();
        let listener = Arc::new(MockListener::new());
        bus.on(EventKindTag::CacheHit, listener.clone()).unwrap();

        bus.publish(
            "req-2",
            EventKind::CacheMiss {
                provider: "openai".into(),
                model: "gpt-4-turbo".into(),
                fingerprint: "abcd".into(),
            },
        );
        bus.publish(
            "req-3",
            EventKind::CacheHit {
                provider: "openai".into(),
                model: "gpt-4-turbo".into(),
                fingerprint: "abcd".into(),
            },
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let received = listener.received.lock().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].request_id, "req-3");
    }

    #[tokio::test]
    async fn hard_cap_rejects_further_registrations() {
        let bus = EventBus::with_limits(1, 2);
        bus.on(EventKindTag::KeySet, Arc::new(MockListener::new()))
            .unwrap();
        bus.on(EventKindTag::KeySet, Arc::new(MockListener::new()))
            .unwrap();
        let err = bus
            .on(EventKindTag::KeySet, Arc::new(MockListener::new()))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn off_detaches_listener() {
        let bus = EventBus::new();
        let token = bus
            .on(EventKindTag::KeySet, Arc::new(MockListener::new()))
            .unwrap();
        assert_eq!(bus.listener_count(EventKindTag::KeySet), 1);
        assert!(bus.off(EventKindTag::KeySet, token));
        assert_eq!(bus.listener_count(EventKindTag::KeySet), 0);
        assert!(!bus.off(EventKindTag::KeySet, token));
    }

    #[tokio::test]
    async fn sequence_numbers_increment_monotonically() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(
            "r",
            EventKind::KeyRemove {
                provider: "openai".into(),
            },
        );
        bus.publish(
            "r",
            EventKind::KeyRemove {
                provider: "openai".into(),
            },
        );
        let e1 = rx.recv().await.unwrap();
        let e2 = rx.recv().await.unwrap();
        assert_eq!(e1.seq + 1, e2.seq);
    }
}

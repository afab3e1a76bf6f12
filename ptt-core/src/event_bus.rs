//! Typed pub/sub with priority ordering, bounded history, and a fast path
//! for high-churn event types.
//!
//! Subscribers are ordered by descending priority so CRITICAL handlers
//! observe an event before LOW ones. Two event types (`app.mode_changed`,
//! `app.state_changed`) are dispatched fire-and-forget: the publisher
//! schedules each handler as an independent task and returns without
//! waiting. Every other type is awaited sequentially in priority order so a
//! HIGH handler's side effects are visible to a LOW handler that runs after
//! it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

const MAX_HISTORY: usize = 1000;
const DEBUG_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

fn fast_events() -> &'static HashSet<&'static str> {
    static SET: std::sync::OnceLock<HashSet<&'static str>> = std::sync::OnceLock::new();
    SET.get_or_init(|| ["app.mode_changed", "app.state_changed"].into_iter().collect())
}

fn excluded_from_history() -> &'static HashSet<&'static str> {
    static SET: std::sync::OnceLock<HashSet<&'static str>> = std::sync::OnceLock::new();
    SET.get_or_init(|| ["grpc.response.audio", "grpc.response.text"].into_iter().collect())
}

fn debug_sampled_events() -> &'static HashSet<&'static str> {
    static SET: std::sync::OnceLock<HashSet<&'static str>> = std::sync::OnceLock::new();
    SET.get_or_init(|| ["grpc.response.audio"].into_iter().collect())
}

/// One delivered event: a type name, its payload, and a monotonic timestamp
/// in seconds since this bus was constructed.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Event {
    pub event_type: String,
    pub data: Value,
    pub timestamp: f64,
}

/// A bus subscriber. Implementors should be cheap to clone into an `Arc`
/// and should not block; long work should be spawned internally.
pub trait Handler: Send + Sync {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(self(event))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

struct Subscriber {
    handler: Arc<dyn Handler>,
    priority: Priority,
}

struct SampleState {
    last: Instant,
    suppressed: u32,
}

pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    history: RwLock<VecDeque<Event>>,
    sample_state: Mutex<HashMap<(String, &'static str), SampleState>>,
    started_at: Instant,
    seq: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(MAX_HISTORY)),
            sample_state: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
            seq: AtomicU64::new(0),
        }
    }

    fn now(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Subscribe to `event_type`. A duplicate `handler` (same `Arc` identity)
    /// already registered for the same type is a no-op.
    pub async fn subscribe(&self, event_type: &str, handler: Arc<dyn Handler>, priority: Priority) {
        let mut subs = self.subscribers.write().await;
        let list = subs.entry(event_type.to_string()).or_default();
        if list.iter().any(|s| Arc::ptr_eq(&s.handler, &handler)) {
            warn!(event_type, "duplicate subscription ignored");
            return;
        }
        list.push(Subscriber { handler, priority });
        list.sort_by(|a, b| b.priority.cmp(&a.priority));
        info!(event_type, priority = ?priority, "subscribed");
    }

    pub async fn unsubscribe(&self, event_type: &str, handler: &Arc<dyn Handler>) {
        let mut subs = self.subscribers.write().await;
        if let Some(list) = subs.get_mut(event_type) {
            list.retain(|s| !Arc::ptr_eq(&s.handler, handler));
            if list.is_empty() {
                subs.remove(event_type);
            }
        }
    }

    pub async fn publish(&self, event_type: &str, data: Value) {
        let event = Event {
            event_type: event_type.to_string(),
            data,
            timestamp: self.now(),
        };
        self.seq.fetch_add(1, Ordering::Relaxed);

        if !excluded_from_history().contains(event_type) {
            let mut history = self.history.write().await;
            history.push_back(event.clone());
            if history.len() > MAX_HISTORY {
                history.pop_front();
            }
        }

        let handlers: Vec<(Arc<dyn Handler>, Priority)> = {
            let subs = self.subscribers.read().await;
            subs.get(event_type)
                .map(|list| list.iter().map(|s| (s.handler.clone(), s.priority)).collect())
                .unwrap_or_default()
        };

        self.debug_log(event_type, "dispatch", &format!(
            "dispatching '{event_type}' to {} subscriber(s)",
            handlers.len()
        ));

        if fast_events().contains(event_type) {
            for (handler, _priority) in handlers {
                let ev = event.clone();
                tokio::spawn(async move {
                    handler.handle(ev).await;
                });
            }
        } else {
            for (handler, _priority) in handlers {
                let ev = event.clone();
                handler.handle(ev).await;
            }
        }

        self.debug_log(event_type, "published", &format!("published '{event_type}'"));
    }

    /// Sampled debug logging for high-frequency event types; logs at most
    /// once per second per `(event_type, phase)` with a suppressed-count
    /// tail, otherwise logs every call.
    fn debug_log(&self, event_type: &str, phase: &'static str, message: &str) {
        if !debug_sampled_events().contains(event_type) {
            debug!("{message}");
            return;
        }
        let Ok(mut state) = self.sample_state.try_lock() else {
            // Contended — skip this sample rather than block the dispatch path.
            return;
        };
        let now = Instant::now();
        let entry = state
            .entry((event_type.to_string(), phase))
            .or_insert(SampleState { last: now - DEBUG_SAMPLE_INTERVAL, suppressed: 0 });
        if now.duration_since(entry.last) >= DEBUG_SAMPLE_INTERVAL {
            let suppressed = entry.suppressed;
            entry.last = now;
            entry.suppressed = 0;
            if suppressed > 0 {
                debug!("{message} [suppressed={suppressed}]");
            } else {
                debug!("{message}");
            }
        } else {
            entry.suppressed += 1;
        }
    }

    pub async fn history(&self, event_type: Option<&str>, limit: usize) -> Vec<Event> {
        let history = self.history.read().await;
        let filtered: Vec<Event> = match event_type {
            Some(t) => history.iter().filter(|e| e.event_type == t).cloned().collect(),
            None => history.iter().cloned().collect(),
        };
        let start = filtered.len().saturating_sub(limit);
        filtered[start..].to_vec()
    }

    pub async fn subscriber_count(&self, event_type: Option<&str>) -> usize {
        let subs = self.subscribers.read().await;
        match event_type {
            Some(t) => subs.get(t).map(|l| l.len()).unwrap_or(0),
            None => subs.values().map(|l| l.len()).sum(),
        }
    }
}

/// Logs an unhandled publish-time error the way the bus logs handler panics
/// — never abort a publish over one bad subscriber.
pub fn log_handler_panic(event_type: &str, err: &dyn std::fmt::Display) {
    error!(event_type, %err, "event handler failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn Handler> {
        Arc::new(move |_event: Event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn subscribers_receive_in_priority_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        let o1 = order.clone();
        let low: Arc<dyn Handler> = Arc::new(move |_e: Event| {
            let o = o1.clone();
            async move { o.lock().await.push("low") }
        });
        let o2 = order.clone();
        let high: Arc<dyn Handler> = Arc::new(move |_e: Event| {
            let o = o2.clone();
            async move { o.lock().await.push("high") }
        });

        bus.subscribe("x", low, Priority::Low).await;
        bus.subscribe("x", high, Priority::High).await;
        bus.publish("x", serde_json::json!({})).await;

        assert_eq!(*order.lock().await, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_noop() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(counter.clone());
        bus.subscribe("x", handler.clone(), Priority::Medium).await;
        bus.subscribe("x", handler.clone(), Priority::Medium).await;
        assert_eq!(bus.subscriber_count(Some("x")).await, 1);
    }

    #[tokio::test]
    async fn history_excludes_high_frequency_types() {
        let bus = EventBus::new();
        bus.publish("grpc.response.audio", serde_json::json!({})).await;
        bus.publish("voice.recording_start", serde_json::json!({})).await;
        assert!(bus.history(Some("grpc.response.audio"), 10).await.is_empty());
        assert_eq!(bus.history(Some("voice.recording_start"), 10).await.len(), 1);
    }

    #[tokio::test]
    async fn fast_event_dispatch_does_not_block_publish() {
        let bus = EventBus::new();
        let notify = Arc::new(Notify::new());
        let n = notify.clone();
        let handler: Arc<dyn Handler> = Arc::new(move |_e: Event| {
            let n = n.clone();
            async move {
                n.notified().await;
            }
        });
        bus.subscribe("app.mode_changed", handler, Priority::Critical).await;
        // Would hang if publish awaited the handler, since nothing notifies it.
        tokio::time::timeout(Duration::from_millis(200), bus.publish("app.mode_changed", serde_json::json!({})))
            .await
            .expect("publish of a fast event must not block on its handlers");
        notify.notify_one();
    }
}

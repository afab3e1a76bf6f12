//! Signal Service: short PCM UI cues with per-pattern cooldowns.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::event_bus::{Event, EventBus, Handler, Priority};
use crate::state_store::{StateStore, FLAG_USER_QUIT_INTENT};
use crate::types::SignalPattern;

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub cooldowns_ms: HashMap<SignalPatternKey, u64>,
}

/// Hashable key mirroring [`SignalPattern`] (the value type itself isn't
/// `Hash` to keep it a plain serde enum).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalPatternKey {
    ListenStart,
    Done,
    Cancel,
    Error,
    UpdateStart,
    UpdateSuccess,
    UpdateError,
}

impl From<SignalPattern> for SignalPatternKey {
    fn from(p: SignalPattern) -> Self {
        match p {
            SignalPattern::ListenStart => Self::ListenStart,
            SignalPattern::Done => Self::Done,
            SignalPattern::Cancel => Self::Cancel,
            SignalPattern::Error => Self::Error,
            SignalPattern::UpdateStart => Self::UpdateStart,
            SignalPattern::UpdateSuccess => Self::UpdateSuccess,
            SignalPattern::UpdateError => Self::UpdateError,
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        let mut cooldowns_ms = HashMap::new();
        cooldowns_ms.insert(SignalPatternKey::ListenStart, 600);
        cooldowns_ms.insert(SignalPatternKey::Done, 2000);
        cooldowns_ms.insert(SignalPatternKey::Cancel, 150);
        cooldowns_ms.insert(SignalPatternKey::Error, 150);
        Self { cooldowns_ms }
    }
}

pub struct SignalService {
    bus: Arc<EventBus>,
    store: Arc<StateStore>,
    config: SignalConfig,
    last_emitted: Mutex<HashMap<SignalPatternKey, Instant>>,
}

impl SignalService {
    pub fn new(bus: Arc<EventBus>, store: Arc<StateStore>, config: SignalConfig) -> Arc<Self> {
        Arc::new(Self { bus, store, config, last_emitted: Mutex::new(HashMap::new()) })
    }

    pub async fn start(self: &Arc<Self>) {
        let mic_opened: Arc<dyn Handler> = Arc::new(PatternHandler(self.clone(), SignalPattern::ListenStart));
        self.bus.subscribe("voice.mic_opened", mic_opened, Priority::Medium).await;

        let cancelled: Arc<dyn Handler> = Arc::new(CancelledHandler(self.clone()));
        self.bus.subscribe("playback.cancelled", cancelled, Priority::Medium).await;

        for event_type in ["voice.recognition_failed", "grpc.request_failed", "screenshot.error"] {
            let handler: Arc<dyn Handler> = Arc::new(PatternHandler(self.clone(), SignalPattern::Error));
            self.bus.subscribe(event_type, handler, Priority::Medium).await;
        }
    }

    async fn emit(self: &Arc<Self>, pattern: SignalPattern) {
        if self.store.get_bool(FLAG_USER_QUIT_INTENT, false).await {
            debug!(?pattern, "signal suppressed, user_quit_intent set");
            return;
        }

        let key = SignalPatternKey::from(pattern);
        let cooldown = self.config.cooldowns_ms.get(&key).copied().unwrap_or(150);
        let now = Instant::now();
        {
            let mut last = self.last_emitted.lock().await;
            if let Some(prev) = last.get(&key) {
                if now.duration_since(*prev) < Duration::from_millis(cooldown) {
                    return;
                }
            }
            last.insert(key, now);
        }

        self.bus
            .publish(
                "playback.signal",
                json!({
                    "pattern": pattern,
                    "cue_id": Uuid::new_v4().to_string(),
                    "emitted_at_ms": chrono::Utc::now().timestamp_millis(),
                }),
            )
            .await;
    }
}

struct PatternHandler(Arc<SignalService>, SignalPattern);
impl Handler for PatternHandler {
    fn handle(&self, _event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let service = self.0.clone();
        let pattern = self.1;
        Box::pin(async move { service.emit(pattern).await })
    }
}

struct CancelledHandler(Arc<SignalService>);
impl Handler for CancelledHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let service = self.0.clone();
        Box::pin(async move {
            // `reason` distinguishes a user-originated cancel (cue plays)
            // from a cancel whose cue is already handled via the playback
            // cancel-guard window (I6).
            let source = event.data.get("source").and_then(Value::as_str).unwrap_or_default();
            if source != "grpc_cancel" {
                service.emit(SignalPattern::Cancel).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cooldown_suppresses_rapid_repeat() {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(StateStore::new(bus.clone()));
        let service = SignalService::new(bus.clone(), store, SignalConfig::default());
        service.start().await;
        bus.publish("voice.mic_opened", json!({})).await;
        bus.publish("voice.mic_opened", json!({})).await;
        assert_eq!(bus.history(Some("playback.signal"), 10).await.len(), 1);
    }

    #[tokio::test]
    async fn user_quit_intent_suppresses_all_cues() {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(StateStore::new(bus.clone()));
        store.set(FLAG_USER_QUIT_INTENT, Value::Bool(true)).await;
        let service = SignalService::new(bus.clone(), store, SignalConfig::default());
        service.start().await;
        bus.publish("voice.mic_opened", json!({})).await;
        assert!(bus.history(Some("playback.signal"), 10).await.is_empty());
    }
}

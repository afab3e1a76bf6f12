//! Mode-Change Notifier: spoken announcements tied to mode transitions and
//! upstream progress events (e.g. an updater). Strictly idempotent per
//! progress-step threshold.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::event_bus::{Event, EventBus, Handler, Priority};
use crate::types::SignalPattern;

const PROGRESS_STEP_PERCENT: u32 = 25;

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub enabled: bool,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

pub struct ModeChangeNotifier {
    bus: Arc<EventBus>,
    config: NotifierConfig,
    last_step_by_source: Mutex<HashMap<String, u32>>,
}

impl ModeChangeNotifier {
    pub fn new(bus: Arc<EventBus>, config: NotifierConfig) -> Arc<Self> {
        Arc::new(Self { bus, config, last_step_by_source: Mutex::new(HashMap::new()) })
    }

    pub async fn start(self: &Arc<Self>) {
        let handler: Arc<dyn Handler> = Arc::new(ProgressHandler(self.clone()));
        self.bus.subscribe("progress.update", handler, Priority::Low).await;
    }

    async fn on_progress(self: &Arc<Self>, event: &Event) {
        if !self.config.enabled {
            return;
        }
        let source = event.data.get("source").and_then(Value::as_str).unwrap_or("progress").to_string();
        let percent = event.data.get("percent").and_then(Value::as_u64).unwrap_or(0) as u32;
        let step = percent / PROGRESS_STEP_PERCENT;

        let mut last_step = self.last_step_by_source.lock().await;
        if last_step.get(&source).copied() == Some(step) {
            return;
        }
        last_step.insert(source.clone(), step);
        drop(last_step);

        let text = event
            .data
            .get("announcement")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{source} {percent}% complete"));

        self.bus
            .publish("grpc.tts_request", json!({ "text": text, "session_id": Value::Null, "source": source }))
            .await;

        if percent >= 100 {
            self.bus.publish("signal.play", json!({ "pattern": SignalPattern::UpdateSuccess })).await;
        } else if percent == 0 {
            self.bus.publish("signal.play", json!({ "pattern": SignalPattern::UpdateStart })).await;
        }
    }
}

struct ProgressHandler(Arc<ModeChangeNotifier>);
impl Handler for ProgressHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let notifier = self.0.clone();
        Box::pin(async move { notifier.on_progress(&event).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_step_does_not_re_announce() {
        let bus = Arc::new(EventBus::new());
        let notifier = ModeChangeNotifier::new(bus.clone(), NotifierConfig::default());
        notifier.start().await;
        bus.publish("progress.update", json!({ "source": "updater", "percent": 10 })).await;
        bus.publish("progress.update", json!({ "source": "updater", "percent": 12 })).await;
        assert_eq!(bus.history(Some("grpc.tts_request"), 10).await.len(), 1);
    }

    #[tokio::test]
    async fn crossing_a_step_threshold_announces_again() {
        let bus = Arc::new(EventBus::new());
        let notifier = ModeChangeNotifier::new(bus.clone(), NotifierConfig::default());
        notifier.start().await;
        bus.publish("progress.update", json!({ "source": "updater", "percent": 10 })).await;
        bus.publish("progress.update", json!({ "source": "updater", "percent": 30 })).await;
        assert_eq!(bus.history(Some("grpc.tts_request"), 10).await.len(), 2);
    }
}

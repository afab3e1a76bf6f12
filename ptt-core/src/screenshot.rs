//! Screenshot Capture: one screen snapshot per session, idempotent across
//! the LISTENING→PROCESSING entries of that session.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event_bus::{Event, EventBus, Handler, Priority};
use crate::types::Session;

const REPLAY_CACHE_CAPACITY: usize = 128;
const EARLY_CAPTURE_AWAIT: Duration = Duration::from_millis(500);

#[derive(Debug, serde::Serialize)]
pub struct Capture {
    pub image_path: String,
    pub base64_data: String,
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
    pub mime_type: String,
}

/// External collaborator that actually grabs a screen image. Implemented by
/// `ptt-daemon` via a `screencapture(1)` shell-out.
pub trait ScreenCaptureBackend: Send + Sync {
    fn capture(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<Capture>> + Send>>;
}

enum CaptureState {
    InFlight(tokio::sync::watch::Receiver<Option<Capture>>),
    Done(Capture),
}

pub struct ScreenshotCoordinator {
    bus: Arc<EventBus>,
    backend: Arc<dyn ScreenCaptureBackend>,
    by_session: Mutex<HashMap<Session, CaptureState>>,
    replay_order: Mutex<VecDeque<Session>>,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScreenshotCoordinator {
    pub fn new(bus: Arc<EventBus>, backend: Arc<dyn ScreenCaptureBackend>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            backend,
            by_session: Mutex::new(HashMap::new()),
            replay_order: Mutex::new(VecDeque::new()),
            cleanup_handle: Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let start_handler: Arc<dyn Handler> = Arc::new(RecordingStartHandler(self.clone()));
        self.bus.subscribe("voice.recording_start", start_handler, Priority::Medium).await;
        let stop_handler: Arc<dyn Handler> = Arc::new(RecordingStopHandler(self.clone()));
        self.bus.subscribe("voice.recording_stop", stop_handler, Priority::Medium).await;
        let mode_handler: Arc<dyn Handler> = Arc::new(ModeChangedHandler(self.clone()));
        self.bus.subscribe("app.mode_changed", mode_handler, Priority::Medium).await;
    }

    async fn on_recording_start(self: &Arc<Self>, session: Session) {
        let (tx, rx) = tokio::sync::watch::channel(None);
        self.by_session.lock().await.insert(session, CaptureState::InFlight(rx));

        let backend = self.backend.clone();
        let bus = self.bus.clone();
        let this = self.clone();
        tokio::spawn(async move {
            match backend.capture().await {
                Ok(capture) => {
                    let _ = tx.send(Some(capture.clone()));
                    this.remember(session, capture).await;
                }
                Err(err) => {
                    warn!(%session, %err, "early screenshot capture failed");
                    bus.publish("screenshot.error", json!({ "session": session.to_string(), "error": err.to_string() }))
                        .await;
                }
            }
        });
    }

    async fn on_recording_stop(self: &Arc<Self>, session: Session) {
        let existing = {
            let mut map = self.by_session.lock().await;
            map.remove(&session)
        };

        let capture = match existing {
            Some(CaptureState::Done(capture)) => Some(capture),
            Some(CaptureState::InFlight(mut rx)) => {
                tokio::time::timeout(EARLY_CAPTURE_AWAIT, rx.changed()).await.ok();
                rx.borrow().clone()
            }
            None => None,
        };

        let capture = match capture {
            Some(c) => c,
            None => match self.backend.capture().await {
                Ok(c) => c,
                Err(err) => {
                    warn!(%session, %err, "screenshot capture at recording_stop failed");
                    self.bus
                        .publish("screenshot.error", json!({ "session": session.to_string(), "error": err.to_string() }))
                        .await;
                    return;
                }
            },
        };

        self.remember(session, capture.clone()).await;
        self.publish_captured(session, &capture, None).await;
    }

    async fn on_mode_changed(self: &Arc<Self>, mode: &str, session: Option<Session>) {
        let Some(session) = session else { return };
        match mode {
            "listening" => {
                // Best-effort prepare: capture runs detached, so entering
                // LISTENING never blocks on it even though the budget below
                // only bounds how long we wait for it at recording_stop.
                let has_any = self.by_session.lock().await.contains_key(&session);
                if !has_any {
                    self.on_recording_start(session).await;
                }
            }
            "processing" => {
                let cached = self.lookup_done(session).await;
                match cached {
                    Some(capture) => {
                        self.publish_captured(session, &capture, Some("processing_entry_after_early_capture")).await;
                    }
                    None => match self.backend.capture().await {
                        Ok(capture) => {
                            self.remember(session, capture.clone()).await;
                            self.publish_captured(session, &capture, None).await;
                        }
                        Err(err) => {
                            warn!(%session, %err, "synchronous screenshot on PROCESSING entry failed");
                            self.bus
                                .publish("screenshot.error", json!({ "session": session.to_string(), "error": err.to_string() }))
                                .await;
                        }
                    },
                }
            }
            _ => {}
        }
    }

    async fn lookup_done(&self, session: Session) -> Option<Capture> {
        match self.by_session.lock().await.get(&session) {
            Some(CaptureState::Done(c)) => Some(c.clone()),
            _ => None,
        }
    }

    async fn remember(&self, session: Session, capture: Capture) {
        self.by_session.lock().await.insert(session, CaptureState::Done(capture));
        let mut order = self.replay_order.lock().await;
        order.retain(|s| *s != session);
        order.push_back(session);
        while order.len() > REPLAY_CACHE_CAPACITY {
            if let Some(evicted) = order.pop_front() {
                debug!(session = %evicted, "evicted from screenshot replay cache");
            }
        }
    }

    async fn publish_captured(&self, session: Session, capture: &Capture, replay_reason: Option<&str>) {
        self.bus
            .publish(
                "screenshot.captured",
                json!({
                    "session": session.to_string(),
                    "image_path": capture.image_path,
                    "base64_data": capture.base64_data,
                    "format": capture.format,
                    "width": capture.width,
                    "height": capture.height,
                    "size_bytes": capture.size_bytes,
                    "mime_type": capture.mime_type,
                    "capture_time": chrono::Utc::now().to_rfc3339(),
                    "replay_reason": replay_reason,
                }),
            )
            .await;
    }

    /// Deletes temp files older than 24h from `dir`. Intended to be run
    /// periodically by `ptt-daemon`.
    pub async fn run_cleanup_sweep(dir: std::path::PathBuf) -> std::io::Result<()> {
        let cutoff = std::time::SystemTime::now() - Duration::from_secs(24 * 3600);
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(meta) = entry.metadata().await {
                if let Ok(modified) = meta.modified() {
                    if modified < cutoff {
                        let _ = tokio::fs::remove_file(entry.path()).await;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn spawn_periodic_cleanup(self: &Arc<Self>, dir: std::path::PathBuf, every: Duration) {
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                if let Err(err) = Self::run_cleanup_sweep(dir.clone()).await {
                    warn!(%err, "screenshot temp-file cleanup sweep failed");
                }
            }
        });
        *self.cleanup_handle.lock().await = Some(handle);
    }
}

impl Clone for Capture {
    fn clone(&self) -> Self {
        Self {
            image_path: self.image_path.clone(),
            base64_data: self.base64_data.clone(),
            format: self.format.clone(),
            width: self.width,
            height: self.height,
            size_bytes: self.size_bytes,
            mime_type: self.mime_type.clone(),
        }
    }
}

fn session_of(event: &Event) -> Option<Session> {
    event
        .data
        .get("session")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .map(Session)
}

struct RecordingStartHandler(Arc<ScreenshotCoordinator>);
impl Handler for RecordingStartHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let c = self.0.clone();
        Box::pin(async move {
            if let Some(session) = session_of(&event) {
                c.on_recording_start(session).await;
            }
        })
    }
}

struct RecordingStopHandler(Arc<ScreenshotCoordinator>);
impl Handler for RecordingStopHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let c = self.0.clone();
        Box::pin(async move {
            if let Some(session) = session_of(&event) {
                c.on_recording_stop(session).await;
            }
        })
    }
}

struct ModeChangedHandler(Arc<ScreenshotCoordinator>);
impl Handler for ModeChangedHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let c = self.0.clone();
        Box::pin(async move {
            let mode = event.data.get("mode").and_then(Value::as_str).unwrap_or_default().to_string();
            let session = session_of(&Event {
                event_type: event.event_type.clone(),
                data: json!({ "session": event.data.get("session_id").cloned().unwrap_or(Value::Null) }),
                timestamp: event.timestamp,
            });
            c.on_mode_changed(&mode, session).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeBackend;
    impl ScreenCaptureBackend for FakeBackend {
        fn capture(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<Capture>> + Send>> {
            Box::pin(async {
                Ok(Capture {
                    image_path: "/tmp/shot.jpg".to_string(),
                    base64_data: "".to_string(),
                    format: "jpeg".to_string(),
                    width: 100,
                    height: 100,
                    size_bytes: 10,
                    mime_type: "image/jpeg".to_string(),
                })
            })
        }
    }

    #[tokio::test]
    async fn recording_stop_publishes_exactly_one_capture() {
        let bus = Arc::new(EventBus::new());
        let coordinator = ScreenshotCoordinator::new(bus.clone(), Arc::new(FakeBackend));
        coordinator.start().await;
        let session = Session::new();
        bus.publish("voice.recording_start", json!({ "session": session.to_string() })).await;
        bus.publish("voice.recording_stop", json!({ "session": session.to_string() })).await;
        assert_eq!(bus.history(Some("screenshot.captured"), 10).await.len(), 1);
    }

    #[tokio::test]
    async fn processing_entry_replays_with_reason() {
        let bus = Arc::new(EventBus::new());
        let coordinator = ScreenshotCoordinator::new(bus.clone(), Arc::new(FakeBackend));
        coordinator.start().await;
        let session = Session::new();
        bus.publish("voice.recording_start", json!({ "session": session.to_string() })).await;
        bus.publish("voice.recording_stop", json!({ "session": session.to_string() })).await;
        bus.publish("app.mode_changed", json!({ "mode": "processing", "session_id": session.to_string() })).await;

        let captured = bus.history(Some("screenshot.captured"), 10).await;
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[1].data["replay_reason"], "processing_entry_after_early_capture");
    }
}

//! Input-to-Intent Translator: owns the push-to-talk state machine and
//! turns raw [`KeyEvent`]s for one configured key/chord into recording,
//! mode, and interrupt intents on the bus.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event_bus::EventBus;
use crate::types::{KeyEvent, KeyEventKind, Session};

#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub key_id: String,
    pub short_press_threshold_sec: f64,
    pub long_press_threshold_sec: f64,
    pub event_cooldown_sec: f64,
    pub min_recording_duration_sec: f64,
    pub mic_closed_timeout: Duration,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            key_id: "left_shift".to_string(),
            short_press_threshold_sec: 0.1,
            long_press_threshold_sec: 0.6,
            event_cooldown_sec: 0.1,
            min_recording_duration_sec: 0.6,
            mic_closed_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PressState {
    Idle,
    PressPending,
    Recording,
}

struct Inner {
    state: PressState,
    pending_session: Option<Session>,
    previous_session: Option<Session>,
    cancelled_this_press: bool,
    pending_recording_cancelled: bool,
    mic_active_without_session: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: PressState::Idle,
            pending_session: None,
            previous_session: None,
            cancelled_this_press: false,
            pending_recording_cancelled: false,
            mic_active_without_session: false,
        }
    }
}

/// Owns one key/chord's PTT state machine. Does not talk to hardware
/// directly — the platform key-tap monitor (external collaborator) feeds
/// [`KeyEvent`]s into [`InputTranslator::on_key_event`].
pub struct InputTranslator {
    bus: Arc<EventBus>,
    config: TranslatorConfig,
    inner: Mutex<Inner>,
    playback_active: Arc<std::sync::atomic::AtomicBool>,
}

impl InputTranslator {
    pub fn new(bus: Arc<EventBus>, config: TranslatorConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            inner: Mutex::new(Inner::default()),
            playback_active: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    /// Lets downstream playback state feed back into barge-in detection.
    pub fn set_playback_active(&self, active: bool) {
        self.playback_active.store(active, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn on_key_event(self: &Arc<Self>, event: KeyEvent) {
        if event.key_id != self.config.key_id {
            return;
        }
        match event.kind {
            KeyEventKind::Press => self.on_press().await,
            KeyEventKind::LongPress => self.on_long_press(event).await,
            KeyEventKind::ShortPress => self.on_short_press().await,
            KeyEventKind::Release => self.on_release(event).await,
        }
    }

    async fn on_press(self: &Arc<Self>) {
        self.bus.publish("keyboard.press", json!({})).await;

        let pending = Session::new();
        let mut inner = self.inner.lock().await;
        inner.pending_recording_cancelled = false;
        inner.cancelled_this_press = false;
        inner.pending_session = Some(pending);
        inner.state = PressState::PressPending;
        drop(inner);

        if self.playback_active.load(std::sync::atomic::Ordering::SeqCst) {
            let prior = {
                let inner = self.inner.lock().await;
                inner.previous_session
            };
            info!("playback active on PRESS, barging in eagerly");
            self.bus
                .publish(
                    "interrupt.request",
                    json!({
                        "type": "speech_stop",
                        "session": prior.map(|s| s.to_string()),
                        "event_id": Uuid::new_v4().to_string(),
                        "source": "translator.press_barge_in",
                        "priority": "high",
                    }),
                )
                .await;
        }
    }

    async fn on_long_press(self: &Arc<Self>, event: KeyEvent) {
        let mut inner = self.inner.lock().await;
        if inner.pending_recording_cancelled {
            debug!("LONG_PRESS after early RELEASE, dropped");
            return;
        }
        if inner.state == PressState::Recording {
            debug!("LONG_PRESS while already recording, dropped (dedup)");
            return;
        }
        let Some(session) = inner.pending_session else {
            warn!("LONG_PRESS with no pending session, dropped");
            return;
        };
        inner.state = PressState::Recording;
        drop(inner);

        self.bus
            .publish(
                "voice.recording_start",
                json!({ "session": session.to_string(), "source": "keyboard", "timestamp": event.timestamp }),
            )
            .await;

        self.bus
            .publish(
                "mode.request",
                json!({
                    "target": "listening",
                    "source": "translator.long_press",
                    "session": session.to_string(),
                }),
            )
            .await;
    }

    async fn on_short_press(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.state == PressState::Recording {
            // Quartz chord path: a SHORT_PRESS while recording behaves like
            // RELEASE for chord-style keys whose key-up is unreliable.
            let session = inner.pending_session;
            inner.state = PressState::Idle;
            inner.previous_session = session;
            drop(inner);
            if let Some(session) = session {
                self.finish_recording(session, None).await;
            }
            return;
        }

        inner.cancelled_this_press = true;
        let cancel_target = inner.previous_session;
        inner.state = PressState::Idle;
        inner.previous_session = None;
        drop(inner);

        self.cancel_current(cancel_target).await;
    }

    async fn on_release(self: &Arc<Self>, event: KeyEvent) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            PressState::Recording => {
                let session = inner.pending_session;
                let duration = event.duration.unwrap_or(0.0);
                inner.state = PressState::Idle;
                inner.previous_session = session;
                drop(inner);
                if let Some(session) = session {
                    if duration >= self.config.min_recording_duration_sec {
                        self.finish_recording(session, Some(duration)).await;
                    } else {
                        debug!(duration, "recording discarded, below minimum duration");
                    }
                }
            }
            PressState::PressPending => {
                if inner.cancelled_this_press {
                    inner.state = PressState::Idle;
                    return;
                }
                // RELEASE before LONG_PRESS landed: mark so the late
                // LONG_PRESS (hardware race) will not open the mic.
                inner.pending_recording_cancelled = true;
                let mic_active = inner.mic_active_without_session;
                inner.state = PressState::Idle;
                drop(inner);

                if mic_active {
                    warn!("mic active with no bound session at RELEASE, forcing close");
                    self.bus
                        .publish("voice.recording_stop", json!({ "session": Value::Null, "source": "force_close" }))
                        .await;
                    self.bus.publish("voice.mic_closed", json!({ "session": Value::Null })).await;
                }
            }
            PressState::Idle => {}
        }
    }

    async fn finish_recording(self: &Arc<Self>, session: Session, duration: Option<f64>) {
        self.bus
            .publish(
                "voice.recording_stop",
                json!({ "session": session.to_string(), "source": "keyboard", "duration": duration }),
            )
            .await;

        let mut closed = false;
        let mut subscribe_once = MicClosedWaiter::new(self.bus.clone(), session);
        if timeout(self.config.mic_closed_timeout, subscribe_once.wait()).await.is_ok() {
            closed = true;
        }
        if !closed {
            warn!(%session, "voice.mic_closed timed out, forcing PROCESSING anyway");
        }

        self.bus
            .publish(
                "mode.request",
                json!({
                    "target": "processing",
                    "source": "translator.recording_stop",
                    "session": session.to_string(),
                }),
            )
            .await;
    }

    async fn cancel_current(self: &Arc<Self>, cancel_target: Option<Session>) {
        let event_id = Uuid::new_v4().to_string();
        self.bus
            .publish(
                "interrupt.request",
                json!({
                    "type": "speech_stop",
                    "session": cancel_target.map(|s| s.to_string()),
                    "event_id": event_id,
                    "source": "translator.short_press_cancel",
                }),
            )
            .await;
        self.bus
            .publish("grpc.request_cancel", json!({ "session": cancel_target.map(|s| s.to_string()) }))
            .await;
        self.bus
            .publish(
                "mode.request",
                json!({ "target": "sleeping", "source": "keyboard.short_press" }),
            )
            .await;
    }
}

/// Waits for one `voice.mic_closed` matching `session`, bounded by the
/// caller's timeout. A small ad hoc one-shot subscriber rather than pulling
/// in a broadcast channel for a single wait.
struct MicClosedWaiter {
    bus: Arc<EventBus>,
    session: Session,
}

impl MicClosedWaiter {
    fn new(bus: Arc<EventBus>, session: Session) -> Self {
        Self { bus, session }
    }

    async fn wait(&mut self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let target = self.session;
        let handler: Arc<dyn crate::event_bus::Handler> = Arc::new(move |event: crate::event_bus::Event| {
            let tx = tx.clone();
            async move {
                let matches = event
                    .data
                    .get("session")
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .map(|u| Session(u) == target)
                    .unwrap_or(false);
                if matches {
                    if let Some(tx) = tx.lock().await.take() {
                        let _ = tx.send(());
                    }
                }
            }
        });
        self.bus
            .subscribe("voice.mic_closed", handler.clone(), crate::event_bus::Priority::High)
            .await;
        let _ = rx.await;
        self.bus.unsubscribe("voice.mic_closed", &handler).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(kind: KeyEventKind, duration: Option<f64>) -> KeyEvent {
        KeyEvent { kind, key_id: "left_shift".to_string(), timestamp: 0.0, duration }
    }

    #[tokio::test]
    async fn short_tap_without_long_press_emits_no_recording_start() {
        let bus = Arc::new(EventBus::new());
        let translator = InputTranslator::new(bus.clone(), TranslatorConfig::default());
        translator.on_key_event(key(KeyEventKind::Press, None)).await;
        translator.on_key_event(key(KeyEventKind::Release, Some(0.2))).await;
        assert!(bus.history(Some("voice.recording_start"), 10).await.is_empty());
    }

    #[tokio::test]
    async fn long_press_then_release_emits_recording_lifecycle() {
        let bus = Arc::new(EventBus::new());
        let translator = InputTranslator::new(bus.clone(), TranslatorConfig::default());
        translator.on_key_event(key(KeyEventKind::Press, None)).await;
        translator.on_key_event(key(KeyEventKind::LongPress, Some(0.6))).await;
        assert_eq!(bus.history(Some("voice.recording_start"), 10).await.len(), 1);

        // Unblock finish_recording's mic_closed wait immediately.
        let session = {
            let hist = bus.history(Some("voice.recording_start"), 10).await;
            hist[0].data.get("session").unwrap().as_str().unwrap().to_string()
        };
        bus.publish("voice.mic_closed", json!({ "session": session })).await;

        translator.on_key_event(key(KeyEventKind::Release, Some(1.2))).await;
        assert_eq!(bus.history(Some("voice.recording_stop"), 10).await.len(), 1);
    }

    #[tokio::test]
    async fn late_long_press_after_release_is_dropped() {
        let bus = Arc::new(EventBus::new());
        let translator = InputTranslator::new(bus.clone(), TranslatorConfig::default());
        translator.on_key_event(key(KeyEventKind::Press, None)).await;
        translator.on_key_event(key(KeyEventKind::Release, Some(0.2))).await;
        translator.on_key_event(key(KeyEventKind::LongPress, Some(0.6))).await;
        assert!(bus.history(Some("voice.recording_start"), 10).await.is_empty());
    }
}

//! Voice Recognition Coordinator: owns the microphone lifetime for each
//! session and streams recognition results back onto the bus.
//!
//! The mic opens on `recording_start` but the STT call itself is deferred
//! until `recording_stop` closes it — the session's sample buffer only
//! fills over the life of the PTT hold, so recognizing at `recording_start`
//! would run on an empty buffer.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event_bus::{Event, EventBus, Handler, Priority};
use crate::state_store::StateStore;
use crate::types::Session;

/// Decision returned by the external audio-route reconciler before the mic
/// is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Proceed,
    Retry,
    Abort,
}

/// External collaborator deciding whether the input route is safe to open.
/// Implemented by `ptt-daemon` against the real platform audio stack.
pub trait RouteReconciler: Send + Sync {
    fn reconcile(&self) -> Pin<Box<dyn Future<Output = RouteDecision> + Send>>;
}

/// External collaborator performing STT. Implemented by `ptt-daemon`.
pub trait SttAdapter: Send + Sync {
    fn recognize(&self, session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<(String, f32)>> + Send>>;
    fn cancel(&self, session: Session);
}

/// External collaborator owning the physical input device.
pub trait MicSource: Send + Sync {
    fn open(&self, session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
    fn close(&self, session: Session) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

struct InFlight {
    session: Session,
    /// The recognize-and-publish task. `None` while the mic is still open
    /// and recording — the task is only spawned once `recording_stop`
    /// closes the mic and the full utterance is sitting in the session's
    /// buffer; a cancel that lands before that has nothing to abort yet.
    handle: Option<JoinHandle<()>>,
}

pub struct VoiceRecognitionCoordinator {
    bus: Arc<EventBus>,
    store: Arc<StateStore>,
    mic: Arc<dyn MicSource>,
    stt: Arc<dyn SttAdapter>,
    route: Arc<dyn RouteReconciler>,
    in_flight: Mutex<Option<InFlight>>,
    ptt_held: Arc<std::sync::atomic::AtomicBool>,
}

impl VoiceRecognitionCoordinator {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<StateStore>,
        mic: Arc<dyn MicSource>,
        stt: Arc<dyn SttAdapter>,
        route: Arc<dyn RouteReconciler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            store,
            mic,
            stt,
            route,
            in_flight: Mutex::new(None),
            ptt_held: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let start_handler: Arc<dyn Handler> = Arc::new(RecordingStartHandler(self.clone()));
        self.bus.subscribe("voice.recording_start", start_handler, Priority::High).await;
        let stop_handler: Arc<dyn Handler> = Arc::new(RecordingStopHandler(self.clone()));
        self.bus.subscribe("voice.recording_stop", stop_handler, Priority::High).await;
        let cancel_handler: Arc<dyn Handler> = Arc::new(ShortPressHandler(self.clone()));
        self.bus.subscribe("keyboard.short_press", cancel_handler, Priority::High).await;
    }

    pub fn set_ptt_held(&self, held: bool) {
        self.ptt_held.store(held, std::sync::atomic::Ordering::SeqCst);
    }

    async fn handle_recording_start(self: &Arc<Self>, event: Event) {
        let Some(session) = session_of(&event) else {
            warn!("voice.recording_start without a session, ignored");
            return;
        };

        if self.store.get_bool("first_run_in_progress", false).await {
            debug!("recording_start gated, first run in progress");
            return;
        }

        self.cancel_in_flight().await;

        match self.route.reconcile().await {
            RouteDecision::Abort => {
                self.bus.publish("voice.mic_closed", json!({ "session": session.to_string() })).await;
                self.bus
                    .publish(
                        "voice.recognition_failed",
                        json!({ "session": session.to_string(), "reason": "route_reconcile_abort" }),
                    )
                    .await;
                self.store.update_session_id(None).await;
                return;
            }
            RouteDecision::Retry => {
                if self.route.reconcile().await != RouteDecision::Proceed {
                    self.bus.publish("voice.mic_closed", json!({ "session": session.to_string() })).await;
                    self.bus
                        .publish(
                            "voice.recognition_failed",
                            json!({ "session": session.to_string(), "reason": "route_reconcile_retry_exhausted" }),
                        )
                        .await;
                    self.store.update_session_id(None).await;
                    return;
                }
            }
            RouteDecision::Proceed => {}
        }

        if let Err(err) = self.mic.open(session).await {
            self.bus
                .publish(
                    "voice.recognition_failed",
                    json!({ "session": session.to_string(), "reason": format!("mic_open_failed: {err}") }),
                )
                .await;
            return;
        }
        self.bus.publish("voice.mic_opened", json!({ "session": session.to_string() })).await;

        // The recognize call itself waits until `recording_stop` closes the
        // mic — the session's sample buffer is empty right now and only
        // fills over the life of the hold. Track the session so stop/cancel
        // know which recording is active.
        *self.in_flight.lock().await = Some(InFlight { session, handle: None });
    }

    async fn handle_recording_stop(self: &Arc<Self>, event: Event) {
        let session = session_of(&event);
        if let Some(session) = session {
            self.mic.close(session).await;
        }
        self.bus.publish("voice.mic_closed", json!({ "session": session.map(|s| s.to_string()) })).await;

        let Some(session) = session else { return };
        let is_active_recording = {
            let in_flight = self.in_flight.lock().await;
            in_flight.as_ref().map(|f| f.session) == Some(session)
        };
        if !is_active_recording {
            // Already cancelled (e.g. a short-press cancel landed first).
            return;
        }

        let bus = self.bus.clone();
        let stt = self.stt.clone();
        let ptt_held = self.ptt_held.clone();
        let handle = tokio::spawn(async move {
            match stt.recognize(session).await {
                Ok((text, confidence)) => {
                    let publish = async {
                        bus.publish(
                            "voice.recognition_completed",
                            json!({ "session": session.to_string(), "text": text, "confidence": confidence }),
                        )
                        .await;
                    };
                    if ptt_held.load(std::sync::atomic::Ordering::SeqCst) {
                        // Edge case: engine finished while PTT still held.
                        // Defer until RELEASE triggers recording_stop, which
                        // will have already cleared in_flight by then — the
                        // publish is safe to fire once key-up happens, and
                        // since we're on a detached task we simply wait.
                        while ptt_held.load(std::sync::atomic::Ordering::SeqCst) {
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        }
                    }
                    publish.await;
                }
                Err(err) => {
                    bus.publish(
                        "voice.recognition_failed",
                        json!({ "session": session.to_string(), "reason": err.to_string() }),
                    )
                    .await;
                }
            }
        });
        if let Some(in_flight) = self.in_flight.lock().await.as_mut() {
            if in_flight.session == session {
                in_flight.handle = Some(handle);
            }
        }
    }

    async fn handle_short_press_cancel(self: &Arc<Self>) {
        self.cancel_in_flight().await;
    }

    async fn cancel_in_flight(&self) {
        if let Some(in_flight) = self.in_flight.lock().await.take() {
            self.stt.cancel(in_flight.session);
            if let Some(handle) = in_flight.handle {
                handle.abort();
            }
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

struct RecordingStartHandler(Arc<VoiceRecognitionCoordinator>);
impl Handler for RecordingStartHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let c = self.0.clone();
        Box::pin(async move { c.handle_recording_start(event).await })
    }
}

struct RecordingStopHandler(Arc<VoiceRecognitionCoordinator>);
impl Handler for RecordingStopHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let c = self.0.clone();
        Box::pin(async move { c.handle_recording_stop(event).await })
    }
}

struct ShortPressHandler(Arc<VoiceRecognitionCoordinator>);
impl Handler for ShortPressHandler {
    fn handle(&self, _event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let c = self.0.clone();
        Box::pin(async move { c.handle_short_press_cancel().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysProceed;
    impl RouteReconciler for AlwaysProceed {
        fn reconcile(&self) -> Pin<Box<dyn Future<Output = RouteDecision> + Send>> {
            Box::pin(async { RouteDecision::Proceed })
        }
    }

    struct AlwaysAbort;
    impl RouteReconciler for AlwaysAbort {
        fn reconcile(&self) -> Pin<Box<dyn Future<Output = RouteDecision> + Send>> {
            Box::pin(async { RouteDecision::Abort })
        }
    }

    struct FakeMic;
    impl MicSource for FakeMic {
        fn open(&self, _session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
            Box::pin(async { Ok(()) })
        }
        fn close(&self, _session: Session) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async {})
        }
    }

    struct FakeStt;
    impl SttAdapter for FakeStt {
        fn recognize(&self, _session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<(String, f32)>> + Send>> {
            Box::pin(async { Ok(("hello".to_string(), 0.9)) })
        }
        fn cancel(&self, _session: Session) {}
    }

    fn setup(route: Arc<dyn RouteReconciler>) -> (Arc<EventBus>, Arc<VoiceRecognitionCoordinator>) {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(StateStore::new(bus.clone()));
        let coordinator = VoiceRecognitionCoordinator::new(bus.clone(), store, Arc::new(FakeMic), Arc::new(FakeStt), route);
        (bus, coordinator)
    }

    /// A mic/STT pair sharing one buffer map, the way `CpalMicSource` and
    /// `CloudSttAdapter` share `MicBuffers` in `ptt-daemon`: `open` seeds an
    /// empty buffer for the session, samples accumulate into it (here, via
    /// the test driving `push_samples` directly rather than a real audio
    /// callback), and `recognize` reads whatever is in the buffer at the
    /// moment it's called.
    #[derive(Default)]
    struct SharedBuffers(std::sync::Mutex<std::collections::HashMap<Session, Vec<f32>>>);

    impl SharedBuffers {
        fn push_samples(&self, session: Session, samples: &[f32]) {
            self.0.lock().unwrap().entry(session).or_default().extend_from_slice(samples);
        }
    }

    struct BufferingMic(Arc<SharedBuffers>);
    impl MicSource for BufferingMic {
        fn open(&self, session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
            self.0 .0.lock().unwrap().insert(session, Vec::new());
            Box::pin(async { Ok(()) })
        }
        fn close(&self, _session: Session) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async {})
        }
    }

    /// Reports the sample count it observed at the moment `recognize` is
    /// called, the way `CloudSttAdapter::recognize` snapshots the buffer
    /// synchronously before its async upload body runs.
    struct BufferSnapshotStt(Arc<SharedBuffers>);
    impl SttAdapter for BufferSnapshotStt {
        fn recognize(&self, session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<(String, f32)>> + Send>> {
            let observed_len = self.0 .0.lock().unwrap().get(&session).map(Vec::len).unwrap_or(0);
            Box::pin(async move { Ok((format!("samples={observed_len}"), 1.0)) })
        }
        fn cancel(&self, _session: Session) {}
    }

    /// Guards against the recognize-at-recording-start regression: the STT
    /// call must observe the samples the mic accumulated over the life of
    /// the hold, not an empty buffer captured the instant the mic opened.
    #[tokio::test]
    async fn recognize_observes_samples_accumulated_between_start_and_stop() {
        let buffers = Arc::new(SharedBuffers::default());
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(StateStore::new(bus.clone()));
        let coordinator = VoiceRecognitionCoordinator::new(
            bus.clone(),
            store,
            Arc::new(BufferingMic(buffers.clone())),
            Arc::new(BufferSnapshotStt(buffers.clone())),
            Arc::new(AlwaysProceed),
        );
        coordinator.start().await;

        let session = Session::new();
        bus.publish("voice.recording_start", json!({ "session": session.to_string() })).await;

        // The "utterance": samples arriving while the key is held, well
        // after recording_start but before recording_stop.
        buffers.push_samples(session, &[0.1, 0.2, 0.3, 0.4]);

        bus.publish("voice.recording_stop", json!({ "session": session.to_string() })).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let completed = bus.history(Some("voice.recognition_completed"), 10).await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].data["text"], "samples=4");
    }

    #[tokio::test]
    async fn recording_start_opens_mic_and_emits_mic_opened() {
        let (bus, coordinator) = setup(Arc::new(AlwaysProceed));
        coordinator.start().await;
        let session = Session::new();
        bus.publish("voice.recording_start", json!({ "session": session.to_string() })).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(bus.history(Some("voice.mic_opened"), 10).await.len(), 1);
    }

    #[tokio::test]
    async fn route_reconcile_abort_fails_without_opening_mic() {
        let (bus, coordinator) = setup(Arc::new(AlwaysAbort));
        coordinator.start().await;
        let session = Session::new();
        bus.publish("voice.recording_start", json!({ "session": session.to_string() })).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(bus.history(Some("voice.mic_opened"), 10).await.is_empty());
        let failed = bus.history(Some("voice.recognition_failed"), 10).await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].data["reason"], "route_reconcile_abort");
    }
}

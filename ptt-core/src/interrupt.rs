//! Interrupt Coordinator: fans cancellation intents out to the components
//! that own cancellable resources, with dedup and bounded concurrency.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use crate::event_bus::{Event, EventBus, Handler, Priority};
use crate::types::{InterruptKind, Session};

const EVENT_ID_TTL: Duration = Duration::from_secs(5);
const SPEECH_STOP_WINDOW: Duration = Duration::from_millis(500);
const MAX_CONCURRENT_INTERRUPTS: usize = 5;
const INTERRUPT_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct InboundInterrupt {
    kind: InterruptKind,
    session: Option<Session>,
    event_id: String,
    press_id: Option<String>,
    source: String,
}

impl InboundInterrupt {
    fn from_event(event: &Event) -> Option<Self> {
        let data = &event.data;
        let kind = match data.get("type")?.as_str()? {
            "speech_stop" => InterruptKind::SpeechStop,
            "speech_pause" => InterruptKind::SpeechPause,
            "recording_stop" => InterruptKind::RecordingStop,
            "session_clear" => InterruptKind::SessionClear,
            "full_reset" => InterruptKind::FullReset,
            _ => return None,
        };
        Some(Self {
            kind,
            session: data
                .get("session")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(Session),
            event_id: data
                .get("event_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            press_id: data.get("press_id").and_then(Value::as_str).map(str::to_string),
            source: data.get("source").and_then(Value::as_str).unwrap_or("unknown").to_string(),
        })
    }
}

struct Dedup {
    by_event_id: HashMap<String, Instant>,
    speech_stop_by_key: HashMap<(String, String), Instant>,
}

impl Dedup {
    fn new() -> Self {
        Self { by_event_id: HashMap::new(), speech_stop_by_key: HashMap::new() }
    }

    fn prune(&mut self, now: Instant) {
        self.by_event_id.retain(|_, ts| now.duration_since(*ts) < EVENT_ID_TTL);
        self.speech_stop_by_key.retain(|_, ts| now.duration_since(*ts) < SPEECH_STOP_WINDOW * 4);
    }
}

/// External collaborators this coordinator fans cancellation out to. One
/// method per interrupt kind; `ptt-daemon` wires these to Speech Playback,
/// Voice Recognition, and the State Store.
pub trait InterruptHandlers: Send + Sync {
    fn speech_stop(&self, session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
    fn speech_pause(&self, session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
    fn recording_stop(&self, session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
    fn session_clear(&self, session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
    fn full_reset(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
}

pub struct InterruptCoordinator {
    bus: Arc<EventBus>,
    handlers: Arc<dyn InterruptHandlers>,
    dedup: Mutex<Dedup>,
    concurrency: Arc<Semaphore>,
}

impl InterruptCoordinator {
    pub fn new(bus: Arc<EventBus>, handlers: Arc<dyn InterruptHandlers>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            handlers,
            dedup: Mutex::new(Dedup::new()),
            concurrency: Arc::new(Semaphore::new(MAX_CONCURRENT_INTERRUPTS)),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let handler: Arc<dyn Handler> = Arc::new(RequestHandler(self.clone()));
        self.bus.subscribe("interrupt.request", handler, Priority::High).await;
        let cancel_handler: Arc<dyn Handler> = Arc::new(CancelHandler(self.clone()));
        self.bus.subscribe("interrupt.cancel", cancel_handler, Priority::High).await;
    }

    async fn handle_request(self: &Arc<Self>, event: Event) {
        let Some(req) = InboundInterrupt::from_event(&event) else {
            warn!("interrupt.request: unknown or malformed type, ignored");
            return;
        };

        if req.kind == InterruptKind::SpeechStop && req.session.is_none() {
            warn!("interrupt.request(speech_stop) without a session, rejected");
            return;
        }

        if self.is_duplicate(&req).await {
            return;
        }

        self.bus
            .publish(
                "grpc.request_cancel",
                json!({
                    "session": req.session.map(|s| s.to_string()),
                    "press_id": req.press_id,
                    "event_id": req.event_id,
                    "source": req.source,
                    "reason": "interrupt",
                    "initiator": req.kind.to_string(),
                }),
            )
            .await;

        self.dispatch(req).await;
    }

    async fn handle_cancel(self: &Arc<Self>, _event: Event) {
        // `interrupt.cancel` withdraws a previously-requested interrupt
        // before it's dispatched; since dispatch runs inline here there is
        // nothing in flight to withdraw beyond the dedup bookkeeping.
    }

    async fn is_duplicate(&self, req: &InboundInterrupt) -> bool {
        let now = Instant::now();
        let mut dedup = self.dedup.lock().await;
        dedup.prune(now);

        if let Some(last) = dedup.by_event_id.get(&req.event_id) {
            if now.duration_since(*last) < EVENT_ID_TTL {
                return true;
            }
        }
        dedup.by_event_id.insert(req.event_id.clone(), now);

        if req.kind == InterruptKind::SpeechStop {
            let key = (req.session.map(|s| s.to_string()).unwrap_or_default(), req.press_id.clone().unwrap_or_default());
            if let Some(last) = dedup.speech_stop_by_key.get(&key) {
                if now.duration_since(*last) < SPEECH_STOP_WINDOW {
                    return true;
                }
            }
            dedup.speech_stop_by_key.insert(key, now);
        }
        false
    }

    async fn dispatch(self: &Arc<Self>, req: InboundInterrupt) {
        let Ok(permit) = self.concurrency.clone().acquire_owned().await else {
            return;
        };
        let handlers = self.handlers.clone();
        let bus = self.bus.clone();
        let kind = req.kind;
        let session = req.session;
        let source = req.source.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let mut attempt = 0;
            let result = loop {
                attempt += 1;
                let outcome = tokio::time::timeout(INTERRUPT_TIMEOUT, run_handler(&*handlers, kind, session)).await;
                match outcome {
                    Ok(Ok(())) => break Ok(()),
                    Ok(Err(err)) if attempt < RETRY_ATTEMPTS => {
                        warn!(?kind, attempt, %err, "interrupt handler failed, retrying");
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                    Ok(Err(err)) => break Err(err.to_string()),
                    Err(_) => break Err("interrupt handler timed out".to_string()),
                }
            };

            match &result {
                Ok(()) => info!(?kind, ?session, "interrupt completed"),
                Err(err) => warn!(?kind, ?session, %err, "interrupt failed after retries"),
            }

            if !matches!(kind, InterruptKind::SpeechStop) {
                if let Some(session) = session {
                    bus.publish(
                        "mode.request",
                        json!({ "target": "sleeping", "source": "interrupt", "session": session.to_string() }),
                    )
                    .await;
                }
            }

            bus.publish(
                "interrupt.result",
                json!({
                    "kind": kind.to_string(),
                    "session": session.map(|s| s.to_string()),
                    "source": source,
                    "status": if result.is_ok() { "completed" } else { "failed" },
                    "error": result.err(),
                }),
            )
            .await;
        });
    }
}

async fn run_handler(handlers: &dyn InterruptHandlers, kind: InterruptKind, session: Option<Session>) -> anyhow::Result<()> {
    match kind {
        InterruptKind::SpeechStop => {
            let session = session.ok_or_else(|| anyhow::anyhow!("speech_stop without session"))?;
            handlers.speech_stop(session).await
        }
        InterruptKind::SpeechPause => {
            let session = session.ok_or_else(|| anyhow::anyhow!("speech_pause without session"))?;
            handlers.speech_pause(session).await
        }
        InterruptKind::RecordingStop => {
            let session = session.ok_or_else(|| anyhow::anyhow!("recording_stop without session"))?;
            handlers.recording_stop(session).await
        }
        InterruptKind::SessionClear => {
            let session = session.ok_or_else(|| anyhow::anyhow!("session_clear without session"))?;
            handlers.session_clear(session).await
        }
        InterruptKind::FullReset => handlers.full_reset().await,
    }
}

struct RequestHandler(Arc<InterruptCoordinator>);
impl Handler for RequestHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let c = self.0.clone();
        Box::pin(async move { c.handle_request(event).await })
    }
}

struct CancelHandler(Arc<InterruptCoordinator>);
impl Handler for CancelHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let c = self.0.clone();
        Box::pin(async move { c.handle_cancel(event).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandlers {
        speech_stop_calls: Arc<AtomicUsize>,
    }

    impl InterruptHandlers for CountingHandlers {
        fn speech_stop(&self, _session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
            self.speech_stop_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
        fn speech_pause(&self, _session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
            Box::pin(async { Ok(()) })
        }
        fn recording_stop(&self, _session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
            Box::pin(async { Ok(()) })
        }
        fn session_clear(&self, _session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
            Box::pin(async { Ok(()) })
        }
        fn full_reset(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn speech_stop_without_session_is_rejected() {
        let bus = Arc::new(EventBus::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let coordinator = InterruptCoordinator::new(bus.clone(), Arc::new(CountingHandlers { speech_stop_calls: calls.clone() }));
        coordinator.start().await;
        bus.publish("interrupt.request", json!({ "type": "speech_stop", "source": "test" })).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_event_id_dispatches_once() {
        let bus = Arc::new(EventBus::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let coordinator = InterruptCoordinator::new(bus.clone(), Arc::new(CountingHandlers { speech_stop_calls: calls.clone() }));
        coordinator.start().await;
        let session = Session::new();
        let payload = json!({ "type": "speech_stop", "session": session.to_string(), "source": "test", "event_id": "e1" });
        bus.publish("interrupt.request", payload.clone()).await;
        bus.publish("interrupt.request", payload).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

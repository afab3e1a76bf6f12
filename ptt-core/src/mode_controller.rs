//! Sole writer of application mode. Subscribes to `mode.request` at
//! CRITICAL priority and is the only component allowed to call
//! [`StateStore::set_mode`]. Everything else asks; this decides.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event_bus::{Event, EventBus, Handler, Priority};
use crate::state_store::StateStore;
use crate::types::{Mode, Session};

const DEDUP_WINDOW: Duration = Duration::from_millis(500);
const DEDUP_PRUNE_FACTOR: u32 = 4;
const ACTION_INTENT_TTL: Duration = Duration::from_secs(3);

const SOFT_FINALIZER_SOURCES: &[&str] = &[
    "processing_completed",
    "playback",
    "playback.finished",
    "browser.finished",
    "actions.finished",
];

#[derive(Debug, Clone, Default)]
pub struct ModeControllerConfig {
    pub processing_timeout_sec: u64,
    pub listening_timeout_sec: u64,
}

/// Inbound `mode.request` payload.
#[derive(Debug, Clone)]
pub struct ModeRequest {
    pub target: String,
    pub source: String,
    pub session: Option<Session>,
    pub priority: Option<u32>,
    pub request_id: Option<String>,
    pub reason: Option<String>,
}

impl ModeRequest {
    fn from_event(event: &Event) -> Option<Self> {
        let data = &event.data;
        Some(Self {
            target: data.get("target")?.as_str()?.to_string(),
            source: data.get("source").and_then(Value::as_str).unwrap_or("unknown").to_string(),
            session: data
                .get("session")
                .and_then(Value::as_str)
                .and_then(|s| uuid::Uuid::parse_str(s).ok())
                .map(Session),
            priority: data.get("priority").and_then(Value::as_u64).map(|p| p as u32),
            request_id: data.get("request_id").and_then(Value::as_str).map(str::to_string),
            reason: data.get("reason").and_then(Value::as_str).map(str::to_string),
        })
    }
}

#[derive(Default)]
struct LifecycleState {
    active_playback_sessions: HashMap<Session, u32>,
    active_browser_sessions: HashMap<Session, u32>,
    active_action_sessions: HashMap<Session, u32>,
    pending_action_intents: HashMap<Session, Instant>,
    deferred_sleep_sessions: HashSet<Session>,
}

impl LifecycleState {
    fn incr(map: &mut HashMap<Session, u32>, session: Session) {
        *map.entry(session).or_insert(0) += 1;
    }

    fn decr(map: &mut HashMap<Session, u32>, session: Session) {
        if let Some(count) = map.get_mut(&session) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(&session);
            }
        }
    }

    fn has_pending_action_intent(&self, session: Session, now: Instant) -> bool {
        self.pending_action_intents
            .get(&session)
            .is_some_and(|ts| now.duration_since(*ts) < ACTION_INTENT_TTL)
    }

    /// Blockers for `session`, plus the global fallback guard: any unrelated
    /// session still holding playback/browser/action work counts too, to
    /// protect against session-id drift between components.
    fn blockers_for(&self, session: Session) -> bool {
        let now = Instant::now();
        let own = self.active_playback_sessions.contains_key(&session)
            || self.active_browser_sessions.contains_key(&session)
            || self.active_action_sessions.contains_key(&session)
            || self.has_pending_action_intent(session, now);
        let other = self.active_playback_sessions.keys().any(|s| *s != session)
            || self.active_browser_sessions.keys().any(|s| *s != session)
            || self.active_action_sessions.keys().any(|s| *s != session);
        own || other
    }

    fn is_quiescent(&self, session: Session) -> bool {
        !self.blockers_for(session)
    }
}

#[derive(Default)]
struct DedupState {
    by_request_id: HashMap<String, Instant>,
    by_key: HashMap<(String, String, String), Instant>,
}

impl DedupState {
    fn prune(&mut self, now: Instant) {
        let cutoff = DEDUP_WINDOW * DEDUP_PRUNE_FACTOR;
        self.by_request_id.retain(|_, ts| now.duration_since(*ts) < cutoff);
        self.by_key.retain(|_, ts| now.duration_since(*ts) < cutoff);
    }
}

pub struct ModeController {
    bus: Arc<EventBus>,
    store: Arc<StateStore>,
    config: ModeControllerConfig,
    dedup: Mutex<DedupState>,
    lifecycle: Mutex<LifecycleState>,
    timeout_guard: Mutex<Option<JoinHandle<()>>>,
}

impl ModeController {
    pub fn new(bus: Arc<EventBus>, store: Arc<StateStore>, config: ModeControllerConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            store,
            config,
            dedup: Mutex::new(DedupState::default()),
            lifecycle: Mutex::new(LifecycleState::default()),
            timeout_guard: Mutex::new(None),
        })
    }

    /// Subscribes this controller to `mode.request` and the lifecycle events
    /// it tracks for the sleep-deferral guard.
    pub async fn start(self: &Arc<Self>) {
        let handler: Arc<dyn Handler> = Arc::new(ModeRequestHandler(self.clone()));
        self.bus.subscribe("mode.request", handler, Priority::Critical).await;

        for event_type in [
            "playback.started",
            "playback.completed",
            "playback.failed",
            "playback.cancelled",
            "browser.started",
            "browser.completed",
            "browser.failed",
            "browser.cancelled",
            "actions.lifecycle.started",
            "actions.lifecycle.finished",
            "grpc.response.action",
        ] {
            let handler: Arc<dyn Handler> = Arc::new(LifecycleHandler(self.clone(), event_type));
            self.bus.subscribe(event_type, handler, Priority::High).await;
        }
    }

    async fn is_dedup(&self, req: &ModeRequest) -> bool {
        let now = Instant::now();
        let mut dedup = self.dedup.lock().await;
        dedup.prune(now);

        if let Some(request_id) = &req.request_id {
            if let Some(last) = dedup.by_request_id.get(request_id) {
                if now.duration_since(*last) < DEDUP_WINDOW {
                    return true;
                }
            }
            dedup.by_request_id.insert(request_id.clone(), now);
            return false;
        }

        let key = (
            req.target.clone(),
            req.session.map(|s| s.to_string()).unwrap_or_else(|| "__none__".to_string()),
            req.source.clone(),
        );
        if let Some(last) = dedup.by_key.get(&key) {
            if now.duration_since(*last) < DEDUP_WINDOW {
                return true;
            }
        }
        dedup.by_key.insert(key, now);
        false
    }

    fn is_dedup_bypass(&self, req: &ModeRequest, deferred: &HashSet<Session>) -> bool {
        SOFT_FINALIZER_SOURCES.contains(&req.source.as_str())
            && req.session.is_some_and(|s| deferred.contains(&s))
    }

    fn is_interrupt_override(req: &ModeRequest) -> bool {
        req.source == "interrupt" || req.priority.is_some_and(|p| p >= 90)
    }

    pub async fn handle(&self, req: ModeRequest) {
        let Some(target) = parse_mode(&req.target) else {
            warn!(target = %req.target, "mode.request: unknown target, rejected");
            return;
        };

        if target == Mode::Processing && req.session.is_none() {
            warn!("mode.request(PROCESSING) without a session, rejected");
            return;
        }

        let bypass = Self::is_interrupt_override(&req);
        if !bypass {
            let deferred = { self.lifecycle.lock().await.deferred_sleep_sessions.clone() };
            let dedup_bypass = self.is_dedup_bypass(&req, &deferred);
            if !dedup_bypass && self.is_dedup(&req).await {
                debug!(target = %req.target, source = %req.source, "mode.request dropped by dedup window");
                return;
            }
        }

        let snapshot = self.store.snapshot().await;
        if !bypass && snapshot.mode == Mode::Processing && target == Mode::Processing {
            let same_session = req.session == snapshot.current_session;
            if same_session {
                debug!("mode.request(PROCESSING) duplicate for current session, rejected");
                return;
            }
            // Different session: accepted as a session switch.
        }

        if target == Mode::Sleeping && SOFT_FINALIZER_SOURCES.contains(&req.source.as_str()) && !bypass {
            if self.defer_if_blocked(req.session).await {
                return;
            }
        }

        self.apply(target, req.session).await;
    }

    /// Returns true if the SLEEPING transition was deferred rather than
    /// applied.
    async fn defer_if_blocked(&self, session: Option<Session>) -> bool {
        let Some(session) = session else { return false };
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.blockers_for(session) {
            lifecycle.deferred_sleep_sessions.insert(session);
            debug!(%session, "SLEEPING deferred, session still has active owners");
            true
        } else {
            lifecycle.deferred_sleep_sessions.remove(&session);
            false
        }
    }

    async fn apply(&self, target: Mode, session: Option<Session>) {
        let snapshot = self.store.snapshot().await;
        if !snapshot.mode.can_transition_to(target) && snapshot.mode != target {
            warn!(from = %snapshot.mode, to = %target, "illegal mode transition rejected");
            return;
        }
        self.store.set_mode(target, session).await;
        self.rearm_timeout_guard(target, session).await;
    }

    async fn rearm_timeout_guard(&self, mode: Mode, session: Option<Session>) {
        let mut guard = self.timeout_guard.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        let timeout_sec = match mode {
            Mode::Processing => self.config.processing_timeout_sec,
            Mode::Listening => self.config.listening_timeout_sec,
            Mode::Sleeping => 0,
        };
        if timeout_sec == 0 {
            return;
        }
        let bus = self.bus.clone();
        let duration = Duration::from_secs(timeout_sec);
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            warn!(?mode, ?session, "mode timeout guard fired, forcing SLEEPING");
            bus.publish(
                "mode.request",
                json!({
                    "target": "sleeping",
                    "source": "mode_timeout_guard",
                    "session": session.map(|s| s.to_string()),
                    "priority": 100,
                }),
            )
            .await;
        }));
    }

    async fn on_lifecycle_event(&self, event_type: &str, event: &Event) {
        let session = event
            .data
            .get("session")
            .and_then(Value::as_str)
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .map(Session);

        let mut lifecycle = self.lifecycle.lock().await;
        match event_type {
            "playback.started" => {
                if let Some(s) = session {
                    LifecycleState::incr(&mut lifecycle.active_playback_sessions, s);
                }
            }
            "playback.completed" | "playback.failed" | "playback.cancelled" => {
                if let Some(s) = session {
                    LifecycleState::decr(&mut lifecycle.active_playback_sessions, s);
                }
            }
            "browser.started" => {
                if let Some(s) = session {
                    LifecycleState::incr(&mut lifecycle.active_browser_sessions, s);
                }
            }
            "browser.completed" | "browser.failed" | "browser.cancelled" => {
                if let Some(s) = session {
                    LifecycleState::decr(&mut lifecycle.active_browser_sessions, s);
                }
            }
            "actions.lifecycle.started" => {
                if let Some(s) = session {
                    LifecycleState::incr(&mut lifecycle.active_action_sessions, s);
                }
            }
            "actions.lifecycle.finished" => {
                if let Some(s) = session {
                    LifecycleState::decr(&mut lifecycle.active_action_sessions, s);
                }
            }
            "grpc.response.action" => {
                if let Some(s) = session {
                    lifecycle.pending_action_intents.insert(s, Instant::now());
                }
            }
            _ => {}
        }

        let newly_quiescent: Vec<Session> = lifecycle
            .deferred_sleep_sessions
            .iter()
            .copied()
            .filter(|s| lifecycle.is_quiescent(*s))
            .collect();
        for s in &newly_quiescent {
            lifecycle.deferred_sleep_sessions.remove(s);
        }
        drop(lifecycle);

        for s in newly_quiescent {
            info!(session = %s, "deferred SLEEPING now quiescent, re-requesting");
            self.bus
                .publish(
                    "mode.request",
                    json!({
                        "target": "sleeping",
                        "source": "deferred_sleep_finished",
                        "session": s.to_string(),
                    }),
                )
                .await;
        }
    }
}

fn parse_mode(target: &str) -> Option<Mode> {
    match target {
        "sleeping" => Some(Mode::Sleeping),
        "listening" => Some(Mode::Listening),
        "processing" => Some(Mode::Processing),
        _ => None,
    }
}

struct ModeRequestHandler(Arc<ModeController>);

impl Handler for ModeRequestHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let controller = self.0.clone();
        Box::pin(async move {
            match ModeRequest::from_event(&event) {
                Some(req) => controller.handle(req).await,
                None => warn!("mode.request: malformed payload, ignored"),
            }
        })
    }
}

struct LifecycleHandler(Arc<ModeController>, &'static str);

impl Handler for LifecycleHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let controller = self.0.clone();
        let event_type = self.1;
        Box::pin(async move {
            controller.on_lifecycle_event(event_type, &event).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_controller() -> (Arc<EventBus>, Arc<StateStore>, Arc<ModeController>) {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(StateStore::new(bus.clone()));
        let ctrl = ModeController::new(bus.clone(), store.clone(), ModeControllerConfig::default());
        (bus, store, ctrl)
    }

    fn req(target: &str, source: &str, session: Option<Session>) -> ModeRequest {
        ModeRequest {
            target: target.to_string(),
            source: source.to_string(),
            session,
            priority: None,
            request_id: None,
            reason: None,
        }
    }

    #[tokio::test]
    async fn processing_without_session_is_rejected() {
        let (_bus, store, ctrl) = new_controller();
        ctrl.handle(req("processing", "voice", None)).await;
        assert_eq!(store.snapshot().await.mode, Mode::Sleeping);
    }

    #[tokio::test]
    async fn happy_path_transitions_apply() {
        let (_bus, store, ctrl) = new_controller();
        let session = Session::new();
        ctrl.handle(req("listening", "keyboard", Some(session))).await;
        assert_eq!(store.snapshot().await.mode, Mode::Listening);
        ctrl.handle(req("processing", "voice", Some(session))).await;
        assert_eq!(store.snapshot().await.mode, Mode::Processing);
    }

    #[tokio::test]
    async fn dedup_window_drops_repeat_request_id() {
        let (_bus, store, ctrl) = new_controller();
        let session = Session::new();
        let mut r1 = req("listening", "keyboard", Some(session));
        r1.request_id = Some("abc".into());
        ctrl.handle(r1.clone()).await;
        assert_eq!(store.snapshot().await.mode, Mode::Listening);
        // A second distinct-mode request with the same request_id, inside
        // the window, must be dropped rather than applied.
        let mut r2 = r1.clone();
        r2.target = "sleeping".to_string();
        ctrl.handle(r2).await;
        assert_eq!(store.snapshot().await.mode, Mode::Listening);
    }

    #[tokio::test]
    async fn sleeping_is_deferred_while_playback_active() {
        let (bus, store, ctrl) = new_controller();
        ctrl.start().await;
        let session = Session::new();
        ctrl.handle(req("processing", "voice", Some(session))).await;
        bus.publish("playback.started", json!({ "session": session.to_string() })).await;
        ctrl.handle(req("sleeping", "playback.finished", Some(session))).await;
        assert_eq!(store.snapshot().await.mode, Mode::Processing);

        bus.publish("playback.completed", json!({ "session": session.to_string() })).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.snapshot().await.mode, Mode::Sleeping);
    }

    #[tokio::test]
    async fn interrupt_source_bypasses_gating() {
        let (_bus, store, ctrl) = new_controller();
        let session = Session::new();
        ctrl.handle(req("processing", "voice", Some(session))).await;
        ctrl.handle(req("listening", "interrupt", Some(session))).await;
        assert_eq!(store.snapshot().await.mode, Mode::Listening);
    }
}

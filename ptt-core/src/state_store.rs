//! Process-wide snapshot of mode, session, and the permission/device/network
//! axes, plus a small flag bag for miscellaneous booleans. Mode and session
//! id are written only through this store (Mode Controller holds the only
//! reference that calls `set_mode`); every other component reads a
//! [`Snapshot`] and decides via the selector functions below — nothing
//! reaches into the store's fields directly.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::event_bus::EventBus;
use crate::types::{DeviceStatus, Mode, NetworkStatus, PermissionStatus, Session, Snapshot};

pub const FLAG_UPDATE_IN_PROGRESS: &str = "update_in_progress";
pub const FLAG_FIRST_RUN_IN_PROGRESS: &str = "first_run_in_progress";
pub const FLAG_USER_QUIT_INTENT: &str = "user_quit_intent";
pub const FLAG_FIRST_RUN_RESTART_SCHEDULED: &str = "first_run_restart_scheduled";

pub struct StateStore {
    inner: RwLock<Snapshot>,
    flags: RwLock<HashMap<String, Value>>,
    bus: Arc<EventBus>,
}

impl StateStore {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: RwLock::new(Snapshot::default()),
            flags: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Atomic capture of every axis. Two calls with no intervening writes
    /// compare equal.
    pub async fn snapshot(&self) -> Snapshot {
        self.inner.read().await.clone()
    }

    /// Sole path for a mode change. On an actual delta, emits
    /// `app.mode_changed {mode, session_id}` and `app.state_changed`. Always
    /// fine to call with the current mode again (no-op, no events).
    pub async fn set_mode(&self, mode: Mode, session: Option<Session>) -> bool {
        let mut changed = false;
        {
            let mut snap = self.inner.write().await;
            if snap.mode != mode {
                snap.mode = mode;
                snap.current_session = session;
                changed = true;
            } else if snap.current_session != session {
                snap.current_session = session;
            }
        }
        if changed {
            debug!(%mode, ?session, "mode changed");
            self.bus
                .publish(
                    "app.mode_changed",
                    json!({ "mode": mode, "session_id": session.map(|s| s.to_string()) }),
                )
                .await;
            self.bus.publish("app.state_changed", json!({})).await;
        }
        changed
    }

    /// Changes the current session without emitting a mode change — used
    /// when a session needs to be bound or cleared without implying the app
    /// mode moved (e.g. a route-reconcile abort clearing `current_session`).
    pub async fn update_session_id(&self, session: Option<Session>) {
        self.inner.write().await.current_session = session;
    }

    pub async fn set_permission(&self, axis: PermissionAxis, status: PermissionStatus) {
        let mut snap = self.inner.write().await;
        match axis {
            PermissionAxis::Mic => snap.perm_mic = status,
            PermissionAxis::Screen => snap.perm_screen = status,
            PermissionAxis::Accessibility => snap.perm_accessibility = status,
        }
    }

    pub async fn set_device_status(&self, status: DeviceStatus) {
        self.inner.write().await.device_input = status;
    }

    pub async fn set_network_status(&self, status: NetworkStatus) {
        self.inner.write().await.network = status;
    }

    pub async fn set_first_run(&self, first_run: bool) {
        self.inner.write().await.first_run = first_run;
    }

    pub async fn set_restart_pending(&self, pending: bool) {
        self.inner.write().await.restart_pending = pending;
    }

    pub async fn set_ptt_pressed(&self, pressed: bool) {
        self.inner.write().await.ptt_pressed = pressed;
    }

    pub async fn set(&self, key: &str, value: Value) {
        self.flags.write().await.insert(key.to_string(), value);
    }

    pub async fn get(&self, key: &str, default: Value) -> Value {
        self.flags.read().await.get(key).cloned().unwrap_or(default)
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key, Value::Bool(default)).await.as_bool().unwrap_or(default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionAxis {
    Mic,
    Screen,
    Accessibility,
}

// --- Selectors: pure functions over a Snapshot. ------------------------

pub fn mic_ready(snap: &Snapshot) -> bool {
    snap.perm_mic == PermissionStatus::Granted && snap.device_input == DeviceStatus::Ok
}

pub fn screen_ready(snap: &Snapshot) -> bool {
    snap.perm_screen == PermissionStatus::Granted
}

pub fn accessibility_ready(snap: &Snapshot) -> bool {
    snap.perm_accessibility == PermissionStatus::Granted
}

pub fn all_permissions_ready(snap: &Snapshot) -> bool {
    mic_ready(snap) && screen_ready(snap) && accessibility_ready(snap)
}

pub fn device_idle(snap: &Snapshot) -> bool {
    snap.device_input == DeviceStatus::Ok
}

pub fn device_busy(snap: &Snapshot) -> bool {
    snap.device_input == DeviceStatus::Busy
}

pub fn network_online(snap: &Snapshot) -> bool {
    snap.network == NetworkStatus::Online
}

pub fn network_offline(snap: &Snapshot) -> bool {
    snap.network == NetworkStatus::Offline
}

pub fn is_first_run(snap: &Snapshot) -> bool {
    snap.first_run
}

pub fn is_sleeping_mode(snap: &Snapshot) -> bool {
    snap.mode == Mode::Sleeping
}

pub fn is_listening_mode(snap: &Snapshot) -> bool {
    snap.mode == Mode::Listening
}

pub fn is_processing_mode(snap: &Snapshot) -> bool {
    snap.mode == Mode::Processing
}

/// Whether a PRESS is allowed to open the mic right now.
pub fn can_start_listening(snap: &Snapshot) -> bool {
    mic_ready(snap) && !snap.first_run && snap.mode != Mode::Processing
}

/// Whether recognized audio is allowed to be dispatched for processing.
pub fn can_process_audio(snap: &Snapshot) -> bool {
    snap.current_session.is_some() && network_online(snap)
}

/// Whether the app should fall back to degraded (offline) behavior.
pub fn should_degrade_offline(snap: &Snapshot) -> bool {
    network_offline(snap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new())
    }

    #[tokio::test]
    async fn set_mode_emits_only_on_delta() {
        let store = StateStore::new(bus());
        let b = Arc::new(EventBus::new());
        let _ = &b;
        assert!(store.set_mode(Mode::Listening, None).await);
        assert!(!store.set_mode(Mode::Listening, None).await);
    }

    #[tokio::test]
    async fn snapshot_round_trips_without_intervening_writes() {
        let store = StateStore::new(bus());
        let a = store.snapshot().await;
        let b = store.snapshot().await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn selectors_reflect_snapshot_state() {
        let store = StateStore::new(bus());
        store.set_device_status(DeviceStatus::Busy).await;
        let snap = store.snapshot().await;
        assert!(device_busy(&snap));
        assert!(!can_start_listening(&snap));
    }

    #[tokio::test]
    async fn update_session_id_does_not_emit_mode_change() {
        let store = StateStore::new(bus());
        store.update_session_id(Some(Session::new())).await;
        let snap = store.snapshot().await;
        assert!(snap.current_session.is_some());
        assert_eq!(snap.mode, Mode::Sleeping);
    }
}

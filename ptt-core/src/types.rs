//! Shared data model: the value types every component reads and writes.
//!
//! Kept deliberately dumb — no behavior lives here, only shapes and the
//! occasional `Display`/`FromStr` for wire round-tripping.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse application state. SLEEPING is the initial and resting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Sleeping,
    Listening,
    Processing,
}

impl Mode {
    /// True if `(self, to)` is one of the transitions Mode Controller allows.
    pub fn can_transition_to(self, to: Mode) -> bool {
        use Mode::*;
        matches!(
            (self, to),
            (Sleeping, Listening)
                | (Listening, Sleeping)
                | (Listening, Processing)
                | (Processing, Sleeping)
                | (Sleeping, Processing)
                | (Processing, Listening)
        )
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Sleeping => "sleeping",
            Mode::Listening => "listening",
            Mode::Processing => "processing",
        };
        f.write_str(s)
    }
}

/// A UUIDv4 correlating one PTT utterance through recording, recognition,
/// the remote request, and playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Session(pub Uuid);

impl Session {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    Denied,
    PromptBlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Ok,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Online,
    Offline,
}

/// Immutable snapshot of everything decision logic needs to read. Produced
/// on demand by the State Store; nothing else touches its fields directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub perm_mic: PermissionStatus,
    pub perm_screen: PermissionStatus,
    pub perm_accessibility: PermissionStatus,
    pub device_input: DeviceStatus,
    pub network: NetworkStatus,
    pub first_run: bool,
    pub mode: Mode,
    pub restart_pending: bool,
    pub ptt_pressed: bool,
    pub current_session: Option<Session>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            perm_mic: PermissionStatus::Granted,
            perm_screen: PermissionStatus::Granted,
            perm_accessibility: PermissionStatus::Granted,
            device_input: DeviceStatus::Ok,
            network: NetworkStatus::Online,
            first_run: false,
            mode: Mode::Sleeping,
            restart_pending: false,
            ptt_pressed: false,
            current_session: None,
        }
    }
}

/// One physical key/chord transition from the platform key-tap monitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEventKind {
    Press,
    ShortPress,
    LongPress,
    Release,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEvent {
    pub kind: KeyEventKind,
    pub key_id: String,
    /// Seconds since the monitor started, monotonic.
    pub timestamp: f64,
    /// Hold duration in seconds, present on SHORT_PRESS/LONG_PRESS/RELEASE.
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioDType {
    Int16Le,
    Int16Be,
    Float32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioChunk {
    pub session: Session,
    pub pcm_bytes: Vec<u8>,
    pub dtype: AudioDType,
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    SpeechStop,
    SpeechPause,
    RecordingStop,
    SessionClear,
    FullReset,
}

impl fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterruptKind::SpeechStop => "speech_stop",
            InterruptKind::SpeechPause => "speech_pause",
            InterruptKind::RecordingStop => "recording_stop",
            InterruptKind::SessionClear => "session_clear",
            InterruptKind::FullReset => "full_reset",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptEvent {
    pub kind: InterruptKind,
    pub priority: InterruptPriority,
    pub source: String,
    pub session: Option<Session>,
    pub event_id: String,
    pub press_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalPattern {
    ListenStart,
    Done,
    Error,
    Cancel,
    UpdateStart,
    UpdateSuccess,
    UpdateError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalCue {
    pub pattern: SignalPattern,
    pub cue_id: String,
    pub emitted_at_ms: u64,
    pub pcm: Option<Vec<f32>>,
    pub gain: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_transition_table_matches_spec() {
        assert!(Mode::Sleeping.can_transition_to(Mode::Listening));
        assert!(Mode::Listening.can_transition_to(Mode::Sleeping));
        assert!(Mode::Listening.can_transition_to(Mode::Processing));
        assert!(Mode::Processing.can_transition_to(Mode::Sleeping));
        assert!(Mode::Sleeping.can_transition_to(Mode::Processing));
        assert!(Mode::Processing.can_transition_to(Mode::Listening));
        assert!(!Mode::Sleeping.can_transition_to(Mode::Sleeping));
    }

    #[test]
    fn session_round_trips_through_json() {
        let s = Session::new();
        let json = serde_json::to_string(&s).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn snapshot_default_is_sleeping_and_idle() {
        let snap = Snapshot::default();
        assert_eq!(snap.mode, Mode::Sleeping);
        assert!(snap.current_session.is_none());
        assert!(!snap.ptt_pressed);
    }
}

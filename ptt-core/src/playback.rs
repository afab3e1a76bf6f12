//! Speech Playback: the single playback owner. Serializes enqueue/stop/
//! cancel through one operation lock, the way the spec's single-mutex
//! discipline requires, and guarantees at most one terminal event per
//! session (I4).

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::event_bus::{Event, EventBus, Handler, Priority};
use crate::types::{AudioChunk, AudioDType, Session};

const CANCEL_DEDUP_WINDOW: Duration = Duration::from_millis(500);
const CANCEL_CUE_GUARD_WINDOW: Duration = Duration::from_millis(500);
const POST_MIC_ROUTE_WAIT: Duration = Duration::from_millis(800);
const POST_MIC_DEDUP_WINDOW: Duration = Duration::from_millis(750);
const GRPC_START_WATCHDOG: Duration = Duration::from_millis(250);
const SILENCE_TAIL_THRESHOLD_SEC: f64 = 0.05;
const SILENCE_TAIL_CONSECUTIVE: u32 = 3;
const SILENCE_POLL_INTERVAL: Duration = Duration::from_millis(50);

const TTS_TARGET_PEAK: f32 = 0.35;
const TTS_MAX_GAIN: f32 = 6.0;
const TTS_MIN_PEAK_FOR_GAIN: f32 = 0.01;
const TTS_SAFE_MAX_GAIN: f32 = 2.5;
const TTS_HEADROOM_PEAK: f32 = 0.90;
const TTS_GAIN_EMA_ALPHA: f32 = 0.25;
const CLIP_LIMIT: f32 = 0.98;

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub auto_gain_enabled: bool,
    pub signal_max_age_ms: u64,
    pub silence_finalize_timeout: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 48_000,
            channels: 1,
            auto_gain_enabled: false,
            signal_max_age_ms: 1200,
            silence_finalize_timeout: Duration::from_secs(10),
        }
    }
}

/// External collaborator owning the actual output device. `ptt-daemon`
/// implements this against `rodio`.
pub trait AudioOutputPlayer: Send + Sync {
    fn initialize(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
    fn start_playback(&self, reassert_profile: bool) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
    fn stop_playback(&self) -> Pin<Box<dyn Future<Output = ()> + Send>>;
    fn clear_queue(&self) -> Pin<Box<dyn Future<Output = ()> + Send>>;
    fn add_audio_data(&self, samples: Vec<f32>) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
    fn is_queue_empty(&self) -> Pin<Box<dyn Future<Output = bool> + Send>>;
    fn buffered_audio_seconds(&self) -> Pin<Box<dyn Future<Output = f64> + Send>>;
    fn is_route_transition_in_flight(&self) -> Pin<Box<dyn Future<Output = bool> + Send>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Default)]
struct State {
    active_output_session: Option<Session>,
    player_ready: bool,
    had_audio_for_session: HashSet<Session>,
    grpc_done_sessions: HashSet<Session>,
    cancelled_sessions: HashSet<Session>,
    finalized_sessions: HashSet<Session>,
    terminal_event_by_session: HashMap<Session, Terminal>,
    no_audio_terminal_sessions: HashSet<Session>,
    gain_ema: HashMap<Session, f32>,
    wav_header_checked: HashSet<Session>,
    last_cancel: Option<(Session, Instant)>,
    cancel_cue_guard_until: Option<Instant>,
    grpc_start_confirmed: HashSet<Session>,
    last_post_mic_recovery: Option<(Session, Instant)>,
}

pub struct SpeechPlayback {
    bus: Arc<EventBus>,
    player: Arc<dyn AudioOutputPlayer>,
    config: PlaybackConfig,
    state: Mutex<State>,
    silence_tasks: Mutex<HashMap<Session, JoinHandle<()>>>,
}

impl SpeechPlayback {
    pub fn new(bus: Arc<EventBus>, player: Arc<dyn AudioOutputPlayer>, config: PlaybackConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            player,
            config,
            state: Mutex::new(State::default()),
            silence_tasks: Mutex::new(HashMap::new()),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let audio_handler: Arc<dyn Handler> = Arc::new(AudioChunkHandler(self.clone()));
        self.bus.subscribe("grpc.response.audio", audio_handler, Priority::High).await;
        let cancel_handler: Arc<dyn Handler> = Arc::new(CancelHandler(self.clone()));
        self.bus.subscribe("playback.cancelled", cancel_handler.clone(), Priority::High).await;
        self.bus.subscribe("grpc.request_cancel", cancel_handler, Priority::High).await;
        let completed_handler: Arc<dyn Handler> = Arc::new(RequestCompletedHandler(self.clone()));
        self.bus.subscribe("grpc.request_completed", completed_handler, Priority::High).await;
        let failed_handler: Arc<dyn Handler> = Arc::new(RequestFailedHandler(self.clone()));
        self.bus.subscribe("grpc.request_failed", failed_handler, Priority::High).await;
        let mic_closed_handler: Arc<dyn Handler> = Arc::new(MicClosedHandler(self.clone()));
        self.bus.subscribe("voice.mic_closed", mic_closed_handler, Priority::Medium).await;
        let signal_handler: Arc<dyn Handler> = Arc::new(SignalHandler(self.clone()));
        self.bus.subscribe("playback.signal", signal_handler, Priority::Medium).await;
    }

    /// Enqueue one chunk. Single critical path, serialized by `state`.
    pub async fn enqueue(self: &Arc<Self>, chunk: AudioChunk) {
        let mut state = self.state.lock().await;

        if state.cancelled_sessions.contains(&chunk.session) {
            trace!(session = %chunk.session, "chunk dropped, session cancelled");
            return;
        }

        if chunk.sample_rate_hz != self.config.sample_rate_hz || chunk.channels != self.config.channels {
            warn!(session = %chunk.session, sample_rate = chunk.sample_rate_hz, channels = chunk.channels, "chunk dropped, output format mismatch");
            return;
        }

        let mut bytes = chunk.pcm_bytes.as_slice();
        if state.wav_header_checked.insert(chunk.session) && bytes.len() >= 44 && &bytes[0..4] == b"RIFF" {
            bytes = &bytes[44..];
        }

        let samples = match decode_samples(bytes, chunk.dtype) {
            Some(samples) => samples,
            None => {
                warn!(session = %chunk.session, "chunk dropped, non-finite samples or bad length");
                return;
            }
        };

        let was_no_audio_terminal = state.no_audio_terminal_sessions.remove(&chunk.session);
        if was_no_audio_terminal {
            state.finalized_sessions.remove(&chunk.session);
            state.terminal_event_by_session.remove(&chunk.session);
        }

        let fresh_start = state.active_output_session.is_some_and(|s| s != chunk.session);
        if fresh_start {
            self.player.stop_playback().await;
            state.player_ready = false;
        }

        let first_chunk_overall = !state.player_ready;
        if first_chunk_overall {
            if let Err(err) = self.player.initialize().await {
                warn!(session = %chunk.session, %err, "player initialize failed");
                return;
            }
            state.player_ready = true;
        }
        if fresh_start || was_no_audio_terminal || !state.had_audio_for_session.contains(&chunk.session) {
            trace!(session = %chunk.session, "playback starting");
            state.active_output_session = Some(chunk.session);
            let bus = self.bus.clone();
            let session = chunk.session;
            let payload = json!({ "session": session.to_string() });
            tokio::spawn(async move { bus.publish("playback.started", payload).await });
        }

        let samples = if self.config.auto_gain_enabled {
            apply_auto_gain(&mut state.gain_ema, chunk.session, samples)
        } else {
            samples
        };

        if let Err(err) = self.player.add_audio_data(samples).await {
            warn!(session = %chunk.session, %err, "add_audio_data failed");
            return;
        }
        state.had_audio_for_session.insert(chunk.session);

        let schedule_finalize = state.grpc_done_sessions.contains(&chunk.session);
        drop(state);
        if schedule_finalize {
            self.schedule_silence_finalize(chunk.session).await;
        }
    }

    async fn schedule_silence_finalize(self: &Arc<Self>, session: Session) {
        let mut tasks = self.silence_tasks.lock().await;
        if tasks.contains_key(&session) {
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_silence_finalize(session).await });
        tasks.insert(session, handle);
    }

    async fn run_silence_finalize(self: Arc<Self>, session: Session) {
        let deadline = Instant::now() + self.config.silence_finalize_timeout * 5;
        let mut consecutive = 0;
        loop {
            let empty = self.player.is_queue_empty().await;
            let tail = self.player.buffered_audio_seconds().await;
            if empty && tail <= SILENCE_TAIL_THRESHOLD_SEC {
                consecutive += 1;
                if consecutive >= SILENCE_TAIL_CONSECUTIVE {
                    break;
                }
            } else {
                consecutive = 0;
            }
            if Instant::now() >= deadline {
                warn!(%session, "silence-finalize exceeded soft timeout, finalizing anyway");
                break;
            }
            tokio::time::sleep(SILENCE_POLL_INTERVAL).await;
        }

        self.player.stop_playback().await;
        self.finalize_once(session, Terminal::Completed, None).await;
        self.silence_tasks.lock().await.remove(&session);
    }

    async fn finalize_once(self: &Arc<Self>, session: Session, terminal: Terminal, error: Option<String>) {
        {
            let mut state = self.state.lock().await;
            if !state.finalized_sessions.insert(session) {
                return;
            }
            state.terminal_event_by_session.insert(session, terminal);
        }
        let event_type = match terminal {
            Terminal::Completed => "playback.completed",
            Terminal::Failed => "playback.failed",
            Terminal::Cancelled => "playback.cancelled",
        };
        self.bus.publish(event_type, json!({ "session": session.to_string(), "error": error })).await;
    }

    async fn handle_cancel(self: &Arc<Self>, _event_type: &str, event: &Event) {
        let explicit_session = session_of(event);

        self.player.stop_playback().await;

        let now = Instant::now();
        let mut state = self.state.lock().await;

        // Resolution order: explicit session on the event, else whichever
        // session currently owns the output device.
        let session = explicit_session.or(state.active_output_session);
        let Some(session) = session else {
            drop(state);
            return;
        };

        if let Some((last_session, last_ts)) = state.last_cancel {
            if last_session == session && now.duration_since(last_ts) < CANCEL_DEDUP_WINDOW {
                drop(state);
                return;
            }
        }
        state.last_cancel = Some((session, now));
        state.cancel_cue_guard_until = Some(now + CANCEL_CUE_GUARD_WINDOW);
        state.cancelled_sessions.insert(session);
        state.had_audio_for_session.remove(&session);
        if state.active_output_session == Some(session) {
            state.active_output_session = None;
            state.player_ready = false;
        }
        drop(state);

        if let Some(task) = self.silence_tasks.lock().await.remove(&session) {
            task.abort();
        }

        self.finalize_once(session, Terminal::Cancelled, None).await;
    }

    async fn handle_request_completed(self: &Arc<Self>, event: &Event) {
        let Some(session) = session_of(event) else { return };
        let had_audio = {
            let mut state = self.state.lock().await;
            state.grpc_done_sessions.insert(session);
            state.had_audio_for_session.contains(&session)
        };
        if had_audio {
            self.schedule_silence_finalize(session).await;
        } else {
            self.state.lock().await.no_audio_terminal_sessions.insert(session);
            self.finalize_once(session, Terminal::Completed, None).await;
        }
    }

    async fn handle_request_failed(self: &Arc<Self>, event: &Event) {
        let Some(session) = session_of(event) else { return };
        let error = event.data.get("error").and_then(Value::as_str).map(str::to_string);
        self.finalize_once(session, Terminal::Failed, error).await;
    }

    async fn handle_mic_closed(self: &Arc<Self>, event: &Event) {
        let Some(session) = session_of(event) else { return };
        let still_relevant = {
            let state = self.state.lock().await;
            state.active_output_session == Some(session) || !state.had_audio_for_session.is_empty()
        };
        if !still_relevant {
            return;
        }

        {
            let mut state = self.state.lock().await;
            if let Some((last_session, last_ts)) = state.last_post_mic_recovery {
                if last_session == session && Instant::now().duration_since(last_ts) < POST_MIC_DEDUP_WINDOW {
                    return;
                }
            }
            state.last_post_mic_recovery = Some((session, Instant::now()));
        }

        let deadline = Instant::now() + POST_MIC_ROUTE_WAIT;
        while self.player.is_route_transition_in_flight().await && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if let Err(err) = self.player.start_playback(true).await {
            warn!(%session, %err, "post-mic-recovery reassert failed");
        }
    }

    async fn handle_signal(self: &Arc<Self>, event: &Event) {
        let emitted_at_ms = event.data.get("emitted_at_ms").and_then(Value::as_u64).unwrap_or(0);
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        if now_ms.saturating_sub(emitted_at_ms) > self.config.signal_max_age_ms {
            trace!("stale signal cue dropped");
            return;
        }

        let pattern = event.data.get("pattern").and_then(Value::as_str).unwrap_or_default();
        let cue_id = event.data.get("cue_id").and_then(Value::as_str).unwrap_or_default();

        if pattern == "cancel" {
            let guarded = {
                let state = self.state.lock().await;
                state.cancel_cue_guard_until.is_some_and(|deadline| Instant::now() < deadline)
            };
            if !guarded {
                trace!(cue_id, "cancel cue dropped, no active cancel guard");
                return;
            }
        }

        if let Some(pcm) = event.data.get("pcm").and_then(Value::as_array) {
            let samples: Vec<f32> = pcm.iter().filter_map(Value::as_f64).map(|v| v as f32).collect();
            if let Err(err) = self.player.add_audio_data(samples).await {
                warn!(%err, "signal cue playback failed");
            }
        }
    }

    /// Confirms the output route within the watchdog window or reasserts
    /// the player profile once.
    pub async fn arm_grpc_start_watchdog(self: &Arc<Self>, session: Session) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(GRPC_START_WATCHDOG).await;
            let mut state = this.state.lock().await;
            if state.grpc_start_confirmed.contains(&session) {
                return;
            }
            state.grpc_start_confirmed.insert(session);
            drop(state);
            if let Err(err) = this.player.start_playback(true).await {
                warn!(%session, %err, "grpc start watchdog reassert failed");
            }
        });
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

fn decode_samples(bytes: &[u8], dtype: AudioDType) -> Option<Vec<f32>> {
    match dtype {
        AudioDType::Int16Le => {
            if bytes.len() % 2 != 0 {
                return None;
            }
            Some(bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / i16::MAX as f32).collect())
        }
        AudioDType::Int16Be => {
            if bytes.len() % 2 != 0 {
                return None;
            }
            Some(bytes.chunks_exact(2).map(|c| i16::from_be_bytes([c[0], c[1]]) as f32 / i16::MAX as f32).collect())
        }
        AudioDType::Float32 => {
            if bytes.len() % 4 != 0 {
                return None;
            }
            let samples: Vec<f32> = bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
            if samples.iter().all(|s| s.is_finite()) {
                Some(samples)
            } else {
                None
            }
        }
    }
}

/// Per-session EMA-of-peak auto-gain, matching the exact formula: near-
/// silent chunks decay the EMA by 0.9 instead of tracking a near-zero peak,
/// gain is clamped to the safe max and to headroom, and output is clipped.
fn apply_auto_gain(ema_by_session: &mut HashMap<Session, f32>, session: Session, mut samples: Vec<f32>) -> Vec<f32> {
    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    let ema = ema_by_session.entry(session).or_insert(0.0);
    if peak >= TTS_MIN_PEAK_FOR_GAIN {
        *ema = (1.0 - TTS_GAIN_EMA_ALPHA) * *ema + TTS_GAIN_EMA_ALPHA * peak;
    } else {
        *ema *= 0.9;
    }

    let effective_max_gain = TTS_MAX_GAIN.min(TTS_SAFE_MAX_GAIN);
    let mut gain = (TTS_TARGET_PEAK / ema.max(1e-6)).min(effective_max_gain).max(1.0);
    if peak > 0.0 && peak * gain > TTS_HEADROOM_PEAK {
        gain = TTS_HEADROOM_PEAK / peak;
    }

    for s in samples.iter_mut() {
        *s = (*s * gain).clamp(-CLIP_LIMIT, CLIP_LIMIT);
    }
    samples
}

struct AudioChunkHandler(Arc<SpeechPlayback>);
impl Handler for AudioChunkHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let playback = self.0.clone();
        Box::pin(async move {
            let Some(session) = session_of(&event) else { return };
            let dtype = match event.data.get("dtype").and_then(Value::as_str) {
                Some("int16_be") => AudioDType::Int16Be,
                Some("float32") => AudioDType::Float32,
                _ => AudioDType::Int16Le,
            };
            let (Some(sample_rate_hz), Some(channels)) = (
                event.data.get("sample_rate").and_then(Value::as_u64),
                event.data.get("channels").and_then(Value::as_u64),
            ) else {
                warn!(%session, "grpc.response.audio missing sample_rate/channels, dropped");
                return;
            };
            let pcm_bytes = event
                .data
                .get("bytes")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_u64).map(|b| b as u8).collect())
                .unwrap_or_default();
            let chunk = AudioChunk {
                session,
                pcm_bytes,
                dtype,
                sample_rate_hz: sample_rate_hz as u32,
                channels: channels as u16,
                sequence: event.data.get("sequence").and_then(Value::as_u64).unwrap_or(0),
            };
            playback.enqueue(chunk).await;
        })
    }
}

struct CancelHandler(Arc<SpeechPlayback>);
impl Handler for CancelHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let playback = self.0.clone();
        let event_type = event.event_type.clone();
        Box::pin(async move { playback.handle_cancel(&event_type, &event).await })
    }
}

struct RequestCompletedHandler(Arc<SpeechPlayback>);
impl Handler for RequestCompletedHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let playback = self.0.clone();
        Box::pin(async move { playback.handle_request_completed(&event).await })
    }
}

struct RequestFailedHandler(Arc<SpeechPlayback>);
impl Handler for RequestFailedHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let playback = self.0.clone();
        Box::pin(async move { playback.handle_request_failed(&event).await })
    }
}

struct MicClosedHandler(Arc<SpeechPlayback>);
impl Handler for MicClosedHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let playback = self.0.clone();
        Box::pin(async move { playback.handle_mic_closed(&event).await })
    }
}

struct SignalHandler(Arc<SpeechPlayback>);
impl Handler for SignalHandler {
    fn handle(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let playback = self.0.clone();
        Box::pin(async move { playback.handle_signal(&event).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakePlayer {
        queue_empty: AtomicBool,
    }

    impl Default for FakePlayer {
        fn default() -> Self {
            Self { queue_empty: AtomicBool::new(true) }
        }
    }

    impl AudioOutputPlayer for FakePlayer {
        fn initialize(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
            Box::pin(async { Ok(()) })
        }
        fn start_playback(&self, _reassert_profile: bool) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
            Box::pin(async { Ok(()) })
        }
        fn stop_playback(&self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async {})
        }
        fn clear_queue(&self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async {})
        }
        fn add_audio_data(&self, _samples: Vec<f32>) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
            Box::pin(async { Ok(()) })
        }
        fn is_queue_empty(&self) -> Pin<Box<dyn Future<Output = bool> + Send>> {
            let empty = self.queue_empty.load(Ordering::SeqCst);
            Box::pin(async move { empty })
        }
        fn buffered_audio_seconds(&self) -> Pin<Box<dyn Future<Output = f64> + Send>> {
            Box::pin(async { 0.0 })
        }
        fn is_route_transition_in_flight(&self) -> Pin<Box<dyn Future<Output = bool> + Send>> {
            Box::pin(async { false })
        }
    }

    fn setup() -> (Arc<EventBus>, Arc<SpeechPlayback>) {
        let bus = Arc::new(EventBus::new());
        let playback = SpeechPlayback::new(bus.clone(), Arc::new(FakePlayer::default()), PlaybackConfig::default());
        (bus, playback)
    }

    fn int16_chunk(session: Session, samples: &[i16]) -> AudioChunk {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        AudioChunk { session, pcm_bytes: bytes, dtype: AudioDType::Int16Le, sample_rate_hz: 48_000, channels: 1, sequence: 0 }
    }

    #[tokio::test]
    async fn mismatched_sample_rate_is_dropped_without_started_event() {
        let (bus, playback) = setup();
        let session = Session::new();
        let mut chunk = int16_chunk(session, &[100, 200]);
        chunk.sample_rate_hz = 44_100;
        playback.enqueue(chunk).await;
        assert!(bus.history(Some("playback.started"), 10).await.is_empty());
    }

    #[tokio::test]
    async fn completion_with_no_audio_finalizes_once() {
        let (bus, playback) = setup();
        let session = Session::new();
        bus.publish("grpc.request_completed", json!({ "session": session.to_string() })).await;
        assert_eq!(bus.history(Some("playback.completed"), 10).await.len(), 1);
    }

    #[tokio::test]
    async fn cancel_finalizes_as_cancelled_not_completed() {
        let (bus, playback) = setup();
        let session = Session::new();
        playback.enqueue(int16_chunk(session, &[1000, -1000])).await;
        bus.publish("playback.cancelled", json!({ "session": session.to_string() })).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bus.history(Some("playback.cancelled"), 10).await.len(), 1);
        assert!(bus.history(Some("playback.completed"), 10).await.is_empty());
    }

    #[test]
    fn auto_gain_clips_to_limit() {
        let mut ema = HashMap::new();
        let session = Session::new();
        let samples = vec![1.0f32, -1.0, 0.5];
        let out = apply_auto_gain(&mut ema, session, samples);
        for s in out {
            assert!(s.abs() <= CLIP_LIMIT + f32::EPSILON);
        }
    }
}

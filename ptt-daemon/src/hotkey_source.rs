//! Global push-to-talk key source.
//!
//! Captures keyboard events system-wide using `rdev` and turns raw down/up
//! transitions into the four-stage [`KeyEventKind`] stream the translator
//! expects: PRESS fires immediately on key-down, then exactly one of
//! SHORT_PRESS / LONG_PRESS / RELEASE fires depending on how long the key
//! was held relative to the configured thresholds.
//!
//! A long hold is reported as LONG_PRESS *while the key is still down* (via a
//! timer), not on key-up, so the translator can open the mic without waiting
//! for release. The key-up that follows a LONG_PRESS is then reported as a
//! plain RELEASE.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rdev::{listen, Event, EventType, Key};
use tokio::sync::mpsc;
use tracing::warn;

use ptt_core::types::{KeyEvent, KeyEventKind};

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Parse a configured key name into the matching `rdev::Key`.
///
/// Only the subset of keys a PTT binding plausibly uses is covered; unknown
/// names are rejected at startup rather than silently ignored.
fn parse_key(name: &str) -> Option<Key> {
    match name.to_lowercase().trim() {
        "left_shift" | "shiftleft" => Some(Key::ShiftLeft),
        "right_shift" | "shiftright" => Some(Key::ShiftRight),
        "left_control" | "controlleft" => Some(Key::ControlLeft),
        "right_control" | "controlright" => Some(Key::ControlRight),
        "left_alt" | "alt" => Some(Key::Alt),
        "right_alt" | "altgr" => Some(Key::AltGr),
        "f1" => Some(Key::F1),
        "f2" => Some(Key::F2),
        "f3" => Some(Key::F3),
        "f4" => Some(Key::F4),
        "f5" => Some(Key::F5),
        "f6" => Some(Key::F6),
        "space" => Some(Key::Space),
        "capslock" => Some(Key::CapsLock),
        other => {
            warn!(key = other, "unknown PTT key binding");
            None
        }
    }
}

pub struct HotkeySource {
    key_id: String,
    short_press_threshold: Duration,
    long_press_threshold: Duration,
}

impl HotkeySource {
    pub fn new(key_id: String, short_press_threshold_sec: f64, long_press_threshold_sec: f64) -> Self {
        Self {
            key_id,
            short_press_threshold: Duration::from_secs_f64(short_press_threshold_sec),
            long_press_threshold: Duration::from_secs_f64(long_press_threshold_sec),
        }
    }

    /// Start listening in a background OS thread and stream [`KeyEvent`]s
    /// back over the returned channel.
    pub fn start(self) -> mpsc::UnboundedReceiver<KeyEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let Some(target) = parse_key(&self.key_id) else {
            warn!("hotkey source not started, no valid key binding");
            return rx;
        };

        let key_id = self.key_id.clone();
        let short_threshold = self.short_press_threshold;
        let long_threshold = self.long_press_threshold;

        thread::spawn(move || {
            let pressed = Arc::new(AtomicBool::new(false));
            let press_started_ms = Arc::new(AtomicU64::new(0));
            let long_press_fired = Arc::new(AtomicBool::new(false));
            let press_generation = Arc::new(AtomicU64::new(0));

            let callback_tx = tx.clone();
            let callback_key_id = key_id.clone();
            let callback_pressed = pressed.clone();
            let callback_press_started = press_started_ms.clone();
            let callback_long_fired = long_press_fired.clone();
            let callback_generation = press_generation.clone();

            let callback = move |event: Event| {
                let now_ms = (now_secs() * 1000.0) as u64;
                match event.event_type {
                    EventType::KeyPress(key) if key == target => {
                        if callback_pressed.swap(true, Ordering::SeqCst) {
                            return; // key-repeat, already down
                        }
                        callback_press_started.store(now_ms, Ordering::SeqCst);
                        callback_long_fired.store(false, Ordering::SeqCst);
                        let generation = callback_generation.fetch_add(1, Ordering::SeqCst) + 1;

                        let _ = callback_tx.send(KeyEvent {
                            kind: KeyEventKind::Press,
                            key_id: callback_key_id.clone(),
                            timestamp: now_secs(),
                            duration: None,
                        });

                        let tx2 = callback_tx.clone();
                        let key_id2 = callback_key_id.clone();
                        let pressed2 = callback_pressed.clone();
                        let long_fired2 = callback_long_fired.clone();
                        let generation2 = callback_generation.clone();
                        thread::spawn(move || {
                            thread::sleep(long_threshold);
                            if generation2.load(Ordering::SeqCst) != generation
                                || !pressed2.load(Ordering::SeqCst)
                            {
                                return; // key was released before the long-press fired
                            }
                            long_fired2.store(true, Ordering::SeqCst);
                            let _ = tx2.send(KeyEvent {
                                kind: KeyEventKind::LongPress,
                                key_id: key_id2,
                                timestamp: now_secs(),
                                duration: Some(long_threshold.as_secs_f64()),
                            });
                        });
                    }
                    EventType::KeyRelease(key) if key == target => {
                        if !callback_pressed.swap(false, Ordering::SeqCst) {
                            return; // release without a matching press we saw
                        }
                        callback_generation.fetch_add(1, Ordering::SeqCst);
                        let held_ms = now_ms.saturating_sub(callback_press_started.load(Ordering::SeqCst));
                        let duration = held_ms as f64 / 1000.0;

                        let kind = if callback_long_fired.load(Ordering::SeqCst) {
                            KeyEventKind::Release
                        } else if duration < short_threshold.as_secs_f64() {
                            KeyEventKind::ShortPress
                        } else {
                            KeyEventKind::Release
                        };

                        let _ = callback_tx.send(KeyEvent {
                            kind,
                            key_id: callback_key_id.clone(),
                            timestamp: now_secs(),
                            duration: Some(duration),
                        });
                    }
                    _ => {}
                }
            };

            if let Err(e) = listen(callback) {
                warn!("hotkey listener error: {:?}", e);
            }
        });

        rx
    }
}

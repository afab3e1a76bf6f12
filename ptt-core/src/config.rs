//! Explicit configuration struct passed in at construction — no global
//! knobs, matching the no-config-loading-UI boundary. A thin JSON-file
//! loader is provided for `ptt-daemon`, mirroring the shape of the
//! teacher's own settings file (one struct, read once at startup).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mode_controller::ModeControllerConfig;
use crate::playback::PlaybackConfig;
use crate::signal::{SignalConfig, SignalPatternKey};
use crate::translator::TranslatorConfig;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PttOptions {
    pub key: String,
    pub short_press_threshold: f64,
    pub long_press_threshold: f64,
    pub event_cooldown: f64,
    pub min_recording_duration: f64,
}

impl Default for PttOptions {
    fn default() -> Self {
        Self {
            key: "left_shift".to_string(),
            short_press_threshold: 0.1,
            long_press_threshold: 0.6,
            event_cooldown: 0.1,
            min_recording_duration: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackOptions {
    pub sample_rate: u32,
    pub channels: u16,
    pub tts_auto_gain_enabled: bool,
    pub signal_max_age_ms: u64,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self { sample_rate: 48_000, channels: 1, tts_auto_gain_enabled: false, signal_max_age_ms: 1200 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeOptions {
    pub processing_timeout_sec: u64,
    pub listening_timeout_sec: u64,
    pub request_dedup_window_sec: f64,
    pub action_intent_ttl_sec: f64,
}

impl Default for ModeOptions {
    fn default() -> Self {
        Self { processing_timeout_sec: 0, listening_timeout_sec: 0, request_dedup_window_sec: 0.5, action_intent_ttl_sec: 3.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenshotOptions {
    pub format: String,
    pub region: String,
    pub quality: u8,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

impl Default for ScreenshotOptions {
    fn default() -> Self {
        Self { format: "jpeg".to_string(), region: "full_screen".to_string(), quality: 85, max_width: None, max_height: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ptt: PttOptions,
    pub playback: PlaybackOptions,
    pub mode: ModeOptions,
    pub screenshot: ScreenshotOptions,
    pub signal_cooldowns_ms: HashMap<String, u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ptt: PttOptions::default(),
            playback: PlaybackOptions::default(),
            mode: ModeOptions::default(),
            screenshot: ScreenshotOptions::default(),
            signal_cooldowns_ms: HashMap::new(),
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn translator_config(&self) -> TranslatorConfig {
        TranslatorConfig {
            key_id: self.ptt.key.clone(),
            short_press_threshold_sec: self.ptt.short_press_threshold,
            long_press_threshold_sec: self.ptt.long_press_threshold,
            event_cooldown_sec: self.ptt.event_cooldown,
            min_recording_duration_sec: self.ptt.min_recording_duration,
            mic_closed_timeout: Duration::from_secs(2),
        }
    }

    pub fn mode_controller_config(&self) -> ModeControllerConfig {
        ModeControllerConfig {
            processing_timeout_sec: self.mode.processing_timeout_sec,
            listening_timeout_sec: self.mode.listening_timeout_sec,
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            sample_rate_hz: self.playback.sample_rate,
            channels: self.playback.channels,
            auto_gain_enabled: self.playback.tts_auto_gain_enabled,
            signal_max_age_ms: self.playback.signal_max_age_ms,
            silence_finalize_timeout: Duration::from_secs(10),
        }
    }

    pub fn signal_config(&self) -> SignalConfig {
        let mut cooldowns_ms = SignalConfig::default().cooldowns_ms;
        for (pattern, ms) in &self.signal_cooldowns_ms {
            let key = match pattern.as_str() {
                "listen_start" => SignalPatternKey::ListenStart,
                "done" => SignalPatternKey::Done,
                "cancel" => SignalPatternKey::Cancel,
                "error" => SignalPatternKey::Error,
                "update_start" => SignalPatternKey::UpdateStart,
                "update_success" => SignalPatternKey::UpdateSuccess,
                "update_error" => SignalPatternKey::UpdateError,
                _ => continue,
            };
            cooldowns_ms.insert(key, *ms);
        }
        SignalConfig { cooldowns_ms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.ptt.long_press_threshold, 0.6);
        assert_eq!(config.playback.sample_rate, 48_000);
        assert_eq!(config.mode.request_dedup_window_sec, 0.5);
    }
}

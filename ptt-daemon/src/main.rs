//! ptt-daemon — push-to-talk voice assistant daemon.
//!
//! Initializes tracing, loads config, constructs the event bus and state
//! store, wires the ten `ptt-core` collaborators to concrete platform
//! backends, and runs until Ctrl-C.

mod audio_io;
mod hotkey_source;
mod interrupt_handlers;
mod paths;
mod screenshot_backend;
mod stt_adapter;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ptt_core::config::Config;
use ptt_core::interrupt::InterruptCoordinator;
use ptt_core::mode_controller::ModeController;
use ptt_core::notifier::{ModeChangeNotifier, NotifierConfig};
use ptt_core::playback::{AudioOutputPlayer, SpeechPlayback};
use ptt_core::recognition::{MicSource, VoiceRecognitionCoordinator};
use ptt_core::screenshot::ScreenshotCoordinator;
use ptt_core::signal::SignalService;
use ptt_core::translator::InputTranslator;
use ptt_core::types::KeyEventKind;
use ptt_core::{EventBus, StateStore};

use audio_io::{CpalMicSource, RodioPlayer};
use hotkey_source::HotkeySource;
use interrupt_handlers::DaemonInterruptHandlers;
use screenshot_backend::ScreencaptureBackend;
use stt_adapter::{AlwaysProceedReconciler, CloudSttAdapter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let data_dir = paths::get_data_dir();
    let use_file = std::fs::create_dir_all(&data_dir).is_ok();

    let _guard: Option<tracing_appender::non_blocking::WorkerGuard>;
    if use_file {
        let file_appender = tracing_appender::rolling::daily(&data_dir, "ptt-daemon.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        _guard = Some(guard);
        tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(non_blocking).with_ansi(false).init();
    } else {
        _guard = None;
        tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(std::io::stderr).init();
    }

    let config = match Config::load(&paths::get_config_path()).await {
        Ok(config) => config,
        Err(err) => {
            warn!(%err, "failed to load config, using defaults");
            Config::default()
        }
    };
    info!(?config, "configuration loaded");

    let bus = Arc::new(EventBus::new());
    let store = Arc::new(StateStore::new(bus.clone()));

    // ── Microphone / speaker ──────────────────────────────────────────
    let cpal_mic = Arc::new(CpalMicSource::new());
    let mic_buffers = cpal_mic.buffers();
    let mic: Arc<dyn MicSource> = cpal_mic;

    let player: Arc<dyn AudioOutputPlayer> =
        Arc::new(RodioPlayer::new(config.playback.sample_rate, config.playback.channels));
    if let Err(err) = player.initialize().await {
        warn!(%err, "audio output failed to initialize");
    }

    // ── Mode controller ───────────────────────────────────────────────
    let mode_controller = ModeController::new(bus.clone(), store.clone(), config.mode_controller_config());
    mode_controller.start().await;

    // ── Input translator ──────────────────────────────────────────────
    let translator = InputTranslator::new(bus.clone(), config.translator_config());

    // ── Voice recognition ──────────────────────────────────────────────
    let stt_endpoint = std::env::var("PTT_STT_ENDPOINT").unwrap_or_else(|_| "https://api.openai.com/v1/audio/transcriptions".to_string());
    let stt_api_key = std::env::var("PTT_STT_API_KEY").ok();
    let stt: Arc<dyn ptt_core::recognition::SttAdapter> =
        Arc::new(CloudSttAdapter::new(mic_buffers, stt_endpoint, stt_api_key));
    let route: Arc<dyn ptt_core::recognition::RouteReconciler> = Arc::new(AlwaysProceedReconciler);
    let recognition = VoiceRecognitionCoordinator::new(bus.clone(), store.clone(), mic.clone(), stt, route);
    recognition.start().await;

    // ── Screenshot capture ──────────────────────────────────────────────
    let screenshot_backend: Arc<dyn ptt_core::screenshot::ScreenCaptureBackend> =
        Arc::new(ScreencaptureBackend::new(config.screenshot.quality));
    let screenshot = ScreenshotCoordinator::new(bus.clone(), screenshot_backend);
    screenshot.start().await;
    screenshot.spawn_periodic_cleanup(data_dir.join("screenshots"), std::time::Duration::from_secs(3600)).await;

    // ── Interrupts ──────────────────────────────────────────────────────
    let interrupt_handlers: Arc<dyn ptt_core::interrupt::InterruptHandlers> =
        Arc::new(DaemonInterruptHandlers::new(player.clone(), mic.clone()));
    let interrupts = InterruptCoordinator::new(bus.clone(), interrupt_handlers);
    interrupts.start().await;

    // ── Playback ──────────────────────────────────────────────────────
    let playback = SpeechPlayback::new(bus.clone(), player.clone(), config.playback_config());
    playback.start().await;

    // ── Signal cues ──────────────────────────────────────────────────
    let signal = SignalService::new(bus.clone(), store.clone(), config.signal_config());
    signal.start().await;

    // ── Mode-change notifier ──────────────────────────────────────────
    let notifier = ModeChangeNotifier::new(bus.clone(), NotifierConfig::default());
    notifier.start().await;

    // ── Cross-cutting glue the bus alone can't express ────────────────
    {
        let translator = translator.clone();
        let handler: Arc<dyn ptt_core::event_bus::Handler> = Arc::new(move |_event| {
            let translator = translator.clone();
            async move { translator.set_playback_active(true) }
        });
        bus.subscribe("playback.started", handler, ptt_core::event_bus::Priority::Low).await;
    }
    for event_type in ["playback.completed", "playback.failed", "playback.cancelled"] {
        let translator = translator.clone();
        let handler: Arc<dyn ptt_core::event_bus::Handler> = Arc::new(move |_event| {
            let translator = translator.clone();
            async move { translator.set_playback_active(false) }
        });
        bus.subscribe(event_type, handler, ptt_core::event_bus::Priority::Low).await;
    }

    // ── Hotkey loop ─────────────────────────────────────────────────────
    let hotkey = HotkeySource::new(
        config.ptt.key.clone(),
        config.ptt.short_press_threshold,
        config.ptt.long_press_threshold,
    );
    let mut key_events = hotkey.start();

    info!("ptt-daemon started");

    loop {
        tokio::select! {
            Some(event) = key_events.recv() => {
                recognition.set_ptt_held(matches!(event.kind, KeyEventKind::Press | KeyEventKind::LongPress));
                translator.on_key_event(event).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    Ok(())
}

//! Concrete [`InterruptHandlers`] wiring the interrupt coordinator's five
//! kinds onto the speaker and microphone collaborators.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use ptt_core::interrupt::InterruptHandlers;
use ptt_core::playback::AudioOutputPlayer;
use ptt_core::recognition::MicSource;
use ptt_core::types::Session;

pub struct DaemonInterruptHandlers {
    player: Arc<dyn AudioOutputPlayer>,
    mic: Arc<dyn MicSource>,
}

impl DaemonInterruptHandlers {
    pub fn new(player: Arc<dyn AudioOutputPlayer>, mic: Arc<dyn MicSource>) -> Self {
        Self { player, mic }
    }
}

impl InterruptHandlers for DaemonInterruptHandlers {
    fn speech_stop(&self, _session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
        let player = self.player.clone();
        Box::pin(async move {
            player.stop_playback().await;
            Ok(())
        })
    }

    // Only a hard stop is wired up today; a real pause (rodio `Sink::pause`,
    // preserving the queue) would need a dedicated player method.
    fn speech_pause(&self, _session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
        let player = self.player.clone();
        Box::pin(async move {
            player.stop_playback().await;
            Ok(())
        })
    }

    fn recording_stop(&self, session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
        let mic = self.mic.clone();
        Box::pin(async move {
            mic.close(session).await;
            Ok(())
        })
    }

    fn session_clear(&self, session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
        let player = self.player.clone();
        let mic = self.mic.clone();
        Box::pin(async move {
            player.clear_queue().await;
            mic.close(session).await;
            Ok(())
        })
    }

    fn full_reset(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
        let player = self.player.clone();
        Box::pin(async move {
            player.stop_playback().await;
            player.clear_queue().await;
            Ok(())
        })
    }
}

//! macOS screen capture via a `screencapture(1)` shell-out.
//!
//! There is no precedent for this in the teacher (a voice-only app); the
//! capture *contract* (one JPEG per call, base64-inlined alongside a path,
//! idempotent per session) is grounded on the original integration's
//! `ScreenshotCaptureIntegration`/`ScreenshotCapture` pair.

use std::future::Future;
use std::pin::Pin;

use base64::Engine;
use tokio::process::Command;
use tracing::debug;

use ptt_core::screenshot::{Capture, ScreenCaptureBackend};

pub struct ScreencaptureBackend {
    quality: u8,
}

impl ScreencaptureBackend {
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }
}

/// Read width/height out of a baseline JPEG's SOF0 marker without pulling in
/// a full image-decoding dependency.
fn jpeg_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2; // skip SOI marker (0xFFD8)
    while i + 9 < bytes.len() {
        if bytes[i] != 0xFF {
            i += 1;
            continue;
        }
        let marker = bytes[i + 1];
        let is_sof = matches!(marker, 0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF);
        if is_sof {
            let height = u16::from_be_bytes([bytes[i + 5], bytes[i + 6]]) as u32;
            let width = u16::from_be_bytes([bytes[i + 7], bytes[i + 8]]) as u32;
            return Some((width, height));
        }
        if marker == 0xD8 || marker == 0x01 || (0xD0..=0xD7).contains(&marker) {
            i += 2;
            continue;
        }
        let len = u16::from_be_bytes([bytes[i + 2], bytes[i + 3]]) as usize;
        i += 2 + len;
    }
    None
}

impl ScreenCaptureBackend for ScreencaptureBackend {
    fn capture(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<Capture>> + Send>> {
        let quality = self.quality;
        Box::pin(async move {
            let dir = std::env::temp_dir().join("ptt-daemon-screenshots");
            tokio::fs::create_dir_all(&dir).await?;
            let path = dir.join(format!("{}.jpg", uuid::Uuid::new_v4()));

            let status = Command::new("screencapture")
                .arg("-x") // no camera shutter sound
                .arg("-t")
                .arg("jpg")
                .arg(&path)
                .status()
                .await?;
            if !status.success() {
                anyhow::bail!("screencapture exited with status {status}");
            }

            let bytes = tokio::fs::read(&path).await?;
            let (width, height) = jpeg_dimensions(&bytes).unwrap_or((0, 0));
            debug!(quality, width, height, bytes = bytes.len(), "captured screenshot");

            Ok(Capture {
                image_path: path.to_string_lossy().to_string(),
                base64_data: base64::engine::general_purpose::STANDARD.encode(&bytes),
                format: "jpeg".to_string(),
                width,
                height,
                size_bytes: bytes.len() as u64,
                mime_type: "image/jpeg".to_string(),
            })
        })
    }
}

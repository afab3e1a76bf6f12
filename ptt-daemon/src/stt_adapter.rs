//! Cloud STT adapter and a trivial always-proceed route reconciler.
//!
//! Grounded on the teacher's `stt::cloud::CustomApiStt` (WAV-encode + upload
//! to an OpenAI-compatible transcription endpoint), adapted to read the
//! session's recorded samples out of [`CpalMicSource`]'s shared buffer map
//! instead of an in-memory argument, since recognition here is keyed by
//! session rather than by a single call-site buffer.

use std::future::Future;
use std::pin::Pin;

use reqwest::multipart;
use tracing::debug;

use ptt_core::recognition::{RouteDecision, RouteReconciler, SttAdapter};
use ptt_core::types::Session;

use crate::audio_io::MicBuffers;

const STT_SAMPLE_RATE: u32 = 16_000;

/// Encode f32 mono samples as 16-bit PCM WAV bytes.
fn encode_wav(audio: &[f32], sample_rate: u32) -> Vec<u8> {
    let num_samples = audio.len() as u32;
    let bytes_per_sample: u16 = 2;
    let num_channels: u16 = 1;
    let data_size = num_samples * bytes_per_sample as u32;
    let file_size = 36 + data_size;

    let mut buf = Vec::with_capacity(44 + data_size as usize);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&file_size.to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&num_channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    let byte_rate = sample_rate * num_channels as u32 * bytes_per_sample as u32;
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    let block_align = num_channels * bytes_per_sample;
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&(bytes_per_sample * 8).to_le_bytes());
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for &sample in audio {
        let clamped = sample.clamp(-1.0, 1.0);
        let pcm = (clamped * 32767.0) as i16;
        buf.extend_from_slice(&pcm.to_le_bytes());
    }
    buf
}

pub struct CloudSttAdapter {
    buffers: MicBuffers,
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl CloudSttAdapter {
    pub fn new(buffers: MicBuffers, endpoint: String, api_key: Option<String>) -> Self {
        Self { buffers, endpoint, api_key, client: reqwest::Client::new() }
    }
}

impl SttAdapter for CloudSttAdapter {
    fn recognize(&self, session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<(String, f32)>> + Send>> {
        let samples = self.buffers.lock().unwrap().get(&session).cloned().unwrap_or_default();
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let wav = encode_wav(&samples, STT_SAMPLE_RATE);
            debug!(bytes = wav.len(), %endpoint, "sending audio to STT endpoint");

            let file_part = multipart::Part::bytes(wav).file_name("audio.wav").mime_str("audio/wav")?;
            let form = multipart::Form::new().text("model", "whisper-1").part("file", file_part);
            let mut req = client.post(&endpoint).multipart(form);
            if let Some(key) = &api_key {
                req = req.bearer_auth(key);
            }

            let resp = req.send().await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("STT endpoint error {status}: {body}");
            }

            let json: serde_json::Value = resp.json().await?;
            let text = json["text"].as_str().unwrap_or("").to_string();
            let confidence = json["confidence"].as_f64().unwrap_or(1.0) as f32;
            Ok((text, confidence))
        })
    }

    fn cancel(&self, session: Session) {
        self.buffers.lock().unwrap().remove(&session);
    }
}

/// Always proceeds. Real route reconciliation (checking the platform's
/// exclusive-audio-mode negotiation) is out of scope; this is the seam a
/// real integration would replace.
pub struct AlwaysProceedReconciler;

impl RouteReconciler for AlwaysProceedReconciler {
    fn reconcile(&self) -> Pin<Box<dyn Future<Output = RouteDecision> + Send>> {
        Box::pin(async move { RouteDecision::Proceed })
    }
}

//! Concrete microphone and speaker collaborators backed by cpal/rodio.
//!
//! Grounded on the teacher's own `audio::capture` (input resampling) and
//! `tts::playback` (rodio output sink) modules, adapted to the trait seams
//! `ptt-core` exposes instead of the teacher's direct `AppState` wiring.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Stream;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use tracing::warn;

use ptt_core::playback::AudioOutputPlayer;
use ptt_core::recognition::MicSource;
use ptt_core::types::Session;

const TARGET_SAMPLE_RATE: u32 = 16_000;

pub type MicBuffers = Arc<StdMutex<HashMap<Session, Vec<f32>>>>;

/// Down-mix multi-channel audio to mono by averaging channels.
fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples.chunks_exact(ch).map(|frame| frame.iter().sum::<f32>() / ch as f32).collect()
}

/// Linear resampler, mono f32 in and out.
fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let frac = (src_idx - idx0 as f64) as f32;
        let s0 = input.get(idx0).copied().unwrap_or(0.0);
        let s1 = input.get(idx0 + 1).copied().unwrap_or(s0);
        output.push(s0 + frac * (s1 - s0));
    }
    output
}

/// Microphone source backed by the default cpal input device.
///
/// Only one recording session is active at a time, matching the push-to-talk
/// model: `open` starts a stream that accumulates resampled mono 16 kHz
/// samples into `buffers[session]`; `close` tears the stream down but leaves
/// the recorded samples in place for the STT adapter to read.
pub struct CpalMicSource {
    buffers: MicBuffers,
    active: Arc<StdMutex<Option<Stream>>>,
}

// cpal::Stream is not Send on some platforms (raw CoreAudio handles). We
// only ever touch it from behind `active`'s mutex, one thread at a time, the
// same way the teacher's AudioPlayer asserts Send for its OutputStream.
unsafe impl Send for CpalMicSource {}
unsafe impl Sync for CpalMicSource {}

impl CpalMicSource {
    pub fn new() -> Self {
        Self { buffers: Arc::new(StdMutex::new(HashMap::new())), active: Arc::new(StdMutex::new(None)) }
    }

    pub fn buffers(&self) -> MicBuffers {
        self.buffers.clone()
    }
}

impl Default for CpalMicSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MicSource for CpalMicSource {
    fn open(&self, session: Session) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
        let buffers = self.buffers.clone();
        let active = self.active.clone();
        Box::pin(async move {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| anyhow::anyhow!("no default input device available"))?;
            let config = device.default_input_config()?;
            let native_rate = config.sample_rate().0;
            let channels = config.channels();

            buffers.lock().unwrap().insert(session, Vec::new());
            let buffers_cb = buffers.clone();

            let stream = device.build_input_stream(
                &config.into(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = to_mono(data, channels);
                    let resampled = resample_linear(&mono, native_rate, TARGET_SAMPLE_RATE);
                    if let Some(buf) = buffers_cb.lock().unwrap().get_mut(&session) {
                        buf.extend_from_slice(&resampled);
                    }
                },
                |err| warn!("mic input stream error: {err}"),
                None,
            )?;
            stream.play()?;
            *active.lock().unwrap() = Some(stream);
            Ok(())
        })
    }

    fn close(&self, session: Session) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let active = self.active.clone();
        Box::pin(async move {
            let _ = session;
            active.lock().unwrap().take(); // dropping the Stream stops it
        })
    }
}

/// Speaker output backed by a rodio `Sink`.
///
/// `buffered_audio_seconds`/`is_queue_empty` are tracked from an expected
/// drain deadline rather than querying the sink directly (rodio doesn't
/// expose queued-sample counts), advanced every time a chunk is appended.
pub struct RodioPlayer {
    sample_rate_hz: u32,
    channels: u16,
    inner: StdMutex<Option<PlayerHandles>>,
    drain_deadline: StdMutex<Instant>,
    route_transition: std::sync::atomic::AtomicBool,
}

struct PlayerHandles {
    _stream: OutputStream,
    _stream_handle: OutputStreamHandle,
    sink: Sink,
}

// Same rationale as CpalMicSource: OutputStream is !Send on some platforms;
// access is always serialized through `inner`'s mutex.
unsafe impl Send for RodioPlayer {}
unsafe impl Sync for RodioPlayer {}

impl RodioPlayer {
    pub fn new(sample_rate_hz: u32, channels: u16) -> Self {
        Self {
            sample_rate_hz,
            channels,
            inner: StdMutex::new(None),
            drain_deadline: StdMutex::new(Instant::now()),
            route_transition: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn open_device() -> anyhow::Result<PlayerHandles> {
        let (stream, stream_handle) =
            OutputStream::try_default().map_err(|e| anyhow::anyhow!("failed to open audio output: {e}"))?;
        let sink = Sink::try_new(&stream_handle).map_err(|e| anyhow::anyhow!("failed to create sink: {e}"))?;
        Ok(PlayerHandles { _stream: stream, _stream_handle: stream_handle, sink })
    }
}

impl AudioOutputPlayer for RodioPlayer {
    fn initialize(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
        Box::pin(async move {
            let handles = Self::open_device()?;
            *self.inner.lock().unwrap() = Some(handles);
            Ok(())
        })
    }

    fn start_playback(&self, reassert_profile: bool) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
        Box::pin(async move {
            if reassert_profile {
                self.route_transition.store(true, std::sync::atomic::Ordering::SeqCst);
                let handles = Self::open_device()?;
                *self.inner.lock().unwrap() = Some(handles);
                self.route_transition.store(false, std::sync::atomic::Ordering::SeqCst);
            } else if let Some(handles) = self.inner.lock().unwrap().as_ref() {
                handles.sink.play();
            }
            Ok(())
        })
    }

    fn stop_playback(&self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            if let Some(handles) = self.inner.lock().unwrap().as_ref() {
                handles.sink.stop();
            }
            *self.drain_deadline.lock().unwrap() = Instant::now();
        })
    }

    fn clear_queue(&self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            if let Some(handles) = self.inner.lock().unwrap().as_ref() {
                handles.sink.stop();
            }
            *self.drain_deadline.lock().unwrap() = Instant::now();
        })
    }

    fn add_audio_data(&self, samples: Vec<f32>) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> {
        Box::pin(async move {
            let count = samples.len();
            let buf = SamplesBuffer::new(self.channels, self.sample_rate_hz, samples);
            let inner = self.inner.lock().unwrap();
            let handles = inner.as_ref().ok_or_else(|| anyhow::anyhow!("player not initialized"))?;
            handles.sink.append(buf);
            drop(inner);

            let frames = count as f64 / self.channels.max(1) as f64;
            let duration = Duration::from_secs_f64(frames / self.sample_rate_hz.max(1) as f64);
            let mut deadline = self.drain_deadline.lock().unwrap();
            let now = Instant::now();
            *deadline = if *deadline > now { *deadline + duration } else { now + duration };
            Ok(())
        })
    }

    fn is_queue_empty(&self) -> Pin<Box<dyn Future<Output = bool> + Send>> {
        Box::pin(async move { Instant::now() >= *self.drain_deadline.lock().unwrap() })
    }

    fn buffered_audio_seconds(&self) -> Pin<Box<dyn Future<Output = f64> + Send>> {
        Box::pin(async move {
            let remaining = self.drain_deadline.lock().unwrap().saturating_duration_since(Instant::now());
            remaining.as_secs_f64()
        })
    }

    fn is_route_transition_in_flight(&self) -> Pin<Box<dyn Future<Output = bool> + Send>> {
        Box::pin(async move { self.route_transition.load(std::sync::atomic::Ordering::SeqCst) })
    }
}

//! cpal output for decoded PCM.
//!
//! ```text
//!   decoder stdout ──► feeder task (tokio) ──► mpsc<Vec<i16>> ──► cpal callback
//!                                                                  (device thread)
//! ```
//!
//! The device thread is the device context: it owns the cpal host/device and
//! the current output stream, and lives as long as the sink.  Each `open`
//! builds a fresh stream and feeder for the new session.
//!
//! The stream format is negotiated once when the context starts.  When no
//! supported range covers the preferred rate and channel count, the device's
//! own default is used and the decoder is asked to resample to it.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use spiral_proto::state::VolumeState;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AudioSink, PcmFormat, SampleFormat};
use crate::error::PlayerError;
use crate::supervisor::{DecoderPipes, PipeReader};

/// Bytes per read from the decoder's stdout.
const FEED_CHUNK: usize = 8192;

/// Chunks buffered between feeder and callback (~0.75s at 44.1kHz stereo).
const FEED_QUEUE: usize = 16;

/// Upper bound on device-thread round trips.
const DEVICE_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// State read by the output callback.
#[derive(Debug)]
struct OutputShared {
    gain_bits: AtomicU32,
    playing: AtomicBool,
}

impl OutputShared {
    fn new(gain: f32) -> Self {
        Self {
            gain_bits: AtomicU32::new(gain.to_bits()),
            playing: AtomicBool::new(false),
        }
    }

    fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    fn set_gain(&self, gain: f32) {
        self.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }
}

/// A supported output configuration range, reduced to what negotiation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputRange {
    channels: u16,
    min_rate: u32,
    max_rate: u32,
    sample_format: cpal::SampleFormat,
}

impl OutputRange {
    fn covers(&self, format: PcmFormat) -> bool {
        self.channels == format.channels
            && self.min_rate <= format.sample_rate
            && format.sample_rate <= self.max_rate
    }
}

impl From<&cpal::SupportedStreamConfigRange> for OutputRange {
    fn from(range: &cpal::SupportedStreamConfigRange) -> Self {
        Self {
            channels: range.channels(),
            min_rate: range.min_sample_rate().0,
            max_rate: range.max_sample_rate().0,
            sample_format: range.sample_format(),
        }
    }
}

impl From<&cpal::SupportedStreamConfig> for OutputRange {
    fn from(config: &cpal::SupportedStreamConfig) -> Self {
        Self {
            channels: config.channels(),
            min_rate: config.sample_rate().0,
            max_rate: config.sample_rate().0,
            sample_format: config.sample_format(),
        }
    }
}

/// Sample formats the output callback can render.
fn renderable(sample_format: cpal::SampleFormat) -> bool {
    matches!(
        sample_format,
        cpal::SampleFormat::F32 | cpal::SampleFormat::I16 | cpal::SampleFormat::U16
    )
}

/// Choose the stream the device is opened with.
///
/// A supported range covering `preferred` wins, favouring the default's
/// sample format.  Otherwise the device default's rate and channel count are
/// used as-is.
fn negotiate(
    preferred: PcmFormat,
    ranges: &[OutputRange],
    default: Option<OutputRange>,
) -> Option<(PcmFormat, cpal::SampleFormat)> {
    let covering = || {
        ranges
            .iter()
            .filter(|r| r.covers(preferred) && renderable(r.sample_format))
    };
    let matched = default
        .and_then(|d| covering().find(|r| r.sample_format == d.sample_format))
        .or_else(|| covering().next());
    if let Some(range) = matched {
        return Some((preferred, range.sample_format));
    }

    let fallback = default.filter(|d| renderable(d.sample_format) && d.channels > 0)?;
    let format = PcmFormat {
        sample_rate: fallback.min_rate,
        channels: fallback.channels,
        sample_format: SampleFormat::S16Le,
    };
    Some((format, fallback.sample_format))
}

/// Wait on the device thread without stalling the other tasks of a
/// multi-threaded runtime.
fn wait_for_device<T>(wait: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(wait)
        }
        _ => wait(),
    }
}

enum DeviceCommand {
    Open {
        chunks: mpsc::Receiver<Vec<i16>>,
        reply: std::sync::mpsc::Sender<Result<(), String>>,
    },
    Play,
    Pause,
    Close,
}

struct DeviceContext {
    commands: std::sync::mpsc::Sender<DeviceCommand>,
    /// Format the stream was negotiated at.
    format: PcmFormat,
    _thread: JoinHandle<()>,
}

impl DeviceContext {
    fn start(preferred: PcmFormat, shared: Arc<OutputShared>) -> Result<Self, PlayerError> {
        let (commands, command_rx) = std::sync::mpsc::channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("audio-device".to_string())
            .spawn(move || device_thread(preferred, shared, command_rx, ready_tx))
            .map_err(|e| PlayerError::DeviceInit(e.to_string()))?;

        match wait_for_device(|| ready_rx.recv_timeout(DEVICE_REPLY_TIMEOUT)) {
            Ok(Ok(format)) => Ok(Self {
                commands,
                format,
                _thread: thread,
            }),
            Ok(Err(e)) => Err(PlayerError::DeviceInit(e)),
            Err(_) => Err(PlayerError::DeviceInit(
                "audio device did not become ready".to_string(),
            )),
        }
    }

    fn send(&self, command: DeviceCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

struct SessionPlayer {
    cancel: CancellationToken,
}

/// PCM sink on the default output device.
pub struct DeviceSink {
    /// Asked of the device; the negotiated format may differ.
    preferred: PcmFormat,
    context: Option<DeviceContext>,
    player: Option<SessionPlayer>,
    volume: VolumeState,
    shared: Arc<OutputShared>,
}

impl DeviceSink {
    /// No device is touched until the first `output_format` or `open`.
    pub fn new(preferred: PcmFormat, initial_volume: f32) -> Self {
        let volume = VolumeState::new(initial_volume);
        Self {
            preferred,
            context: None,
            player: None,
            shared: Arc::new(OutputShared::new(volume.volume())),
            volume,
        }
    }

    fn ensure_context(&mut self) -> Result<&DeviceContext, PlayerError> {
        if self.context.is_none() {
            let context = DeviceContext::start(self.preferred, Arc::clone(&self.shared))?;
            self.context = Some(context);
        }
        self.context
            .as_ref()
            .ok_or_else(|| PlayerError::DeviceInit("audio device unavailable".to_string()))
    }

    fn send(&mut self, command: DeviceCommand) {
        let alive = match &self.context {
            Some(context) => context.send(command),
            None => return,
        };
        if !alive {
            warn!("audio: device thread is gone");
            self.context = None;
        }
    }
}

impl AudioSink for DeviceSink {
    fn output_format(&mut self) -> Result<PcmFormat, PlayerError> {
        Ok(self.ensure_context()?.format)
    }

    fn open(&mut self, pipes: &mut DecoderPipes) -> Result<(), PlayerError> {
        self.close();
        let audio = pipes.audio.take().ok_or(PlayerError::MissingPipe("audio"))?;

        let (chunk_tx, chunk_rx) = mpsc::channel(FEED_QUEUE);
        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        let context = self.ensure_context()?;
        if !context.send(DeviceCommand::Open {
            chunks: chunk_rx,
            reply: reply_tx,
        }) {
            self.context = None;
            return Err(PlayerError::DeviceInit("audio device thread stopped".to_string()));
        }
        match wait_for_device(|| reply_rx.recv_timeout(DEVICE_REPLY_TIMEOUT)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(PlayerError::DeviceInit(e)),
            Err(_) => {
                return Err(PlayerError::DeviceInit(
                    "audio device did not open a stream".to_string(),
                ))
            }
        }

        let cancel = CancellationToken::new();
        tokio::spawn(feed_pcm(audio, chunk_tx, cancel.clone()));
        self.player = Some(SessionPlayer { cancel });
        Ok(())
    }

    fn play(&mut self) {
        if self.player.is_none() {
            debug!("audio: play without a loaded player");
            return;
        }
        self.shared.playing.store(true, Ordering::Relaxed);
        self.send(DeviceCommand::Play);
    }

    fn pause(&mut self) {
        if self.player.is_none() {
            return;
        }
        self.shared.playing.store(false, Ordering::Relaxed);
        self.send(DeviceCommand::Pause);
    }

    fn close(&mut self) {
        self.shared.playing.store(false, Ordering::Relaxed);
        if let Some(player) = self.player.take() {
            player.cancel.cancel();
            self.send(DeviceCommand::Close);
        }
    }

    fn is_open(&self) -> bool {
        self.player.is_some()
    }

    fn is_playing(&self) -> bool {
        if self.player.is_none() {
            debug!("audio: player not loaded");
            return false;
        }
        self.shared.playing.load(Ordering::Relaxed)
    }

    fn set_volume(&mut self, volume: f32) {
        let volume = self.volume.set(volume);
        self.shared.set_gain(volume);
    }

    fn volume(&self) -> f32 {
        self.volume.volume()
    }

    fn mute(&mut self) {
        let volume = self.volume.toggle_mute();
        self.shared.set_gain(volume);
    }
}

impl Drop for DeviceSink {
    fn drop(&mut self) {
        self.close();
    }
}

// ── feeder ────────────────────────────────────────────────────────────────────

/// Turns a byte stream of s16le samples into whole samples, carrying an odd
/// trailing byte into the next push.
#[derive(Debug, Default)]
pub struct PcmAssembler {
    carry: Option<u8>,
}

impl PcmAssembler {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<i16> {
        let mut samples = Vec::with_capacity(bytes.len() / 2 + 1);
        let mut rest = bytes;
        if let Some(lo) = self.carry.take() {
            match rest.split_first() {
                Some((&hi, tail)) => {
                    samples.push(i16::from_le_bytes([lo, hi]));
                    rest = tail;
                }
                None => {
                    self.carry = Some(lo);
                    return samples;
                }
            }
        }
        let mut pairs = rest.chunks_exact(2);
        for pair in &mut pairs {
            samples.push(i16::from_le_bytes([pair[0], pair[1]]));
        }
        self.carry = pairs.remainder().first().copied();
        samples
    }
}

pub fn pcm_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

async fn feed_pcm(mut audio: PipeReader, chunks: mpsc::Sender<Vec<i16>>, cancel: CancellationToken) {
    feed_samples(&mut audio, chunks, cancel).await;
    debug!("audio: feeder exiting");
}

async fn feed_samples<R>(audio: &mut R, chunks: mpsc::Sender<Vec<i16>>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut assembler = PcmAssembler::default();
    let mut buf = vec![0u8; FEED_CHUNK];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            read = audio.read(&mut buf) => match read {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    debug!("audio: read error: {}", e);
                    return;
                }
            },
        };
        let samples = assembler.push(&buf[..n]);
        if samples.is_empty() {
            continue;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = chunks.send(samples) => if sent.is_err() {
                return;
            },
        }
    }
}

// ── device thread ─────────────────────────────────────────────────────────────

fn device_thread(
    preferred: PcmFormat,
    shared: Arc<OutputShared>,
    commands: std::sync::mpsc::Receiver<DeviceCommand>,
    ready: std::sync::mpsc::Sender<Result<PcmFormat, String>>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        let _ = ready.send(Err("no output device found".to_string()));
        return;
    };
    let ranges: Vec<OutputRange> = match device.supported_output_configs() {
        Ok(configs) => configs.map(|range| OutputRange::from(&range)).collect(),
        Err(e) => {
            debug!("audio: cannot list output configs: {}", e);
            Vec::new()
        }
    };
    let default = match device.default_output_config() {
        Ok(config) => Some(OutputRange::from(&config)),
        Err(e) => {
            debug!("audio: no default output config: {}", e);
            None
        }
    };
    let Some((format, sample_format)) = negotiate(preferred, &ranges, default) else {
        let _ = ready.send(Err("no usable output configuration".to_string()));
        return;
    };
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    if format != preferred {
        warn!(
            "audio: {} cannot play {}Hz/{}ch, decoder will resample",
            device_name, preferred.sample_rate, preferred.channels
        );
    }
    info!(
        "audio: using {} ({:?}, {}Hz, {} channels)",
        device_name, sample_format, format.sample_rate, format.channels
    );
    let _ = ready.send(Ok(format));

    let config = cpal::StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut stream: Option<cpal::Stream> = None;
    while let Ok(command) = commands.recv() {
        match command {
            DeviceCommand::Open { chunks, reply } => {
                stream = None;
                let built =
                    build_stream(&device, &config, sample_format, chunks, Arc::clone(&shared));
                match built {
                    Ok(s) => {
                        stream = Some(s);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        error!("audio: cannot open output stream: {}", e);
                        let _ = reply.send(Err(e));
                    }
                }
            }
            DeviceCommand::Play => {
                if let Some(s) = &stream {
                    if let Err(e) = s.play() {
                        warn!("audio: play failed: {}", e);
                    }
                }
            }
            DeviceCommand::Pause => {
                if let Some(s) = &stream {
                    if let Err(e) = s.pause() {
                        debug!("audio: pause failed: {}", e);
                    }
                }
            }
            DeviceCommand::Close => stream = None,
        }
    }
    debug!("audio: device thread exiting");
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    chunks: mpsc::Receiver<Vec<i16>>,
    shared: Arc<OutputShared>,
) -> Result<cpal::Stream, String> {
    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_typed::<f32>(device, config, chunks, shared),
        cpal::SampleFormat::I16 => build_typed::<i16>(device, config, chunks, shared),
        cpal::SampleFormat::U16 => build_typed::<u16>(device, config, chunks, shared),
        other => return Err(format!("unsupported sample format {:?}", other)),
    }
    .map_err(|e| e.to_string())?;

    // Some hosts start streams immediately; wait for an explicit play.
    if let Err(e) = stream.pause() {
        debug!("audio: initial pause failed: {}", e);
    }
    Ok(stream)
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut chunks: mpsc::Receiver<Vec<i16>>,
    shared: Arc<OutputShared>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let mut current: Vec<i16> = Vec::new();
    let mut pos = 0usize;

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            if !shared.playing.load(Ordering::Relaxed) {
                for sample in data.iter_mut() {
                    *sample = T::from_sample(0.0f32);
                }
                return;
            }
            let gain = shared.gain();
            for out in data.iter_mut() {
                if pos >= current.len() {
                    match chunks.try_recv() {
                        Ok(next) => {
                            current = next;
                            pos = 0;
                        }
                        Err(_) => {
                            // Underrun: silence until the feeder catches up.
                            *out = T::from_sample(0.0f32);
                            continue;
                        }
                    }
                }
                let sample = current.get(pos).copied().unwrap_or(0);
                pos += 1;
                *out = T::from_sample(pcm_to_f32(sample) * gain);
            }
        },
        |err| {
            error!("audio: stream error: {}", err);
        },
        None,
    )
}

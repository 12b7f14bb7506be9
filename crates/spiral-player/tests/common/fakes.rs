//! In-process stand-ins for the decoder process and the audio device.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use spiral_player::error::PlayerError;
use spiral_player::sink::{AudioSink, PcmFormat, PCM_FORMAT};
use spiral_player::supervisor::{ControlSender, DecoderPipes, InvocationMode, PipeReader, Supervisor};
use spiral_proto::config::DecoderKind;
use spiral_proto::state::VolumeState;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

const PIPE_BUFFER: usize = 4096;

/// What the fake supervisor has been asked to do.
#[derive(Debug, Default)]
pub struct DecoderLog {
    pub starts: Vec<(String, InvocationMode)>,
    /// PCM format each start was asked for.
    pub formats: Vec<PcmFormat>,
    pub terminations: usize,
    pub running: bool,
    pub fail_next_start: bool,
}

/// The far side of a fake decoder's pipes, held by the test.
pub struct FakeDecoder {
    pub diagnostics: DuplexStream,
    pub audio: Option<DuplexStream>,
    pub control: mpsc::Receiver<Vec<u8>>,
}

impl FakeDecoder {
    /// Write raw bytes to the diagnostic pipe.
    pub async fn say(&mut self, text: &str) {
        self.diagnostics
            .write_all(text.as_bytes())
            .await
            .expect("diagnostic pipe closed");
    }

    /// True once the controller side of the diagnostic pipe has been dropped.
    pub async fn diagnostics_released(&mut self) -> bool {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if self.diagnostics.write_all(b"\n").await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    /// True once every control sender on the controller side is gone.
    pub async fn control_released(&mut self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(2), self.control.recv()).await,
            Ok(None)
        )
    }
}

#[derive(Clone)]
pub struct FakeSupervisor {
    kind: DecoderKind,
    pub log: Arc<Mutex<DecoderLog>>,
    decoders: Arc<Mutex<Vec<FakeDecoder>>>,
}

impl FakeSupervisor {
    pub fn new(kind: DecoderKind) -> Self {
        Self {
            kind,
            log: Arc::new(Mutex::new(DecoderLog::default())),
            decoders: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Take the pipes of the most recently started decoder.
    pub fn take_decoder(&self) -> FakeDecoder {
        self.decoders
            .lock()
            .unwrap()
            .pop()
            .expect("no decoder was started")
    }

    pub fn starts(&self) -> Vec<(String, InvocationMode)> {
        self.log.lock().unwrap().starts.clone()
    }

    pub fn formats(&self) -> Vec<PcmFormat> {
        self.log.lock().unwrap().formats.clone()
    }

    pub fn terminations(&self) -> usize {
        self.log.lock().unwrap().terminations
    }

    pub fn fail_next_start(&self) {
        self.log.lock().unwrap().fail_next_start = true;
    }

    /// Simulate the process dying without the diagnostic pipe closing.
    pub fn crash(&self) {
        self.log.lock().unwrap().running = false;
    }
}

impl Supervisor for FakeSupervisor {
    fn kind(&self) -> DecoderKind {
        self.kind
    }

    fn start(
        &mut self,
        url: &str,
        mode: InvocationMode,
        format: PcmFormat,
    ) -> Result<DecoderPipes, PlayerError> {
        let mut log = self.log.lock().unwrap();
        if std::mem::take(&mut log.fail_next_start) {
            return Err(PlayerError::Spawn {
                program: "fake-decoder".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not installed"),
            });
        }
        log.starts.push((url.to_string(), mode));
        log.formats.push(format);
        log.running = true;

        let (diag_ours, diag_theirs) = tokio::io::duplex(PIPE_BUFFER);
        let (audio, audio_theirs) = match self.kind {
            DecoderKind::Ffmpeg => {
                let (ours, theirs) = tokio::io::duplex(PIPE_BUFFER);
                let ours: PipeReader = Box::new(ours);
                (Some(ours), Some(theirs))
            }
            DecoderKind::Mplayer => (None, None),
        };
        let (control, control_rx) = ControlSender::channel(8);
        self.decoders.lock().unwrap().push(FakeDecoder {
            diagnostics: diag_theirs,
            audio: audio_theirs,
            control: control_rx,
        });

        let diagnostics: PipeReader = Box::new(diag_ours);
        Ok(DecoderPipes {
            control,
            audio,
            diagnostics: Some(diagnostics),
        })
    }

    fn is_running(&mut self) -> bool {
        self.log.lock().unwrap().running
    }

    fn terminate(&mut self) {
        let mut log = self.log.lock().unwrap();
        if log.running {
            log.running = false;
            log.terminations += 1;
        }
    }
}

/// Records transport calls instead of driving a device.
pub struct FakeSink {
    volume: VolumeState,
    /// Reported by `output_format`, as a negotiated device format would be.
    pub format: PcmFormat,
    open: bool,
    playing: bool,
    pub opens: usize,
    pub fail_open: bool,
    audio: Option<PipeReader>,
    control: Option<ControlSender>,
}

impl FakeSink {
    pub fn new(volume: f32) -> Self {
        Self {
            volume: VolumeState::new(volume),
            format: PCM_FORMAT,
            open: false,
            playing: false,
            opens: 0,
            fail_open: false,
            audio: None,
            control: None,
        }
    }

    pub fn holds_audio(&self) -> bool {
        self.audio.is_some()
    }
}

impl AudioSink for FakeSink {
    fn output_format(&mut self) -> Result<PcmFormat, PlayerError> {
        Ok(self.format)
    }

    fn open(&mut self, pipes: &mut DecoderPipes) -> Result<(), PlayerError> {
        if self.fail_open {
            return Err(PlayerError::DeviceInit("no device".to_string()));
        }
        self.close();
        self.audio = pipes.audio.take();
        self.control = Some(pipes.control.clone());
        self.open = true;
        self.opens += 1;
        Ok(())
    }

    fn play(&mut self) {
        if self.open {
            self.playing = true;
        }
    }

    fn pause(&mut self) {
        self.playing = false;
    }

    fn close(&mut self) {
        self.open = false;
        self.playing = false;
        self.audio = None;
        self.control = None;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn is_playing(&self) -> bool {
        self.open && self.playing
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume.set(volume);
    }

    fn volume(&self) -> f32 {
        self.volume.volume()
    }

    fn mute(&mut self) {
        self.volume.toggle_mute();
    }
}

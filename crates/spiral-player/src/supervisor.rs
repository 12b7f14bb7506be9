//! Decoder process supervision.
//!
//! ```text
//!   DecoderSupervisor::start(url, mode, format)
//!         │
//!         ├── spawn decoder (ffmpeg | mplayer) with kind-specific args
//!         ├── control_writer_task  ← ControlSender (mpsc) → child stdin
//!         └── DecoderPipes { control, audio: stdout?, diagnostics }
//! ```
//!
//! ffmpeg writes PCM to stdout and its log to stderr.  mplayer renders audio
//! itself, prints status on stdout and errors on stderr (sent to a log file).
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use spiral_proto::config::DecoderKind;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::PlayerError;
use crate::sink::PcmFormat;

pub type PipeReader = Box<dyn AsyncRead + Send + Unpin>;

/// Pending control writes per session.  mplayer commands are tiny; if this
/// fills up the decoder has stopped reading stdin.
const CONTROL_QUEUE: usize = 64;

/// How a URL is handed to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// Direct audio stream.
    Stream,
    /// `.m3u` / `.pls` playlist that the decoder must resolve itself.
    Playlist,
}

impl InvocationMode {
    pub fn for_url(url: &str) -> Self {
        if is_playlist_url(url) {
            InvocationMode::Playlist
        } else {
            InvocationMode::Stream
        }
    }
}

impl std::fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationMode::Stream => f.write_str("stream"),
            InvocationMode::Playlist => f.write_str("playlist"),
        }
    }
}

/// True for URLs whose path ends in `.m3u` or `.pls` (query and fragment
/// ignored, case-insensitive).
pub fn is_playlist_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.to_ascii_lowercase();
    path.ends_with(".m3u") || path.ends_with(".pls")
}

/// Build the decoder argument list for `url`.  `format` is the PCM layout
/// ffmpeg resamples to; mplayer renders audio itself and ignores it.
pub fn decoder_args(
    kind: DecoderKind,
    url: &str,
    mode: InvocationMode,
    format: PcmFormat,
) -> Result<Vec<String>, PlayerError> {
    let args: Vec<String> = match (kind, mode) {
        (DecoderKind::Ffmpeg, InvocationMode::Stream) => {
            let rate = format.sample_rate.to_string();
            let channels = format.channels.to_string();
            [
                "-hide_banner",
                "-nostats",
                "-loglevel",
                "verbose",
                "-i",
                url,
                "-vn",
                "-ac",
                channels.as_str(),
                "-ar",
                rate.as_str(),
                "-f",
                "s16le",
                "-",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect()
        }
        // ffmpeg has no playlist front end; .pls in particular is unknown to it.
        (DecoderKind::Ffmpeg, InvocationMode::Playlist) => {
            return Err(PlayerError::UnsupportedMode { kind, mode });
        }
        (DecoderKind::Mplayer, mode) => {
            let mut args: Vec<String> = ["-slave", "-quiet", "-nolirc", "-vo", "null"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            if mode == InvocationMode::Playlist {
                args.push("-playlist".to_string());
            }
            args.push(url.to_string());
            args
        }
    };
    Ok(args)
}

/// Bytes that ask the decoder to quit, if it takes commands at all.
pub fn quit_command(kind: DecoderKind) -> Option<&'static [u8]> {
    match kind {
        DecoderKind::Ffmpeg => None,
        DecoderKind::Mplayer => Some(b"quit\n"),
    }
}

// ── control pipe ──────────────────────────────────────────────────────────────

/// Cloneable sender for bytes destined to the decoder's stdin.
#[derive(Debug, Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl ControlSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue bytes without waiting.  Returns false if the writer is gone or
    /// the queue is full.
    pub fn send(&self, bytes: impl Into<Vec<u8>>) -> bool {
        match self.tx.try_send(bytes.into()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("decoder control queue full, dropping command");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("decoder control pipe closed");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drains queued control bytes into the decoder's stdin.  Exits when every
/// `ControlSender` is dropped (closing stdin) or a write fails.
pub async fn control_writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = rx.recv().await {
        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            debug!("decoder control: write error: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!("decoder control: writer exiting");
}

// ── supervisor ────────────────────────────────────────────────────────────────

/// Pipes of one running decoder.  Consumers `take()` the readers they own.
pub struct DecoderPipes {
    pub control: ControlSender,
    /// Decoded PCM (ffmpeg only).
    pub audio: Option<PipeReader>,
    /// Line-oriented status text.
    pub diagnostics: Option<PipeReader>,
}

/// Owns the decoder child process.
pub trait Supervisor: Send {
    fn kind(&self) -> DecoderKind;

    /// Spawn the decoder for `url`, producing `format` if it outputs PCM.
    /// Any previous process is terminated first.
    fn start(
        &mut self,
        url: &str,
        mode: InvocationMode,
        format: PcmFormat,
    ) -> Result<DecoderPipes, PlayerError>;

    /// Non-blocking liveness check.
    fn is_running(&mut self) -> bool;

    /// Ask the decoder to quit, close our end of its pipes and reap it in the
    /// background.  Safe to call when nothing is running.
    fn terminate(&mut self);
}

pub struct DecoderSupervisor {
    kind: DecoderKind,
    program: Option<PathBuf>,
    grace: Duration,
    stderr_log: Option<PathBuf>,
    child: Option<Child>,
    control: Option<ControlSender>,
}

impl DecoderSupervisor {
    /// `program: None` means the binary was not found; `start` then fails
    /// with `DecoderNotFound` instead of at construction time.
    pub fn new(kind: DecoderKind, program: Option<PathBuf>, grace: Duration) -> Self {
        Self {
            kind,
            program,
            grace,
            stderr_log: None,
            child: None,
            control: None,
        }
    }

    /// Append mplayer's stderr to this file instead of discarding it.
    pub fn with_stderr_log(mut self, path: PathBuf) -> Self {
        self.stderr_log = Some(path);
        self
    }

    fn stderr_target(&self) -> Stdio {
        match self.kind {
            DecoderKind::Ffmpeg => Stdio::piped(),
            DecoderKind::Mplayer => {
                let Some(path) = &self.stderr_log else {
                    return Stdio::null();
                };
                match std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                {
                    Ok(file) => Stdio::from(file),
                    Err(e) => {
                        warn!("decoder: cannot open {:?} for stderr: {}", path, e);
                        Stdio::null()
                    }
                }
            }
        }
    }
}

impl Supervisor for DecoderSupervisor {
    fn kind(&self) -> DecoderKind {
        self.kind
    }

    fn start(
        &mut self,
        url: &str,
        mode: InvocationMode,
        format: PcmFormat,
    ) -> Result<DecoderPipes, PlayerError> {
        if self.child.is_some() {
            self.terminate();
        }

        let args = decoder_args(self.kind, url, mode, format)?;
        let program = self
            .program
            .clone()
            .ok_or(PlayerError::DecoderNotFound(self.kind))?;

        let mut command = tokio::process::Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(self.stderr_target())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = command.spawn().map_err(|source| PlayerError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        info!(
            "decoder: started {} (pid {:?}) for {} {}",
            self.kind,
            child.id(),
            mode,
            url
        );

        let stdin = child.stdin.take().ok_or(PlayerError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(PlayerError::MissingPipe("stdout"))?;
        let stdout: PipeReader = Box::new(stdout);
        let (audio, diagnostics) = match self.kind {
            DecoderKind::Ffmpeg => {
                let stderr = child.stderr.take().ok_or(PlayerError::MissingPipe("stderr"))?;
                let stderr: PipeReader = Box::new(stderr);
                (Some(stdout), stderr)
            }
            DecoderKind::Mplayer => (None, stdout),
        };

        let (control, control_rx) = ControlSender::channel(CONTROL_QUEUE);
        tokio::spawn(control_writer_task(stdin, control_rx));

        self.child = Some(child);
        self.control = Some(control.clone());

        Ok(DecoderPipes {
            control,
            audio,
            diagnostics: Some(diagnostics),
        })
    }

    fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    fn terminate(&mut self) {
        let control = self.control.take();
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let (Some(quit), Some(control)) = (quit_command(self.kind), control.as_ref()) {
            control.send(quit);
        }
        drop(control);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(reap(child, self.kind, self.grace));
            }
            Err(_) => {
                // No runtime left (process shutdown): kill outright.
                if let Err(e) = child.start_kill() {
                    debug!("decoder: kill during shutdown failed: {}", e);
                }
            }
        }
    }
}

impl Drop for DecoderSupervisor {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Give the decoder `grace` to exit on its own, then kill it.
async fn reap(mut child: Child, kind: DecoderKind, grace: Duration) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("decoder: {} exited with {}", kind, status),
        Ok(Err(e)) => warn!("decoder: waiting for {} failed: {}", kind, e),
        Err(_) => {
            warn!("decoder: {} still running after {:?}, killing", kind, grace);
            if let Err(e) = child.kill().await {
                warn!("decoder: kill failed: {}", e);
            }
        }
    }
}

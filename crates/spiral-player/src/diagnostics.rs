//! Decoder diagnostic stream parsing.
//!
//! The decoder's status text is split into lines (across read boundaries),
//! each line is classified against the decoder's vocabulary, and a
//! per-session task forwards the resulting metadata to the controller.
use futures_util::{Stream, StreamExt};
use spiral_proto::config::DecoderKind;
use spiral_proto::protocol::MetadataEvent;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const READ_CHUNK: usize = 4096;

/// Lines longer than this are flushed without a terminator.
const MAX_LINE: usize = 64 * 1024;

/// Marker strings a decoder prints on its diagnostic stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vocabulary {
    pub decoder: &'static str,
    /// Printed once the output stream is open and audio is flowing.
    pub started_marker: &'static str,
    /// Precedes the new stream title.
    pub title_marker: &'static str,
    /// Ends the title, if the decoder quotes it.
    pub title_terminator: Option<&'static str>,
}

impl Vocabulary {
    pub const FFMPEG: Vocabulary = Vocabulary {
        decoder: "ffmpeg",
        started_marker: "Output #0",
        title_marker: "StreamTitle: ",
        title_terminator: None,
    };

    /// `ICY Info: StreamTitle='Artist - Song';StreamUrl='';`
    pub const MPLAYER: Vocabulary = Vocabulary {
        decoder: "mplayer",
        started_marker: "Starting playback...",
        title_marker: "StreamTitle='",
        title_terminator: Some("';"),
    };

    pub fn for_decoder(kind: DecoderKind) -> Self {
        match kind {
            DecoderKind::Ffmpeg => Self::FFMPEG,
            DecoderKind::Mplayer => Self::MPLAYER,
        }
    }

    pub fn classify(&self, line: &str) -> DiagnosticLine {
        if line.contains(self.started_marker) {
            return DiagnosticLine::PlaybackStarted;
        }
        if let Some((_, rest)) = line.split_once(self.title_marker) {
            let title = match self.title_terminator {
                Some(end) => rest.split_once(end).map_or(rest, |(title, _)| title),
                None => rest,
            };
            let title = title.trim();
            if !title.is_empty() {
                return DiagnosticLine::TitleChanged(title.to_string());
            }
        }
        DiagnosticLine::Other(line.to_string())
    }
}

/// One classified diagnostic line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticLine {
    PlaybackStarted,
    TitleChanged(String),
    Other(String),
}

// ── line buffering ────────────────────────────────────────────────────────────

/// Carries partial lines between reads.  `\n`, `\r\n` and bare `\r` all end
/// a line; empty lines are dropped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete line, if the buffer holds one.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let end = match self.buf.iter().position(|&b| b == b'\n' || b == b'\r') {
                Some(end) => end,
                None if self.buf.len() >= MAX_LINE => self.buf.len(),
                None => return None,
            };
            let line: Vec<u8> = self.buf.drain(..end).collect();
            if !self.buf.is_empty() {
                self.buf.remove(0);
            }
            if !line.is_empty() {
                return Some(String::from_utf8_lossy(&line).into_owned());
            }
        }
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        if rest.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&rest).into_owned())
        }
    }
}

// ── reader ────────────────────────────────────────────────────────────────────

/// Reads and classifies diagnostic lines until the pipe closes or errors.
pub struct DiagnosticReader<R> {
    reader: R,
    vocabulary: Vocabulary,
    lines: LineBuffer,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R> DiagnosticReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, vocabulary: Vocabulary) -> Self {
        Self {
            reader,
            vocabulary,
            lines: LineBuffer::default(),
            chunk: vec![0u8; READ_CHUNK],
            eof: false,
        }
    }

    /// `None` once the stream is exhausted; never restarts.
    pub async fn next_line(&mut self) -> Option<DiagnosticLine> {
        loop {
            if let Some(line) = self.lines.next_line() {
                return Some(self.vocabulary.classify(&line));
            }
            if self.eof {
                return self
                    .lines
                    .finish()
                    .map(|line| self.vocabulary.classify(&line));
            }
            match self.reader.read(&mut self.chunk).await {
                Ok(0) => self.eof = true,
                Ok(n) => self.lines.extend(&self.chunk[..n]),
                Err(e) => {
                    debug!("{}: diagnostic read error: {}", self.vocabulary.decoder, e);
                    self.eof = true;
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = DiagnosticLine> {
        futures_util::stream::unfold(self, |mut reader| async move {
            reader.next_line().await.map(|line| (line, reader))
        })
    }
}

// ── per-session ordering ──────────────────────────────────────────────────────

/// Enforces per-session ordering: one `PlaybackStarted`, always before any
/// title.  A title seen early is held until the start marker; repeats of the
/// current title are dropped.
#[derive(Debug, Default)]
pub struct MetadataGate {
    started: bool,
    held_title: Option<String>,
    last_title: Option<String>,
}

impl MetadataGate {
    pub fn admit(&mut self, line: DiagnosticLine) -> Vec<MetadataEvent> {
        let mut out = Vec::new();
        match line {
            DiagnosticLine::PlaybackStarted if !self.started => {
                self.started = true;
                out.push(MetadataEvent::PlaybackStarted);
                if let Some(title) = self.held_title.take() {
                    self.push_title(title, &mut out);
                }
            }
            DiagnosticLine::PlaybackStarted => {}
            DiagnosticLine::TitleChanged(title) if self.started => {
                self.push_title(title, &mut out);
            }
            DiagnosticLine::TitleChanged(title) => self.held_title = Some(title),
            DiagnosticLine::Other(_) => {}
        }
        out
    }

    /// Drops a title equal to the last one emitted.
    fn push_title(&mut self, title: String, out: &mut Vec<MetadataEvent>) {
        if self.last_title.as_deref() == Some(title.as_str()) {
            return;
        }
        self.last_title = Some(title.clone());
        out.push(MetadataEvent::TitleChanged(title));
    }
}

// ── session task ──────────────────────────────────────────────────────────────

/// Message from a session's diagnostic task to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: u64,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    Metadata(MetadataEvent),
    /// The diagnostic stream ended: the decoder is gone.
    Exited,
}

/// Watch one session's diagnostic pipe until it closes or `cancel` fires.
/// `Exited` is only reported for a natural end of stream.
pub async fn watch_diagnostics<R>(
    reader: R,
    vocabulary: Vocabulary,
    session: u64,
    cancel: CancellationToken,
    events: mpsc::Sender<SessionEvent>,
    log_output: bool,
) where
    R: AsyncRead + Unpin,
{
    let lines = DiagnosticReader::new(reader, vocabulary).into_stream();
    tokio::pin!(lines);
    let mut gate = MetadataGate::default();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("session {}: diagnostics cancelled", session);
                return;
            }
            line = lines.next() => line,
        };
        let Some(line) = line else {
            break;
        };

        if let DiagnosticLine::Other(text) = &line {
            if log_output {
                info!(target: "decoder", "[{}] {}", vocabulary.decoder, text);
            }
            continue;
        }

        for event in gate.admit(line) {
            let event = SessionEvent {
                session,
                kind: SessionEventKind::Metadata(event),
            };
            if events.send(event).await.is_err() {
                return;
            }
        }
    }

    debug!("session {}: {} diagnostic stream closed", session, vocabulary.decoder);
    if !cancel.is_cancelled() {
        let _ = events
            .send(SessionEvent {
                session,
                kind: SessionEventKind::Exited,
            })
            .await;
    }
}

//! Playback controller: the state machine that ties supervisor, sink and
//! diagnostic parser together.
//!
//! ```text
//!   PlayerHandle ──► mpsc<PlayerRequest> ──┐
//!                                          ├──► PlayerCore::run ──► broadcast<PlayerEvent>
//!   session task ──► mpsc<SessionEvent> ───┘
//! ```
//!
//! `PlayerCore` is the single owner of the session; every operation runs on
//! its task, so no locking is needed around session fields.
use spiral_proto::protocol::{MetadataEvent, PlayerEvent};
use spiral_proto::state::{clamp_volume, PlayState, PlayerSnapshot, VOLUME_STEP};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diagnostics::{watch_diagnostics, SessionEvent, SessionEventKind, Vocabulary};
use crate::error::PlayerError;
use crate::sink::AudioSink;
use crate::supervisor::{InvocationMode, Supervisor};

const REQUEST_QUEUE: usize = 32;
const SESSION_QUEUE: usize = 64;

/// One Load-to-Stop lifetime of a stream.
struct Session {
    id: u64,
    url: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    started: bool,
}

pub struct PlayerCore<S, K> {
    supervisor: S,
    sink: K,
    vocabulary: Vocabulary,
    session: Option<Session>,
    /// URL to reload on `play` after the decoder went away by itself.
    last_url: Option<String>,
    state: PlayState,
    title: Option<String>,
    next_session: u64,
    session_tx: mpsc::Sender<SessionEvent>,
    session_rx: mpsc::Receiver<SessionEvent>,
    events: broadcast::Sender<PlayerEvent>,
    log_decoder_output: bool,
}

impl<S: Supervisor, K: AudioSink> PlayerCore<S, K> {
    pub fn new(supervisor: S, sink: K, events: broadcast::Sender<PlayerEvent>) -> Self {
        let (session_tx, session_rx) = mpsc::channel(SESSION_QUEUE);
        Self {
            vocabulary: Vocabulary::for_decoder(supervisor.kind()),
            supervisor,
            sink,
            session: None,
            last_url: None,
            state: PlayState::Stopped,
            title: None,
            next_session: 1,
            session_tx,
            session_rx,
            events,
            log_decoder_output: false,
        }
    }

    /// Log every non-metadata decoder line under the `decoder` target.
    pub fn with_decoder_output_logging(mut self, enabled: bool) -> Self {
        self.log_decoder_output = enabled;
        self
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Id of the live session, if any.
    pub fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            state: self.state,
            volume: self.sink.volume(),
            muted: self.sink.is_muted(),
            is_playing: self.sink.is_playing(),
            url: self
                .session
                .as_ref()
                .map(|s| s.url.clone())
                .or_else(|| self.last_url.clone()),
            title: self.title.clone(),
        }
    }

    // ── operations ────────────────────────────────────────────────────────

    pub fn load(&mut self, url: &str) -> Result<(), PlayerError> {
        if self.state != PlayState::Stopped || self.sink.is_playing() {
            debug!("player: load ignored while {}", self.state.label());
            return Ok(());
        }
        // A session whose exit has not been processed yet.
        self.teardown();

        let mode = InvocationMode::for_url(url);
        let format = self.sink.output_format()?;
        let mut pipes = self.supervisor.start(url, mode, format)?;
        if let Err(e) = self.sink.open(&mut pipes) {
            self.supervisor.terminate();
            return Err(e);
        }
        let Some(diagnostics) = pipes.diagnostics.take() else {
            self.sink.close();
            self.supervisor.terminate();
            return Err(PlayerError::MissingPipe("diagnostics"));
        };

        let id = self.next_session;
        self.next_session += 1;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watch_diagnostics(
            diagnostics,
            self.vocabulary,
            id,
            cancel.clone(),
            self.session_tx.clone(),
            self.log_decoder_output,
        ));

        info!("player: session {} loading {} ({})", id, url, mode);
        self.session = Some(Session {
            id,
            url: url.to_string(),
            cancel,
            task,
            started: false,
        });
        self.last_url = Some(url.to_string());
        self.title = None;
        self.set_state(PlayState::Loading);
        self.emit(PlayerEvent::VolumeChanged {
            volume: self.sink.volume(),
        });
        Ok(())
    }

    pub fn play(&mut self) -> Result<(), PlayerError> {
        let decoder_gone = self.session.is_some() && !self.supervisor.is_running();
        if self.session.is_none() || decoder_gone {
            let Some(url) = self.last_url.clone() else {
                debug!("player: play with nothing loaded");
                return Err(PlayerError::NotLoaded);
            };
            if decoder_gone {
                info!("player: decoder is gone, reloading {}", url);
                self.teardown();
                self.set_state(PlayState::Stopped);
            }
            self.load(&url)?;
        }

        if !self.sink.is_playing() {
            self.sink.play();
        }
        if self.state == PlayState::Paused {
            self.set_state(PlayState::Playing);
        }
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), PlayerError> {
        if self.session.is_none() {
            return Err(PlayerError::NotLoaded);
        }
        if self.state != PlayState::Playing {
            debug!("player: pause ignored while {}", self.state.label());
            return Ok(());
        }
        self.sink.pause();
        self.set_state(PlayState::Paused);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), PlayerError> {
        if !matches!(self.state, PlayState::Playing | PlayState::Paused) {
            debug!("player: stop ignored while {}", self.state.label());
            return Ok(());
        }
        self.teardown();
        self.last_url = None;
        self.set_state(PlayState::Stopped);
        Ok(())
    }

    pub fn mute(&mut self) -> Result<(), PlayerError> {
        if self.session.is_none() {
            return Err(PlayerError::NotLoaded);
        }
        self.sink.mute();
        self.emit(PlayerEvent::VolumeChanged {
            volume: self.sink.volume(),
        });
        Ok(())
    }

    pub fn inc_volume(&mut self) -> Result<(), PlayerError> {
        self.step_volume(VOLUME_STEP)
    }

    pub fn dec_volume(&mut self) -> Result<(), PlayerError> {
        self.step_volume(-VOLUME_STEP)
    }

    fn step_volume(&mut self, delta: f32) -> Result<(), PlayerError> {
        if self.session.is_none() {
            return Err(PlayerError::NotLoaded);
        }
        if self.state != PlayState::Playing {
            return Ok(());
        }
        let volume = clamp_volume(self.sink.volume() + delta);
        self.sink.set_volume(volume);
        self.emit(PlayerEvent::VolumeChanged {
            volume: self.sink.volume(),
        });
        Ok(())
    }

    /// Tear down from any state.  Never blocks; the decoder is reaped in the
    /// background.
    pub fn close(&mut self) {
        self.teardown();
        self.last_url = None;
        self.set_state(PlayState::Stopped);
    }

    // ── session events ────────────────────────────────────────────────────

    pub fn handle_session_event(&mut self, event: SessionEvent) {
        let Some(session) = self.session.as_mut().filter(|s| s.id == event.session) else {
            debug!("player: dropping event from stale session {}", event.session);
            return;
        };

        match event.kind {
            SessionEventKind::Metadata(MetadataEvent::PlaybackStarted) => {
                session.started = true;
                info!("player: session {} started", session.id);
                self.emit(PlayerEvent::PlaybackStarted);
                if self.state == PlayState::Loading {
                    if !self.sink.is_playing() {
                        self.sink.play();
                    }
                    self.set_state(PlayState::Playing);
                }
            }
            SessionEventKind::Metadata(MetadataEvent::TitleChanged(title)) => {
                info!("player: now playing {}", title);
                self.title = Some(title.clone());
                self.emit(PlayerEvent::TitleChanged { title });
            }
            SessionEventKind::Exited => {
                let started = session.started;
                let url = session.url.clone();
                self.teardown();
                self.set_state(PlayState::Stopped);
                if started {
                    info!("player: {} ended", url);
                } else {
                    warn!("player: decoder exited before playback of {} started", url);
                    self.emit(PlayerEvent::Error {
                        message: format!("{}: {}", PlayerError::DecoderExited, url),
                    });
                }
            }
        }
    }

    /// Wait for the next event from a session task.
    pub async fn next_session_event(&mut self) -> Option<SessionEvent> {
        self.session_rx.recv().await
    }

    // ── actor loop ────────────────────────────────────────────────────────

    pub async fn run(mut self, mut requests: mpsc::Receiver<PlayerRequest>) {
        info!("player: controller running ({})", self.supervisor.kind());
        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    if !self.handle_request(request) {
                        break;
                    }
                }
                Some(event) = self.session_rx.recv() => {
                    self.handle_session_event(event);
                }
            }
        }
        self.close();
        info!("player: controller stopped");
    }

    /// Returns false when the loop should exit.
    fn handle_request(&mut self, request: PlayerRequest) -> bool {
        match request {
            PlayerRequest::Run { op, reply } => {
                let name = op.name();
                let result = self.apply(op);
                if let Err(e) = &result {
                    if e.is_benign() {
                        debug!("player: {}: {}", name, e);
                    } else {
                        warn!("player: {} failed: {}", name, e);
                    }
                }
                let _ = reply.send(result);
                true
            }
            PlayerRequest::Status { reply } => {
                let _ = reply.send(self.snapshot());
                true
            }
            PlayerRequest::Shutdown { reply } => {
                self.close();
                let _ = reply.send(());
                false
            }
        }
    }

    fn apply(&mut self, op: Operation) -> Result<(), PlayerError> {
        match op {
            Operation::Load(url) => self.load(&url),
            Operation::Play => self.play(),
            Operation::Pause => self.pause(),
            Operation::Stop => self.stop(),
            Operation::Mute => self.mute(),
            Operation::VolumeUp => self.inc_volume(),
            Operation::VolumeDown => self.dec_volume(),
            Operation::Close => {
                self.close();
                Ok(())
            }
        }
    }

    // ── helpers ───────────────────────────────────────────────────────────

    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("player: tearing down session {}", session.id);
            session.cancel.cancel();
            drop(session.task);
        }
        self.sink.close();
        self.supervisor.terminate();
        self.title = None;
    }

    fn set_state(&mut self, state: PlayState) {
        if self.state == state {
            return;
        }
        debug!("player: {} -> {}", self.state.label(), state.label());
        self.state = state;
        self.emit(PlayerEvent::StateChanged { state });
    }

    fn emit(&self, event: PlayerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

// ── requests and handle ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Load(String),
    Play,
    Pause,
    Stop,
    Mute,
    VolumeUp,
    VolumeDown,
    Close,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Load(_) => "load",
            Operation::Play => "play",
            Operation::Pause => "pause",
            Operation::Stop => "stop",
            Operation::Mute => "mute",
            Operation::VolumeUp => "volume up",
            Operation::VolumeDown => "volume down",
            Operation::Close => "close",
        }
    }
}

pub enum PlayerRequest {
    Run {
        op: Operation,
        reply: oneshot::Sender<Result<(), PlayerError>>,
    },
    Status {
        reply: oneshot::Sender<PlayerSnapshot>,
    },
    /// Close and stop the controller task.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cloneable front-end side of a running controller.
#[derive(Clone)]
pub struct PlayerHandle {
    requests: mpsc::Sender<PlayerRequest>,
    events: broadcast::Sender<PlayerEvent>,
}

impl PlayerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    async fn run(&self, op: Operation) -> Result<(), PlayerError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(PlayerRequest::Run { op, reply })
            .await
            .map_err(|_| PlayerError::Closed)?;
        rx.await.map_err(|_| PlayerError::Closed)?
    }

    pub async fn load(&self, url: impl Into<String>) -> Result<(), PlayerError> {
        self.run(Operation::Load(url.into())).await
    }

    pub async fn play(&self) -> Result<(), PlayerError> {
        self.run(Operation::Play).await
    }

    pub async fn pause(&self) -> Result<(), PlayerError> {
        self.run(Operation::Pause).await
    }

    pub async fn stop(&self) -> Result<(), PlayerError> {
        self.run(Operation::Stop).await
    }

    pub async fn mute(&self) -> Result<(), PlayerError> {
        self.run(Operation::Mute).await
    }

    pub async fn inc_volume(&self) -> Result<(), PlayerError> {
        self.run(Operation::VolumeUp).await
    }

    pub async fn dec_volume(&self) -> Result<(), PlayerError> {
        self.run(Operation::VolumeDown).await
    }

    pub async fn close(&self) -> Result<(), PlayerError> {
        self.run(Operation::Close).await
    }

    pub async fn status(&self) -> Result<PlayerSnapshot, PlayerError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(PlayerRequest::Status { reply })
            .await
            .map_err(|_| PlayerError::Closed)?;
        rx.await.map_err(|_| PlayerError::Closed)
    }

    /// Close the session and end the controller task.
    pub async fn shutdown(&self) -> Result<(), PlayerError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(PlayerRequest::Shutdown { reply })
            .await
            .map_err(|_| PlayerError::Closed)?;
        rx.await.map_err(|_| PlayerError::Closed)
    }
}

/// Run `core` on its own task.
pub fn spawn<S, K>(core: PlayerCore<S, K>) -> (PlayerHandle, JoinHandle<()>)
where
    S: Supervisor + 'static,
    K: AudioSink + 'static,
{
    let (requests, rx) = mpsc::channel(REQUEST_QUEUE);
    let handle = PlayerHandle {
        requests,
        events: core.events.clone(),
    };
    let task = tokio::spawn(core.run(rx));
    (handle, task)
}

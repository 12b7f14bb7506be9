use serde::{Deserialize, Serialize};

use crate::state::{PlayState, PlayerSnapshot};

/// Commands a front end sends to the player.
///
/// Accepted on stdin either as JSON (`{"cmd":"Load","url":"..."}`) or as the
/// short text form parsed by [`PlayerCommand::parse_line`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd")]
pub enum PlayerCommand {
    /// `url: None` means the configured default stream.
    Load { url: Option<String> },
    Play,
    Pause,
    /// Load and play when idle, stop when playing.
    Toggle,
    Stop,
    Mute,
    VolumeUp,
    VolumeDown,
    Status,
    Close,
    Quit,
}

impl PlayerCommand {
    /// Parse one input line. JSON objects are decoded as-is, anything else
    /// is read as a whitespace-separated text command. Blank lines are `None`.
    pub fn parse_line(line: &str) -> anyhow::Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        if line.starts_with('{') {
            return Ok(Some(serde_json::from_str(line)?));
        }

        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or_default().to_ascii_lowercase();
        let arg = parts.next().map(str::to_string);
        let cmd = match verb.as_str() {
            "load" | "open" => PlayerCommand::Load { url: arg },
            "play" | "resume" => PlayerCommand::Play,
            "pause" => PlayerCommand::Pause,
            "toggle" | "t" => PlayerCommand::Toggle,
            "stop" | "s" => PlayerCommand::Stop,
            "mute" | "m" => PlayerCommand::Mute,
            "up" | "+" | "vol+" => PlayerCommand::VolumeUp,
            "down" | "-" | "vol-" => PlayerCommand::VolumeDown,
            "status" | "?" => PlayerCommand::Status,
            "close" => PlayerCommand::Close,
            "quit" | "exit" | "q" => PlayerCommand::Quit,
            other => anyhow::bail!("unknown command '{}'", other),
        };
        Ok(Some(cmd))
    }
}

/// Metadata observed on the decoder's diagnostic stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataEvent {
    PlaybackStarted,
    TitleChanged(String),
}

/// Notifications from the player to its consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum PlayerEvent {
    PlaybackStarted,
    TitleChanged { title: String },
    StateChanged { state: PlayState },
    VolumeChanged { volume: f32 },
    /// Reply to a status request.
    Status { snapshot: PlayerSnapshot },
    /// Load failure or decoder exit before playback started.
    Error { message: String },
    /// WARN/ERROR log records forwarded to the front end.
    Log { message: String },
}

impl PlayerEvent {
    /// Serialise as one JSON line (no trailing newline).
    pub fn to_json_line(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

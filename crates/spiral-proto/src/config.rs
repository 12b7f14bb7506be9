use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;
use super::state::clamp_volume;

pub const RADIOSPIRAL_STREAM: &str = "https://radiospiral.radio:8000/stream.mp3";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which external program decodes the stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    /// Decodes to raw PCM on stdout; audio is rendered by our own sink.
    #[default]
    Ffmpeg,
    /// Renders audio itself and takes slave-mode commands on stdin.
    Mplayer,
}

impl DecoderKind {
    pub fn name(self) -> &'static str {
        match self {
            DecoderKind::Ffmpeg => "ffmpeg",
            DecoderKind::Mplayer => "mplayer",
        }
    }
}

impl std::fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for DecoderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ffmpeg" => Ok(DecoderKind::Ffmpeg),
            "mplayer" => Ok(DecoderKind::Mplayer),
            other => anyhow::bail!("unknown decoder '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[serde(default)]
    pub decoder: DecoderKind,
    /// Explicit decoder executable; skips the binary search when set.
    #[serde(default)]
    pub decoder_path: Option<PathBuf>,
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    #[serde(default = "default_volume")]
    pub default_volume: f32,
    /// Forward every decoder diagnostic line to the log.
    #[serde(default)]
    pub log_decoder_output: bool,
    /// How long a terminated decoder gets to exit before it is killed.
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            decoder: DecoderKind::default(),
            decoder_path: None,
            stream_url: default_stream_url(),
            default_volume: default_volume(),
            log_decoder_output: false,
            terminate_grace_ms: default_terminate_grace_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_to_file: false,
            filter: default_log_filter(),
        }
    }
}

fn default_stream_url() -> String {
    RADIOSPIRAL_STREAM.to_string()
}

fn default_volume() -> f32 {
    1.0
}

fn default_terminate_grace_ms() -> u64 {
    1500
}

fn default_log_filter() -> String {
    "info,spiral_player=debug".to_string()
}

impl PlayerConfig {
    /// Resolve the decoder executable: explicit path first, then the
    /// platform search for the configured decoder.
    pub fn decoder_binary(&self) -> Option<PathBuf> {
        if let Some(path) = &self.decoder_path {
            return Some(path.clone());
        }
        match self.decoder {
            DecoderKind::Ffmpeg => platform::find_ffmpeg_binary(),
            DecoderKind::Mplayer => platform::find_mplayer_binary(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.player.default_volume = clamp_volume(config.player.default_volume);
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

use serde::{Deserialize, Serialize};

/// Fixed step used by volume up/down.
pub const VOLUME_STEP: f32 = 0.05;

/// Playback state of the controller.
///
/// Transitions:
///   Stopped -> Loading -> Playing <-> Paused -> Stopped
///   any -> Stopped (close / decoder exit)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlayState {
    #[default]
    Stopped,
    /// Decoder spawned, waiting for its output stream to open.
    Loading,
    Playing,
    Paused,
}

impl PlayState {
    /// Short label for status lines.
    pub fn label(self) -> &'static str {
        match self {
            PlayState::Stopped => "stopped",
            PlayState::Loading => "buffering",
            PlayState::Playing => "playing",
            PlayState::Paused => "paused",
        }
    }
}

/// Linear output level in `0.0..=1.0` plus the level to restore on unmute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeState {
    volume: f32,
    remembered: f32,
}

impl VolumeState {
    pub fn new(volume: f32) -> Self {
        let volume = clamp_volume(volume);
        Self {
            volume,
            remembered: volume,
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn is_muted(&self) -> bool {
        self.volume == 0.0
    }

    pub fn set(&mut self, volume: f32) -> f32 {
        self.volume = clamp_volume(volume);
        self.volume
    }

    /// Toggle between silence and the remembered level. Returns the new level.
    pub fn toggle_mute(&mut self) -> f32 {
        if self.volume > 0.0 {
            self.remembered = self.volume;
            self.volume = 0.0;
        } else {
            self.volume = self.remembered;
        }
        self.volume
    }
}

impl Default for VolumeState {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Clamp to `0.0..=1.0` and snap to hundredths.
///
/// Every level the player can reach goes through here, so a step up
/// followed by a step down lands exactly where it started.
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        return 0.0;
    }
    (volume.clamp(0.0, 1.0) * 100.0).round() / 100.0
}

/// Point-in-time view of the controller for front ends.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PlayerSnapshot {
    pub state: PlayState,
    pub volume: f32,
    pub muted: bool,
    /// True while the sink is actually producing sound.
    pub is_playing: bool,
    pub url: Option<String>,
    pub title: Option<String>,
}

use spiral_proto::config::DecoderKind;
use thiserror::Error;

use crate::supervisor::InvocationMode;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("failed to start decoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} binary not found")]
    DecoderNotFound(DecoderKind),

    #[error("{kind} cannot open {mode} URLs")]
    UnsupportedMode {
        kind: DecoderKind,
        mode: InvocationMode,
    },

    #[error("no stream loaded")]
    NotLoaded,

    #[error("decoder exited")]
    DecoderExited,

    #[error("audio device init failed: {0}")]
    DeviceInit(String),

    #[error("decoder did not expose its {0} pipe")]
    MissingPipe(&'static str),

    #[error("player task is gone")]
    Closed,
}

impl PlayerError {
    /// Errors a front end can ignore: the call simply had no effect.
    pub fn is_benign(&self) -> bool {
        matches!(self, PlayerError::NotLoaded)
    }

    /// The decoder could not be started for this load attempt.
    pub fn is_spawn_error(&self) -> bool {
        matches!(
            self,
            PlayerError::Spawn { .. }
                | PlayerError::DecoderNotFound(_)
                | PlayerError::UnsupportedMode { .. }
                | PlayerError::MissingPipe(_)
        )
    }
}

//! Backend selection: one controller, two decoder/sink pairings.
use std::time::Duration;

use spiral_proto::config::{DecoderKind, PlayerConfig};
use spiral_proto::platform;
use spiral_proto::protocol::PlayerEvent;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::controller::{self, PlayerCore, PlayerHandle};
use crate::sink::{CommandSink, DeviceSink, PCM_FORMAT};
use crate::supervisor::DecoderSupervisor;

pub const MPLAYER_LOG_FILE: &str = "mplayer.log";

pub enum Player {
    /// ffmpeg decodes to PCM, cpal renders it.
    Ffmpeg(PlayerCore<DecoderSupervisor, DeviceSink>),
    /// mplayer decodes and renders; driven through slave commands.
    Mplayer(PlayerCore<DecoderSupervisor, CommandSink>),
}

impl Player {
    pub fn from_config(config: &PlayerConfig, events: broadcast::Sender<PlayerEvent>) -> Self {
        let program = config.decoder_binary();
        match &program {
            Some(path) => info!("player: {} at {:?}", config.decoder, path),
            None => warn!("player: no {} binary found", config.decoder),
        }
        let grace = Duration::from_millis(config.terminate_grace_ms);
        let supervisor = DecoderSupervisor::new(config.decoder, program, grace);

        match config.decoder {
            DecoderKind::Ffmpeg => {
                let sink = DeviceSink::new(PCM_FORMAT, config.default_volume);
                Player::Ffmpeg(
                    PlayerCore::new(supervisor, sink, events)
                        .with_decoder_output_logging(config.log_decoder_output),
                )
            }
            DecoderKind::Mplayer => {
                let supervisor = if config.log_decoder_output {
                    supervisor.with_stderr_log(platform::data_dir().join(MPLAYER_LOG_FILE))
                } else {
                    supervisor
                };
                let sink = CommandSink::new(config.default_volume);
                Player::Mplayer(
                    PlayerCore::new(supervisor, sink, events)
                        .with_decoder_output_logging(config.log_decoder_output),
                )
            }
        }
    }

    pub fn kind(&self) -> DecoderKind {
        match self {
            Player::Ffmpeg(_) => DecoderKind::Ffmpeg,
            Player::Mplayer(_) => DecoderKind::Mplayer,
        }
    }

    /// Start the controller task for whichever backend this is.
    pub fn spawn(self) -> (PlayerHandle, JoinHandle<()>) {
        match self {
            Player::Ffmpeg(core) => controller::spawn(core),
            Player::Mplayer(core) => controller::spawn(core),
        }
    }
}

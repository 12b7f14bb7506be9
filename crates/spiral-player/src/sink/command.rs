use spiral_proto::state::VolumeState;
use tracing::debug;

use super::AudioSink;
use crate::error::PlayerError;
use crate::supervisor::{ControlSender, DecoderPipes};

/// Sink for decoders that play audio themselves and take slave-mode
/// commands on stdin.
///
/// mplayer's `pause` toggles, so the paused state is tracked here.  Volume is
/// sent as an absolute percentage with `pausing_keep` so that adjusting it
/// does not resume a paused decoder.
pub struct CommandSink {
    control: Option<ControlSender>,
    volume: VolumeState,
    playing: bool,
}

impl CommandSink {
    pub fn new(initial_volume: f32) -> Self {
        Self {
            control: None,
            volume: VolumeState::new(initial_volume),
            playing: false,
        }
    }

    fn send(&self, command: &str) {
        if let Some(control) = &self.control {
            control.send(command);
        }
    }

    fn send_volume(&self) {
        let pct = (self.volume.volume() * 100.0).round() as u32;
        self.send(&format!("pausing_keep volume {} 1\n", pct));
    }
}

impl AudioSink for CommandSink {
    fn open(&mut self, pipes: &mut DecoderPipes) -> Result<(), PlayerError> {
        self.close();
        self.control = Some(pipes.control.clone());
        // mplayer starts rendering by itself once the stream opens.
        self.playing = true;
        self.send_volume();
        Ok(())
    }

    fn play(&mut self) {
        if self.control.is_none() {
            debug!("command sink: play without decoder");
            return;
        }
        if !self.playing {
            self.send("pause\n");
            self.playing = true;
        }
    }

    fn pause(&mut self) {
        if self.playing {
            self.send("pause\n");
            self.playing = false;
        }
    }

    fn close(&mut self) {
        self.control = None;
        self.playing = false;
    }

    fn is_open(&self) -> bool {
        self.control.is_some()
    }

    fn is_playing(&self) -> bool {
        match &self.control {
            Some(control) => self.playing && !control.is_closed(),
            None => false,
        }
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume.set(volume);
        self.send_volume();
    }

    fn volume(&self) -> f32 {
        self.volume.volume()
    }

    fn mute(&mut self) {
        self.volume.toggle_mute();
        self.send_volume();
    }
}

//! Audio output adapters.
//!
//! `DeviceSink` renders decoded PCM through cpal; `CommandSink` drives a
//! decoder that renders audio itself (mplayer slave mode).  Both expose the
//! same transport and an absolute linear volume in `0.0..=1.0`.
mod command;
mod device;

pub use command::CommandSink;
pub use device::{pcm_to_f32, DeviceSink, PcmAssembler};

use crate::error::PlayerError;
use crate::supervisor::DecoderPipes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian, interleaved.
    S16Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl PcmFormat {
    pub const fn bytes_per_frame(&self) -> usize {
        match self.sample_format {
            SampleFormat::S16Le => 2 * self.channels as usize,
        }
    }
}

/// Preferred decoder output.  A device sink may negotiate another rate or
/// channel count.
pub const PCM_FORMAT: PcmFormat = PcmFormat {
    sample_rate: 44100,
    channels: 2,
    sample_format: SampleFormat::S16Le,
};

pub trait AudioSink: Send {
    /// PCM layout the decoder should produce for this sink.  Device sinks
    /// negotiate it with the hardware the first time it is asked for.
    fn output_format(&mut self) -> Result<PcmFormat, PlayerError> {
        Ok(PCM_FORMAT)
    }

    /// Attach to a freshly started decoder, taking the pipes this sink needs.
    /// Creates a new per-session player; any previous one is closed.
    fn open(&mut self, pipes: &mut DecoderPipes) -> Result<(), PlayerError>;

    fn play(&mut self);

    fn pause(&mut self);

    /// Drop the per-session player.  Shared device state is kept.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// True while sound is actually being produced.
    fn is_playing(&self) -> bool;

    /// Absolute level; clamped to `0.0..=1.0`.
    fn set_volume(&mut self, volume: f32);

    fn volume(&self) -> f32;

    /// Toggle between silence and the level before muting.
    fn mute(&mut self);

    fn is_muted(&self) -> bool {
        self.volume() == 0.0
    }
}

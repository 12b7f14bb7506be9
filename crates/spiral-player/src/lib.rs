//! Stream-playback controller for the RadioSpiral client.
//!
//! An external decoder (ffmpeg or mplayer) fetches and decodes the stream;
//! this crate supervises it, routes its audio to the output device, reads
//! its diagnostic output for now-playing metadata and exposes the result as
//! a small play/pause/stop/volume state machine.
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod player;
pub mod sink;
pub mod supervisor;
pub mod ticker;

pub use controller::{PlayerCore, PlayerHandle};
pub use error::PlayerError;
pub use player::Player;

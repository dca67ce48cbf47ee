use std::collections::TryReserveError;
use std::io;

use thiserror::Error;

/// Errors reported by a PCM device while the playback thread writes to it
#[derive(Debug, Error)]
pub enum DeviceError {
    /// the device ran dry before the next period arrived; recoverable
    #[error("audio underrun")]
    Underrun,
    /// the device stopped consuming samples altogether
    #[error("audio device stalled: no progress for {0} ms")]
    Stalled(u64),
    #[error("audio stream error: {0}")]
    Stream(String),
}

impl DeviceError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DeviceError::Underrun)
    }
}

/// Unrecoverable audio failures, surfaced to whoever owns the sink
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no audio output device available")]
    NoDevice,
    #[error("no supported output configuration (need i16 or f32 samples)")]
    NoSupportedConfig,
    #[error("cannot query output configurations: {0}")]
    SupportedConfigs(#[from] cpal::SupportedStreamConfigsError),
    #[error("cannot build output stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),
    #[error("cannot start output stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),
    #[error("cannot spawn playback thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("playback thread exited before reporting the device format")]
    OpenAborted,
    #[error("playback thread panicked")]
    Panicked,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Failures while serialising a frame to the terminal
#[derive(Debug, Error)]
pub enum DisplayError {
    /// the frame is dropped, emulation carries on
    #[error("cannot allocate encode buffer: {0}")]
    Alloc(#[from] TryReserveError),
    #[error("terminal write failed: {0}")]
    Io(#[from] io::Error),
}

/// A program image the machine could not accept
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read program image: {0}")]
    Io(#[from] io::Error),
    #[error("program image is {0} bytes, need at least 2 for the load address")]
    TooShort(usize),
    #[error("program image rejected: {0}")]
    Rejected(String),
}

/// Fatal conditions that end the pacing loop
#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error("terminal output failed: {0}")]
    Display(#[source] io::Error),
    #[error("input failed: {0}")]
    Input(#[source] io::Error),
}

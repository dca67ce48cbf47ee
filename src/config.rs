use std::path::PathBuf;

use crate::emulator::{Schedule, ScheduledAction};
use crate::kitty::{CellGeometry, ImageSession, Personality};
use crate::pacing::FRAME_QUANTUM_US;
use crate::sound::AudioConfig;

/// frames to wait before loading a program, so the machine has booted (3s)
pub const DEFAULT_LOAD_FRAME: u64 = 90;

/// everything the binary can be told
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub quantum_us: u32,
    pub personality: Personality,
    pub cells: CellGeometry,
    /// fixed image id; random when unset
    pub image_id: Option<u32>,
    /// program image to load at `load_frame`
    pub program: Option<PathBuf>,
    pub load_frame: u64,
    /// stop after this many frames; run until quit when unset
    pub max_frames: Option<u64>,
    pub audio: AudioConfig,
    /// screen size of the built-in test card
    pub screen: (u32, u32),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            quantum_us: FRAME_QUANTUM_US,
            personality: Personality::default(),
            cells: CellGeometry::default(),
            image_id: None,
            program: None,
            load_frame: DEFAULT_LOAD_FRAME,
            max_frames: None,
            audio: AudioConfig::default(),
            screen: (320, 200),
        }
    }
}

impl Config {
    pub fn session(&self) -> ImageSession {
        match self.image_id {
            Some(id) => ImageSession::new(id),
            None => ImageSession::random(),
        }
    }

    /// one-shot actions implied by the config
    pub fn schedule(&self) -> Schedule {
        let mut schedule = Schedule::new();
        if let Some(path) = &self.program {
            schedule.at(self.load_frame, ScheduledAction::LoadProgram(path.clone()));
        }
        schedule
    }
}

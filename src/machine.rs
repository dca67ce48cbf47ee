//! The seam between the bridge and an emulator core.
//!
//! A core is stepped one quantum at a time and reports its output through a
//! [`Host`] borrowed for the duration of the step, so pixels and samples can
//! only ever arrive while the pacing loop is inside [`Machine::step`].
use std::f32::consts::TAU;

use tracing::info;

use crate::error::LoadError;

/// a 24-bit pixel colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Rgb { r, g, b }
    }

    /// unpack the `0x00BBGGRR` form cores use for palettes
    pub const fn from_abgr(color: u32) -> Self {
        Rgb {
            r: (color & 0xff) as u8,
            g: ((color >> 8) & 0xff) as u8,
            b: ((color >> 16) & 0xff) as u8,
        }
    }
}

/// what the bridge provides to a core while it runs
pub trait Host {
    /// one output sample, amplitude in [-1.0, 1.0]
    fn on_sample(&mut self, amplitude: f32);

    fn on_samples(&mut self, amplitudes: &[f32]) {
        for a in amplitudes {
            self.on_sample(*a);
        }
    }

    fn on_pixel(&mut self, x: u32, y: u32, color: Rgb);
}

/// a key code as the core understands it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(pub u8);

impl Key {
    pub const DEL: Key = Key(0x01);
    pub const CURSOR_LEFT: Key = Key(0x08);
    pub const CURSOR_RIGHT: Key = Key(0x09);
    pub const CURSOR_DOWN: Key = Key(0x0a);
    pub const CURSOR_UP: Key = Key(0x0b);
    pub const RETURN: Key = Key(0x0d);
    pub const SPACE: Key = Key(0x20);
}

/// where a program image went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramInfo {
    pub load_address: u16,
    pub len: usize,
}

impl ProgramInfo {
    /// read the little-endian load address that heads a program image
    pub fn parse(image: &[u8]) -> Result<ProgramInfo, LoadError> {
        match image {
            [lo, hi, ..] => Ok(ProgramInfo {
                load_address: u16::from_le_bytes([*lo, *hi]),
                len: image.len(),
            }),
            _ => Err(LoadError::TooShort(image.len())),
        }
    }
}

/// an emulator core, driven by the pacing loop
pub trait Machine {
    /// visible screen in pixels
    fn screen_size(&self) -> (u32, u32);

    /// advance emulated time, reporting output through `host`
    fn step(&mut self, quantum_us: u32, host: &mut dyn Host);

    fn key_down(&mut self, key: Key);

    fn key_up(&mut self, key: Key);

    /// copy a program image into emulated memory
    fn load_program(&mut self, image: &[u8]) -> Result<ProgramInfo, LoadError>;
}

/// the 16 colour palette, in core (ABGR) form
#[rustfmt::skip]
const PALETTE: [u32; 16] = [
    0xff000000, 0xffffffff, 0xff3e31a2, 0xffc1ba6d,
    0xffa93d8f, 0xff4ab556, 0xffc43c34, 0xff71e4d2,
    0xff296090, 0xff004c60, 0xff7269d8, 0xff5e5e5e,
    0xff8b8b8b, 0xff90fe9c, 0xffff8586, 0xffbbbbbb,
];

/// tone pitch before any key has been pressed
const BASE_PITCH_HZ: f32 = 440.0;

const TONE_VOLUME: f32 = 0.2;

/// A stand-in core for running the bridge without a real machine: colour
/// bars with a raster line sweeping down them, and a tone whose pitch
/// follows the last key pressed.
pub struct TestCard {
    width: u32,
    height: u32,
    sample_rate: u32,
    /// sub-sample remainder carried between steps, in sample-microseconds
    sample_debt: u64,
    phase: f32,
    pitch: f32,
    raster: u32,
    held: Option<Key>,
    program: Option<Vec<u8>>,
    samples: Vec<f32>,
}

impl TestCard {
    pub fn new(width: u32, height: u32, sample_rate: u32) -> Self {
        TestCard {
            width,
            height,
            sample_rate,
            sample_debt: 0,
            phase: 0.0,
            pitch: BASE_PITCH_HZ,
            raster: 0,
            held: None,
            program: None,
            samples: Vec::new(),
        }
    }

    /// the last program image accepted
    pub fn program(&self) -> Option<&[u8]> {
        self.program.as_deref()
    }

    /// samples owed for `quantum_us`, keeping the fraction for next time
    fn samples_for(&mut self, quantum_us: u32) -> usize {
        let total = self.sample_debt + self.sample_rate as u64 * quantum_us as u64;
        self.sample_debt = total % 1_000_000;
        (total / 1_000_000) as usize
    }

    fn bar_color(&self, x: u32) -> Rgb {
        let bar = (x as usize * PALETTE.len()) / self.width.max(1) as usize;
        Rgb::from_abgr(PALETTE[bar % PALETTE.len()])
    }
}

impl Machine for TestCard {
    fn screen_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn step(&mut self, quantum_us: u32, host: &mut dyn Host) {
        for y in 0..self.height {
            for x in 0..self.width {
                let color = if y == self.raster {
                    Rgb::from_abgr(PALETTE[1])
                } else {
                    self.bar_color(x)
                };
                host.on_pixel(x, y, color);
            }
        }
        self.raster = (self.raster + 1) % self.height.max(1);

        let count = self.samples_for(quantum_us);
        let step = TAU * self.pitch / self.sample_rate.max(1) as f32;
        self.samples.clear();
        for _ in 0..count {
            self.samples.push(self.phase.sin() * TONE_VOLUME);
            self.phase = (self.phase + step) % TAU;
        }
        host.on_samples(&self.samples);
    }

    fn key_down(&mut self, key: Key) {
        self.held = Some(key);
        // a semitone per key code above the base pitch, wrapped to two octaves
        self.pitch = BASE_PITCH_HZ * 2f32.powf((key.0 % 24) as f32 / 12.0);
    }

    fn key_up(&mut self, key: Key) {
        if self.held == Some(key) {
            self.held = None;
        }
    }

    fn load_program(&mut self, image: &[u8]) -> Result<ProgramInfo, LoadError> {
        let info = ProgramInfo::parse(image)?;
        info!(
            "loaded {} byte program at ${:04x}",
            info.len, info.load_address
        );
        self.program = Some(image.to_vec());
        Ok(info)
    }
}

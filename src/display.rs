use std::io;

use crate::error::DisplayError;
use crate::kitty::{CellGeometry, ImageSession, KittyEncoder, Personality};
use crate::machine::Rgb;

/// Display is used by the pacing loop to put finished frames on screen. It
/// should abstract the implementation details, so a variety of kinds of
/// screen would work.
pub trait Display {
    /// show a complete frame
    fn draw(&mut self, frame: &Framebuffer) -> Result<(), DisplayError>;

    /// give back whatever the display holds on the other side
    fn release(&mut self) -> Result<(), DisplayError> {
        Ok(())
    }
}

/// packed 24-bit RGB pixels, row-major, fixed size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framebuffer {
    width: u32,
    height: u32,
    bytes: Box<[u8]>,
}

impl Framebuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Framebuffer {
            width,
            height,
            bytes: vec![0u8; width as usize * height as usize * 3].into_boxed_slice(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// off-screen coordinates are ignored
    pub fn set_pixel(&mut self, x: u32, y: u32, color: Rgb) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        self.bytes[offset..offset + 3].copy_from_slice(&[color.r, color.g, color.b]);
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        let px = &self.bytes[offset..offset + 3];
        Some(Rgb::new(px[0], px[1], px[2]))
    }

    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// image in a terminal, streamed with the kitty graphics protocol
pub struct KittyDisplay<W: io::Write> {
    encoder: KittyEncoder<W>,
    frame_index: u64,
}

impl<W: io::Write> KittyDisplay<W> {
    pub fn new(out: W, session: ImageSession, personality: Personality, cells: CellGeometry) -> Self {
        KittyDisplay {
            encoder: KittyEncoder::new(out, session, personality, cells),
            frame_index: 0,
        }
    }

    pub fn session(&self) -> ImageSession {
        self.encoder.session()
    }

    /// frames put on screen so far
    pub fn frames_shown(&self) -> u64 {
        self.frame_index
    }
}

impl<W: io::Write> Display for KittyDisplay<W> {
    fn draw(&mut self, frame: &Framebuffer) -> Result<(), DisplayError> {
        self.encoder.emit_frame(self.frame_index, frame)?;
        // a dropped frame 0 means the image still needs creating next time
        self.frame_index += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<(), DisplayError> {
        if self.frame_index == 0 {
            return Ok(());
        }
        self.encoder.release()
    }
}

/// useful for testing non-display routines
#[derive(Debug, Default)]
pub struct DummyDisplay {
    pub frames: u64,
    pub last: Option<Framebuffer>,
}

impl DummyDisplay {
    pub fn new() -> Self {
        DummyDisplay::default()
    }
}

impl Display for DummyDisplay {
    fn draw(&mut self, frame: &Framebuffer) -> Result<(), DisplayError> {
        self.frames += 1;
        self.last = Some(frame.clone());
        Ok(())
    }
}

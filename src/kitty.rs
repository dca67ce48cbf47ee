//! # kitty
//!
//! Encoder for the terminal graphics protocol: every frame is sent as raw
//! 24-bit RGB, base64 encoded and wrapped in APC escape sequences
//!
//! ```text
//! ESC _ G <key>=<value>,... ; <payload> ESC \
//! ```
//!
//! Keys used here:
//!  * `a` action: `T` transmit and display, `t` transmit, `a` animate, `d` delete
//!  * `i` image id, shared by every frame of one session
//!  * `f` pixel format, always 24 (RGB)
//!  * `s`, `v` width and height in pixels
//!  * `c`, `r` number of terminal cells to cover (on `a=T`), or the frame to
//!    make current (`c` on `a=a`)
//!  * `m` more chunks follow (1) or this is the last one (0)
//!  * `q` quiet level; 2 suppresses every response from the terminal
//!
//! Payloads longer than [`CHUNK_SIZE`] are split over several records; only
//! the first one carries the control keys, the rest carry `m` alone.
use std::collections::TryReserveError;
use std::fmt;
use std::io::{self, Write};

use rand::Rng;
use tracing::debug;

use crate::display::Framebuffer;
use crate::error::DisplayError;

/// max encoded payload bytes in one escape sequence
pub const CHUNK_SIZE: usize = 4096;

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// every record starts with this...
const APC_START: &[u8] = b"\x1b_G";
/// ...and ends with this
const APC_END: &[u8] = b"\x1b\\";

/// size of the encoding of `len` raw bytes
pub fn encoded_len(len: usize) -> usize {
    4 * len.div_ceil(3)
}

/// base64 encode `raw`, standard alphabet and `=` padding
pub fn encode(raw: &[u8]) -> String {
    let mut out = String::new();
    // a plain String grows on demand; only encode_into reports failure
    out.reserve(encoded_len(raw.len()));
    push_encoded(raw, &mut out);
    out
}

/// Encode into a reusable buffer, replacing its contents. Reports rather
/// than aborts when the buffer can't grow.
pub fn encode_into(raw: &[u8], out: &mut String) -> Result<(), TryReserveError> {
    out.clear();
    out.try_reserve(encoded_len(raw.len()))?;
    push_encoded(raw, out);
    Ok(())
}

fn push_encoded(raw: &[u8], out: &mut String) {
    for group in raw.chunks(3) {
        let b0 = group[0] as u32;
        let b1 = group.get(1).copied().unwrap_or(0) as u32;
        let b2 = group.get(2).copied().unwrap_or(0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;

        out.push(ALPHABET[(triple >> 18) as usize & 0x3f] as char);
        out.push(ALPHABET[(triple >> 12) as usize & 0x3f] as char);
        match group.len() {
            1 => out.push_str("=="),
            2 => {
                out.push(ALPHABET[(triple >> 6) as usize & 0x3f] as char);
                out.push('=');
            }
            _ => {
                out.push(ALPHABET[(triple >> 6) as usize & 0x3f] as char);
                out.push(ALPHABET[triple as usize & 0x3f] as char);
            }
        }
    }
}

/// How a terminal wants image updates delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Personality {
    /// retransmitting under the same id replaces the picture on screen
    #[default]
    Immediate,
    /// the terminal buffers a retransmit until told to animate to it
    Animated,
}

/// id binding successive frames to one on-screen image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSession(u32);

impl ImageSession {
    /// zero means "no id" to the terminal, so it's bumped to 1
    pub fn new(id: u32) -> Self {
        ImageSession(id.max(1))
    }

    pub fn random() -> Self {
        ImageSession(rand::thread_rng().gen_range(1..=u32::MAX))
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ImageSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// how many terminal cells the image covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellGeometry {
    pub cols: u16,
    pub rows: u16,
}

impl Default for CellGeometry {
    fn default() -> Self {
        CellGeometry { cols: 30, rows: 10 }
    }
}

/// Turns framebuffers into protocol records on `out`. Buffers are kept
/// between frames so steady state doesn't allocate.
pub struct KittyEncoder<W: Write> {
    out: W,
    session: ImageSession,
    personality: Personality,
    cells: CellGeometry,
    payload: String,
    frame: Vec<u8>,
}

impl<W: Write> KittyEncoder<W> {
    pub fn new(out: W, session: ImageSession, personality: Personality, cells: CellGeometry) -> Self {
        KittyEncoder {
            out,
            session,
            personality,
            cells,
            payload: String::new(),
            frame: Vec::new(),
        }
    }

    pub fn session(&self) -> ImageSession {
        self.session
    }

    /// Send one frame. Frame 0 creates and places the image, later frames
    /// update it. The frame goes out in a single write followed by a flush.
    pub fn emit_frame(&mut self, frame_index: u64, framebuffer: &Framebuffer) -> Result<(), DisplayError> {
        encode_into(framebuffer.as_bytes(), &mut self.payload)?;
        let records = self.payload.len().div_ceil(CHUNK_SIZE).max(1);

        self.frame.clear();
        // control keys, escape framing and the animate record stay well under 128 bytes each
        self.frame.try_reserve(self.payload.len() + records * 32 + 256)?;

        let (width, height) = (framebuffer.width(), framebuffer.height());
        let id = self.session;
        let control = if frame_index == 0 {
            format!(
                "a=T,i={},f=24,s={},v={},q=2,c={},r={}",
                id, width, height, self.cells.cols, self.cells.rows
            )
        } else {
            format!("a=t,i={},f=24,s={},v={},q=2", id, width, height)
        };
        push_records(&mut self.frame, &control, self.payload.as_bytes())?;

        if frame_index == 0 {
            self.frame.extend_from_slice(b"\r\n");
        } else if self.personality == Personality::Animated {
            write_record(&mut self.frame, &format!("a=a,i={},c=1,q=2", id), b"")?;
        }

        self.out.write_all(&self.frame)?;
        self.out.flush()?;
        debug!(
            "frame {}: {} payload bytes in {} record(s)",
            frame_index,
            self.payload.len(),
            records
        );
        Ok(())
    }

    /// drop the image and free its storage in the terminal
    pub fn release(&mut self) -> Result<(), DisplayError> {
        self.frame.clear();
        write_record(&mut self.frame, &format!("a=d,d=I,i={},q=2", self.session), b"")?;
        self.out.write_all(&self.frame)?;
        self.out.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn output(&self) -> &W {
        &self.out
    }
}

fn write_record(out: &mut Vec<u8>, control: &str, payload: &[u8]) -> io::Result<()> {
    out.write_all(APC_START)?;
    out.write_all(control.as_bytes())?;
    out.write_all(b";")?;
    out.write_all(payload)?;
    out.write_all(APC_END)
}

/// split `payload` across as many records as CHUNK_SIZE demands
fn push_records(out: &mut Vec<u8>, control: &str, payload: &[u8]) -> io::Result<()> {
    if payload.len() <= CHUNK_SIZE {
        return write_record(out, control, payload);
    }
    let count = payload.len().div_ceil(CHUNK_SIZE);
    for (i, chunk) in payload.chunks(CHUNK_SIZE).enumerate() {
        let more = (i + 1 < count) as u8;
        if i == 0 {
            write_record(out, &format!("{},m={}", control, more), chunk)?;
        } else {
            write_record(out, &format!("m={},q=2", more), chunk)?;
        }
    }
    Ok(())
}

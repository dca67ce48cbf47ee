use std::io;
use std::time::Duration;

use crossterm::event::{poll, read, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal;
use tracing::debug;

use crate::machine::Key;

/// most events taken from the terminal in one poll; the rest wait for the
/// next frame
pub const MAX_EVENTS_PER_FRAME: usize = 8;

/// what the pacing loop gets told about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Quit,
    /// a key to press and release on the emulated keyboard
    Key(Key),
}

/// reads keypresses, never blocking
pub trait Input {
    /// everything that arrived since the last poll, up to MAX_EVENTS_PER_FRAME
    fn poll(&mut self) -> Result<&[InputEvent], io::Error>;
}

/// Map a terminal key event to something the emulator understands. The
/// emulated keyboard types capitals unshifted, so letter case is swapped.
pub fn translate(event: &KeyEvent) -> Option<InputEvent> {
    if event.modifiers.contains(KeyModifiers::CONTROL) {
        return match event.code {
            KeyCode::Char('c') | KeyCode::Char('C') => Some(InputEvent::Quit),
            _ => None,
        };
    }
    let key = match event.code {
        KeyCode::Esc => return Some(InputEvent::Quit),
        KeyCode::Up => Key::CURSOR_UP,
        KeyCode::Down => Key::CURSOR_DOWN,
        KeyCode::Left => Key::CURSOR_LEFT,
        KeyCode::Right => Key::CURSOR_RIGHT,
        KeyCode::Backspace | KeyCode::Delete => Key::DEL,
        KeyCode::Enter => Key::RETURN,
        KeyCode::Char(c) if c.is_ascii_lowercase() => Key(c.to_ascii_uppercase() as u8),
        KeyCode::Char(c) if c.is_ascii_uppercase() => Key(c.to_ascii_lowercase() as u8),
        KeyCode::Char(c) if c.is_ascii_graphic() || c == ' ' => Key(c as u8),
        _ => return None,
    };
    Some(InputEvent::Key(key))
}

/// simple implementation of Input, using the controlling terminal in raw mode
pub struct StdinInput {
    buffer: Vec<InputEvent>,
}

impl StdinInput {
    pub fn new() -> Result<Self, io::Error> {
        terminal::enable_raw_mode()?;
        Ok(StdinInput {
            buffer: Vec::with_capacity(MAX_EVENTS_PER_FRAME),
        })
    }

    fn read_stdin(&mut self) -> Result<(), io::Error> {
        self.buffer.clear();
        while self.buffer.len() < MAX_EVENTS_PER_FRAME && poll(Duration::ZERO)? {
            match read()? {
                Event::Key(evt) => match translate(&evt) {
                    Some(mapped) => self.buffer.push(mapped),
                    None => debug!("can't map {:?} to an emulated key", evt.code),
                },
                other => debug!("ignoring terminal event {:?}", other),
            }
        }
        Ok(())
    }
}

impl Drop for StdinInput {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

impl Input for StdinInput {
    fn poll(&mut self) -> Result<&[InputEvent], io::Error> {
        self.read_stdin()?;
        Ok(self.buffer.as_slice())
    }
}

/// dummy Input implementation for testing: hands out one scripted batch per
/// poll, then nothing
pub struct DummyInput {
    batches: Vec<Vec<InputEvent>>,
    current: Vec<InputEvent>,
}

impl DummyInput {
    pub fn new(batches: Vec<Vec<InputEvent>>) -> Self {
        let mut batches = batches;
        batches.reverse();
        DummyInput {
            batches,
            current: Vec::new(),
        }
    }

    pub fn idle() -> Self {
        DummyInput::new(Vec::new())
    }
}

impl Input for DummyInput {
    fn poll(&mut self) -> Result<&[InputEvent], io::Error> {
        self.current = self.batches.pop().unwrap_or_default();
        self.current.truncate(MAX_EVENTS_PER_FRAME);
        Ok(self.current.as_slice())
    }
}

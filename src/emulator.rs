//! # emulator
//!
//! The pacing loop. Each iteration:
//!
//!  1. steps the machine by one quantum; pixels land in the framebuffer and
//!     samples in a staging buffer that's pushed to the sample queue in one go
//!  2. polls input without blocking and forwards key presses
//!  3. sends the finished frame to the display
//!  4. sleeps `quantum + (emulated - real)` so wall time keeps up with
//!     emulated time over the whole run, not just per frame
//!  5. runs any one-shot actions scheduled for this frame
//!
//! ```text
//!   Running --quit--> Stopping --resources released--> Stopped
//! ```
//!
//! A quit request is only looked at between iterations, so the frame in
//! flight always completes.
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::display::{Display, Framebuffer};
use crate::error::{DisplayError, EmulatorError, LoadError};
use crate::input::{Input, InputEvent};
use crate::machine::{Host, Machine, Rgb};
use crate::pacing::{Clock, Pacer};
use crate::queue::SampleQueue;
use crate::sink::AudioSink;

/// shared "please stop" flag
#[derive(Debug, Clone, Default)]
pub struct QuitSignal(Arc<AtomicBool>);

impl QuitSignal {
    pub fn new() -> Self {
        QuitSignal::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledAction {
    LoadProgram(PathBuf),
}

/// one-shot actions keyed on frame count
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pending: Vec<(u64, ScheduledAction)>,
}

impl Schedule {
    pub fn new() -> Self {
        Schedule::default()
    }

    pub fn at(&mut self, frame: u64, action: ScheduledAction) {
        self.pending.push((frame, action));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// remove and return everything due by `frame`
    pub fn take_due(&mut self, frame: u64) -> Vec<ScheduledAction> {
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].0 <= frame {
                due.push(self.pending.remove(i).1);
            } else {
                i += 1;
            }
        }
        due
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub frames: u64,
    pub dropped_frames: u64,
    pub dropped_samples: u64,
}

/// the Host handed to the machine while it steps
struct Bridge {
    framebuffer: Framebuffer,
    staging: Vec<f32>,
    queue: Option<Arc<SampleQueue>>,
}

impl Bridge {
    fn new(width: u32, height: u32, queue: Option<Arc<SampleQueue>>) -> Self {
        // a step never produces more than the queue could hold anyway
        let staging = match &queue {
            Some(q) => Vec::with_capacity(q.capacity()),
            None => Vec::new(),
        };
        Bridge {
            framebuffer: Framebuffer::new(width, height),
            staging,
            queue,
        }
    }

    /// hand the step's samples to the playback side, returns how many were dropped
    fn flush_samples(&mut self) -> usize {
        let dropped = match &self.queue {
            Some(queue) if !self.staging.is_empty() => {
                let outcome = queue.push(&self.staging);
                if outcome.overflowed() {
                    debug!("sample queue full, dropped {} samples", outcome.dropped);
                }
                outcome.dropped
            }
            _ => 0,
        };
        self.staging.clear();
        dropped
    }
}

impl Host for Bridge {
    fn on_sample(&mut self, amplitude: f32) {
        self.staging.push(amplitude);
    }

    fn on_samples(&mut self, amplitudes: &[f32]) {
        self.staging.extend_from_slice(amplitudes);
    }

    fn on_pixel(&mut self, x: u32, y: u32, color: Rgb) {
        self.framebuffer.set_pixel(x, y, color);
    }
}

pub struct Emulator<'a, C: Clock> {
    machine: &'a mut dyn Machine,
    display: &'a mut dyn Display,
    input: &'a mut dyn Input,
    audio: Option<AudioSink>,
    clock: C,
    bridge: Bridge,
    pacer: Pacer,
    schedule: Schedule,
    quit: QuitSignal,
    state: LoopState,
    frame: u64,
    max_frames: Option<u64>,
    stats: RunStats,
}

impl<'a, C: Clock> Emulator<'a, C> {
    pub fn new(
        machine: &'a mut dyn Machine,
        display: &'a mut dyn Display,
        input: &'a mut dyn Input,
        audio: Option<AudioSink>,
        clock: C,
        config: &Config,
    ) -> Self {
        let (width, height) = machine.screen_size();
        let queue = audio.as_ref().map(AudioSink::queue);
        let pacer = Pacer::new(config.quantum_us, clock.now_us());
        Emulator {
            machine,
            display,
            input,
            audio,
            clock,
            bridge: Bridge::new(width, height, queue),
            pacer,
            schedule: config.schedule(),
            quit: QuitSignal::new(),
            state: LoopState::Running,
            frame: 0,
            max_frames: config.max_frames,
            stats: RunStats::default(),
        }
    }

    /// a handle that stops the loop from elsewhere
    pub fn quit_signal(&self) -> QuitSignal {
        self.quit.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.bridge.framebuffer
    }

    /// Run until asked to quit (or the frame limit), then release the display
    /// and audio. Only unrecoverable failures come back as errors.
    pub fn run(&mut self) -> Result<RunStats, EmulatorError> {
        info!("pacing loop started, {}us per frame", self.pacer.quantum_us());
        let result = self.run_frames();
        self.shutdown(result)
    }

    fn run_frames(&mut self) -> Result<(), EmulatorError> {
        while self.state == LoopState::Running {
            if self.quit.is_requested() || self.max_frames.is_some_and(|max| self.frame >= max) {
                self.state = LoopState::Stopping;
                break;
            }
            self.iterate()?;
        }
        Ok(())
    }

    fn iterate(&mut self) -> Result<(), EmulatorError> {
        self.pacer.advance();
        self.machine.step(self.pacer.quantum_us(), &mut self.bridge);
        self.stats.dropped_samples += self.bridge.flush_samples() as u64;

        for event in self.input.poll().map_err(EmulatorError::Input)? {
            match *event {
                InputEvent::Quit => self.quit.request(),
                InputEvent::Key(key) => {
                    self.machine.key_down(key);
                    self.machine.key_up(key);
                }
            }
        }

        match self.display.draw(&self.bridge.framebuffer) {
            Ok(()) => {}
            Err(DisplayError::Alloc(e)) => {
                self.stats.dropped_frames += 1;
                warn!("frame {} dropped: {}", self.frame, e);
            }
            Err(DisplayError::Io(e)) => return Err(EmulatorError::Display(e)),
        }

        let sleep = self.pacer.sleep_for(self.clock.now_us());
        if sleep > 0 {
            self.clock.sleep_us(sleep);
        }

        self.frame += 1;
        self.stats.frames = self.frame;
        for action in self.schedule.take_due(self.frame) {
            self.perform(action);
        }

        if let Some(audio) = &mut self.audio {
            audio.check()?;
        }
        Ok(())
    }

    fn perform(&mut self, action: ScheduledAction) {
        match action {
            ScheduledAction::LoadProgram(path) => {
                let loaded = fs::read(&path)
                    .map_err(LoadError::from)
                    .and_then(|image| self.machine.load_program(&image));
                match loaded {
                    Ok(info) => info!(
                        "loaded {} ({} bytes), run it with SYS {}",
                        path.display(),
                        info.len,
                        info.load_address
                    ),
                    Err(e) => warn!("skipping {}: {}", path.display(), e),
                }
            }
        }
    }

    fn shutdown(&mut self, result: Result<(), EmulatorError>) -> Result<RunStats, EmulatorError> {
        self.state = LoopState::Stopping;
        if let Err(e) = &result {
            error!("stopping after frame {}: {}", self.frame, e);
        }
        if let Err(e) = self.display.release() {
            warn!("cannot release image: {}", e);
        }
        let closed = match self.audio.take() {
            Some(audio) => audio.close().map(|_| ()),
            None => Ok(()),
        };
        self.state = LoopState::Stopped;
        info!(
            "pacing loop stopped: {} frames, {} dropped, {} samples dropped",
            self.stats.frames, self.stats.dropped_frames, self.stats.dropped_samples
        );
        result?;
        closed?;
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::DummyDisplay;
    use crate::error::{AudioError, DeviceError};
    use crate::input::DummyInput;
    use crate::machine::{Key, ProgramInfo};
    use crate::sound::{PcmDevice, PcmFormat};
    use std::collections::TryReserveError;
    use std::io;
    use std::thread;
    use std::time::Duration;

    /// fake time that advances only by what the loop sleeps, plus a real
    /// nap so other threads get a look in
    struct TestClock {
        now: u64,
        total_slept: u64,
    }

    impl TestClock {
        fn new() -> Self {
            TestClock { now: 0, total_slept: 0 }
        }
    }

    impl Clock for TestClock {
        fn now_us(&self) -> u64 {
            self.now
        }

        fn sleep_us(&mut self, us: u64) {
            self.now += us;
            self.total_slept += us;
            thread::sleep(Duration::from_micros(50));
        }
    }

    #[derive(Default)]
    struct MockMachine {
        steps: u32,
        keys: Vec<(bool, Key)>,
        loaded: Vec<Vec<u8>>,
        samples_per_step: usize,
    }

    impl Machine for MockMachine {
        fn screen_size(&self) -> (u32, u32) {
            (2, 2)
        }

        fn step(&mut self, _quantum_us: u32, host: &mut dyn Host) {
            self.steps += 1;
            host.on_pixel(1, 1, Rgb::new(self.steps as u8, 0, 0));
            for _ in 0..self.samples_per_step {
                host.on_sample(0.5);
            }
        }

        fn key_down(&mut self, key: Key) {
            self.keys.push((true, key));
        }

        fn key_up(&mut self, key: Key) {
            self.keys.push((false, key));
        }

        fn load_program(&mut self, image: &[u8]) -> Result<ProgramInfo, LoadError> {
            let info = ProgramInfo::parse(image)?;
            self.loaded.push(image.to_vec());
            Ok(info)
        }
    }

    fn frames(n: u64) -> Config {
        Config {
            max_frames: Some(n),
            ..Config::default()
        }
    }

    fn alloc_error() -> TryReserveError {
        Vec::<u8>::new().try_reserve(usize::MAX).unwrap_err()
    }

    /// fails every other frame with an allocation error
    struct FlakyDisplay {
        calls: u64,
    }

    impl Display for FlakyDisplay {
        fn draw(&mut self, _frame: &Framebuffer) -> Result<(), DisplayError> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                Err(DisplayError::Alloc(alloc_error()))
            } else {
                Ok(())
            }
        }
    }

    struct BrokenDisplay;

    impl Display for BrokenDisplay {
        fn draw(&mut self, _frame: &Framebuffer) -> Result<(), DisplayError> {
            Err(DisplayError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        }
    }

    #[test]
    fn test_runs_frame_limit_then_stops() {
        let mut machine = MockMachine::default();
        let mut display = DummyDisplay::new();
        let mut input = DummyInput::idle();
        let mut emu = Emulator::new(&mut machine, &mut display, &mut input, None, TestClock::new(), &frames(5));

        let stats = emu.run().unwrap();
        assert_eq!(stats.frames, 5);
        assert_eq!(emu.state(), LoopState::Stopped);
        assert_eq!(emu.framebuffer().pixel(1, 1), Some(Rgb::new(5, 0, 0)));
        drop(emu);
        assert_eq!(machine.steps, 5);
        assert_eq!(display.frames, 5);
    }

    #[test]
    fn test_sleeps_track_emulated_time() {
        let mut machine = MockMachine::default();
        let mut display = DummyDisplay::new();
        let mut input = DummyInput::idle();
        let mut emu = Emulator::new(&mut machine, &mut display, &mut input, None, TestClock::new(), &frames(10));
        emu.run().unwrap();
        // no real work done, so the loop ends one quantum ahead of emulated time
        assert_eq!(emu.clock.total_slept, 11 * 33_333);
    }

    #[test]
    fn test_quit_event_finishes_current_frame() {
        let mut machine = MockMachine::default();
        let mut display = DummyDisplay::new();
        let mut input = DummyInput::new(vec![
            vec![],
            vec![InputEvent::Key(Key(b'A'))],
            vec![InputEvent::Quit, InputEvent::Key(Key::SPACE)],
        ]);
        let mut emu = Emulator::new(&mut machine, &mut display, &mut input, None, TestClock::new(), &frames(100));

        let stats = emu.run().unwrap();
        assert_eq!(stats.frames, 3);
        drop(emu);
        // the frame carrying the quit was drawn, and its keys still delivered
        assert_eq!(display.frames, 3);
        assert_eq!(
            machine.keys,
            vec![
                (true, Key(b'A')),
                (false, Key(b'A')),
                (true, Key::SPACE),
                (false, Key::SPACE)
            ]
        );
    }

    #[test]
    fn test_quit_signal_before_start() {
        let mut machine = MockMachine::default();
        let mut display = DummyDisplay::new();
        let mut input = DummyInput::idle();
        let mut emu = Emulator::new(&mut machine, &mut display, &mut input, None, TestClock::new(), &Config::default());
        emu.quit_signal().request();
        assert_eq!(emu.run().unwrap().frames, 0);
        assert_eq!(emu.state(), LoopState::Stopped);
    }

    #[test]
    fn test_alloc_failure_drops_frame_only() {
        let mut machine = MockMachine::default();
        let mut display = FlakyDisplay { calls: 0 };
        let mut input = DummyInput::idle();
        let mut emu = Emulator::new(&mut machine, &mut display, &mut input, None, TestClock::new(), &frames(6));
        let stats = emu.run().unwrap();
        assert_eq!(stats.frames, 6);
        assert_eq!(stats.dropped_frames, 3);
    }

    #[test]
    fn test_terminal_write_failure_is_fatal() {
        let mut machine = MockMachine::default();
        let mut display = BrokenDisplay;
        let mut input = DummyInput::idle();
        let mut emu = Emulator::new(&mut machine, &mut display, &mut input, None, TestClock::new(), &frames(6));
        assert!(matches!(emu.run(), Err(EmulatorError::Display(_))));
        assert_eq!(emu.state(), LoopState::Stopped);
    }

    #[test]
    fn test_scheduled_program_load() {
        let path = std::env::temp_dir().join(format!("kittybridge-load-{}.prg", std::process::id()));
        fs::write(&path, [0x01, 0x08, 0xea]).unwrap();
        let config = Config {
            program: Some(path.clone()),
            load_frame: 3,
            max_frames: Some(6),
            ..Config::default()
        };
        let mut machine = MockMachine::default();
        let mut display = DummyDisplay::new();
        let mut input = DummyInput::idle();
        let mut emu = Emulator::new(&mut machine, &mut display, &mut input, None, TestClock::new(), &config);
        emu.run().unwrap();
        drop(emu);
        fs::remove_file(&path).unwrap();
        assert_eq!(machine.loaded, vec![vec![0x01, 0x08, 0xea]]);
    }

    #[test]
    fn test_unreadable_program_is_skipped() {
        let config = Config {
            program: Some(PathBuf::from("/nonexistent/kittybridge/game.prg")),
            load_frame: 1,
            max_frames: Some(4),
            ..Config::default()
        };
        let mut machine = MockMachine::default();
        let mut display = DummyDisplay::new();
        let mut input = DummyInput::idle();
        let mut emu = Emulator::new(&mut machine, &mut display, &mut input, None, TestClock::new(), &config);
        assert_eq!(emu.run().unwrap().frames, 4);
        drop(emu);
        assert!(machine.loaded.is_empty());
    }

    #[test]
    fn test_bridge_pushes_step_samples_once() {
        let queue = Arc::new(SampleQueue::new(10));
        let mut bridge = Bridge::new(1, 1, Some(Arc::clone(&queue)));
        bridge.on_samples(&[0.1; 6]);
        bridge.on_sample(0.2);
        assert!(queue.is_empty());
        assert_eq!(bridge.flush_samples(), 0);
        assert_eq!(queue.len(), 7);

        bridge.on_samples(&[0.3; 5]);
        assert_eq!(bridge.flush_samples(), 2);
        assert_eq!(queue.len(), 10);
        assert!(bridge.staging.is_empty());
    }

    /// takes periods without delay, or fails on the first write
    struct FastDevice {
        fail: bool,
    }

    impl PcmDevice for FastDevice {
        fn format(&self) -> PcmFormat {
            PcmFormat {
                sample_rate: 44_100,
                channels: 1,
                period_frames: 64,
                periods: 3,
            }
        }

        fn write_period(&mut self, samples: &[i16]) -> Result<usize, DeviceError> {
            if self.fail {
                return Err(DeviceError::Stream("device unplugged".into()));
            }
            thread::sleep(Duration::from_micros(200));
            Ok(samples.len())
        }

        fn recover(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    #[test]
    fn test_samples_reach_audio_sink() {
        let queue = Arc::new(SampleQueue::default());
        let sink = AudioSink::open_with(|| Ok(FastDevice { fail: false }), Arc::clone(&queue)).unwrap();
        let mut machine = MockMachine {
            samples_per_step: 100,
            ..MockMachine::default()
        };
        let mut display = DummyDisplay::new();
        let mut input = DummyInput::idle();
        let mut emu = Emulator::new(&mut machine, &mut display, &mut input, Some(sink), TestClock::new(), &frames(20));
        let stats = emu.run().unwrap();
        assert_eq!(stats.dropped_samples, 0);
        // 2000 samples produced; whatever playback didn't get to is still queued
        assert!(queue.len() <= 2000);
    }

    #[test]
    fn test_fatal_audio_error_stops_loop() {
        let queue = Arc::new(SampleQueue::default());
        let sink = AudioSink::open_with(|| Ok(FastDevice { fail: true }), queue).unwrap();
        let mut machine = MockMachine::default();
        let mut display = DummyDisplay::new();
        let mut input = DummyInput::idle();
        let mut emu = Emulator::new(&mut machine, &mut display, &mut input, Some(sink), TestClock::new(), &frames(100_000));
        let result = emu.run();
        assert!(matches!(
            result,
            Err(EmulatorError::Audio(AudioError::Device(DeviceError::Stream(_))))
        ));
        assert_eq!(emu.state(), LoopState::Stopped);
    }
}

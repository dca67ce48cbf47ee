use std::time::{Duration, Instant};

/// one 30Hz video frame
pub const FRAME_QUANTUM_US: u32 = 33_333;

/// a source of wall-clock time the pacing loop can sleep on
pub trait Clock {
    /// microseconds since some fixed start
    fn now_us(&self) -> u64;

    fn sleep_us(&mut self, us: u64);
}

/// the real thing
pub struct WallClock {
    start: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        WallClock {
            start: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        WallClock::new()
    }
}

impl Clock for WallClock {
    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn sleep_us(&mut self, us: u64) {
        // plain sleeps overshoot by a scheduler tick or so; spin_sleep doesn't
        spin_sleep::sleep(Duration::from_micros(us));
    }
}

/// Keeps emulated time in step with real time. Emulated time moves on by a
/// fixed quantum per frame and the sleep after each frame is stretched or
/// shrunk by however far the two have drifted over the whole run.
#[derive(Debug, Clone)]
pub struct Pacer {
    quantum_us: u32,
    emulated_us: u64,
    start_us: u64,
}

impl Pacer {
    pub fn new(quantum_us: u32, start_us: u64) -> Self {
        Pacer {
            quantum_us,
            emulated_us: 0,
            start_us,
        }
    }

    pub fn quantum_us(&self) -> u32 {
        self.quantum_us
    }

    /// count one more quantum of emulated time
    pub fn advance(&mut self) {
        self.emulated_us += self.quantum_us as u64;
    }

    /// emulated minus real time; negative when running behind
    pub fn drift_us(&self, now_us: u64) -> i64 {
        let real = now_us.saturating_sub(self.start_us);
        self.emulated_us as i64 - real as i64
    }

    /// how long to sleep at `now_us`; zero when running behind
    pub fn sleep_for(&self, now_us: u64) -> u64 {
        let to_sleep = self.quantum_us as i64 + self.drift_us(now_us);
        to_sleep.max(0) as u64
    }
}

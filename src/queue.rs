use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// converted emulator output, as the sound device wants it
pub type Sample = i16;

/// 64Ki samples, about 1.5s of mono audio at 44.1kHz
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

/// scale factor from a [-1.0, 1.0] amplitude to a Sample
const SAMPLE_SCALE: f32 = 32767.0;

/// convert one floating point amplitude
pub fn to_sample(amplitude: f32) -> Sample {
    (amplitude.clamp(-1.0, 1.0) * SAMPLE_SCALE) as Sample
}

/// what happened to a single push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushOutcome {
    pub accepted: usize,
    pub dropped: usize,
}

impl PushOutcome {
    pub fn overflowed(&self) -> bool {
        self.dropped > 0
    }
}

struct Inner {
    samples: VecDeque<Sample>,
    dropped_total: u64,
}

/// Bounded FIFO of samples between the emulator (producer) and the playback
/// thread (consumer). Everything sits behind one lock; neither side ever does
/// I/O while holding it.
pub struct SampleQueue {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        SampleQueue {
            inner: Mutex::new(Inner {
                // reserved up front so pushes never reallocate
                samples: VecDeque::with_capacity(capacity),
                dropped_total: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // neither side can leave the queue half-written, so a poisoned lock
        // still guards consistent data
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Convert and append amplitudes. A full queue rejects the whole call;
    /// otherwise whatever doesn't fit is dropped from the tail of the input.
    pub fn push(&self, amplitudes: &[f32]) -> PushOutcome {
        let mut inner = self.lock();
        let room = self.capacity.saturating_sub(inner.samples.len());
        let accepted = room.min(amplitudes.len());
        inner
            .samples
            .extend(amplitudes[..accepted].iter().copied().map(to_sample));
        let dropped = amplitudes.len() - accepted;
        inner.dropped_total += dropped as u64;
        PushOutcome { accepted, dropped }
    }

    /// Move up to `out.len()` samples from the front of the queue into `out`.
    /// Returns how many were written; the tail of `out` is left untouched.
    pub fn pop_into(&self, out: &mut [Sample]) -> usize {
        let mut inner = self.lock();
        let n = out.len().min(inner.samples.len());
        for (dst, src) in out.iter_mut().zip(inner.samples.drain(..n)) {
            *dst = src;
        }
        n
    }

    /// remove and return up to `n` samples from the front
    pub fn pop_up_to(&self, n: usize) -> Vec<Sample> {
        let mut inner = self.lock();
        let n = n.min(inner.samples.len());
        inner.samples.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// samples rejected since the queue was created
    pub fn dropped_total(&self) -> u64 {
        self.lock().dropped_total
    }
}

impl Default for SampleQueue {
    fn default() -> Self {
        SampleQueue::new(DEFAULT_CAPACITY)
    }
}

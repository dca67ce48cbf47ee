//! Audio sink driver: a dedicated playback thread draining the sample queue
//! into hardware periods.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::error::AudioError;
use crate::queue::{Sample, SampleQueue};
use crate::sound::{AudioConfig, CpalDevice, Mute, PcmDevice, PcmFormat};

/// counters kept by the playback thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub periods: u64,
    /// periods written while the queue was empty
    pub silent_periods: u64,
    /// periods padded with silence because the queue ran short
    pub short_periods: u64,
    pub underruns: u64,
}

pub struct AudioSink {
    queue: Arc<SampleQueue>,
    format: PcmFormat,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<PlaybackStats, AudioError>>>,
}

impl AudioSink {
    /// Open the sound card (or a muted stand-in when audio is disabled) and
    /// start playback. Fails if the device can't be opened or negotiated.
    pub fn open(config: &AudioConfig, queue: Arc<SampleQueue>) -> Result<AudioSink, AudioError> {
        let config = config.clone();
        if config.enabled {
            AudioSink::open_with(move || CpalDevice::open(&config), queue)
        } else {
            let format = PcmFormat::from_config(&config);
            AudioSink::open_with(move || Ok(Mute::new(format)), queue)
        }
    }

    /// Start the playback thread around whatever device `factory` opens. The
    /// device is created on, used by and dropped on the playback thread.
    pub fn open_with<D, F>(factory: F, queue: Arc<SampleQueue>) -> Result<AudioSink, AudioError>
    where
        D: PcmDevice,
        F: FnOnce() -> Result<D, AudioError> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("audio-playback".into())
                .spawn(move || {
                    let device = match factory() {
                        Ok(device) => device,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return Ok(PlaybackStats::default());
                        }
                    };
                    let _ = ready_tx.send(Ok(device.format()));
                    playback(device, &queue, &running)
                })
                .map_err(AudioError::Spawn)?
        };

        match ready_rx.recv() {
            Ok(Ok(format)) => Ok(AudioSink {
                queue,
                format,
                running,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                // sender dropped without a word: the factory panicked
                let _ = thread.join();
                Err(AudioError::OpenAborted)
            }
        }
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// producer handle for the emulator side
    pub fn queue(&self) -> Arc<SampleQueue> {
        Arc::clone(&self.queue)
    }

    /// Non-blocking health check. Once the playback thread has died on a
    /// fatal device error, this returns that error (once).
    pub fn check(&mut self) -> Result<(), AudioError> {
        match &self.thread {
            Some(handle) if handle.is_finished() => {}
            _ => return Ok(()),
        }
        match self.join() {
            Ok(stats) => {
                warn!("playback thread stopped early after {} periods", stats.periods);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// stop the playback thread, wait for it and release the device
    pub fn close(mut self) -> Result<PlaybackStats, AudioError> {
        self.running.store(false, Ordering::Release);
        let stats = self.join()?;
        info!(
            "audio closed: {} periods, {} silent, {} short, {} underruns",
            stats.periods, stats.silent_periods, stats.short_periods, stats.underruns
        );
        Ok(stats)
    }

    fn join(&mut self) -> Result<PlaybackStats, AudioError> {
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|_| AudioError::Panicked)?,
            None => Ok(PlaybackStats::default()),
        }
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.join() {
            error!("audio shutdown: {}", e);
        }
    }
}

/// Spread mono samples over every channel of an interleaved period buffer.
/// Frames past `mono.len()` are zeroed.
pub fn fan_out(mono: &[Sample], channels: usize, period: &mut [Sample]) {
    period.fill(0);
    for (frame, sample) in period.chunks_exact_mut(channels.max(1)).zip(mono) {
        frame.fill(*sample);
    }
}

/// the playback thread body
fn playback<D: PcmDevice>(
    mut device: D,
    queue: &SampleQueue,
    running: &AtomicBool,
) -> Result<PlaybackStats, AudioError> {
    let format = device.format();
    let channels = format.channels.max(1) as usize;
    let mut mono = vec![0 as Sample; format.period_frames];
    let mut period = vec![0 as Sample; format.period_samples()];
    let mut stats = PlaybackStats::default();

    while running.load(Ordering::Acquire) {
        let available = queue.pop_into(&mut mono);
        if available == 0 {
            // the emulator hasn't produced anything yet: not an error
            stats.silent_periods += 1;
        } else if available < format.period_frames {
            stats.short_periods += 1;
        }
        fan_out(&mono[..available], channels, &mut period);

        submit(&mut device, &period, &mut stats, running)?;
    }
    debug!("playback thread stopping");
    Ok(stats)
}

/// Write one period, recovering from underruns and writing the same period
/// again until the device takes it (or playback is stopped).
fn submit<D: PcmDevice>(
    device: &mut D,
    period: &[Sample],
    stats: &mut PlaybackStats,
    running: &AtomicBool,
) -> Result<(), AudioError> {
    let format = device.format();
    loop {
        match device.write_period(period) {
            Ok(frames) => {
                stats.periods += 1;
                if frames != format.period_frames {
                    warn!(
                        "short write: wrote {} frames instead of {}",
                        frames, format.period_frames
                    );
                }
                return Ok(());
            }
            Err(e) if e.is_recoverable() => {
                stats.underruns += 1;
                warn!("{}, recovering", e);
                device.recover()?;
                if !running.load(Ordering::Acquire) {
                    return Ok(());
                }
            }
            Err(e) => {
                error!("audio write failed: {}", e);
                return Err(e.into());
            }
        }
    }
}

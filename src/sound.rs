use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, error, info, warn};

use crate::error::{AudioError, DeviceError};
use crate::queue;

/// what we ask the sound card for
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
    pub enabled: bool,
    pub sample_rate: u32,
    /// how much audio one hardware period holds
    pub period_ms: u32,
    /// hardware buffering depth, in periods
    pub periods: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            enabled: true,
            sample_rate: 44_100,
            period_ms: 100,
            periods: 3,
        }
    }
}

/// what the sound card actually agreed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub period_frames: usize,
    pub periods: usize,
}

impl PcmFormat {
    /// format we'd get from a device that accepts the config as-is, mono
    pub fn from_config(config: &AudioConfig) -> Self {
        PcmFormat {
            sample_rate: config.sample_rate,
            channels: 1,
            period_frames: period_frames(config.sample_rate, config.period_ms),
            periods: config.periods,
        }
    }

    /// interleaved samples in one period
    pub fn period_samples(&self) -> usize {
        self.period_frames * self.channels as usize
    }

    pub fn period_duration(&self) -> Duration {
        Duration::from_micros(self.period_frames as u64 * 1_000_000 / self.sample_rate.max(1) as u64)
    }
}

/// frames in a period of `ms` milliseconds, never zero
pub fn period_frames(sample_rate: u32, ms: u32) -> usize {
    ((sample_rate as u64 * ms as u64 / 1000) as usize).max(1)
}

/// A sound device that takes whole periods of interleaved i16 samples.
/// `write_period` blocks until the device has room; that wait is what paces
/// the playback thread.
pub trait PcmDevice {
    fn format(&self) -> PcmFormat;

    /// submit one period, returns the number of frames accepted
    fn write_period(&mut self, samples: &[queue::Sample]) -> Result<usize, DeviceError>;

    /// bring the device back to a ready state after an underrun
    fn recover(&mut self) -> Result<(), DeviceError>;
}

/// pick the closest rate a device range supports
pub fn nearest_rate(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

/// Rank a device config range: mono before multichannel, i16 before f32,
/// then closeness to the requested rate. `None` for formats we can't feed.
fn config_rank(range: &cpal::SupportedStreamConfigRange, target: u32) -> Option<(bool, bool, u32)> {
    let format = range.sample_format();
    if format != cpal::SampleFormat::I16 && format != cpal::SampleFormat::F32 {
        return None;
    }
    let rate = nearest_rate(range.min_sample_rate().0, range.max_sample_rate().0, target);
    Some((
        range.channels() != 1,
        format != cpal::SampleFormat::I16,
        rate.abs_diff(target),
    ))
}

/// how long a write may wait without the device draining anything
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// longest single wait for the device callback to free space
const WAIT_SLICE: Duration = Duration::from_millis(5);

/// state shared between the writer and the cpal callback
struct Shared {
    underrun: AtomicBool,
    failure: Mutex<Option<String>>,
    space: Mutex<()>,
    drained: Condvar,
}

impl Shared {
    fn new() -> Self {
        Shared {
            underrun: AtomicBool::new(false),
            failure: Mutex::new(None),
            space: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    /// first error wins, later ones are only logged
    fn fail(&self, message: String) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        failure.get_or_insert(message);
        self.drained.notify_one();
    }

    fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Writer half of the ring the device callback drains. Writes block until
/// the whole period is in the ring, the callback fails, or nothing drains
/// for `stall_timeout`.
struct RingWriter {
    producer: HeapProd<queue::Sample>,
    shared: Arc<Shared>,
    channels: usize,
    stall_timeout: Duration,
}

impl RingWriter {
    fn new(capacity: usize, channels: u16, stall_timeout: Duration) -> (RingWriter, HeapCons<queue::Sample>) {
        let (producer, consumer) = HeapRb::<queue::Sample>::new(capacity.max(1)).split();
        let writer = RingWriter {
            producer,
            shared: Arc::new(Shared::new()),
            channels: channels.max(1) as usize,
            stall_timeout,
        };
        (writer, consumer)
    }

    fn prefill_silence(&mut self, samples: usize) {
        for _ in 0..samples {
            if self.producer.try_push(0).is_err() {
                break;
            }
        }
    }

    fn write(&mut self, samples: &[queue::Sample]) -> Result<usize, DeviceError> {
        if let Some(message) = self.shared.failure() {
            return Err(DeviceError::Stream(message));
        }
        if self.shared.underrun.swap(false, Ordering::AcqRel) {
            return Err(DeviceError::Underrun);
        }

        let mut written = 0;
        let mut last_progress = Instant::now();
        loop {
            let n = self.producer.push_slice(&samples[written..]);
            written += n;
            if written == samples.len() {
                break;
            }
            if n > 0 {
                last_progress = Instant::now();
            } else if last_progress.elapsed() > self.stall_timeout {
                return Err(DeviceError::Stalled(self.stall_timeout.as_millis() as u64));
            }
            if let Some(message) = self.shared.failure() {
                return Err(DeviceError::Stream(message));
            }
            if self.producer.vacant_len() == 0 {
                let guard = self.shared.space.lock().unwrap_or_else(PoisonError::into_inner);
                let _ = self
                    .shared
                    .drained
                    .wait_timeout(guard, WAIT_SLICE)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        Ok(written / self.channels)
    }

    fn recover(&mut self) -> Result<(), DeviceError> {
        if let Some(message) = self.shared.failure() {
            return Err(DeviceError::Stream(message));
        }
        self.shared.underrun.store(false, Ordering::Release);
        Ok(())
    }
}

/// The device callback body: fill `data` from the ring, silence whatever the
/// ring can't cover and flag that as an underrun. `scratch` is sized before
/// the stream starts; it is never grown here.
fn drain_ring<T>(
    consumer: &mut HeapCons<queue::Sample>,
    scratch: &mut [queue::Sample],
    data: &mut [T],
    shared: &Shared,
) where
    T: SizedSample + FromSample<queue::Sample>,
{
    let mut filled = 0;
    if !scratch.is_empty() {
        for chunk in data.chunks_mut(scratch.len()) {
            let popped = consumer.pop_slice(&mut scratch[..chunk.len()]);
            for (dst, src) in chunk.iter_mut().zip(&scratch[..popped]) {
                *dst = T::from_sample(*src);
            }
            filled += popped;
            if popped < chunk.len() {
                break;
            }
        }
    }
    for dst in &mut data[filled..] {
        *dst = T::EQUILIBRIUM;
    }
    if filled < data.len() {
        shared.underrun.store(true, Ordering::Release);
    }
    shared.drained.notify_one();
}

/// Sound card output through cpal. The callback drains a ring sized to
/// `periods` periods, which gives the same blocking-write model as a
/// classic period-based PCM API.
pub struct CpalDevice {
    format: PcmFormat,
    writer: RingWriter,
    // kept alive for the duration; dropping it stops playback
    _stream: cpal::Stream,
}

impl CpalDevice {
    pub fn open(config: &AudioConfig) -> Result<CpalDevice, AudioError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
        if let Ok(name) = device.name() {
            debug!("using audio device {}", name);
        }

        let range = device
            .supported_output_configs()?
            .filter_map(|range| config_rank(&range, config.sample_rate).map(|rank| (rank, range)))
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, range)| range)
            .ok_or(AudioError::NoSupportedConfig)?;

        let sample_rate = nearest_rate(
            range.min_sample_rate().0,
            range.max_sample_rate().0,
            config.sample_rate,
        );
        if sample_rate != config.sample_rate {
            warn!(
                "sample rate changed from {} to {}",
                config.sample_rate, sample_rate
            );
        }

        let format = PcmFormat {
            sample_rate,
            channels: range.channels(),
            period_frames: period_frames(sample_rate, config.period_ms),
            periods: config.periods.max(1),
        };

        let buffer_size = match range.buffer_size() {
            cpal::SupportedBufferSize::Range { min, max }
                if (*min as usize..=*max as usize).contains(&format.period_frames) =>
            {
                cpal::BufferSize::Fixed(format.period_frames as cpal::FrameCount)
            }
            _ => cpal::BufferSize::Default,
        };
        let stream_config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size,
        };

        let (mut writer, consumer) = RingWriter::new(
            format.period_samples() * format.periods,
            format.channels,
            STALL_TIMEOUT,
        );
        // one period of silence so the first callback doesn't count as an underrun
        writer.prefill_silence(format.period_samples());

        let shared = Arc::clone(&writer.shared);
        let scratch_len = format.period_samples();
        let stream = match range.sample_format() {
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&device, &stream_config, consumer, shared, scratch_len)?
            }
            _ => build_stream::<f32>(&device, &stream_config, consumer, shared, scratch_len)?,
        };
        stream.play()?;

        info!(
            "audio initialised: {} Hz, {} channel(s), {} frames per period, {} periods",
            format.sample_rate, format.channels, format.period_frames, format.periods
        );
        Ok(CpalDevice {
            format,
            writer,
            _stream: stream,
        })
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut consumer: HeapCons<queue::Sample>,
    shared: Arc<Shared>,
    scratch_len: usize,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<queue::Sample>,
{
    let on_error = Arc::clone(&shared);
    let mut scratch = vec![0 as queue::Sample; scratch_len.max(1)];
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            drain_ring(&mut consumer, &mut scratch, data, &shared);
        },
        move |err| {
            error!("audio stream error: {}", err);
            on_error.fail(err.to_string());
        },
        None,
    )?;
    Ok(stream)
}

impl PcmDevice for CpalDevice {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn write_period(&mut self, samples: &[queue::Sample]) -> Result<usize, DeviceError> {
        self.writer.write(samples)
    }

    fn recover(&mut self) -> Result<(), DeviceError> {
        self.writer.recover()
    }
}

/// Swallows periods at wall-clock rate, so the queue still drains the way
/// it would with a real sound card attached
pub struct Mute {
    format: PcmFormat,
}

impl Mute {
    pub fn new(format: PcmFormat) -> Self {
        Mute { format }
    }
}

impl PcmDevice for Mute {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn write_period(&mut self, samples: &[queue::Sample]) -> Result<usize, DeviceError> {
        spin_sleep::sleep(self.format.period_duration());
        Ok(samples.len() / self.format.channels.max(1) as usize)
    }

    fn recover(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_default_period_is_100ms() {
        let format = PcmFormat::from_config(&AudioConfig::default());
        assert_eq!(format.period_frames, 4410);
        assert_eq!(format.periods, 3);
        assert_eq!(format.period_duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_period_samples_counts_channels() {
        let format = PcmFormat {
            sample_rate: 48_000,
            channels: 2,
            period_frames: period_frames(48_000, 100),
            periods: 3,
        };
        assert_eq!(format.period_frames, 4800);
        assert_eq!(format.period_samples(), 9600);
    }

    #[test]
    fn test_period_frames_never_zero() {
        assert_eq!(period_frames(8_000, 0), 1);
    }

    #[test]
    fn test_nearest_rate() {
        assert_eq!(nearest_rate(8_000, 192_000, 44_100), 44_100);
        assert_eq!(nearest_rate(48_000, 48_000, 44_100), 48_000);
        assert_eq!(nearest_rate(8_000, 22_050, 44_100), 22_050);
    }

    #[test]
    fn test_mute_accepts_whole_period() {
        let mut mute = Mute::new(PcmFormat {
            sample_rate: 44_100,
            channels: 2,
            period_frames: 44,
            periods: 3,
        });
        let start = Instant::now();
        assert_eq!(mute.write_period(&[0; 88]).unwrap(), 44);
        // 44 frames at 44.1kHz is just under a millisecond
        assert!(start.elapsed() >= Duration::from_micros(900));
        assert!(mute.recover().is_ok());
    }

    #[test]
    fn test_short_callback_reports_underrun_once() {
        let (mut writer, mut consumer) = RingWriter::new(8, 1, STALL_TIMEOUT);
        assert_eq!(writer.write(&[1, 2, 3, 4]).unwrap(), 4);

        let mut scratch = [0; 8];
        let mut data = [7i16; 6];
        drain_ring(&mut consumer, &mut scratch, &mut data, &writer.shared);
        assert_eq!(data, [1, 2, 3, 4, 0, 0]);

        assert!(matches!(writer.write(&[5, 6]), Err(DeviceError::Underrun)));
        writer.recover().unwrap();
        assert_eq!(writer.write(&[5, 6]).unwrap(), 2);
    }

    #[test]
    fn test_callback_drains_in_scratch_sized_chunks() {
        let (mut writer, mut consumer) = RingWriter::new(8, 1, STALL_TIMEOUT);
        writer.write(&[i16::MIN, 0, i16::MIN, 0, i16::MIN]).unwrap();

        let mut scratch = [0; 2];
        let mut data = [1.0f32; 5];
        drain_ring(&mut consumer, &mut scratch, &mut data, &writer.shared);
        assert_eq!(data, [-1.0, 0.0, -1.0, 0.0, -1.0]);
        assert!(!writer.shared.underrun.load(Ordering::Acquire));
    }

    #[test]
    fn test_stream_failure_is_latched() {
        let (mut writer, _consumer) = RingWriter::new(8, 1, STALL_TIMEOUT);
        writer.shared.fail("device unplugged".into());
        writer.shared.fail("second error".into());
        match writer.write(&[0; 4]) {
            Err(DeviceError::Stream(message)) => assert_eq!(message, "device unplugged"),
            other => panic!("expected stream error, got {:?}", other),
        }
        assert!(matches!(writer.recover(), Err(DeviceError::Stream(_))));
        assert!(matches!(writer.write(&[0; 4]), Err(DeviceError::Stream(_))));
    }

    #[test]
    fn test_full_ring_without_callback_stalls() {
        let (mut writer, _consumer) = RingWriter::new(4, 1, Duration::from_millis(20));
        let start = Instant::now();
        assert!(matches!(writer.write(&[0; 8]), Err(DeviceError::Stalled(20))));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_write_blocks_until_callback_drains() {
        let (mut writer, mut consumer) = RingWriter::new(4, 2, STALL_TIMEOUT);
        let shared = Arc::clone(&writer.shared);
        let callback = thread::spawn(move || {
            let mut scratch = [0; 4];
            let mut audible = Vec::new();
            let deadline = Instant::now() + Duration::from_secs(5);
            while audible.len() < 8 && Instant::now() < deadline {
                let mut data = [0i16; 4];
                drain_ring(&mut consumer, &mut scratch, &mut data, &shared);
                audible.extend(data.iter().copied().filter(|s| *s != 0));
                thread::sleep(Duration::from_millis(2));
            }
            audible
        });

        let period: Vec<i16> = (1..=8).collect();
        // the callback may have run dry before the first write
        let frames = loop {
            match writer.write(&period) {
                Err(DeviceError::Underrun) => writer.recover().unwrap(),
                other => break other.unwrap(),
            }
        };
        assert_eq!(frames, 4);
        assert_eq!(callback.join().unwrap(), period);
    }

    #[test]
    fn test_only_underrun_is_recoverable() {
        assert!(DeviceError::Underrun.is_recoverable());
        assert!(!DeviceError::Stalled(2000).is_recoverable());
        assert!(!DeviceError::Stream("gone".into()).is_recoverable());
    }
}

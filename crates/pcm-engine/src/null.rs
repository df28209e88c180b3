//! Clocked sink without audio output.
//!
//! Queued frames drain in real time against a monotonic clock, so playback position,
//! pause and end-of-stream behave as on a real device. Running out of queued audio
//! while armed is reported on the next write, like an ALSA `-EPIPE`.

use std::time::{Duration, Instant};

use crate::device::{DeviceError, NULL_DEVICE, SinkOptions, SoundDevice};
use crate::format::PcmFormat;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

pub struct NullSink {
    format: PcmFormat,
    capacity: u64,
    queued: u64,
    /// Clock origin for the frames still in `queued`.
    since: Instant,
    paused: bool,
    /// Set once audio was written; cleared when the queue is dropped.
    armed: bool,
    underrun: bool,
    closed: bool,
}

impl NullSink {
    pub fn new(format: PcmFormat, opts: &SinkOptions) -> Self {
        tracing::debug!(
            rate_hz = format.sample_rate,
            channels = format.channels,
            capacity_frames = opts.capacity_frames,
            "null sink opened"
        );
        Self {
            format,
            capacity: opts.capacity_frames.max(1),
            queued: 0,
            since: Instant::now(),
            paused: true,
            armed: false,
            underrun: false,
            closed: false,
        }
    }

    fn elapsed_frames(&self) -> u64 {
        if self.paused || self.closed {
            return 0;
        }
        let nanos = self.since.elapsed().as_nanos();
        let frames = nanos * u128::from(self.format.sample_rate) / NANOS_PER_SECOND;
        u64::try_from(frames).unwrap_or(u64::MAX)
    }

    /// Retire frames played since the last call.
    fn settle(&mut self) {
        let elapsed = self.elapsed_frames();
        if elapsed >= self.queued {
            if self.armed && !self.paused && elapsed > self.queued {
                self.underrun = true;
                self.armed = false;
            }
            self.queued = 0;
            self.since = Instant::now();
        } else {
            self.queued -= elapsed;
            self.since += frames_to_duration(elapsed, self.format.sample_rate);
        }
    }
}

fn frames_to_duration(frames: u64, rate: u32) -> Duration {
    let nanos = u128::from(frames) * NANOS_PER_SECOND / u128::from(rate.max(1));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

impl SoundDevice for NullSink {
    fn name(&self) -> &str {
        NULL_DEVICE
    }

    fn format(&self) -> PcmFormat {
        self.format
    }

    fn capacity_frames(&self) -> u64 {
        self.capacity
    }

    fn delay_frames(&self) -> u64 {
        self.queued.saturating_sub(self.elapsed_frames())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<u64, DeviceError> {
        if self.closed {
            return Err(DeviceError::lost("null sink is closed"));
        }
        self.settle();
        if self.underrun {
            self.underrun = false;
            return Err(DeviceError::underrun());
        }
        let frames = (bytes.len() / self.format.block_align().max(1)) as u64;
        let accepted = frames.min(self.capacity - self.queued);
        self.queued += accepted;
        if accepted > 0 {
            self.armed = true;
        }
        Ok(accepted)
    }

    fn set_paused(&mut self, paused: bool) {
        self.settle();
        self.paused = paused;
        self.since = Instant::now();
    }

    fn drop_pending(&mut self) {
        self.queued = 0;
        self.armed = false;
        self.underrun = false;
        self.since = Instant::now();
    }

    fn close(&mut self) {
        if !self.closed {
            tracing::debug!("null sink closed");
        }
        self.drop_pending();
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU8;
    use std::thread;

    fn sink(rate: u32, capacity: u64) -> NullSink {
        let opts = SinkOptions {
            capacity_frames: capacity,
            volume_percent: Arc::new(AtomicU8::new(100)),
            tuning: SinkConfig::default(),
        };
        NullSink::new(PcmFormat::new(rate, 1, 8), &opts)
    }

    #[test]
    fn write_is_capped_by_capacity() {
        let mut s = sink(8_000, 100);
        assert_eq!(s.write(&[0u8; 150]).unwrap(), 100);
        assert_eq!(s.delay_frames(), 100);
        assert_eq!(s.available_frames(), 0);
    }

    #[test]
    fn paused_sink_does_not_drain() {
        let mut s = sink(8_000, 8_000);
        s.write(&[0u8; 800]).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(s.delay_frames(), 800);
    }

    #[test]
    fn running_sink_drains_in_real_time() {
        let mut s = sink(8_000, 8_000);
        s.write(&[0u8; 4_000]).unwrap();
        s.set_paused(false);
        thread::sleep(Duration::from_millis(100));
        let delay = s.delay_frames();
        // 100 ms at 8 kHz is 800 frames; allow for scheduler slack.
        assert!(delay <= 3_200, "delay={delay}");
        assert!(delay >= 1_000, "delay={delay}");
    }

    #[test]
    fn running_dry_reports_underrun_once() {
        let mut s = sink(8_000, 8_000);
        s.write(&[0u8; 8]).unwrap();
        s.set_paused(false);
        thread::sleep(Duration::from_millis(20));
        let err = s.write(&[0u8; 8]).unwrap_err();
        assert_eq!(err, DeviceError::underrun());
        assert_eq!(s.write(&[0u8; 8]).unwrap(), 8);
    }

    #[test]
    fn drop_pending_clears_queue_and_underrun() {
        let mut s = sink(8_000, 8_000);
        s.write(&[0u8; 8]).unwrap();
        s.set_paused(false);
        thread::sleep(Duration::from_millis(20));
        s.drop_pending();
        assert_eq!(s.delay_frames(), 0);
        assert_eq!(s.write(&[0u8; 8]).unwrap(), 8);
    }

    #[test]
    fn close_is_idempotent_and_rejects_writes() {
        let mut s = sink(8_000, 8_000);
        s.close();
        s.close();
        let err = s.write(&[0u8; 8]).unwrap_err();
        assert!(err.fatal);
    }
}

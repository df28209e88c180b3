//! Sound device abstraction and output device selection.
//!
//! A [`SoundDevice`] is an output sink opened by name for one [`PcmFormat`]. It accepts
//! interleaved PCM bytes into a bounded buffer and reports how much of that buffer is
//! still waiting to be heard. Names resolve as:
//! - `"default"` (or empty): host default output device
//! - `"null"`: clocked sink without hardware ([`crate::null::NullSink`])
//! - anything else: first output device whose name contains it (case-insensitive)

use std::sync::Arc;
use std::sync::atomic::AtomicU8;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

use crate::config::SinkConfig;
use crate::error::device_code;
use crate::format::PcmFormat;

pub const DEFAULT_DEVICE: &str = "default";
pub const NULL_DEVICE: &str = "null";

/// Failure reported by a sink, with an errno-style driver sub-code.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({code})")]
pub struct DeviceError {
    pub code: i32,
    /// Fatal errors leave the sink unusable; the player must be re-initialized.
    pub fatal: bool,
    pub message: String,
}

impl DeviceError {
    pub fn underrun() -> Self {
        Self {
            code: device_code::UNDERRUN,
            fatal: false,
            message: "buffer underrun".to_string(),
        }
    }

    pub fn lost(message: impl Into<String>) -> Self {
        Self {
            code: device_code::NO_DEVICE,
            fatal: true,
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self {
            code: device_code::IO,
            fatal: false,
            message: message.into(),
        }
    }

    /// Map a cpal setup failure onto a sub-code.
    pub fn from_setup(err: &anyhow::Error) -> Self {
        let code = if let Some(e) = err.downcast_ref::<cpal::BuildStreamError>() {
            match e {
                cpal::BuildStreamError::DeviceNotAvailable => device_code::NO_DEVICE,
                cpal::BuildStreamError::StreamConfigNotSupported
                | cpal::BuildStreamError::InvalidArgument => device_code::INVALID,
                _ => device_code::IO,
            }
        } else if let Some(e) = err.downcast_ref::<cpal::PlayStreamError>() {
            match e {
                cpal::PlayStreamError::DeviceNotAvailable => device_code::NO_DEVICE,
                _ => device_code::IO,
            }
        } else if err.downcast_ref::<NoMatchingDevice>().is_some() {
            device_code::NO_DEVICE
        } else if err.downcast_ref::<cpal::SupportedStreamConfigsError>().is_some() {
            device_code::BUSY
        } else {
            device_code::IO
        };
        Self {
            code,
            fatal: true,
            message: format!("{err:#}"),
        }
    }
}

/// Options shared by all sinks of one player.
#[derive(Clone, Debug)]
pub struct SinkOptions {
    /// Buffer capacity in source frames.
    pub capacity_frames: u64,
    /// User-facing volume percent (0..=100), read by the output callback.
    pub volume_percent: Arc<AtomicU8>,
    pub tuning: SinkConfig,
}

/// Output sink for interleaved PCM bytes.
///
/// Sinks are created and used on the render thread only.
pub trait SoundDevice {
    fn name(&self) -> &str;

    fn format(&self) -> PcmFormat;

    /// Total buffer capacity in frames.
    fn capacity_frames(&self) -> u64;

    /// Frames written but not yet played.
    fn delay_frames(&self) -> u64;

    /// Frames that can be written without overflowing the buffer.
    fn available_frames(&self) -> u64 {
        self.capacity_frames().saturating_sub(self.delay_frames())
    }

    /// Queue whole frames from `bytes`; returns the number of frames accepted.
    fn write(&mut self, bytes: &[u8]) -> Result<u64, DeviceError>;

    /// Paused sinks output silence and keep their buffer.
    fn set_paused(&mut self, paused: bool);

    /// Discard everything queued but not yet played.
    fn drop_pending(&mut self);

    /// Push out audio held back for internal processing. Called once the source is
    /// fully written.
    fn flush(&mut self) {}

    /// Release the device. Safe to call more than once.
    fn close(&mut self);
}

/// Open the sink called `name` for `format`.
pub fn open(
    name: &str,
    format: PcmFormat,
    opts: &SinkOptions,
) -> Result<Box<dyn SoundDevice>, DeviceError> {
    let name = name.trim();
    if name.eq_ignore_ascii_case(NULL_DEVICE) {
        return Ok(Box::new(crate::null::NullSink::new(format, opts)));
    }
    let needle = if name.is_empty() || name.eq_ignore_ascii_case(DEFAULT_DEVICE) {
        None
    } else {
        Some(name)
    };
    crate::playback::CpalSink::open(needle, format, opts)
        .map(|sink| Box::new(sink) as Box<dyn SoundDevice>)
        .map_err(|e| DeviceError::from_setup(&e))
}

/// Whether `a` and `b` name the same sink.
pub fn same_device(a: &str, b: &str) -> bool {
    let norm = |s: &str| {
        let s = s.trim();
        if s.is_empty() {
            DEFAULT_DEVICE.to_string()
        } else {
            s.to_lowercase()
        }
    };
    norm(a) == norm(b)
}

#[derive(Debug, thiserror::Error)]
#[error("No output device matched: {0}")]
struct NoMatchingDevice(String);

/// Pick a CPAL output device.
///
/// - If `needle` is `Some`, chooses the first output device whose name contains the substring
///   (case-insensitive).
/// - Otherwise, returns the host default output device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices: Vec<cpal::Device> = host
            .output_devices()
            .context("No output devices")?
            .collect();
        if let Some(d) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| matches_device_name(&n.name(), needle))
                .unwrap_or(false)
        }) {
            return Ok(d);
        }
        return Err(NoMatchingDevice(needle.to_string()).into());
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!(NoMatchingDevice(DEFAULT_DEVICE.to_string())))
}

/// Pick the best supported output config for a source.
///
/// Prefers configs that can carry all source channels, then the rate closest to
/// `target_rate` (exact match first, then the highest rate below it, then the lowest
/// above it), then the sample format cheapest to convert to.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: u32,
    channels: u16,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs()?.collect();
    if ranges.is_empty() {
        return Err(anyhow!("No supported output configs"));
    }

    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;

    for range in ranges {
        if sample_format_rank(range.sample_format()) >= UNSUPPORTED_RANK {
            continue;
        }
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            fits_channels: range.channels() >= channels,
            below: rate <= target_rate,
            distance: rate.abs_diff(target_rate),
            format_rank: sample_format_rank(range.sample_format()),
        };
        let replace = match &best {
            None => true,
            Some((b, _)) => candidate.is_better_than(b),
        };
        if replace {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("No output config with a convertible sample format"))
}

/// Prefer a fixed buffer size if the device advertises one.
///
/// The callback buffer is kept small (at most `max_frames`) so the sink's own queue,
/// not the driver, holds the latency budget.
pub fn pick_buffer_size(
    config: &cpal::SupportedStreamConfig,
    max_frames: u32,
) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            let chosen = (*max).min(max_frames).max(*min);
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Print available output devices to stdout.
///
/// This is intended for CLI UX (`--list-devices`) rather than structured output.
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let devices = host.output_devices().context("No output devices")?;
    for (i, d) in devices.enumerate() {
        println!("#{i}: {}", d.description()?);
    }
    println!("{NULL_DEVICE}: clocked sink without audio output");
    Ok(())
}

const UNSUPPORTED_RANK: u8 = 10;

#[derive(Clone, Copy, Debug)]
struct Candidate {
    fits_channels: bool,
    below: bool,
    distance: u32,
    format_rank: u8,
}

impl Candidate {
    fn is_better_than(&self, other: &Candidate) -> bool {
        if self.fits_channels != other.fits_channels {
            return self.fits_channels;
        }
        if (self.distance == 0) != (other.distance == 0) {
            return self.distance == 0;
        }
        if self.below != other.below {
            return self.below;
        }
        if self.distance != other.distance {
            return self.distance < other.distance;
        }
        self.format_rank < other.format_rank
    }
}

fn pick_rate_for_range(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => UNSUPPORTED_RANK,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(fits_channels: bool, rate: u32, target: u32, format_rank: u8) -> Candidate {
        Candidate {
            fits_channels,
            below: rate <= target,
            distance: rate.abs_diff(target),
            format_rank,
        }
    }

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", "USB"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", ""));
    }

    #[test]
    fn same_device_normalizes_default_and_case() {
        assert!(same_device("", "default"));
        assert!(same_device(" Default ", "default"));
        assert!(same_device("NULL", "null"));
        assert!(!same_device("null", "default"));
    }

    #[test]
    fn pick_rate_for_range_clamps_to_range() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, 48_000), 48_000);
        assert_eq!(pick_rate_for_range(44_100, 96_000, 8_000), 44_100);
        assert_eq!(pick_rate_for_range(44_100, 96_000, 192_000), 96_000);
    }

    #[test]
    fn exact_rate_beats_closer_format() {
        let exact = candidate(true, 44_100, 44_100, 3);
        let near = candidate(true, 48_000, 44_100, 0);
        assert!(exact.is_better_than(&near));
        assert!(!near.is_better_than(&exact));
    }

    #[test]
    fn channel_fit_beats_rate_match() {
        let fits = candidate(true, 48_000, 44_100, 0);
        let narrow = candidate(false, 44_100, 44_100, 0);
        assert!(fits.is_better_than(&narrow));
    }

    #[test]
    fn below_target_preferred_over_above() {
        let below = candidate(true, 32_000, 44_100, 0);
        let above = candidate(true, 48_000, 44_100, 0);
        assert!(below.is_better_than(&above));
    }

    #[test]
    fn lower_format_rank_breaks_ties() {
        let f32_cfg = candidate(true, 48_000, 48_000, 0);
        let i16_cfg = candidate(true, 48_000, 48_000, 2);
        assert!(f32_cfg.is_better_than(&i16_cfg));
    }

    #[test]
    fn underrun_is_recoverable_and_loss_is_fatal() {
        assert!(!DeviceError::underrun().fatal);
        assert_eq!(DeviceError::underrun().code, device_code::UNDERRUN);
        assert!(DeviceError::lost("gone").fatal);
        assert_eq!(DeviceError::lost("gone").to_string(), "gone (-19)");
    }

    #[test]
    fn setup_errors_map_to_sub_codes() {
        let err = anyhow::Error::new(NoMatchingDevice("dac".into()));
        let mapped = DeviceError::from_setup(&err);
        assert_eq!(mapped.code, device_code::NO_DEVICE);
        assert!(mapped.fatal);
        assert!(mapped.message.contains("dac"));

        let err = anyhow!("something else");
        assert_eq!(DeviceError::from_setup(&err).code, device_code::IO);
    }
}

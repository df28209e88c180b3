use crate::device::DEFAULT_DEVICE;
use crate::format::PcmFormat;

/// Default command/refill cadence in milliseconds.
pub const DEFAULT_TIME_RESOLUTION_MS: u32 = 10;
/// Default device buffer length, in multiples of the time resolution.
pub const DEFAULT_BUFFER_PERIODS: u32 = 8;

/// PCM bytes handed to the player. Ownership moves into the player at init.
#[derive(Clone, Debug)]
pub enum AudioSource {
    /// A complete RIFF/WAVE file; the format is read from its header.
    Wave(Vec<u8>),
    /// Bare interleaved PCM with an explicit format.
    Raw { data: Vec<u8>, format: PcmFormat },
}

impl AudioSource {
    pub fn len(&self) -> usize {
        match self {
            AudioSource::Wave(bytes) => bytes.len(),
            AudioSource::Raw { data, .. } => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything needed to initialize a player.
#[derive(Clone, Debug)]
pub struct PlaybackConfiguration {
    pub source: AudioSource,
    /// Output sink name (`"default"`, `"null"`, or a device name substring).
    pub device_name: String,
    /// How often (ms) the render thread applies commands and refills the device.
    pub time_resolution_ms: u32,
    /// Device buffer length in multiples of `time_resolution_ms`.
    pub buffer_periods: u32,
    pub sink: SinkConfig,
}

impl PlaybackConfiguration {
    pub fn new(source: AudioSource) -> Self {
        Self {
            source,
            device_name: DEFAULT_DEVICE.to_string(),
            time_resolution_ms: DEFAULT_TIME_RESOLUTION_MS,
            buffer_periods: DEFAULT_BUFFER_PERIODS,
            sink: SinkConfig::default(),
        }
    }

    pub fn wave(bytes: Vec<u8>) -> Self {
        Self::new(AudioSource::Wave(bytes))
    }

    pub fn raw(data: Vec<u8>, format: PcmFormat) -> Self {
        Self::new(AudioSource::Raw { data, format })
    }

    pub fn with_device(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn with_time_resolution(mut self, millis: u32) -> Self {
        self.time_resolution_ms = millis;
        self
    }

    pub fn with_buffer_periods(mut self, periods: u32) -> Self {
        self.buffer_periods = periods;
        self
    }
}

/// Tuning for hardware sinks.
#[derive(Clone, Copy, Debug)]
pub struct SinkConfig {
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
    /// Resampler input chunk size in frames (used only when the device rate differs).
    pub resample_chunk_frames: usize,
    /// Upper bound for a fixed driver callback buffer, in frames.
    pub max_callback_frames: u32,
}

impl Default for SinkConfig {
    /// Defaults tuned for low-risk playback across common devices.
    fn default() -> Self {
        Self {
            refill_max_frames: 4096,
            resample_chunk_frames: 1024,
            max_callback_frames: 2048,
        }
    }
}

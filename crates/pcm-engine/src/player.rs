//! Public playback handle.
//!
//! A [`Player`] owns one render thread, one [`ErrorChannel`] and a published transport
//! snapshot. Transport calls are forwarded to the render thread and return once it has
//! applied them; getters only read the last snapshot.

use std::ops::Range;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{AudioSource, PlaybackConfiguration};
use crate::device::SinkOptions;
use crate::error::{AudioError, ErrorChannel, ErrorKind};
use crate::format::PcmFormat;
use crate::render::{Action, RenderHandle, RenderSetup};
use crate::status::{self, PlayerState, PlayerStatus, TransportState};
use crate::timebase::TimeBase;
use crate::wav;

static NEXT_PLAYER_ID: AtomicU64 = AtomicU64::new(1);

/// A PCM buffer bound to an output sink.
///
/// Dropping the player tears it down like [`Player::destroy`].
pub struct Player {
    id: u64,
    format: PcmFormat,
    timebase: TimeBase,
    duration_ms: u64,
    time_resolution_ms: u32,
    volume: Arc<AtomicU8>,
    transport: Arc<Mutex<TransportState>>,
    errors: Arc<ErrorChannel>,
    render: RenderHandle,
}

impl Player {
    /// Validate `config`, open its sink and return a player in the `Ready` state.
    pub fn init(config: PlaybackConfiguration) -> Result<Player, AudioError> {
        let id = NEXT_PLAYER_ID.fetch_add(1, Ordering::Relaxed);
        let PlaybackConfiguration {
            source,
            device_name,
            time_resolution_ms,
            buffer_periods,
            sink,
        } = config;

        if source.is_empty() {
            return Err(AudioError::error(ErrorKind::EmptyBuffer));
        }
        if time_resolution_ms == 0 {
            return Err(AudioError::error(ErrorKind::InvalidTimeResolution));
        }
        if buffer_periods < 2 {
            return Err(AudioError::error(ErrorKind::InvalidBufferPeriods));
        }

        let (pcm, data, format) = split_source(source)?;
        if data.is_empty() {
            return Err(AudioError::error(ErrorKind::EmptyBuffer));
        }
        let timebase = TimeBase::new(format);
        let duration_ms = timebase.bytes_to_millis(data.len() as u64);
        let capacity_frames = timebase
            .millis_to_frames(u64::from(time_resolution_ms) * u64::from(buffer_periods))
            .max(1);

        let volume = Arc::new(AtomicU8::new(100));
        let transport = TransportState::shared();
        let errors = Arc::new(ErrorChannel::new());

        let render = RenderHandle::spawn(RenderSetup {
            player: id,
            pcm,
            data,
            format,
            device_name: device_name.clone(),
            sink: SinkOptions {
                capacity_frames,
                volume_percent: volume.clone(),
                tuning: sink,
            },
            period: Duration::from_millis(u64::from(time_resolution_ms)),
            transport: transport.clone(),
            errors: errors.clone(),
        })?;

        tracing::info!(
            player = id,
            device = %device_name,
            rate_hz = format.sample_rate,
            channels = format.channels,
            bits = format.bits_per_sample,
            duration_ms,
            time_resolution_ms,
            capacity_frames,
            "player initialized"
        );

        Ok(Player {
            id,
            format,
            timebase,
            duration_ms,
            time_resolution_ms,
            volume,
            transport,
            errors,
            render,
        })
    }

    /// Process-unique id, as used in log fields.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Start or resume playback, optionally on another sink.
    ///
    /// Already playing is not an error: returns `true` and records
    /// [`ErrorKind::AlreadyPlaying`] at info level.
    pub fn play(&self, device: Option<&str>) -> bool {
        self.command(device, Action::Play)
    }

    /// Pause playback. Only valid while playing.
    pub fn pause(&self, device: Option<&str>) -> bool {
        self.command(device, Action::Pause)
    }

    /// Stop and rewind to the start. Always succeeds unless the render thread is gone.
    pub fn stop(&self, device: Option<&str>) {
        self.command(device, Action::Stop);
    }

    /// Move to `millis`, keeping the current state.
    ///
    /// Targets past the end are clamped to the duration; the jump still succeeds and
    /// [`ErrorKind::JumpedBeyondEnd`] is recorded as a warning.
    pub fn jump(&self, device: Option<&str>, millis: u64) -> bool {
        self.command(device, Action::Jump(millis))
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlayerState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state() == PlayerState::Paused
    }

    pub fn state(&self) -> PlayerState {
        status::lock(&self.transport).state
    }

    /// Audible position in milliseconds.
    pub fn current_time_ms(&self) -> u64 {
        let frames = status::lock(&self.transport).position_frames;
        self.timebase.frames_to_millis(frames)
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Last error recorded by a transport call or the render thread.
    pub fn error(&self) -> AudioError {
        self.errors.get()
    }

    pub fn reset_error(&self) {
        self.errors.clear();
    }

    /// Set the output volume in percent; values above 100 are clamped.
    pub fn set_volume(&self, percent: u8) {
        let percent = percent.min(100);
        self.volume.store(percent, Ordering::Relaxed);
        tracing::debug!(player = self.id, volume = percent, "volume changed");
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> PlayerStatus {
        let transport = status::lock(&self.transport).clone();
        PlayerStatus::snapshot(
            self.id,
            &transport,
            &self.timebase,
            self.format,
            self.duration_ms,
            self.volume(),
            self.time_resolution_ms,
            self.error(),
        )
    }

    /// Stop playback, close the sink and release the PCM buffer.
    pub fn destroy(mut self) {
        self.render.shutdown();
        tracing::info!(player = self.id, "player destroyed");
    }

    fn command(&self, device: Option<&str>, action: Action) -> bool {
        let ack = self.render.request(device, action);
        self.errors.record(ack.error);
        ack.accepted
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.render.shutdown();
    }
}

/// PCM bytes, the byte range of whole frames inside them, and their format.
fn split_source(source: AudioSource) -> Result<(Vec<u8>, Range<usize>, PcmFormat), AudioError> {
    match source {
        AudioSource::Wave(bytes) => {
            let layout = wav::parse(&bytes).inspect_err(|e| {
                tracing::warn!(error = %e, "rejected wave data");
            })?;
            Ok((bytes, layout.data, layout.format))
        }
        AudioSource::Raw { data, format } => {
            if !matches!(format.bits_per_sample, 8 | 16 | 24 | 32) {
                return Err(AudioError::error(ErrorKind::UnsupportedBitsPerSample));
            }
            if !format.is_supported() {
                return Err(AudioError::error(ErrorKind::InvalidFormat));
            }
            let len = TimeBase::new(format).align_down(data.len() as u64) as usize;
            Ok((data, 0..len, format))
        }
    }
}

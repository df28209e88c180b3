//! Player error reporting.
//!
//! Every player owns one [`ErrorChannel`] holding the last [`AudioError`]. Transport
//! operations overwrite it (success resets it to [`AudioError::none`]); the render
//! thread records asynchronous device failures into the same slot.

use std::borrow::Cow;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

/// Driver sub-codes carried by device errors (negative errno values, ALSA style).
pub mod device_code {
    pub const IO: i32 = -5;
    pub const BUSY: i32 = -16;
    pub const NO_DEVICE: i32 = -19;
    pub const INVALID: i32 = -22;
    pub const UNDERRUN: i32 = -32;
}

/// Coarse error domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDomain {
    None,
    Configuration,
    Device,
    State,
    Internal,
}

/// Severity. `Info` (0) means "no error".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ErrorLevel {
    /// Informational only; the operation succeeded.
    Info = 0,
    /// The request was degraded or rejected; the player is healthy.
    Warning = 1,
    /// Unrecoverable for this player (or for this init attempt).
    Error = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoError,

    // transport
    AlreadyPlaying,
    AlreadyPaused,
    NotPlaying,
    JumpedBeyondEnd,

    // configuration
    EmptyBuffer,
    InvalidTimeResolution,
    InvalidBufferPeriods,

    // riff/wave
    FileTooSmall,
    InvalidRiffMagic,
    InvalidWaveMagic,
    InvalidFileSize,
    FmtChunkNotFound,
    InvalidFmtSize,
    NotPcmFormat,
    InvalidByteRate,
    InvalidBlockAlign,
    InvalidFormat,
    UnsupportedBitsPerSample,
    DataChunkNotFound,
    InvalidDataSize,

    // sound device
    DeviceOpen,
    DeviceWrite,

    // engine
    ThreadSpawn,
    RenderLoopGone,
}

impl ErrorKind {
    pub fn domain(self) -> ErrorDomain {
        use ErrorKind::*;
        match self {
            NoError => ErrorDomain::None,
            AlreadyPlaying | AlreadyPaused | NotPlaying | JumpedBeyondEnd => ErrorDomain::State,
            EmptyBuffer | InvalidTimeResolution | InvalidBufferPeriods | FileTooSmall
            | InvalidRiffMagic | InvalidWaveMagic | InvalidFileSize | FmtChunkNotFound
            | InvalidFmtSize | NotPcmFormat | InvalidByteRate | InvalidBlockAlign
            | InvalidFormat | UnsupportedBitsPerSample | DataChunkNotFound | InvalidDataSize => {
                ErrorDomain::Configuration
            }
            DeviceOpen | DeviceWrite => ErrorDomain::Device,
            ThreadSpawn | RenderLoopGone => ErrorDomain::Internal,
        }
    }

    /// Static description of the kind.
    pub fn message(self) -> &'static str {
        use ErrorKind::*;
        match self {
            NoError => "No error",
            AlreadyPlaying => "Audio is already playing",
            AlreadyPaused => "Audio is already paused",
            NotPlaying => "Audio is not playing",
            JumpedBeyondEnd => "Jumped beyond end of audio",
            EmptyBuffer => "Audio buffer is empty",
            InvalidTimeResolution => "Time resolution must be greater than zero",
            InvalidBufferPeriods => "Buffer must span at least two time resolutions",
            FileTooSmall => "RIFF file is too small",
            InvalidRiffMagic => "RIFF magic is invalid",
            InvalidWaveMagic => "WAVE magic is invalid",
            InvalidFileSize => "RIFF file size is invalid",
            FmtChunkNotFound => "FMT chunk not found",
            InvalidFmtSize => "FMT size is invalid",
            NotPcmFormat => "Audio format is not PCM",
            InvalidByteRate => "Byte rate is invalid",
            InvalidBlockAlign => "Block align is invalid",
            InvalidFormat => "Sample rate or channel count is invalid",
            UnsupportedBitsPerSample => "Unsupported bits per sample",
            DataChunkNotFound => "DATA chunk not found",
            InvalidDataSize => "DATA size is invalid",
            DeviceOpen => "Sound device could not be opened",
            DeviceWrite => "Sound device write failed",
            ThreadSpawn => "Render thread could not be started",
            RenderLoopGone => "Render thread is not running",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// The last error of a player: kind, severity and an optional driver sub-code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AudioError {
    pub kind: ErrorKind,
    pub level: ErrorLevel,
    /// Driver sub-code; only meaningful when `kind.domain()` is [`ErrorDomain::Device`].
    pub device_code: i32,
}

impl AudioError {
    pub const fn none() -> Self {
        Self {
            kind: ErrorKind::NoError,
            level: ErrorLevel::Info,
            device_code: 0,
        }
    }

    pub const fn info(kind: ErrorKind) -> Self {
        Self {
            kind,
            level: ErrorLevel::Info,
            device_code: 0,
        }
    }

    pub const fn warning(kind: ErrorKind) -> Self {
        Self {
            kind,
            level: ErrorLevel::Warning,
            device_code: 0,
        }
    }

    pub const fn error(kind: ErrorKind) -> Self {
        Self {
            kind,
            level: ErrorLevel::Error,
            device_code: 0,
        }
    }

    pub const fn device(kind: ErrorKind, level: ErrorLevel, device_code: i32) -> Self {
        Self {
            kind,
            level,
            device_code,
        }
    }

    pub fn domain(&self) -> ErrorDomain {
        self.kind.domain()
    }

    /// `true` when the level is [`ErrorLevel::Info`].
    pub fn is_ok(&self) -> bool {
        self.level == ErrorLevel::Info
    }
}

impl Default for AudioError {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&error_string(self))
    }
}

impl std::error::Error for AudioError {}

/// Human-readable text for `error`.
///
/// Pure: derived only from the kind and, for device errors, the sub-code.
pub fn error_string(error: &AudioError) -> Cow<'static, str> {
    if error.domain() == ErrorDomain::Device && error.device_code != 0 {
        Cow::Owned(format!(
            "{}: {} ({})",
            error.kind.message(),
            describe_device_code(error.device_code),
            error.device_code
        ))
    } else {
        Cow::Borrowed(error.kind.message())
    }
}

/// Driver text for a device sub-code.
pub fn describe_device_code(code: i32) -> &'static str {
    match code {
        0 => "Success",
        device_code::IO => "Input/output error",
        device_code::BUSY => "Device or resource busy",
        device_code::NO_DEVICE => "No such device",
        device_code::INVALID => "Invalid argument",
        device_code::UNDERRUN => "Broken pipe (buffer underrun)",
        _ => "Unknown device error",
    }
}

/// Holder of a player's last error.
#[derive(Debug, Default)]
pub struct ErrorChannel {
    slot: Mutex<AudioError>,
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored error.
    pub fn record(&self, error: AudioError) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    pub fn clear(&self) {
        self.record(AudioError::none());
    }

    pub fn get(&self) -> AudioError {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

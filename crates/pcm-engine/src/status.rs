use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::error::{AudioError, error_string};
use crate::format::PcmFormat;
use crate::timebase::TimeBase;

/// Transport state of a player.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    /// Initialized, never played.
    #[default]
    Ready,
    Playing,
    Paused,
    Stopped,
}

/// Transport snapshot published by the render thread.
///
/// The lock is only held to copy fields in or out.
#[derive(Clone, Debug, Default)]
pub struct TransportState {
    pub state: PlayerState,
    /// Audible position in frames from the start of the PCM data.
    pub position_frames: u64,
    /// Resolved name of the sink currently in use.
    pub device: String,
    /// Recoverable underruns seen since init.
    pub underruns: u64,
    /// Set after a fatal device error; cleared when a new sink is opened.
    pub faulted: bool,
}

impl TransportState {
    /// Create a shared, mutex-protected transport store.
    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::default()))
    }
}

/// Lock `transport`, recovering from a poisoned mutex.
pub(crate) fn lock(transport: &Mutex<TransportState>) -> MutexGuard<'_, TransportState> {
    transport.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serializable view of a player, for diagnostics and the CLI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlayerStatus {
    pub player: u64,
    pub state: PlayerState,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub format: PcmFormat,
    pub device: String,
    pub volume: u8,
    pub time_resolution_ms: u32,
    pub underruns: u64,
    pub faulted: bool,
    pub error: AudioError,
    pub error_text: String,
}

impl PlayerStatus {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn snapshot(
        player: u64,
        transport: &TransportState,
        timebase: &TimeBase,
        format: PcmFormat,
        duration_ms: u64,
        volume: u8,
        time_resolution_ms: u32,
        error: AudioError,
    ) -> Self {
        Self {
            player,
            state: transport.state,
            position_ms: timebase.frames_to_millis(transport.position_frames),
            duration_ms,
            format,
            device: transport.device.clone(),
            volume,
            time_resolution_ms,
            underruns: transport.underruns,
            faulted: transport.faulted,
            error,
            error_text: error_string(&error).into_owned(),
        }
    }
}

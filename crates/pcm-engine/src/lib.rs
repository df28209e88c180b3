pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod null;
pub mod playback;
pub mod player;
pub mod queue;
pub mod resample;
pub mod status;
pub mod timebase;
pub mod wav;

mod render;

pub use config::{AudioSource, PlaybackConfiguration, SinkConfig};
pub use error::{AudioError, ErrorDomain, ErrorKind, ErrorLevel, error_string};
pub use format::PcmFormat;
pub use player::Player;
pub use status::{PlayerState, PlayerStatus};

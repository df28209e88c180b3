use std::path::PathBuf;

use clap::Parser;
use pcm_engine::config::{DEFAULT_BUFFER_PERIODS, DEFAULT_TIME_RESOLUTION_MS};

#[derive(Parser, Debug)]
#[command(name = "pcm-play", version)]
pub struct Args {
    /// Path to a PCM WAV file
    #[arg(required_unless_present = "list_devices")]
    pub path: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Output device: "default", "null", or a device name substring
    #[arg(long, default_value = "default")]
    pub device: String,

    /// How often (ms) commands are applied and the device is refilled
    #[arg(long, default_value_t = DEFAULT_TIME_RESOLUTION_MS)]
    pub time_resolution: u32,

    /// Device buffer length, in multiples of the time resolution
    #[arg(long, default_value_t = DEFAULT_BUFFER_PERIODS)]
    pub buffer_periods: u32,

    /// Initial volume percent [0..100]
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub volume: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let args = Args::try_parse_from(["pcm-play", "a.wav"]).unwrap();
        assert_eq!(args.path, Some(PathBuf::from("a.wav")));
        assert_eq!(args.device, "default");
        assert_eq!(args.time_resolution, DEFAULT_TIME_RESOLUTION_MS);
        assert_eq!(args.volume, 100);
    }

    #[test]
    fn list_devices_needs_no_path() {
        let args = Args::try_parse_from(["pcm-play", "--list-devices"]).unwrap();
        assert!(args.list_devices);
        assert!(Args::try_parse_from(["pcm-play"]).is_err());
    }

    #[test]
    fn volume_is_range_checked() {
        assert!(Args::try_parse_from(["pcm-play", "--volume", "101", "a.wav"]).is_err());
        let args =
            Args::try_parse_from(["pcm-play", "--volume", "30", "--device", "null", "a.wav"])
                .unwrap();
        assert_eq!(args.volume, 30);
        assert_eq!(args.device, "null");
    }
}

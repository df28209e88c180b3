//! pcm-play: play a PCM WAV file and control playback from stdin.
//!
//! The file is read into memory, handed to a [`Player`] and started right away. Each
//! line on stdin is one command (`h` lists them). Warnings left by a command are printed
//! to stderr.

mod cli;
mod repl;

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use pcm_engine::{PlaybackConfiguration, Player, error_string};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,pcm_engine=info,pcm_play=info")
        }))
        .with_writer(std::io::stderr)
        .init();

    if args.list_devices {
        pcm_engine::device::list_devices(&cpal::default_host())?;
        return Ok(());
    }

    let path = args.path.as_ref().context("missing WAV path")?;
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    tracing::info!(path = %path.display(), bytes = bytes.len(), "loaded file");
    let config = PlaybackConfiguration::wave(bytes)
        .with_device(args.device.as_str())
        .with_time_resolution(args.time_resolution)
        .with_buffer_periods(args.buffer_periods);

    let player = Player::init(config)
        .map_err(|e| anyhow!("{}: {}", path.display(), error_string(&e)))?;
    let player = Arc::new(player);
    player.set_volume(args.volume);
    println!(
        "Total duration: {:.2} seconds",
        player.total_duration_ms() as f64 / 1000.0
    );

    let weak = Arc::downgrade(&player);
    let _ = ctrlc::set_handler(move || {
        if let Some(player) = weak.upgrade() {
            player.stop(None);
        }
        std::process::exit(130);
    });

    if !player.play(None) {
        return Err(anyhow!("play failed: {}", error_string(&player.error())));
    }
    println!("Playing\nEnter 'q' to quit");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        match repl::parse(&line) {
            Ok(cmd) => {
                if !repl::execute(&player, cmd)? {
                    break;
                }
            }
            Err(e) => eprintln!("{e:#}"),
        }
    }

    match Arc::try_unwrap(player) {
        Ok(player) => player.destroy(),
        Err(player) => drop(player),
    }
    Ok(())
}

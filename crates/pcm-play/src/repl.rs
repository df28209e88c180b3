//! Line-oriented playback commands read from stdin.

use anyhow::{Context, Result, anyhow, bail};
use pcm_engine::{ErrorLevel, Player, error_string};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Help,
    Pause,
    Play,
    Stop,
    Jump(u64),
    Time,
    SetVolume(u8),
    ShowVolume,
    Status,
    Quit,
}

pub const HELP: &str = "\
h        Show help.
p        Pause playback.
r        Resume/start playback.
s        Stop playback.
j T      Jump to T milliseconds.
t        Show current time.
v V      Set volume to V [0..100].
?        Show current volume [0..100].
i        Show player status as JSON.
q        Quit.
";

pub fn parse(line: &str) -> Result<Command> {
    let mut parts = line.split_whitespace();
    let Some(head) = parts.next() else {
        bail!("empty command");
    };
    let cmd = match head {
        "h" => Command::Help,
        "p" => Command::Pause,
        "r" => Command::Play,
        "s" => Command::Stop,
        "t" => Command::Time,
        "?" => Command::ShowVolume,
        "i" => Command::Status,
        "q" => Command::Quit,
        "j" => {
            let arg = parts.next().ok_or_else(|| anyhow!("missing time"))?;
            Command::Jump(arg.parse().with_context(|| format!("invalid time {arg:?}"))?)
        }
        "v" => {
            let arg = parts.next().ok_or_else(|| anyhow!("missing volume"))?;
            let v: u8 = arg.parse().with_context(|| format!("invalid volume {arg:?}"))?;
            if v > 100 {
                bail!("volume must be in 0..=100");
            }
            Command::SetVolume(v)
        }
        other => bail!("unrecognized command {other:?}, type 'h' for help"),
    };
    if parts.next().is_some() {
        bail!("too many arguments");
    }
    Ok(cmd)
}

/// Apply `cmd` and print its outcome. Returns `false` once the user quits.
pub fn execute(player: &Player, cmd: Command) -> Result<bool> {
    match cmd {
        Command::Help => print!("{HELP}"),
        Command::Pause => {
            if player.pause(None) {
                println!("Paused");
            }
        }
        Command::Play => {
            if player.play(None) {
                println!("Play/Resumed");
            }
        }
        Command::Stop => {
            player.stop(None);
            println!("Stopped");
        }
        Command::Jump(ms) => {
            if player.jump(None, ms) {
                println!("Jumped to {} milliseconds", player.current_time_ms());
            }
        }
        Command::Time => {
            let secs = player.current_time_ms() as f64 / 1000.0;
            println!("Current time: {secs:.2} seconds");
        }
        Command::SetVolume(v) => {
            player.set_volume(v);
            println!("Set volume to {v}");
        }
        Command::ShowVolume => println!("Current volume: {}", player.volume()),
        Command::Status => {
            let json = serde_json::to_string_pretty(&player.status()).context("encode status")?;
            println!("{json}");
        }
        Command::Quit => {
            println!("Quitting");
            return Ok(false);
        }
    }

    let error = player.error();
    if error.level >= ErrorLevel::Warning {
        eprintln!("{}: {}", level_label(error.level), error_string(&error));
    }
    Ok(true)
}

fn level_label(level: ErrorLevel) -> &'static str {
    match level {
        ErrorLevel::Info => "Info",
        ErrorLevel::Warning => "Warning",
        ErrorLevel::Error => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_letter_commands() {
        assert_eq!(parse("h").unwrap(), Command::Help);
        assert_eq!(parse(" p ").unwrap(), Command::Pause);
        assert_eq!(parse("r").unwrap(), Command::Play);
        assert_eq!(parse("s").unwrap(), Command::Stop);
        assert_eq!(parse("t").unwrap(), Command::Time);
        assert_eq!(parse("?").unwrap(), Command::ShowVolume);
        assert_eq!(parse("i").unwrap(), Command::Status);
        assert_eq!(parse("q").unwrap(), Command::Quit);
    }

    #[test]
    fn parses_arguments() {
        assert_eq!(parse("j 1500").unwrap(), Command::Jump(1500));
        assert_eq!(parse("v 40").unwrap(), Command::SetVolume(40));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("").is_err());
        assert!(parse("x").is_err());
        assert!(parse("j").is_err());
        assert!(parse("j soon").is_err());
        assert!(parse("v 101").is_err());
        assert!(parse("p now").is_err());
    }
}

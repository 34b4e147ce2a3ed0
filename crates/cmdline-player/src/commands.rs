//! Interactive commands: parsing, help text and execution.

use std::io::Write;
use std::sync::Arc;

use playback_pipeline::processing::SoftVolumeControl;
use playback_pipeline::{Media, Pipeline, PlaybackProperties, PlayerState, PositionUnit};

const NANOS_PER_MS: i64 = 1_000_000;

struct CommandSpec {
    name: &'static str,
    required_args: usize,
    args_desc: &'static str,
    description: &'static str,
}

/// Every command, in help order.
const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "getvolume",
        required_args: 0,
        args_desc: "",
        description: "prints the current volume in the 0.0 .. 1.0 range",
    },
    CommandSpec {
        name: "help",
        required_args: 0,
        args_desc: "",
        description: "lists the commands",
    },
    CommandSpec {
        name: "ismuted",
        required_args: 0,
        args_desc: "",
        description: "checks if playback is currently muted",
    },
    CommandSpec {
        name: "ispaused",
        required_args: 0,
        args_desc: "",
        description: "checks if playback is currently paused",
    },
    CommandSpec {
        name: "mute",
        required_args: 1,
        args_desc: "<mute yes/no>",
        description: "mutes playback if the argument is \"yes\", unmutes otherwise",
    },
    CommandSpec {
        name: "pause",
        required_args: 1,
        args_desc: "<pause yes/no>",
        description: "pauses playback if the argument is \"yes\", resumes otherwise; ignored if nothing is playing",
    },
    CommandSpec {
        name: "play",
        required_args: 1,
        args_desc: "<URI> [now yes/no]",
        description: "plays the given URI; with \"no\" it follows the current media, or plays right away if nothing is playing",
    },
    CommandSpec {
        name: "quit",
        required_args: 0,
        args_desc: "",
        description: "exits the player",
    },
    CommandSpec {
        name: "seek",
        required_args: 1,
        args_desc: "<position in milliseconds>",
        description: "seeks to the given position if the media allows it",
    },
    CommandSpec {
        name: "setvolume",
        required_args: 1,
        args_desc: "<volume>",
        description: "sets the volume in the 0.0 .. 1.0 range",
    },
    CommandSpec {
        name: "stop",
        required_args: 0,
        args_desc: "",
        description: "stops any current playback",
    },
    CommandSpec {
        name: "tell",
        required_args: 0,
        args_desc: "",
        description: "prints the current playback position in milliseconds",
    },
];

#[derive(Debug, PartialEq)]
pub enum Command {
    Play { uri: String, now: bool },
    Pause(bool),
    IsPaused,
    Stop,
    Seek { ms: i64 },
    Tell,
    SetVolume(f64),
    GetVolume,
    Mute(bool),
    IsMuted,
    Help,
    Quit,
}

#[derive(Debug, PartialEq)]
pub enum ParseError {
    Unknown(String),
    NotEnoughArguments {
        expected: usize,
        got: usize,
        usage: String,
    },
    InvalidArgument {
        value: String,
        usage: String,
    },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Unknown(name) => write!(f, "Unknown command \"{name}\""),
            ParseError::NotEnoughArguments {
                expected,
                got,
                usage,
            } => write!(
                f,
                "Not enough arguments: expected: {expected} got: {got}\n  Usage: {usage}"
            ),
            ParseError::InvalidArgument { value, usage } => {
                write!(f, "Invalid argument \"{value}\"\n  Usage: {usage}")
            }
        }
    }
}

fn usage(spec: &CommandSpec) -> String {
    format!("{} {}", spec.name, spec.args_desc).trim_end().to_string()
}

/// Turn a tokenized line into a command.
pub fn parse(tokens: &[String]) -> Result<Command, ParseError> {
    let Some((name, args)) = tokens.split_first() else {
        return Err(ParseError::Unknown(String::new()));
    };
    let spec = COMMANDS
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| ParseError::Unknown(name.clone()))?;
    if args.len() < spec.required_args {
        return Err(ParseError::NotEnoughArguments {
            expected: spec.required_args,
            got: args.len(),
            usage: usage(spec),
        });
    }

    let invalid = |value: &str| ParseError::InvalidArgument {
        value: value.to_string(),
        usage: usage(spec),
    };
    let yes = |value: &str| value == "yes";

    let command = match spec.name {
        "play" => Command::Play {
            uri: args[0].clone(),
            now: args.get(1).is_none_or(|a| a != "no"),
        },
        "pause" => Command::Pause(yes(&args[0])),
        "ispaused" => Command::IsPaused,
        "stop" => Command::Stop,
        "seek" => Command::Seek {
            ms: args[0].parse().map_err(|_| invalid(&args[0]))?,
        },
        "tell" => Command::Tell,
        "setvolume" => {
            let volume: f64 = args[0].parse().map_err(|_| invalid(&args[0]))?;
            if !(0.0..=1.0).contains(&volume) {
                return Err(invalid(&args[0]));
            }
            Command::SetVolume(volume)
        }
        "getvolume" => Command::GetVolume,
        "mute" => Command::Mute(yes(&args[0])),
        "ismuted" => Command::IsMuted,
        "help" => Command::Help,
        "quit" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(command)
}

/// The command list as printed by `help`.
pub fn help_text() -> String {
    let width = COMMANDS
        .iter()
        .map(|c| usage(c).len())
        .max()
        .unwrap_or(0);
    let mut out = String::from("Command list:\n\n");
    for spec in COMMANDS {
        out.push_str(&format!("  {:<width$} : {}\n", usage(spec), spec.description));
    }
    out
}

pub enum Flow {
    Continue,
    Quit,
}

/// What the commands act on.
pub struct Session {
    pub pipeline: Pipeline,
    pub volume: Arc<SoftVolumeControl>,
}

impl Session {
    pub fn play(&self, uri: &str, now: bool) -> bool {
        let token = self.pipeline.new_token();
        self.pipeline
            .play_media(token, Media::new(uri), now, PlaybackProperties::default())
    }

    pub fn execute(&self, command: Command, out: &mut impl Write) -> std::io::Result<Flow> {
        match command {
            Command::Play { uri, now } => {
                if !self.play(&uri, now) {
                    writeln!(out, "Could not play {uri}")?;
                }
            }
            Command::Pause(paused) => self.pipeline.set_paused(paused),
            Command::IsPaused => {
                let paused = self.pipeline.current_state() == PlayerState::Paused;
                writeln!(out, "Is currently paused: {}", yes_no(paused))?;
            }
            Command::Stop => self.pipeline.stop(),
            Command::Seek { ms } => self
                .pipeline
                .set_current_position(ms.saturating_mul(NANOS_PER_MS), PositionUnit::Nanoseconds),
            Command::Tell => {
                let position = self.pipeline.current_position(PositionUnit::Nanoseconds);
                if position < 0 {
                    writeln!(out, "Current position is unknown")?;
                } else {
                    writeln!(out, "Current position in ms: {}", position / NANOS_PER_MS)?;
                }
            }
            Command::SetVolume(volume) => self.volume.set_volume(volume),
            Command::GetVolume => writeln!(out, "Current volume: {}", self.volume.volume())?,
            Command::Mute(muted) => self.volume.set_muted(muted),
            Command::IsMuted => {
                writeln!(out, "Is currently muted: {}", yes_no(self.volume.is_muted()))?
            }
            Command::Help => write!(out, "{}", help_text())?,
            Command::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tokenize_line;

    fn parse_line(line: &str) -> Result<Command, ParseError> {
        parse(&tokenize_line(line))
    }

    #[test]
    fn play_defaults_to_now() {
        assert_eq!(
            parse_line("play /a.flac").unwrap(),
            Command::Play {
                uri: "/a.flac".into(),
                now: true
            }
        );
        assert_eq!(
            parse_line("play '/b c.flac' no").unwrap(),
            Command::Play {
                uri: "/b c.flac".into(),
                now: false
            }
        );
    }

    #[test]
    fn every_listed_command_parses_to_itself() {
        for spec in COMMANDS {
            let mut tokens = vec![spec.name.to_string()];
            tokens.extend((0..spec.required_args).map(|_| "1".to_string()));
            let command = parse(&tokens).unwrap();
            assert_eq!(command == Command::Quit, spec.name == "quit", "{}", spec.name);
        }
    }

    #[test]
    fn yes_no_arguments() {
        assert_eq!(parse_line("pause yes").unwrap(), Command::Pause(true));
        assert_eq!(parse_line("pause whatever").unwrap(), Command::Pause(false));
        assert_eq!(parse_line("mute yes").unwrap(), Command::Mute(true));
    }

    #[test]
    fn numeric_arguments() {
        assert_eq!(parse_line("seek 1500").unwrap(), Command::Seek { ms: 1500 });
        assert_eq!(parse_line("setvolume 0.5").unwrap(), Command::SetVolume(0.5));
        assert!(matches!(
            parse_line("seek soon"),
            Err(ParseError::InvalidArgument { .. })
        ));
        assert!(matches!(
            parse_line("setvolume 1.5"),
            Err(ParseError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn missing_arguments_report_usage() {
        let err = parse_line("seek").unwrap_err();
        assert_eq!(
            err,
            ParseError::NotEnoughArguments {
                expected: 1,
                got: 0,
                usage: "seek <position in milliseconds>".into()
            }
        );
        assert!(err.to_string().contains("Usage: seek"));
    }

    #[test]
    fn unknown_commands_are_reported() {
        let err = parse_line("rewind 10").unwrap_err();
        assert_eq!(err.to_string(), "Unknown command \"rewind\"");
    }

    #[test]
    fn help_lists_every_command() {
        let help = help_text();
        for spec in COMMANDS {
            assert!(help.contains(spec.name), "{} missing", spec.name);
        }
        assert!(help.contains("\n  seek <position in milliseconds> : seeks"));
        assert!(help.contains("\n  play <URI> [now yes/no]         : plays"));
    }
}

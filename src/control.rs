use std::ops::RangeInclusive;

use crossbeam::channel::{SendError, Sender};
use serde::{Deserialize, Serialize};

use crate::music;
use crate::source::SourceControl;

/// Tempos the beat clock accepts.
pub const BPM_RANGE: RangeInclusive<f64> = 1.0..=1000.0;

pub fn valid_bpm(bpm: f64) -> bool {
    BPM_RANGE.contains(&bpm)
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    SetKey(u8),
    SetScale(String),
    SetBpm(f64),
    SetChordMode(String),
    SetVelocityMode(String),
    Start,
    Stop,
    /// Stop taking values, let pending notes finish, then leave the run loop.
    Shutdown,
    Source(SourceCommand),
}

/// Runtime controls for the metric source rather than the sequencer.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceCommand {
    /// Resume feeding values.
    Start,
    /// Hold values in the ring until started again.
    Stop,
    SetPollRate(u64),
    SetOutputRate(u64),
    /// Switch the live query; the ring is refilled from the new query.
    Query(String),
}

/// Sends each command to whichever thread owns the state it changes.
#[derive(Clone)]
pub struct Controls {
    sequencer: Sender<Command>,
    source: Option<SourceControl>,
}

impl Controls {
    pub fn new(sequencer: Sender<Command>, source: Option<SourceControl>) -> Self {
        Controls { sequencer, source }
    }

    /// Fails only when the sequencer has gone away.
    pub fn send(&self, command: Command) -> Result<(), SendError<Command>> {
        match command {
            Command::Source(command) => {
                match &self.source {
                    Some(source) => source.send(command),
                    None => tracing::warn!("No metric source to apply {:?} to", command),
                }
                Ok(())
            }
            command => self.sequencer.send(command),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChordMode {
    None,
    MajorOnly,
    MinorOnly,
    AscendingMajDescMin,
    AscendingMinDescMaj,
}

impl Default for ChordMode {
    fn default() -> Self {
        Self::None
    }
}

impl ChordMode {
    pub const ALL: [ChordMode; 5] = [
        ChordMode::None,
        ChordMode::MajorOnly,
        ChordMode::MinorOnly,
        ChordMode::AscendingMajDescMin,
        ChordMode::AscendingMinDescMaj,
    ];
    pub const NAMES: [&'static str; 5] = [
        "none",
        "majorOnly",
        "minorOnly",
        "ascendingMajDescMin",
        "ascendingMinDescMaj",
    ];

    pub fn name(self) -> &'static str {
        Self::NAMES[self as usize]
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .position(|candidate| candidate.eq_ignore_ascii_case(name))
            .map(|i| Self::ALL[i])
    }

    pub fn next(self) -> Self {
        Self::ALL[(self as usize + 1) % Self::ALL.len()]
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VelocityMode {
    Fixed,
    Variance,
}

impl Default for VelocityMode {
    fn default() -> Self {
        Self::Variance
    }
}

impl VelocityMode {
    pub const ALL: [VelocityMode; 2] = [VelocityMode::Fixed, VelocityMode::Variance];
    pub const NAMES: [&'static str; 2] = ["fixed", "variance"];

    pub fn name(self) -> &'static str {
        Self::NAMES[self as usize]
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .position(|candidate| candidate.eq_ignore_ascii_case(name))
            .map(|i| Self::ALL[i])
    }

    pub fn next(self) -> Self {
        Self::ALL[(self as usize + 1) % Self::ALL.len()]
    }
}

fn parse_ms(text: &str) -> Option<u64> {
    text.parse::<u64>().ok().filter(|&ms| ms > 0)
}

/// Parses one line of the text command protocol, e.g. `bpm 96` or
/// `scale Dorian`. Anything unrecognised is logged and yields `None`.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (word, argument) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let command = match (word.to_ascii_lowercase().as_str(), argument) {
        ("start", _) => Some(Command::Start),
        ("stop", _) => Some(Command::Stop),
        ("quit", _) | ("exit", _) => Some(Command::Shutdown),
        (_, "") => {
            tracing::warn!("Command {:?} is missing an argument", line);
            return None;
        }
        ("key", key) => music::key_index(key)
            .or_else(|| key.parse::<u8>().ok().filter(|&i| i < 12))
            .map(Command::SetKey),
        ("scale" | "mode", name) => Some(Command::SetScale(name.to_owned())),
        ("bpm", bpm) => bpm
            .parse::<f64>()
            .ok()
            .filter(|&bpm| valid_bpm(bpm))
            .map(Command::SetBpm),
        ("chords" | "chord", mode) => Some(Command::SetChordMode(mode.to_owned())),
        ("velocity", mode) => Some(Command::SetVelocityMode(mode.to_owned())),
        ("source", action) => match action.to_ascii_lowercase().as_str() {
            "start" => Some(Command::Source(SourceCommand::Start)),
            "stop" => Some(Command::Source(SourceCommand::Stop)),
            _ => None,
        },
        ("poll", ms) => parse_ms(ms).map(|ms| Command::Source(SourceCommand::SetPollRate(ms))),
        ("rate", ms) => parse_ms(ms).map(|ms| Command::Source(SourceCommand::SetOutputRate(ms))),
        ("query", query) => Some(Command::Source(SourceCommand::Query(query.to_owned()))),
        _ => {
            tracing::warn!("Unknown command {:?}", line);
            return None;
        }
    };
    if command.is_none() {
        tracing::warn!("Bad argument in command {:?}", line);
    }
    command
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::control::{self, ChordMode, VelocityMode};
use crate::midi;
use crate::music;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub sequencer: SequencerConfig,
    #[serde(default)]
    pub midi: MidiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SourceConfig {
    Prometheus {
        server: String,
        query: String,
        /// Unix seconds of the backfill range; `end` defaults to now.
        #[serde(default)]
        start: Option<f64>,
        #[serde(default)]
        end: Option<f64>,
        #[serde(default = "SourceConfig::default_step")]
        step: u32,
        #[serde(default)]
        live: bool,
        #[serde(default = "SourceConfig::default_poll_ms")]
        poll_ms: u64,
        #[serde(default = "SourceConfig::default_output_rate_ms")]
        output_rate_ms: u64,
        #[serde(default = "SourceConfig::default_ring_size")]
        ring_size: usize,
    },
    Replay {
        path: PathBuf,
        #[serde(default = "SourceConfig::default_output_rate_ms")]
        output_rate_ms: u64,
        #[serde(default = "SourceConfig::default_ring_size")]
        ring_size: usize,
    },
}

impl SourceConfig {
    fn default_step() -> u32 {
        600
    }
    fn default_poll_ms() -> u64 {
        600
    }
    fn default_output_rate_ms() -> u64 {
        600
    }
    fn default_ring_size() -> usize {
        10_000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub intervals: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub default_key: String,
    pub default_scale: String,
    pub bpm: f64,
    pub ticks_per_beat: u32,
    pub max_events: usize,
    pub history_len: usize,
    /// Beats a melody note sounds for.
    pub note_duration: u32,
    pub chord_duration: u32,
    pub melody_channel: u8,
    pub chord_channel: u8,
    pub melody_octave: u8,
    pub chord_octave: u8,
    pub default_velocity: u8,
    pub max_velocity: u8,
    pub velocity_mode: VelocityMode,
    pub chord_mode: ChordMode,
    pub autostart: bool,
    pub scales: Vec<ScaleConfig>,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            default_key: "A".to_owned(),
            default_scale: String::new(),
            bpm: 120.0,
            ticks_per_beat: 4,
            max_events: 64,
            history_len: 20,
            note_duration: 4,
            chord_duration: 4,
            melody_channel: 0,
            chord_channel: 1,
            melody_octave: 4,
            chord_octave: 2,
            default_velocity: 64,
            max_velocity: 127,
            velocity_mode: VelocityMode::default(),
            chord_mode: ChordMode::default(),
            autostart: true,
            scales: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Jack,
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiConfig {
    pub backend: BackendKind,
    pub client_name: String,
    /// JACK ports to connect the output port to.
    pub connect: Vec<String>,
    pub queue_size: usize,
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            backend: if cfg!(feature = "jack") {
                BackendKind::Jack
            } else {
                BackendKind::Log
            },
            client_name: "chime".to_owned(),
            connect: Vec::new(),
            queue_size: 1024,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let SourceConfig::Prometheus { server, query, .. } = &self.source {
            if server.is_empty() {
                bail!("no Prometheus server is defined");
            }
            if query.is_empty() {
                bail!("no Prometheus query is defined");
            }
        }
        self.sequencer.validate()?;
        if self.midi.queue_size == 0 {
            bail!("midi queue_size must be at least 1");
        }
        Ok(())
    }
}

impl SequencerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scales.is_empty() {
            bail!("sequencer configuration doesn't contain any scale definitions");
        }
        for scale in &self.scales {
            if scale.name.is_empty() {
                bail!("scale defined without name");
            }
            if scale.intervals.is_empty() {
                bail!("{} scale defined without any intervals", scale.name);
            }
            if scale.intervals.contains(&0) {
                bail!("{} scale has a zero interval", scale.name);
            }
        }
        if !self.scales.iter().any(|scale| scale.name == self.default_scale) {
            bail!("default scale {:?} is not defined", self.default_scale);
        }
        if music::key_index(&self.default_key).is_none() {
            bail!(
                "default key {:?} is not one of {:?}",
                self.default_key,
                music::KEY_NAMES
            );
        }
        if !control::valid_bpm(self.bpm) {
            bail!(
                "bpm must be within {:?}, got {}",
                control::BPM_RANGE,
                self.bpm
            );
        }
        for (name, value) in [
            ("ticks_per_beat", self.ticks_per_beat as usize),
            ("max_events", self.max_events),
            ("history_len", self.history_len),
            ("note_duration", self.note_duration as usize),
            ("chord_duration", self.chord_duration as usize),
        ] {
            if value == 0 {
                bail!("{} must be at least 1", name);
            }
        }
        for (name, channel) in [
            ("melody_channel", self.melody_channel),
            ("chord_channel", self.chord_channel),
        ] {
            if channel as usize >= midi::CHANNELS {
                bail!("{} must be below {}, got {}", name, midi::CHANNELS, channel);
            }
        }
        if self.max_velocity > 127 {
            bail!("max_velocity must be at most 127");
        }
        if self.default_velocity > self.max_velocity {
            bail!("default_velocity must not exceed max_velocity");
        }
        Ok(())
    }
}

use std::collections::VecDeque;
use std::io::{stdin, stdout, Write};
use std::thread::spawn;

use anyhow::Result;
use crossbeam::channel::{self, Receiver};
use crossbeam::select;
use termion::cursor::HideCursor;
use termion::event::Key;
use termion::input::TermRead;
use termion::raw::IntoRawMode;
use termion::screen::AlternateScreen;

use crate::config::SequencerConfig;
use crate::control::{
    self, ChordMode, Command, Controls, SourceCommand, VelocityMode,
};
use crate::music;
use crate::seq::Report;

const RECENT: usize = 12;
const BPM_STEP: f64 = 5.0;

/// Everything the terminal shows. Owned by the UI loop; the sequencer only
/// hears about changes through commands.
#[derive(Clone, Debug)]
pub struct UiState {
    pub scale_names: Vec<String>,
    pub key: u8,
    pub scale: usize,
    pub bpm: f64,
    pub chord_mode: ChordMode,
    pub velocity_mode: VelocityMode,
    pub running: bool,
    /// Whether the metric source is feeding values.
    pub feeding: bool,
    pub prompt: Option<String>,
    pub recent: VecDeque<Report>,
}

impl UiState {
    pub fn new(config: &SequencerConfig, scale_names: Vec<String>) -> Self {
        let scale = scale_names
            .iter()
            .position(|name| *name == config.default_scale)
            .unwrap_or(0);
        UiState {
            scale_names,
            key: music::key_index(&config.default_key).unwrap_or(0),
            scale,
            bpm: config.bpm,
            chord_mode: config.chord_mode,
            velocity_mode: config.velocity_mode,
            running: config.autostart,
            feeding: true,
            prompt: None,
            recent: VecDeque::with_capacity(RECENT),
        }
    }

    pub fn on_report(&mut self, report: Report) {
        if self.recent.len() >= RECENT {
            self.recent.pop_back();
        }
        self.recent.push_front(report);
    }

    /// Turns a key press into a command for the sequencer. `Shutdown` means
    /// the UI is done.
    pub fn on_key(&mut self, key: Key) -> Option<Command> {
        if let Some(prompt) = &mut self.prompt {
            match key {
                Key::Char('\n') => {
                    let line = std::mem::take(prompt);
                    self.prompt = None;
                    let command = control::parse_command(&line)?;
                    self.mirror(&command);
                    return Some(command);
                }
                Key::Esc => self.prompt = None,
                Key::Backspace => {
                    prompt.pop();
                }
                Key::Char(c) => prompt.push(c),
                _ => (),
            }
            return None;
        }
        let command = match key {
            Key::Left => Command::SetKey((self.key + 11) % 12),
            Key::Right => Command::SetKey((self.key + 1) % 12),
            Key::Up | Key::Down if self.scale_names.is_empty() => return None,
            Key::Up => {
                let len = self.scale_names.len();
                Command::SetScale(self.scale_names[(self.scale + len - 1) % len].clone())
            }
            Key::Down => {
                let len = self.scale_names.len();
                Command::SetScale(self.scale_names[(self.scale + 1) % len].clone())
            }
            Key::Char('+') | Key::Char('=') => {
                Command::SetBpm((self.bpm + BPM_STEP).min(*control::BPM_RANGE.end()))
            }
            Key::Char('-') => Command::SetBpm((self.bpm - BPM_STEP).max(BPM_STEP)),
            Key::Char('c') => Command::SetChordMode(self.chord_mode.next().name().to_owned()),
            Key::Char('v') => {
                Command::SetVelocityMode(self.velocity_mode.next().name().to_owned())
            }
            Key::Char(' ') if self.running => Command::Stop,
            Key::Char(' ') => Command::Start,
            Key::Char('p') if self.feeding => Command::Source(SourceCommand::Stop),
            Key::Char('p') => Command::Source(SourceCommand::Start),
            Key::Char(':') => {
                self.prompt = Some(String::new());
                return None;
            }
            Key::Char('q') | Key::Ctrl('c') => Command::Shutdown,
            _ => return None,
        };
        self.mirror(&command);
        Some(command)
    }

    /// Applies a command to the displayed state, skipping names the
    /// sequencer will reject anyway.
    fn mirror(&mut self, command: &Command) {
        match command {
            Command::SetKey(key) => self.key = *key % 12,
            Command::SetScale(name) => {
                if let Some(position) = self.scale_names.iter().position(|n| n == name) {
                    self.scale = position;
                }
            }
            Command::SetBpm(bpm) => self.bpm = *bpm,
            Command::SetChordMode(name) => {
                if let Some(mode) = ChordMode::from_name(name) {
                    self.chord_mode = mode;
                }
            }
            Command::SetVelocityMode(name) => {
                if let Some(mode) = VelocityMode::from_name(name) {
                    self.velocity_mode = mode;
                }
            }
            Command::Start => self.running = true,
            Command::Stop => self.running = false,
            Command::Source(SourceCommand::Start) => self.feeding = true,
            Command::Source(SourceCommand::Stop) => self.feeding = false,
            Command::Source(_) | Command::Shutdown => (),
        }
    }

    pub fn render(&self, out: &mut impl Write) -> std::io::Result<()> {
        write!(
            out,
            "{}{}chime\r\n\r\n",
            termion::clear::All,
            termion::cursor::Goto(1, 1)
        )?;
        write!(
            out,
            "  key    {:<4} (left/right)\r\n",
            music::KEY_NAMES[self.key as usize % 12]
        )?;
        write!(
            out,
            "  scale  {:<20} (up/down)\r\n",
            self.scale_names
                .get(self.scale)
                .map(String::as_str)
                .unwrap_or("-")
        )?;
        write!(out, "  bpm    {:<6.1} (+/-)\r\n", self.bpm)?;
        write!(out, "  chords {:<20} (c)\r\n", self.chord_mode.name())?;
        write!(
            out,
            "  vel    {:<20} (v: {})\r\n",
            self.velocity_mode.name(),
            VelocityMode::NAMES.join("/")
        )?;
        write!(
            out,
            "  state  {:<20} (space)\r\n",
            if self.running { "running" } else { "stopped" }
        )?;
        write!(
            out,
            "  feed   {:<20} (p)\r\n\r\n",
            if self.feeding { "feeding" } else { "paused" }
        )?;
        for report in &self.recent {
            write!(
                out,
                "  {:>12.3} -> {:<2} {:<3} note {:>3} vel {:>3}{}\r\n",
                report.value,
                report.degree,
                report.note,
                report.pitch,
                report.velocity,
                match report.chord {
                    Some(music::Triad::Major) => " +maj",
                    Some(music::Triad::Minor) => " +min",
                    None => "",
                }
            )?;
        }
        match &self.prompt {
            Some(prompt) => write!(out, "\r\n:{}", prompt)?,
            None => write!(out, "\r\n(: command, q quit)")?,
        }
        out.flush()
    }
}

/// Runs the terminal surface until the user quits. The final `Shutdown` is
/// sent before returning.
pub fn run(mut state: UiState, controls: Controls, reports: Receiver<Report>) -> Result<()> {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        println!("{}", termion::screen::ToMainScreen);
        default_hook(info);
    }));
    let mut stdout = {
        let stdout = stdout().into_raw_mode()?;
        let stdout = AlternateScreen::from(stdout);
        HideCursor::from(stdout)
    };
    let (key_tx, key_rx) = channel::bounded(0);
    spawn(move || {
        for key in stdin().keys() {
            let key = match key {
                Ok(key) => key,
                Err(_) => return,
            };
            if key_tx.send(key).is_err() {
                return;
            }
        }
    });

    state.render(&mut stdout)?;
    loop {
        select! {
            recv(key_rx) -> key => {
                let command = match key {
                    Ok(key) => state.on_key(key),
                    Err(_) => Some(Command::Shutdown),
                };
                if let Some(command) = command {
                    let done = command == Command::Shutdown;
                    if controls.send(command).is_err() || done {
                        break;
                    }
                }
            },
            recv(reports) -> report => match report {
                Ok(report) => state.on_report(report),
                Err(_) => break,
            },
        }
        state.render(&mut stdout)?;
    }
    Ok(())
}

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam::channel::{Receiver, Sender, TryRecvError};

use crate::config::SequencerConfig;
use crate::control::{self, ChordMode, Command, VelocityMode};
use crate::midi::{self, NoteSink};
use crate::music::{self, Scale, ScaleTable, Triad};
use crate::velocity::{History, VelocityEstimator};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Note,
    ChordTone,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventState {
    Ready,
    Active,
    Stopping,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub state: EventState,
    /// Beats left to sound, counted down once per beat while active.
    pub remaining: u32,
    /// Position in the scale the note was mapped against.
    pub degree: usize,
    pub octave: u8,
    pub channel: u8,
    pub velocity: u8,
    /// Bound when the event is created so note-on and note-off always match.
    pub pitch: u8,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Slot {
    Free,
    Pending(Event),
}

/// Fixed number of reusable event slots. Inserting into a full table drops
/// the event.
#[derive(Clone, Debug)]
pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        SlotTable {
            slots: vec![Slot::Free; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn insert(&mut self, event: Event) -> bool {
        match self.slots.iter_mut().find(|slot| **slot == Slot::Free) {
            Some(slot) => {
                *slot = Slot::Pending(event);
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &Event> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Pending(event) => Some(event),
            Slot::Free => None,
        })
    }

    pub fn count(&self, state: EventState) -> usize {
        self.pending().filter(|event| event.state == state).count()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().next().is_none()
    }
}

/// Tick phase within the current beat.
#[derive(Clone, Debug)]
pub struct TickClock {
    tick: u32,
    ticks_per_beat: u32,
    bpm: f64,
}

impl TickClock {
    pub fn new(bpm: f64, ticks_per_beat: u32) -> Self {
        TickClock {
            tick: 0,
            ticks_per_beat: ticks_per_beat.max(1),
            bpm,
        }
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn set_bpm(&mut self, bpm: f64) {
        self.bpm = bpm;
    }

    pub fn ms_per_beat(&self) -> f64 {
        60_000.0 / self.bpm
    }

    pub fn ms_per_tick(&self) -> f64 {
        self.ms_per_beat() / self.ticks_per_beat as f64
    }

    /// Milliseconds into the current beat; always below `ms_per_beat`.
    pub fn phase_ms(&self) -> f64 {
        self.tick as f64 * self.ms_per_tick()
    }

    pub fn at_beat_boundary(&self) -> bool {
        self.tick == 0
    }

    /// Moves one tick forward, wrapping to the next beat, and returns how
    /// long to wait before the following tick.
    pub fn advance(&mut self) -> Duration {
        self.tick += 1;
        if self.tick >= self.ticks_per_beat {
            self.tick = 0;
        }
        Duration::try_from_secs_f64(self.ms_per_tick() / 1000.0).unwrap_or_else(|_| {
            tracing::warn!("No usable tick length at {} BPM, waiting one second", self.bpm);
            Duration::from_secs(1)
        })
    }
}

/// What the sequencer did with one metric value.
#[derive(Clone, Debug, PartialEq)]
pub struct Report {
    pub value: f64,
    pub degree: usize,
    pub note: &'static str,
    pub pitch: u8,
    pub velocity: u8,
    pub chord: Option<Triad>,
}

pub struct Sequencer {
    scales: ScaleTable,
    active_scale: usize,
    chord_mode: ChordMode,
    velocity: VelocityEstimator,
    history: History,
    events: SlotTable,
    clock: TickClock,
    running: bool,
    draining: bool,
    note_duration: u32,
    chord_duration: u32,
    melody_octave: u8,
    chord_octave: u8,
    melody_channel: u8,
    chord_channel: u8,
    reports: Option<Sender<Report>>,
}

impl Sequencer {
    pub fn new(config: &SequencerConfig) -> Result<Self> {
        let root = music::key_index(&config.default_key)
            .ok_or_else(|| anyhow!("unknown default key {}", config.default_key))?;
        let scales = ScaleTable::new(
            config
                .scales
                .iter()
                .map(|scale| (scale.name.as_str(), scale.intervals.as_slice())),
            root,
        )?;
        let active_scale = scales
            .position(&config.default_scale)
            .ok_or_else(|| anyhow!("default scale {} is not configured", config.default_scale))?;
        Ok(Sequencer {
            scales,
            active_scale,
            chord_mode: config.chord_mode,
            velocity: VelocityEstimator::new(
                config.velocity_mode,
                config.default_velocity,
                config.max_velocity,
            ),
            history: History::new(config.history_len),
            events: SlotTable::new(config.max_events),
            clock: TickClock::new(config.bpm, config.ticks_per_beat),
            running: config.autostart,
            draining: false,
            note_duration: config.note_duration.max(1),
            chord_duration: config.chord_duration.max(1),
            melody_octave: config.melody_octave,
            chord_octave: config.chord_octave,
            melody_channel: config.melody_channel,
            chord_channel: config.chord_channel,
            reports: None,
        })
    }

    pub fn with_reports(mut self, reports: Sender<Report>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn scales(&self) -> &ScaleTable {
        &self.scales
    }

    pub fn active_scale(&self) -> &Scale {
        &self.scales[self.active_scale]
    }

    pub fn chord_mode(&self) -> ChordMode {
        self.chord_mode
    }

    pub fn events(&self) -> &SlotTable {
        &self.events
    }

    pub fn clock(&self) -> &TickClock {
        &self.clock
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Nothing pending and no new values accepted.
    pub fn is_finished(&self) -> bool {
        self.draining && self.events.is_empty()
    }

    /// Builds a ready event with its pitch resolved against the current key
    /// and scale.
    fn event(&self, kind: EventKind, degree: usize, velocity: u8) -> Event {
        let (octave, channel, remaining) = match kind {
            EventKind::Note => (self.melody_octave, self.melody_channel, self.note_duration),
            EventKind::ChordTone => (self.chord_octave, self.chord_channel, self.chord_duration),
        };
        let scale = self.active_scale();
        let semitones = self.scales.root() as u32 + scale.offsets[degree % scale.len()];
        Event {
            kind,
            state: EventState::Ready,
            remaining,
            degree,
            octave,
            channel,
            velocity,
            pitch: midi::pitch(octave, semitones),
        }
    }

    fn schedule(&mut self, event: Event) {
        if !self.events.insert(event) {
            tracing::debug!(
                "Event table full ({} slots), dropping {:?}",
                self.events.capacity(),
                event
            );
        }
    }

    /// Maps one metric value onto the active scale and queues its note (and
    /// chord, depending on the chord mode).
    pub fn process_value(&mut self, value: f64) {
        if !value.is_finite() {
            tracing::warn!("Ignoring non-finite metric value {}", value);
            return;
        }
        if !self.running || self.draining {
            tracing::debug!("Not running, ignoring metric value {}", value);
            return;
        }
        let scale_len = self.active_scale().len();
        let degree = (value.floor() as i64).rem_euclid(scale_len as i64) as usize;
        let velocity = self.velocity.estimate(&self.history);
        let previous = self.history.latest();

        let note = self.event(EventKind::Note, degree, velocity);
        self.schedule(note);
        let triad = match self.chord_mode {
            ChordMode::None => None,
            ChordMode::MajorOnly => Some(Triad::Major),
            ChordMode::MinorOnly => Some(Triad::Minor),
            ChordMode::AscendingMajDescMin => {
                previous.map(|p| if value > p { Triad::Major } else { Triad::Minor })
            }
            ChordMode::AscendingMinDescMaj => {
                previous.map(|p| if value > p { Triad::Minor } else { Triad::Major })
            }
        };
        if let Some(triad) = triad {
            for tone in triad.degrees(degree, scale_len) {
                let tone = self.event(EventKind::ChordTone, tone, velocity);
                self.schedule(tone);
            }
        }
        self.history.push(value);

        let report = Report {
            value,
            degree,
            note: self.active_scale().notes[degree],
            pitch: note.pitch,
            velocity,
            chord: triad,
        };
        tracing::debug!(
            "Value {} -> degree {} ({}) pitch {} velocity {}",
            value,
            degree,
            report.note,
            report.pitch,
            velocity
        );
        if let Some(reports) = &self.reports {
            reports.try_send(report).ok();
        }
    }

    /// Runs once per beat boundary. All note-offs go out before any note-on,
    /// so a retriggered pitch is never cut by its own stale note-off.
    pub fn handle_events(&mut self, sink: &mut impl NoteSink) {
        for slot in self.events.slots.iter_mut() {
            if let Slot::Pending(event) = slot {
                if event.state != EventState::Active {
                    continue;
                }
                if event.remaining <= 1 {
                    event.state = EventState::Stopping;
                    sink.send(midi::Event::NoteOff {
                        channel: event.channel,
                        note: event.pitch,
                    });
                } else {
                    event.remaining -= 1;
                }
            }
        }
        for slot in self.events.slots.iter_mut() {
            let event = match slot {
                Slot::Pending(event) => event,
                Slot::Free => continue,
            };
            let state = event.state;
            match state {
                EventState::Ready if self.running => {
                    event.state = EventState::Active;
                    sink.send(midi::Event::NoteOn {
                        channel: event.channel,
                        note: event.pitch,
                        velocity: event.velocity,
                    });
                }
                EventState::Ready | EventState::Stopping => *slot = Slot::Free,
                EventState::Active => (),
            }
        }
    }

    pub fn apply(&mut self, command: Command) {
        match command {
            Command::SetKey(key) => {
                self.scales.set_root(key);
                tracing::info!(
                    "Key set to {}: {} is now {:?}",
                    music::KEY_NAMES[self.scales.root() as usize],
                    self.active_scale().name,
                    self.active_scale().notes
                );
            }
            Command::SetScale(name) => match self.scales.position(&name) {
                Some(position) => {
                    self.active_scale = position;
                    tracing::info!("Scale set to {}", name);
                }
                None => tracing::warn!(
                    "Unknown scale {}, keeping {}",
                    name,
                    self.active_scale().name
                ),
            },
            Command::SetBpm(bpm) if control::valid_bpm(bpm) => {
                self.clock.set_bpm(bpm);
                tracing::info!("BPM set to {}", bpm);
            }
            Command::SetBpm(bpm) => tracing::warn!("Ignoring invalid BPM {}", bpm),
            Command::SetChordMode(name) => match ChordMode::from_name(&name) {
                Some(mode) => {
                    self.chord_mode = mode;
                    tracing::info!("Chord mode set to {}", mode.name());
                }
                None => tracing::warn!("Unknown chord mode {}", name),
            },
            Command::SetVelocityMode(name) => match VelocityMode::from_name(&name) {
                Some(mode) => {
                    self.velocity.mode = mode;
                    tracing::info!("Velocity mode set to {}", mode.name());
                }
                None => tracing::warn!("Unknown velocity mode {}", name),
            },
            Command::Start => {
                self.running = true;
                tracing::info!("Sequencer started");
            }
            Command::Stop => {
                self.running = false;
                tracing::info!("Sequencer stopped");
            }
            Command::Source(command) => {
                tracing::debug!("Sequencer ignoring source command {:?}", command)
            }
            Command::Shutdown => {
                self.draining = true;
                tracing::info!(
                    "Sequencer draining {} pending events",
                    self.events.pending().count()
                );
            }
        }
    }

    /// The sequencer loop: a waiting metric value is always handled first;
    /// otherwise pending commands are applied and the clock ticks. Returns
    /// once shut down and every pending note has finished.
    pub fn run(
        mut self,
        values: Receiver<f64>,
        control: Receiver<Command>,
        mut sink: impl NoteSink,
    ) {
        let mut values_open = true;
        loop {
            if values_open {
                match values.try_recv() {
                    Ok(value) => {
                        self.process_value(value);
                        continue;
                    }
                    Err(TryRecvError::Empty) => (),
                    Err(TryRecvError::Disconnected) => {
                        tracing::info!("Metric input closed");
                        values_open = false;
                    }
                }
            }
            loop {
                match control.try_recv() {
                    Ok(command) => self.apply(command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        if !self.draining {
                            self.apply(Command::Shutdown);
                        }
                        break;
                    }
                }
            }
            if self.clock.at_beat_boundary() {
                self.handle_events(&mut sink);
                if self.is_finished() {
                    tracing::info!("Sequencer finished");
                    return;
                }
            }
            thread::sleep(self.clock.advance());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScaleConfig;

    fn config() -> SequencerConfig {
        SequencerConfig {
            default_key: "C".to_owned(),
            default_scale: "Ionian".to_owned(),
            scales: vec![
                ScaleConfig {
                    name: "Ionian".to_owned(),
                    intervals: vec![2, 2, 1, 2, 2, 2, 1],
                },
                ScaleConfig {
                    name: "Chinese".to_owned(),
                    intervals: vec![4, 2, 1, 4, 1],
                },
            ],
            ..SequencerConfig::default()
        }
    }

    fn sequencer() -> Sequencer {
        Sequencer::new(&config()).unwrap()
    }

    fn beats(sequencer: &mut Sequencer, count: usize) -> Vec<midi::Event> {
        let mut out = Vec::new();
        for _ in 0..count {
            sequencer.handle_events(&mut out);
        }
        out
    }

    fn ons(events: &[midi::Event]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match *event {
                midi::Event::NoteOn { note, .. } => Some(note),
                _ => None,
            })
            .collect()
    }

    fn offs(events: &[midi::Event]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match *event {
                midi::Event::NoteOff { note, .. } => Some(note),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn maps_value_to_degree() {
        let (tx, rx) = crossbeam::channel::bounded(4);
        let mut sequencer = sequencer().with_reports(tx);
        sequencer.process_value(9.0);
        let report = rx.try_recv().unwrap();
        assert_eq!(report.degree, 1);
        assert_eq!(report.note, "D");
        assert_eq!(report.pitch, midi::pitch(4, 2));

        sequencer.process_value(-1.0);
        assert_eq!(rx.try_recv().unwrap().degree, 7);
        sequencer.process_value(-8.5);
        assert_eq!(rx.try_recv().unwrap().degree, 7);
    }

    #[test]
    fn every_note_on_gets_its_note_off() {
        let mut sequencer = sequencer();
        for value in [3.0, 7.0, 1.0] {
            sequencer.process_value(value);
        }
        let events = beats(&mut sequencer, 10);
        let on = ons(&events);
        assert_eq!(on.len(), 3);
        assert_eq!(on, offs(&events));
        assert!(sequencer.events().is_empty());
    }

    #[test]
    fn duration_counts_beats() {
        let mut sequencer = sequencer();
        sequencer.process_value(0.0);
        let mut out = Vec::new();
        sequencer.handle_events(&mut out);
        assert_eq!(ons(&out).len(), 1);
        for _ in 0..3 {
            out.clear();
            sequencer.handle_events(&mut out);
            assert!(out.is_empty());
        }
        sequencer.handle_events(&mut out);
        assert_eq!(offs(&out), vec![midi::pitch(4, 0)]);
        assert!(sequencer.events().is_empty());
    }

    #[test]
    fn note_offs_precede_note_ons_on_the_same_beat() {
        let mut sequencer = sequencer();
        sequencer.process_value(2.0);
        beats(&mut sequencer, 4);
        sequencer.process_value(2.0);
        let events = beats(&mut sequencer, 1);
        assert_eq!(
            events,
            vec![
                midi::Event::NoteOff { channel: 0, note: 64 },
                midi::Event::NoteOn {
                    channel: 0,
                    note: 64,
                    velocity: 64
                },
            ]
        );
    }

    #[test]
    fn full_table_drops_quietly() {
        let mut config = config();
        config.max_events = 2;
        let mut sequencer = Sequencer::new(&config).unwrap();
        for value in 0..5 {
            sequencer.process_value(value as f64);
        }
        assert_eq!(sequencer.events().capacity(), 2);
        assert_eq!(sequencer.events().count(EventState::Ready), 2);
        let events = beats(&mut sequencer, 1);
        assert_eq!(ons(&events), vec![60, 62]);
        sequencer.process_value(6.0);
        assert_eq!(sequencer.events().pending().count(), 2);
    }

    #[test]
    fn stop_reclaims_ready_but_finishes_active() {
        let mut sequencer = sequencer();
        sequencer.process_value(1.0);
        beats(&mut sequencer, 1);
        sequencer.process_value(2.0);
        sequencer.apply(Command::Stop);
        sequencer.process_value(3.0);

        let events = beats(&mut sequencer, 5);
        assert!(ons(&events).is_empty());
        assert_eq!(offs(&events), vec![midi::pitch(4, 2)]);
        assert!(sequencer.events().is_empty());

        sequencer.apply(Command::Start);
        sequencer.process_value(4.0);
        let events = beats(&mut sequencer, 5);
        assert_eq!(ons(&events), vec![midi::pitch(4, 7)]);
        assert_eq!(offs(&events), vec![midi::pitch(4, 7)]);
    }

    #[test]
    fn major_chords_go_to_chord_channel() {
        let mut sequencer = sequencer();
        sequencer.apply(Command::SetChordMode("majorOnly".to_owned()));
        sequencer.process_value(0.0);
        let events = beats(&mut sequencer, 1);
        let chord: Vec<_> = events
            .iter()
            .filter(|event| event.channel() == 1)
            .map(|event| event.note())
            .collect();
        // Degrees 0, 4, 7 of the 8-entry Ionian table, at octave 2.
        assert_eq!(chord, vec![36, 43, 48]);
        assert_eq!(events.iter().filter(|event| event.channel() == 0).count(), 1);
    }

    #[test]
    fn direction_picks_triad_after_first_value() {
        let mut sequencer = sequencer();
        sequencer.apply(Command::SetChordMode("ascendingMajDescMin".to_owned()));
        sequencer.process_value(1.0);
        assert_eq!(sequencer.events().pending().count(), 1);

        sequencer.process_value(2.0);
        let chord: Vec<_> = sequencer
            .events()
            .pending()
            .filter(|event| event.kind == EventKind::ChordTone)
            .map(|event| event.degree)
            .collect();
        assert_eq!(chord, vec![2, 6, 1]);

        sequencer.process_value(1.0);
        let chord: Vec<_> = sequencer
            .events()
            .pending()
            .filter(|event| event.kind == EventKind::ChordTone)
            .skip(3)
            .map(|event| event.degree)
            .collect();
        assert_eq!(chord, vec![1, 4, 0]);
    }

    fn chord_degrees(sequencer: &Sequencer) -> Vec<usize> {
        sequencer
            .events()
            .pending()
            .filter(|event| event.kind == EventKind::ChordTone)
            .map(|event| event.degree)
            .collect()
    }

    #[test]
    fn descending_major_mode_mirrors_direction() {
        let mut sequencer = sequencer();
        sequencer.apply(Command::SetChordMode("ascendingMinDescMaj".to_owned()));
        sequencer.process_value(1.0);
        assert!(chord_degrees(&sequencer).is_empty());

        // Rising: minor triad on degree 2.
        sequencer.process_value(2.0);
        assert_eq!(chord_degrees(&sequencer), Triad::Minor.degrees(2, 8).to_vec());

        // Falling: major triad on degree 1.
        sequencer.process_value(1.0);
        let chord = chord_degrees(&sequencer);
        assert_eq!(chord[3..], Triad::Major.degrees(1, 8));
    }

    #[test]
    fn minor_only_chords_every_value() {
        let mut sequencer = sequencer();
        sequencer.apply(Command::SetChordMode("minorOnly".to_owned()));
        sequencer.process_value(0.0);
        assert_eq!(chord_degrees(&sequencer), vec![0, 3, 7]);
        let events = beats(&mut sequencer, 1);
        let chord: Vec<_> = events
            .iter()
            .filter(|event| event.channel() == 1)
            .map(|event| event.note())
            .collect();
        assert_eq!(chord, vec![36, 41, 48]);
    }

    #[test]
    fn report_pitch_matches_emitted_note() {
        let (tx, rx) = crossbeam::channel::bounded(4);
        let mut sequencer = sequencer().with_reports(tx);
        sequencer.apply(Command::SetKey(5));
        sequencer.process_value(3.0);
        let report = rx.try_recv().unwrap();
        let events = beats(&mut sequencer, 1);
        assert_eq!(ons(&events), vec![report.pitch]);
    }

    #[test]
    fn key_change_keeps_sounding_notes_paired() {
        let mut sequencer = sequencer();
        sequencer.process_value(0.0);
        beats(&mut sequencer, 1);
        sequencer.apply(Command::SetKey(7));
        assert_eq!(sequencer.active_scale().notes[0], "G");
        sequencer.process_value(0.0);
        let events = beats(&mut sequencer, 6);
        assert_eq!(offs(&events), vec![60, 67]);
        assert_eq!(ons(&events), vec![67]);
    }

    #[test]
    fn unknown_names_leave_state_alone() {
        let mut sequencer = sequencer();
        sequencer.apply(Command::SetScale("Bebop".to_owned()));
        assert_eq!(sequencer.active_scale().name, "Ionian");
        sequencer.apply(Command::SetChordMode("arp".to_owned()));
        assert_eq!(sequencer.chord_mode(), ChordMode::None);
        sequencer.apply(Command::SetBpm(0.0));
        assert_eq!(sequencer.clock().bpm(), 120.0);

        sequencer.apply(Command::SetScale("Chinese".to_owned()));
        assert_eq!(sequencer.active_scale().len(), 6);
        sequencer.apply(Command::SetBpm(90.0));
        assert_eq!(sequencer.clock().bpm(), 90.0);
    }

    #[test]
    fn bpm_outside_clock_range_is_ignored() {
        let mut sequencer = sequencer();
        sequencer.apply(Command::SetBpm(1e-300));
        sequencer.apply(Command::SetBpm(1e9));
        assert_eq!(sequencer.clock().bpm(), 120.0);

        let mut clock = TickClock::new(1e-300, 4);
        assert_eq!(clock.advance(), Duration::from_secs(1));
    }

    #[test]
    fn non_finite_values_are_dropped() {
        let mut sequencer = sequencer();
        sequencer.process_value(f64::NAN);
        sequencer.process_value(f64::INFINITY);
        assert!(sequencer.events().is_empty());
    }

    #[test]
    fn clock_wraps_once_per_beat() {
        let mut clock = TickClock::new(120.0, 4);
        assert_eq!(clock.ms_per_beat(), 500.0);
        let mut boundaries = 0;
        for _ in 0..12 {
            assert!(clock.phase_ms() < clock.ms_per_beat());
            let sleep = clock.advance();
            assert_eq!(sleep, Duration::from_millis(125));
            if clock.at_beat_boundary() {
                boundaries += 1;
            }
        }
        assert_eq!(boundaries, 3);
        clock.set_bpm(60.0);
        assert_eq!(clock.advance(), Duration::from_millis(250));
    }
}

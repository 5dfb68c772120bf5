use crossbeam::channel::{Sender, TrySendError};
use tinyvec::ArrayVec;

pub const CHANNELS: usize = 16;
pub const NOTES: usize = 128;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    NoteOff { channel: u8, note: u8 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
}

impl Event {
    pub fn channel(&self) -> u8 {
        match *self {
            Event::NoteOff { channel, .. } | Event::NoteOn { channel, .. } => channel,
        }
    }

    pub fn note(&self) -> u8 {
        match *self {
            Event::NoteOff { note, .. } | Event::NoteOn { note, .. } => note,
        }
    }

    pub fn to_bytes(self) -> ArrayVec<[u8; 3]> {
        let mut out = ArrayVec::new();
        match self {
            Event::NoteOff { channel, note } => {
                out.push(0x80 | (channel & 0x0f));
                out.push(note & 0x7f);
                out.push(0);
            }
            Event::NoteOn {
                channel,
                note,
                velocity,
            } => {
                out.push(0x90 | (channel & 0x0f));
                out.push(note & 0x7f);
                out.push(velocity & 0x7f);
            }
        };
        out
    }
}

/// MIDI note number for a semitone offset above C of `octave`, where octave
/// 0 starts at note 12. Results above 127 are folded down by octaves.
pub fn pitch(octave: u8, semitones: u32) -> u8 {
    let mut note = 12 * (octave as u32 + 1) + semitones;
    while note > 127 {
        note -= 12;
    }
    note as u8
}

/// Somewhere to put outgoing MIDI. Sending never blocks and never fails from
/// the caller's point of view.
pub trait NoteSink {
    fn send(&mut self, event: Event);
}

impl NoteSink for Vec<Event> {
    fn send(&mut self, event: Event) {
        self.push(event);
    }
}

impl NoteSink for Sender<Event> {
    fn send(&mut self, event: Event) {
        match self.try_send(event) {
            Ok(()) => (),
            Err(TrySendError::Full(event)) => {
                tracing::warn!("MIDI output queue full, dropping {:?}", event)
            }
            Err(TrySendError::Disconnected(event)) => {
                tracing::debug!("MIDI output closed, dropping {:?}", event)
            }
        }
    }
}

/// Count of sounding note-ons per channel and note.
pub struct HeldNotes {
    counts: [[u16; NOTES]; CHANNELS],
}

impl Default for HeldNotes {
    fn default() -> Self {
        HeldNotes {
            counts: [[0; NOTES]; CHANNELS],
        }
    }
}

impl HeldNotes {
    pub fn track(&mut self, event: Event) {
        let count = &mut self.counts[event.channel() as usize % CHANNELS]
            [event.note() as usize % NOTES];
        match event {
            Event::NoteOn { .. } => *count += 1,
            Event::NoteOff { .. } => *count = count.saturating_sub(1),
        }
    }

    pub fn total(&self) -> usize {
        self.counts
            .iter()
            .flat_map(|notes| notes.iter())
            .map(|&count| count as usize)
            .sum()
    }

    /// A note-off for every held note-on, leaving nothing held.
    pub fn release_all(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        for (channel, notes) in self.counts.iter_mut().enumerate() {
            for (note, count) in notes.iter_mut().enumerate() {
                for _ in 0..*count {
                    out.push(Event::NoteOff {
                        channel: channel as u8,
                        note: note as u8,
                    });
                }
                *count = 0;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_channel_voice_messages() {
        let on = Event::NoteOn {
            channel: 1,
            note: 60,
            velocity: 100,
        };
        assert_eq!(on.to_bytes().as_slice(), &[0x91, 60, 100]);
        let off = Event::NoteOff { channel: 0, note: 69 };
        assert_eq!(off.to_bytes().as_slice(), &[0x80, 69, 0]);
    }

    #[test]
    fn pitch_is_octave_base_plus_offset() {
        assert_eq!(pitch(3, 0), 48);
        assert_eq!(pitch(4, 9), 69);
        assert_eq!(pitch(0, 0), 12);
        assert_eq!(pitch(9, 11), 119);
        assert!(pitch(9, 24) <= 127);
    }

    #[test]
    fn held_notes_release_leaves_nothing_sounding() {
        let mut held = HeldNotes::default();
        let on = Event::NoteOn {
            channel: 2,
            note: 64,
            velocity: 90,
        };
        held.track(on);
        held.track(on);
        held.track(Event::NoteOn {
            channel: 0,
            note: 60,
            velocity: 90,
        });
        held.track(Event::NoteOff { channel: 0, note: 60 });
        held.track(Event::NoteOff { channel: 5, note: 1 });
        assert_eq!(held.total(), 2);

        let released = held.release_all();
        assert_eq!(
            released,
            vec![Event::NoteOff { channel: 2, note: 64 }; 2]
        );
        assert_eq!(held.total(), 0);
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (mut tx, rx) = crossbeam::channel::bounded(1);
        let off = Event::NoteOff { channel: 0, note: 1 };
        NoteSink::send(&mut tx, off);
        NoteSink::send(&mut tx, off);
        assert_eq!(rx.try_iter().count(), 1);
    }
}

use std::collections::HashMap;
use std::iter::once;
use std::ops::Index;

use anyhow::{bail, Result};

/// Three octaves of chromatic note names, so a root plus any scale offset up
/// to three octaves can be named without wrapping mid-scale.
pub const CHROMATIC: [&str; 37] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B", //
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B", //
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B", //
    "C",
];

pub const KEY_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

pub fn key_index(name: &str) -> Option<u8> {
    KEY_NAMES
        .iter()
        .position(|key| key.eq_ignore_ascii_case(name))
        .map(|i| i as u8)
}

/// Running sum of `intervals`, starting at 0.
pub fn derive_offsets(intervals: &[u8]) -> Vec<u32> {
    once(0)
        .chain(intervals.iter().scan(0, |acc, &interval| {
            *acc += interval as u32;
            Some(*acc)
        }))
        .collect()
}

pub fn derive_notes(root: u8, offsets: &[u32]) -> Vec<&'static str> {
    offsets
        .iter()
        .map(|&offset| CHROMATIC[(root as usize + offset as usize) % CHROMATIC.len()])
        .collect()
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Triad {
    Major,
    Minor,
}

impl Triad {
    /// Scale positions of the triad rooted at `degree`. These index the
    /// scale's offset table; they are not semitone counts.
    pub fn degrees(self, degree: usize, scale_len: usize) -> [usize; 3] {
        let (lower, upper) = match self {
            Triad::Major => (4, 3),
            Triad::Minor => (3, 4),
        };
        let third = (degree + lower) % scale_len;
        let fifth = (third + upper) % scale_len;
        [degree, third, fifth]
    }
}

pub fn major_triad(degree: usize, scale_len: usize) -> [usize; 3] {
    Triad::Major.degrees(degree, scale_len)
}

pub fn minor_triad(degree: usize, scale_len: usize) -> [usize; 3] {
    Triad::Minor.degrees(degree, scale_len)
}

#[derive(Clone, Debug, PartialEq)]
pub struct Scale {
    pub name: String,
    pub intervals: Vec<u8>,
    pub offsets: Vec<u32>,
    pub notes: Vec<&'static str>,
}

impl Scale {
    pub fn new(name: &str, intervals: &[u8], root: u8) -> Result<Self> {
        if name.is_empty() {
            bail!("scale defined without a name");
        }
        if intervals.is_empty() {
            bail!("{} scale defined without any intervals", name);
        }
        if intervals.contains(&0) {
            bail!("{} scale has a zero interval", name);
        }
        let offsets = derive_offsets(intervals);
        let notes = derive_notes(root, &offsets);
        Ok(Scale {
            name: name.to_owned(),
            intervals: intervals.to_vec(),
            offsets,
            notes,
        })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Configured scales in definition order, with a name index for lookups.
#[derive(Clone, Debug)]
pub struct ScaleTable {
    scales: Vec<Scale>,
    index: HashMap<String, usize>,
    root: u8,
}

impl ScaleTable {
    pub fn new<'a>(
        definitions: impl IntoIterator<Item = (&'a str, &'a [u8])>,
        root: u8,
    ) -> Result<Self> {
        let mut scales = Vec::new();
        let mut index = HashMap::new();
        for (name, intervals) in definitions {
            if index.contains_key(name) {
                bail!("scale {} is defined more than once", name);
            }
            index.insert(name.to_owned(), scales.len());
            scales.push(Scale::new(name, intervals, root % 12)?);
        }
        if scales.is_empty() {
            bail!("no scale definitions");
        }
        Ok(ScaleTable {
            scales,
            index,
            root: root % 12,
        })
    }

    pub fn root(&self) -> u8 {
        self.root
    }

    /// Re-derives note names of every scale for a new root.
    pub fn set_root(&mut self, root: u8) {
        self.root = root % 12;
        for scale in &mut self.scales {
            scale.notes = derive_notes(self.root, &scale.offsets);
        }
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn get(&self, position: usize) -> Option<&Scale> {
        self.scales.get(position)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scales.iter().map(|scale| scale.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.scales.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scales.is_empty()
    }
}

impl Index<usize> for ScaleTable {
    type Output = Scale;

    fn index(&self, position: usize) -> &Scale {
        &self.scales[position]
    }
}

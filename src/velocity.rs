use std::collections::VecDeque;

use crate::control::VelocityMode;

/// Most recent metric values, newest first.
#[derive(Clone, Debug)]
pub struct History {
    values: VecDeque<f64>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        History {
            values: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() >= self.capacity {
            self.values.pop_back();
        }
        self.values.push_front(value);
    }

    pub fn latest(&self) -> Option<f64> {
        self.values.front().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.values.iter()
    }
}

/// Maps the jump between the two newest values to a velocity, relative to
/// the largest jump seen so far.
#[derive(Clone, Debug)]
pub struct VelocityEstimator {
    pub mode: VelocityMode,
    default: u8,
    max: u8,
    largest_variance: f64,
}

impl VelocityEstimator {
    pub fn new(mode: VelocityMode, default: u8, max: u8) -> Self {
        let max = max.min(127);
        VelocityEstimator {
            mode,
            default: default.min(max),
            max,
            largest_variance: 0.0,
        }
    }

    pub fn largest_variance(&self) -> f64 {
        self.largest_variance
    }

    pub fn estimate(&mut self, history: &History) -> u8 {
        if self.mode == VelocityMode::Fixed {
            return self.default;
        }
        let mut newest = history.iter();
        let (current, previous) = match (newest.next(), newest.next()) {
            (Some(&current), Some(&previous)) => (current, previous),
            _ => return self.default,
        };
        let variance = (current - previous).abs();
        if variance > self.largest_variance {
            self.largest_variance = variance;
            return self.max;
        }
        if self.largest_variance <= 0.0 {
            return self.default;
        }
        let scaled = (variance / self.largest_variance * 100.0).round();
        (self.default as f64 + scaled).min(self.max as f64) as u8
    }
}

// Copyright 2020 Joyent, Inc.

//! Enumerates every index tuple selected by a set of slices, last
//! dimension fastest.

use crate::constraint::Slice;

pub struct Odometer {
    slices: Vec<Slice>,
    /// Position within each slice, not the dimension index.
    counters: Vec<u64>,
    done: bool,
}

impl Odometer {
    /// A rank-0 odometer yields the empty tuple exactly once.
    pub fn new(slices: &[Slice]) -> Odometer {
        Odometer {
            slices: slices.to_vec(),
            counters: vec![0; slices.len()],
            done: false,
        }
    }

    fn current(&self) -> Vec<u64> {
        self.slices
            .iter()
            .zip(self.counters.iter())
            .map(|(s, c)| s.index(*c))
            .collect()
    }

    fn advance(&mut self) {
        for dim in (0..self.slices.len()).rev() {
            self.counters[dim] += 1;
            if self.counters[dim] < self.slices[dim].count() {
                return;
            }
            self.counters[dim] = 0;
        }
        // the slowest dimension rolled over
        self.done = true;
    }
}

impl Iterator for Odometer {
    type Item = Vec<u64>;

    fn next(&mut self) -> Option<Vec<u64>> {
        if self.done {
            return None;
        }
        let index = self.current();
        self.advance();
        Some(index)
    }
}

/// Row-major offset of `index` within `shape`.
pub fn linear_offset(index: &[u64], shape: &[u64]) -> u64 {
    index
        .iter()
        .zip(shape.iter())
        .fold(0, |offset, (i, size)| offset * size + i)
}

// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A windowed min/max estimator over a round-trip-counted stream of samples.
//!
//! The filter keeps a monotonic deque of `(round, value)` pairs: the front
//! always holds the best sample still inside the window, and every entry
//! behind it is strictly worse but more recent. Updates and queries are
//! amortized O(1), and unlike approximate trackers the reported best is
//! exact over the last `window` rounds.

use std::collections::VecDeque;

/// Whether the filter tracks the windowed maximum or minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, Default)]
struct MinMaxSample {
    /// Round trip count at which the sample was taken.
    round: u64,

    /// Sample value.
    value: u64,
}

/// Windowed min/max filter backed by a monotonic deque.
#[derive(Debug)]
pub struct MinMax {
    kind: FilterKind,

    /// Samples expire once they fall more than `window` rounds behind.
    window: u64,

    /// Front is the current best; entries are monotonically worse towards
    /// the back and monotonically newer.
    samples: VecDeque<MinMaxSample>,
}

impl MinMax {
    pub fn new(kind: FilterKind, window: u64) -> Self {
        Self {
            kind,
            window,
            samples: VecDeque::new(),
        }
    }

    /// Set window size, in rounds.
    pub fn set_window(&mut self, window: u64) {
        self.window = window;
    }

    /// Discard all history and seed the filter with a single sample.
    pub fn reset(&mut self, round: u64, value: u64) {
        self.samples.clear();
        self.samples.push_back(MinMaxSample { round, value });
    }

    /// Incorporate a new sample taken at the given round.
    pub fn update(&mut self, round: u64, value: u64) {
        // Expire samples that have fallen out of the window.
        while let Some(front) = self.samples.front() {
            if round.saturating_sub(front.round) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        // Samples no better than the new one can never be the best again.
        while let Some(back) = self.samples.back() {
            let obsolete = match self.kind {
                FilterKind::Max => back.value <= value,
                FilterKind::Min => back.value >= value,
            };
            if obsolete {
                self.samples.pop_back();
            } else {
                break;
            }
        }

        self.samples.push_back(MinMaxSample { round, value });
    }

    /// The best value within the window, or zero before the first sample.
    pub fn get(&self) -> u64 {
        self.samples.front().map(|s| s.value).unwrap_or(0)
    }
}

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

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;
use std::time::Instant;

use rustc_hash::FxHashMap;

use super::assemble_segment;
use super::disaggregate;
use super::SegmentQueue;
use super::TxScheduler;
use crate::buffer::tx_item::TxItem;
use crate::Config;

/// An earliest-deadline-first scheduler. Each entry's deadline is its
/// generation time plus the latency bound of its stream; entries with the
/// nearest deadline drain first. With `retransmit_first` enabled,
/// retransmitted entries are treated as already due.
pub struct EdfScheduler {
    queue: EdfQueue,

    /// Queued payload bytes.
    app_size: usize,
}

impl EdfScheduler {
    pub fn new(conf: &Config) -> EdfScheduler {
        EdfScheduler {
            queue: EdfQueue {
                heap: BinaryHeap::new(),
                latencies: FxHashMap::default(),
                default_latency: conf.default_latency,
                retransmit_first: conf.retransmit_first,
                next_seq: 0,
                front_seq: 0,
            },
            app_size: 0,
        }
    }
}

impl TxScheduler for EdfScheduler {
    fn add(&mut self, mut item: TxItem, retx: bool) {
        item.retransmitted |= retx;
        for piece in disaggregate(item) {
            self.app_size += piece.size();
            self.queue.push_back(piece);
        }
    }

    fn get_new_segment(&mut self, max_bytes: usize, now: Instant) -> TxItem {
        assemble_segment(&mut self.queue, &mut self.app_size, max_bytes, now)
    }

    fn app_size(&self) -> usize {
        self.app_size
    }

    fn set_latency(&mut self, stream_id: u64, latency: Duration) {
        self.queue.latencies.insert(stream_id, latency);
    }

    fn latency(&self, stream_id: u64) -> Duration {
        self.queue.latency(stream_id)
    }

    fn set_default_latency(&mut self, latency: Duration) {
        self.queue.default_latency = latency;
    }
}

/// Heap entry ordered by deadline, then insertion sequence. A `None`
/// deadline means already due and sorts before every concrete deadline.
struct EdfEntry {
    deadline: Option<Instant>,
    seq: i64,
    item: TxItem,
}

impl PartialEq for EdfEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EdfEntry {}

impl PartialOrd for EdfEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EdfEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.deadline, other.deadline) {
            (None, None) => self.seq.cmp(&other.seq),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(&b).then(self.seq.cmp(&other.seq)),
        }
    }
}

struct EdfQueue {
    heap: BinaryHeap<Reverse<EdfEntry>>,

    /// Per-stream latency bounds; streams without an entry use the
    /// default.
    latencies: FxHashMap<u64, Duration>,
    default_latency: Duration,
    retransmit_first: bool,

    /// Tie-break counters: newly added entries get increasing sequence
    /// numbers, entries pushed back to the front get decreasing ones.
    next_seq: i64,
    front_seq: i64,
}

impl EdfQueue {
    fn latency(&self, stream_id: u64) -> Duration {
        self.latencies
            .get(&stream_id)
            .copied()
            .unwrap_or(self.default_latency)
    }

    fn entry(&self, item: TxItem, seq: i64) -> EdfEntry {
        let deadline = if self.retransmit_first && item.retransmitted {
            None
        } else {
            let latency = item
                .frames
                .first()
                .map(|f| self.latency(f.stream_id()))
                .unwrap_or(self.default_latency);
            Some(item.time_generated + latency)
        };
        EdfEntry {
            deadline,
            seq,
            item,
        }
    }

    fn push_back(&mut self, item: TxItem) {
        self.next_seq += 1;
        let entry = self.entry(item, self.next_seq);
        self.heap.push(Reverse(entry));
    }
}

impl SegmentQueue for EdfQueue {
    fn pop_next(&mut self) -> Option<TxItem> {
        self.heap.pop().map(|Reverse(e)| e.item)
    }

    fn push_front(&mut self, item: TxItem) {
        self.front_seq -= 1;
        let entry = self.entry(item, self.front_seq);
        self.heap.push(Reverse(entry));
    }

    fn rescan_size(&self) -> usize {
        self.heap.iter().map(|Reverse(e)| e.item.size()).sum()
    }
}

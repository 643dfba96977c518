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
use std::time::Instant;

use super::assemble_segment;
use super::disaggregate;
use super::SegmentQueue;
use super::TxScheduler;
use crate::buffer::tx_item::TxItem;
use crate::Config;

/// A scheduler that drains entries in (stream id, offset) order: lower
/// stream ids first, in-order within a stream. With `retransmit_first`
/// enabled, retransmitted entries drain before everything else.
pub struct PfifoScheduler {
    queue: PfifoQueue,

    /// Queued payload bytes.
    app_size: usize,
}

impl PfifoScheduler {
    pub fn new(conf: &Config) -> PfifoScheduler {
        PfifoScheduler {
            queue: PfifoQueue {
                heap: BinaryHeap::new(),
                retransmit_first: conf.retransmit_first,
                next_seq: 0,
                front_seq: 0,
            },
            app_size: 0,
        }
    }
}

impl TxScheduler for PfifoScheduler {
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
}

/// Heap entry ordered by (priority class, stream id, offset, sequence).
/// Class 0 is reserved for retransmissions when `retransmit_first` is on.
struct PfifoEntry {
    class: u8,
    stream_id: u64,
    offset: u64,
    seq: i64,
    item: TxItem,
}

impl PartialEq for PfifoEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PfifoEntry {}

impl PartialOrd for PfifoEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PfifoEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.class, self.stream_id, self.offset, self.seq).cmp(&(
            other.class,
            other.stream_id,
            other.offset,
            other.seq,
        ))
    }
}

struct PfifoQueue {
    heap: BinaryHeap<Reverse<PfifoEntry>>,
    retransmit_first: bool,

    /// Tie-break counters: newly added entries get increasing sequence
    /// numbers, entries pushed back to the front get decreasing ones.
    next_seq: i64,
    front_seq: i64,
}

impl PfifoQueue {
    fn entry(&self, item: TxItem, seq: i64) -> PfifoEntry {
        let class = if self.retransmit_first && item.retransmitted {
            0
        } else {
            1
        };
        let (stream_id, offset) = match item.frames.first() {
            Some(f) => (f.stream_id(), f.offset()),
            None => (0, 0),
        };
        PfifoEntry {
            class,
            stream_id,
            offset,
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

impl SegmentQueue for PfifoQueue {
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

#[cfg(test)]
mod tests {
    use super::super::tests::segment_layout;
    use super::super::tests::stream_item;
    use super::*;

    #[test]
    fn pfifo_stream_id_order() {
        let conf = Config::default();
        let mut sched = PfifoScheduler::new(&conf);
        let now = Instant::now();

        sched.add(stream_item(8, 0, 10, now), false);
        sched.add(stream_item(4, 100, 10, now), false);
        sched.add(stream_item(4, 0, 10, now), false);
        sched.add(stream_item(12, 0, 10, now), false);

        let seg = sched.get_new_segment(1000, now);
        assert_eq!(
            segment_layout(&seg),
            vec![(4, 0, 10), (4, 100, 10), (8, 0, 10), (12, 0, 10)]
        );
    }

    #[test]
    fn pfifo_retransmit_first() {
        let mut conf = Config::default();
        conf.retransmit_first = true;
        let mut sched = PfifoScheduler::new(&conf);
        let now = Instant::now();

        sched.add(stream_item(4, 0, 10, now), false);
        let mut retx = stream_item(8, 50, 10, now);
        retx.retransmitted = true;
        sched.add(retx, true);

        let seg = sched.get_new_segment(1000, now);
        assert_eq!(segment_layout(&seg), vec![(8, 50, 10), (4, 0, 10)]);
    }

    #[test]
    fn pfifo_add_retx_marks_item() {
        let mut conf = Config::default();
        conf.retransmit_first = true;
        let mut sched = PfifoScheduler::new(&conf);
        let now = Instant::now();

        sched.add(stream_item(4, 0, 10, now), false);
        // The caller's retx flag alone is enough, even if the item was
        // never marked retransmitted.
        sched.add(stream_item(8, 50, 10, now), true);

        let seg = sched.get_new_segment(1000, now);
        assert_eq!(segment_layout(&seg), vec![(8, 50, 10), (4, 0, 10)]);
    }

    #[test]
    fn pfifo_retransmit_in_order_by_default() {
        let conf = Config::default();
        let mut sched = PfifoScheduler::new(&conf);
        let now = Instant::now();

        sched.add(stream_item(4, 0, 10, now), false);
        let mut retx = stream_item(8, 50, 10, now);
        retx.retransmitted = true;
        sched.add(retx, true);

        let seg = sched.get_new_segment(1000, now);
        assert_eq!(segment_layout(&seg), vec![(4, 0, 10), (8, 50, 10)]);
    }

    #[test]
    fn pfifo_split_remainder_keeps_priority() {
        let conf = Config::default();
        let mut sched = PfifoScheduler::new(&conf);
        let now = Instant::now();

        sched.add(stream_item(4, 0, 300, now), false);
        sched.add(stream_item(8, 0, 100, now), false);

        let header = stream_item(4, 0, 300, now).frames[0].header_len();
        let seg = sched.get_new_segment(header + 120, now);
        assert_eq!(segment_layout(&seg), vec![(4, 0, 120)]);

        // The remainder still outranks stream 8.
        let seg = sched.get_new_segment(1000, now);
        assert_eq!(segment_layout(&seg), vec![(4, 120, 180), (8, 0, 100)]);
    }
}

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

use std::collections::VecDeque;
use std::time::Instant;

use super::assemble_segment;
use super::disaggregate;
use super::SegmentQueue;
use super::TxScheduler;
use crate::buffer::tx_item::TxItem;
use crate::Config;

/// A scheduler that drains entries strictly in insertion order.
/// Retransmitted data is placed at the head of the queue.
pub struct FifoScheduler {
    queue: FifoQueue,

    /// Queued payload bytes.
    app_size: usize,
}

impl FifoScheduler {
    pub fn new(conf: &Config) -> FifoScheduler {
        FifoScheduler {
            queue: FifoQueue(VecDeque::new()),
            app_size: 0,
        }
    }
}

impl TxScheduler for FifoScheduler {
    fn add(&mut self, item: TxItem, retx: bool) {
        let pieces = disaggregate(item);
        self.app_size += pieces.iter().map(|p| p.size()).sum::<usize>();
        if retx {
            // Reversed so the pieces stay in order at the head.
            for piece in pieces.into_iter().rev() {
                self.queue.0.push_front(piece);
            }
        } else {
            for piece in pieces {
                self.queue.0.push_back(piece);
            }
        }
    }

    fn get_new_segment(&mut self, max_bytes: usize, now: Instant) -> TxItem {
        assemble_segment(&mut self.queue, &mut self.app_size, max_bytes, now)
    }

    fn app_size(&self) -> usize {
        self.app_size
    }
}

struct FifoQueue(VecDeque<TxItem>);

impl SegmentQueue for FifoQueue {
    fn pop_next(&mut self) -> Option<TxItem> {
        self.0.pop_front()
    }

    fn push_front(&mut self, item: TxItem) {
        self.0.push_front(item);
    }

    fn rescan_size(&self) -> usize {
        self.0.iter().map(|i| i.size()).sum()
    }
}

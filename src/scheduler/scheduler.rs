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

#![allow(unused_variables)]

use core::str::FromStr;
use std::time::Duration;
use std::time::Instant;

use log::error;
use smallvec::SmallVec;

use self::scheduler_edf::*;
use self::scheduler_fifo::*;
use self::scheduler_pfifo::*;
use crate::buffer::tx_item::TxItem;
use crate::Config;
use crate::Error;
use crate::Result;

/// TxScheduler decides the order in which buffered application data is
/// handed to the wire.
pub trait TxScheduler {
    /// Queue an item for transmission. Retransmitted data jumps the queue
    /// according to the scheduling discipline.
    fn add(&mut self, item: TxItem, retx: bool);

    /// Assemble the next segment of at most `max_bytes` serialized bytes.
    ///
    /// Whole entries are merged while they fit; the first entry that does
    /// not fit is split byte-exactly, with its remainder kept at the head
    /// of the queue. The returned item is empty if nothing is queued or
    /// not even a frame header fits.
    fn get_new_segment(&mut self, max_bytes: usize, now: Instant) -> TxItem;

    /// Total queued payload bytes.
    fn app_size(&self) -> usize;

    /// Set the latency bound for a stream. Only used by deadline-aware
    /// disciplines.
    fn set_latency(&mut self, stream_id: u64, latency: Duration) {}

    /// The latency bound for a stream.
    fn latency(&self, stream_id: u64) -> Duration {
        Duration::ZERO
    }

    /// Set the latency bound applied to streams without an explicit one.
    fn set_default_latency(&mut self, latency: Duration) {}
}

/// Available scheduling algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerAlgorithm {
    /// Entries are sent strictly in insertion order. Retransmissions are
    /// placed at the head of the queue.
    #[default]
    Fifo,

    /// Entries are keyed by (stream id, offset): lower stream ids drain
    /// first, in-order within a stream. Retransmissions may optionally be
    /// given the highest priority.
    PriorityFifo,

    /// Earliest-deadline-first: each entry's deadline is its generation
    /// time plus the latency bound of its stream.
    Edf,
}

impl FromStr for SchedulerAlgorithm {
    type Err = Error;

    fn from_str(algor: &str) -> Result<SchedulerAlgorithm> {
        if algor.eq_ignore_ascii_case("fifo") {
            Ok(SchedulerAlgorithm::Fifo)
        } else if algor.eq_ignore_ascii_case("pfifo") || algor.eq_ignore_ascii_case("priority") {
            Ok(SchedulerAlgorithm::PriorityFifo)
        } else if algor.eq_ignore_ascii_case("edf") {
            Ok(SchedulerAlgorithm::Edf)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

/// Build a scheduler
pub fn build_scheduler(conf: &Config) -> Box<dyn TxScheduler> {
    match conf.scheduler_algorithm {
        SchedulerAlgorithm::Fifo => Box::new(FifoScheduler::new(conf)),
        SchedulerAlgorithm::PriorityFifo => Box::new(PfifoScheduler::new(conf)),
        SchedulerAlgorithm::Edf => Box::new(EdfScheduler::new(conf)),
    }
}

/// Break a multi-frame item into one single-frame item per frame, each
/// inheriting the original flags and timestamps.
pub(crate) fn disaggregate(mut item: TxItem) -> SmallVec<[TxItem; 1]> {
    if item.frames.len() <= 1 {
        return smallvec::smallvec![item];
    }

    let frames = std::mem::take(&mut item.frames);
    frames
        .into_iter()
        .map(|f| {
            let mut piece = item.clone();
            piece.frames = smallvec::smallvec![f];
            piece
        })
        .collect()
}

/// Internal queue operations shared by the segment assembly loop.
pub(crate) trait SegmentQueue {
    /// Remove and return the highest-priority entry.
    fn pop_next(&mut self) -> Option<TxItem>;

    /// Put an entry back so that it is the next one popped.
    fn push_front(&mut self, item: TxItem);

    /// Queued payload bytes, recomputed by full scan.
    fn rescan_size(&self) -> usize;
}

/// Merge and split queue entries into a segment of at most `max_bytes`
/// serialized bytes. `app_size` tracks queued payload bytes and is kept
/// consistent with the queue contents.
pub(crate) fn assemble_segment<Q: SegmentQueue>(
    queue: &mut Q,
    app_size: &mut usize,
    max_bytes: usize,
    now: Instant,
) -> TxItem {
    let mut out: Option<TxItem> = None;
    let mut collected = 0;
    let mut did_split = false;

    while *app_size > 0 && collected < max_bytes {
        let mut item = match queue.pop_next() {
            Some(item) => item,
            None => break,
        };

        let wire = item.wire_len();
        if collected + wire <= max_bytes {
            *app_size = app_size.saturating_sub(item.size());
            collected += wire;
            match out.as_mut() {
                Some(out) => out.merge(item),
                None => out = Some(item),
            }
            continue;
        }

        // The entry does not fit whole: split it so that its front part
        // fills the remaining budget exactly, and keep the rest at the
        // head of the queue. At most one entry is split per segment.
        let header = match item.frames.first() {
            Some(frame) if item.frames.len() == 1 => frame.header_len(),
            _ => {
                queue.push_front(item);
                break;
            }
        };
        let budget = (max_bytes - collected).saturating_sub(header);
        if budget == 0 {
            queue.push_front(item);
            break;
        }
        match item.split(budget) {
            Ok(tail) => {
                *app_size = app_size.saturating_sub(item.size());
                queue.push_front(tail);
                match out.as_mut() {
                    Some(out) => out.merge(item),
                    None => out = Some(item),
                }
                did_split = true;
            }
            Err(_) => queue.push_front(item),
        }
        break;
    }

    if did_split {
        debug_assert_eq!(queue.rescan_size(), *app_size);
        if cfg!(not(debug_assertions)) && queue.rescan_size() != *app_size {
            error!(
                "scheduler accounting drift: tracked {} scanned {}",
                *app_size,
                queue.rescan_size()
            );
            *app_size = queue.rescan_size();
        }
    }

    let mut out = out.unwrap_or_else(|| TxItem::with_frames(SmallVec::new(), now));
    out.is_stream = true;
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::Frame;
    use bytes::Bytes;

    pub(crate) fn stream_item(
        stream_id: u64,
        offset: u64,
        len: usize,
        now: Instant,
    ) -> TxItem {
        let data = Bytes::from(vec![0x61; len]);
        TxItem::new(Frame::new_stream(stream_id, offset, false, data), now)
    }

    /// Payload carried by a segment, per frame in order.
    pub(crate) fn segment_layout(item: &TxItem) -> Vec<(u64, u64, usize)> {
        item.frames
            .iter()
            .map(|f| (f.stream_id(), f.offset(), f.data_len()))
            .collect()
    }

    #[test]
    fn scheduler_name() {
        let cases = [
            ("fifo", Ok(SchedulerAlgorithm::Fifo)),
            ("FIFO", Ok(SchedulerAlgorithm::Fifo)),
            ("pfifo", Ok(SchedulerAlgorithm::PriorityFifo)),
            ("Priority", Ok(SchedulerAlgorithm::PriorityFifo)),
            ("edf", Ok(SchedulerAlgorithm::Edf)),
            ("EDF", Ok(SchedulerAlgorithm::Edf)),
            ("lifo", Err(Error::InvalidConfig("unknown".into()))),
        ];

        for (name, algor) in cases {
            assert_eq!(SchedulerAlgorithm::from_str(name), algor);
        }
    }

    #[test]
    fn scheduler_disaggregate() {
        let now = Instant::now();
        let mut item = stream_item(4, 0, 10, now);
        item.merge(stream_item(8, 100, 20, now));
        item.retransmitted = true;

        let pieces = disaggregate(item);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].frames.len(), 1);
        assert_eq!(pieces[0].frames[0].stream_id(), 4);
        assert_eq!(pieces[1].frames[0].stream_id(), 8);
        assert!(pieces.iter().all(|p| p.retransmitted));
    }
}

mod scheduler_edf;
mod scheduler_fifo;
mod scheduler_pfifo;

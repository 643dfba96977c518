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

//! Per-stream send buffer.
//!
//! A simpler, offset-ordered sibling of the connection-level buffer: raw
//! data chunks are queued in order, assembled into segments of an exact
//! size, and retired when selectively acknowledged. There is no scheduler
//! and no rate sampling at this level.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use bytes::BytesMut;
use log::warn;

/// Default buffer budget for a single stream, in bytes.
pub const DEFAULT_MAX_STREAM_BUFFER_SIZE: usize = 131_072;

#[derive(Debug)]
struct StreamTxItem {
    /// Packet number the chunk was sent under.
    seq: u64,

    data: Bytes,

    sacked: bool,

    time_sent: Instant,
}

/// Send buffer of a single stream.
pub struct StreamTxBuffer {
    /// Queued chunks, in submission order.
    app_list: VecDeque<Bytes>,

    /// Queued bytes.
    app_size: usize,

    /// Sent but not yet acknowledged chunks, ordered by packet number.
    sent_list: VecDeque<StreamTxItem>,

    /// Sent but not yet acknowledged bytes.
    sent_size: usize,

    max_buffer: usize,
}

impl Default for StreamTxBuffer {
    fn default() -> Self {
        StreamTxBuffer::new(DEFAULT_MAX_STREAM_BUFFER_SIZE)
    }
}

impl StreamTxBuffer {
    pub fn new(max_buffer: usize) -> StreamTxBuffer {
        StreamTxBuffer {
            app_list: VecDeque::new(),
            app_size: 0,
            sent_list: VecDeque::new(),
            sent_size: 0,
            max_buffer,
        }
    }

    /// Queue a chunk of stream data. Empty chunks and chunks that would
    /// overflow the buffer budget are rejected.
    pub fn add(&mut self, data: Bytes) -> bool {
        if data.is_empty() {
            warn!("stream buffer: discarded empty chunk");
            return false;
        }
        if data.len() > self.available() {
            warn!(
                "stream buffer: rejected {} bytes, only {} available",
                data.len(),
                self.available()
            );
            return false;
        }
        self.app_size += data.len();
        self.app_list.push_back(data);
        true
    }

    /// Move the newest sent chunk back to the head of the queue, e.g.
    /// after the socket layer refused it.
    pub fn rejected(&mut self) -> bool {
        match self.sent_list.pop_back() {
            Some(item) => {
                self.sent_size -= item.data.len();
                self.app_size += item.data.len();
                self.app_list.push_front(item.data);
                true
            }
            None => false,
        }
    }

    /// Assemble the next segment of at most `max_bytes`, stamping it with
    /// `seq`. Returns `None` when the buffer holds no data.
    pub fn next_sequence(&mut self, max_bytes: usize, seq: u64, now: Instant) -> Option<Bytes> {
        if self.app_size == 0 || max_bytes == 0 {
            return None;
        }

        let mut out = BytesMut::with_capacity(max_bytes.min(self.app_size));
        while out.len() < max_bytes {
            let mut chunk = match self.app_list.pop_front() {
                Some(chunk) => chunk,
                None => break,
            };
            let room = max_bytes - out.len();
            if chunk.len() > room {
                // Split: the remainder stays at the head of the queue.
                let tail = chunk.split_off(room);
                self.app_list.push_front(tail);
            }
            self.app_size -= chunk.len();
            out.extend_from_slice(&chunk);
        }

        let data = out.freeze();
        self.sent_size += data.len();
        self.sent_list.push_back(StreamTxItem {
            seq,
            data: data.clone(),
            sacked: false,
            time_sent: now,
        });
        Some(data)
    }

    /// Mark sent chunks covered by the given ACK blocks as acknowledged
    /// and retire the acknowledged prefix.
    pub fn on_ack_update(&mut self, largest_acked: u64, ack_blocks: &[u64], gaps: &[u64]) {
        let mut blocks = Vec::with_capacity(ack_blocks.len() + 1);
        blocks.push(largest_acked);
        blocks.extend_from_slice(ack_blocks);

        for (i, &block) in blocks.iter().enumerate() {
            let gap = gaps.get(i).copied();
            for item in self.sent_list.iter_mut().rev() {
                if let Some(gap) = gap {
                    if item.seq <= gap {
                        break;
                    }
                }
                if item.seq <= block {
                    item.sacked = true;
                }
            }
        }

        while let Some(front) = self.sent_list.front() {
            if !front.sacked {
                break;
            }
            self.sent_size -= front.data.len();
            self.sent_list.pop_front();
        }
    }

    /// Queued bytes not yet handed to the wire.
    pub fn app_size(&self) -> usize {
        self.app_size
    }

    /// Remaining buffer budget for new data.
    pub fn available(&self) -> usize {
        self.max_buffer.saturating_sub(self.app_size)
    }

    /// Bytes sent but not yet acknowledged.
    pub fn bytes_in_flight(&self) -> usize {
        self.sent_size
    }

    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer
    }

    pub fn set_max_buffer_size(&mut self, n: usize) {
        self.max_buffer = n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_buffer_add() {
        let mut buf = StreamTxBuffer::default();
        assert_eq!(buf.max_buffer_size(), DEFAULT_MAX_STREAM_BUFFER_SIZE);

        assert!(!buf.add(Bytes::new()));
        assert!(buf.add(Bytes::from(vec![0; 1000])));
        assert_eq!(buf.app_size(), 1000);
        assert_eq!(buf.available(), DEFAULT_MAX_STREAM_BUFFER_SIZE - 1000);

        assert!(!buf.add(Bytes::from(vec![0; DEFAULT_MAX_STREAM_BUFFER_SIZE])));
    }

    #[test]
    fn stream_buffer_segment_split() {
        let mut buf = StreamTxBuffer::new(10_000);
        let now = Instant::now();

        buf.add(Bytes::from_static(b"hello"));
        buf.add(Bytes::from_static(b" world"));

        let seg = buf.next_sequence(8, 1, now).unwrap();
        assert_eq!(seg.as_ref(), b"hello wo");
        assert_eq!(buf.app_size(), 3);
        assert_eq!(buf.bytes_in_flight(), 8);

        let seg = buf.next_sequence(100, 2, now).unwrap();
        assert_eq!(seg.as_ref(), b"rld");
        assert_eq!(buf.app_size(), 0);
        assert!(buf.next_sequence(100, 3, now).is_none());
    }

    #[test]
    fn stream_buffer_ack_retire() {
        let mut buf = StreamTxBuffer::new(10_000);
        let now = Instant::now();

        buf.add(Bytes::from(vec![0; 30]));
        for seq in 1..=3 {
            buf.next_sequence(10, seq, now);
        }
        assert_eq!(buf.bytes_in_flight(), 30);

        // Packets 1 and 3 covered, 2 in a gap: only the prefix before the
        // gap is retired.
        buf.on_ack_update(3, &[1], &[2]);
        assert_eq!(buf.bytes_in_flight(), 30 - 10);

        buf.on_ack_update(3, &[], &[]);
        assert_eq!(buf.bytes_in_flight(), 0);
    }

    #[test]
    fn stream_buffer_rejected() {
        let mut buf = StreamTxBuffer::new(10_000);
        let now = Instant::now();

        buf.add(Bytes::from_static(b"abcdef"));
        buf.next_sequence(3, 1, now);
        assert_eq!(buf.app_size(), 3);

        assert!(buf.rejected());
        assert_eq!(buf.app_size(), 6);
        assert_eq!(buf.bytes_in_flight(), 0);

        let seg = buf.next_sequence(6, 2, now).unwrap();
        assert_eq!(seg.as_ref(), b"abcdef");
    }
}

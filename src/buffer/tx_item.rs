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

use std::time::Instant;

use smallvec::smallvec;
use smallvec::SmallVec;

use crate::error::Error;
use crate::frame::Frame;
use crate::frame::CONTROL_STREAM_ID;
use crate::Result;

/// Delivery state snapshot taken when an item is sent, used to produce a
/// rate sample once the item is acknowledged.
///
/// See
/// <https://datatracker.ietf.org/doc/html/draft-cheng-iccrg-delivery-rate-estimation>.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateSampleState {
    /// Total bytes delivered on the connection when the item was sent.
    pub delivered: u64,

    /// Time of the delivery snapshot. Cleared once the item has been used
    /// to generate a rate sample, so each item contributes at most once.
    pub delivered_time: Option<Instant>,

    /// Send time of the first packet of the current flight.
    pub first_sent_time: Option<Instant>,

    /// Whether the connection was application limited when the item was
    /// sent.
    pub is_app_limited: bool,

    /// Total pure-ACK bytes sent on the connection when the item was sent.
    pub ack_bytes_sent: u64,
}

/// An entry of the transmission buffer: one or more stream frames that
/// travel together in a packet.
#[derive(Debug, Clone)]
pub struct TxItem {
    /// Frames carried by the item. Almost always exactly one.
    pub frames: SmallVec<[Frame; 1]>,

    /// Packet number, assigned when the item is first handed to the wire.
    pub packet_number: u64,

    /// Whether the item has been declared lost.
    pub lost: bool,

    /// Whether the item is a retransmission of lost data.
    pub retransmitted: bool,

    /// Whether the item has been selectively acknowledged.
    pub sacked: bool,

    /// Whether the item has been cumulatively acknowledged.
    pub acked: bool,

    /// Whether the item carries application stream data. Only stream items
    /// count towards bytes in flight.
    pub is_stream: bool,

    /// Whether the item belongs to the control stream.
    pub is_control: bool,

    /// When the item was last handed to the wire.
    pub time_sent: Instant,

    /// When the application produced the data. Drives EDF deadlines.
    pub time_generated: Instant,

    /// When the first acknowledgment covering the item arrived.
    pub time_acked: Option<Instant>,

    /// Delivery state snapshot for rate sampling.
    pub rate_state: RateSampleState,
}

impl TxItem {
    /// Create a fresh item around a single frame.
    pub fn new(frame: Frame, now: Instant) -> TxItem {
        let is_control = frame.stream_id() == CONTROL_STREAM_ID;
        TxItem {
            frames: smallvec![frame],
            packet_number: 0,
            lost: false,
            retransmitted: false,
            sacked: false,
            acked: false,
            is_stream: false,
            is_control,
            time_sent: now,
            time_generated: now,
            time_acked: None,
            rate_state: RateSampleState::default(),
        }
    }

    /// Create an item carrying several frames.
    pub fn with_frames(frames: SmallVec<[Frame; 1]>, now: Instant) -> TxItem {
        let is_control = frames
            .first()
            .map(|f| f.stream_id() == CONTROL_STREAM_ID)
            .unwrap_or(false);
        TxItem {
            frames,
            packet_number: 0,
            lost: false,
            retransmitted: false,
            sacked: false,
            acked: false,
            is_stream: false,
            is_control,
            time_sent: now,
            time_generated: now,
            time_acked: None,
            rate_state: RateSampleState::default(),
        }
    }

    /// Total payload bytes carried by the item, excluding frame headers.
    pub fn size(&self) -> usize {
        self.frames.iter().map(|f| f.data_len()).sum()
    }

    /// Total serialized size, including frame headers.
    pub fn wire_len(&self) -> usize {
        self.frames.iter().map(|f| f.wire_len()).sum()
    }

    /// Absorb another item into this one.
    ///
    /// Acknowledgment flags combine pessimistically: the merged item is
    /// only sacked/acked if both halves were, and is lost/retransmitted if
    /// either half was.
    pub fn merge(&mut self, other: TxItem) {
        self.sacked &= other.sacked;
        self.acked &= other.acked;
        self.retransmitted |= other.retransmitted;
        self.lost |= other.lost;
        self.is_stream |= other.is_stream;
        self.is_control |= other.is_control;
        self.time_sent = self.time_sent.max(other.time_sent);
        self.time_generated = self.time_generated.min(other.time_generated);
        self.time_acked = match (self.time_acked, other.time_acked) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.frames.extend(other.frames);
    }

    /// Split a single-frame item in two at the given payload byte.
    ///
    /// The front keeps `[0, at)` at the original offset with the fin bit
    /// cleared; the returned tail continues at `offset + at` and carries
    /// the original fin bit. Flags and timestamps are inherited by both
    /// halves.
    pub fn split(&mut self, at: usize) -> Result<TxItem> {
        if self.frames.len() != 1 {
            return Err(Error::InvalidState(
                "split of multi-frame item".to_string(),
            ));
        }
        let Frame::Stream {
            stream_id,
            offset,
            length,
            fin,
            data,
        } = &mut self.frames[0];
        if at == 0 || at >= *length {
            return Err(Error::InvalidState("split point out of range".to_string()));
        }

        let tail_data = data.split_off(at);
        let tail_frame = Frame::Stream {
            stream_id: *stream_id,
            offset: *offset + at as u64,
            length: tail_data.len(),
            fin: *fin,
            data: tail_data,
        };
        *length = at;
        *fin = false;

        let mut tail = self.clone();
        tail.frames = smallvec![tail_frame];
        Ok(tail)
    }
}

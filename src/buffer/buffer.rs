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

//! Sender-side transmission buffer.
//!
//! The buffer owns the queue of unsent application data (delegated to a
//! pluggable scheduler, with a dedicated first-priority queue for control
//! stream data), the list of sent-but-unacknowledged items, ACK-driven
//! loss detection, retransmission staging, and delivery rate sampling.

use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use log::trace;
use log::warn;

use self::tx_item::RateSampleState;
use self::tx_item::TxItem;
use crate::congestion::ConnectionState;
use crate::error::Error;
use crate::scheduler::build_scheduler;
use crate::scheduler::TxScheduler;
use crate::Config;
use crate::Result;

pub use stream_buffer::StreamTxBuffer;

/// Measurement of the rate at which data is delivered to the peer.
///
/// Updated incrementally as acknowledged items are processed and finalized
/// by [`TxBuffer::generate_rate_sample`]. See
/// <https://datatracker.ietf.org/doc/html/draft-cheng-iccrg-delivery-rate-estimation>.
#[derive(Debug, Clone, Default)]
pub struct RateSample {
    /// The delivery rate sample, in bits per second.
    pub delivery_rate: u64,

    /// Whether the sample is application limited.
    pub is_app_limited: bool,

    /// The length of the sampling interval.
    pub interval: Duration,

    /// The amount of data delivered in the sampling interval.
    pub delivered: u64,

    /// The delivered count of the most recent packet delivered.
    pub prior_delivered: u64,

    /// The delivered time of the most recent packet delivered.
    pub prior_time: Option<Instant>,

    /// Send time interval calculated from the most recent packet delivered.
    pub send_elapsed: Duration,

    /// ACK time interval calculated from the most recent packet delivered.
    pub ack_elapsed: Duration,

    /// Bytes newly marked lost by the latest ACK batch.
    pub packet_loss: u64,

    /// Bytes in flight before the latest ACK batch was processed.
    pub prior_in_flight: u64,

    /// Pure-ACK bytes sent in the sampling interval, discounted from the
    /// delivery rate.
    pub ack_bytes_sent: u64,

    /// `ack_bytes_sent` connection counter at the prior-delivered mark.
    pub prior_ack_bytes_sent: u64,

    /// Age, in samples, of the current ACK-byte discount. Bounded so the
    /// discount cannot stick forever.
    pub ack_bytes_max_win: u32,
}

/// Transmission buffer of a connection.
pub struct TxBuffer {
    /// Sent but not yet retired items, ordered by packet number.
    sent_list: VecDeque<TxItem>,

    /// Payload bytes held in the sent list.
    sent_size: usize,

    /// Unsent control stream items, drained before any scheduled data.
    control_list: VecDeque<TxItem>,

    /// Payload bytes held in the control list.
    control_size: usize,

    /// Queued-but-unsent application data.
    scheduler: Box<dyn TxScheduler>,

    /// Total payload byte budget for queued data.
    max_buffer: usize,

    /// Running delivery rate measurement.
    rs: RateSample,
}

impl TxBuffer {
    pub fn new(conf: &Config) -> TxBuffer {
        TxBuffer {
            sent_list: VecDeque::new(),
            sent_size: 0,
            control_list: VecDeque::new(),
            control_size: 0,
            scheduler: build_scheduler(conf),
            max_buffer: conf.max_tx_buffer_size,
            rs: RateSample::default(),
        }
    }

    /// Queue application data for transmission. Empty items and items that
    /// would overflow the buffer budget are rejected.
    pub fn add(&mut self, mut item: TxItem) -> bool {
        let size = item.size();
        if size == 0 {
            warn!("tx buffer: discarded empty item");
            return false;
        }
        if size > self.available() {
            warn!(
                "tx buffer: rejected {} bytes, only {} available",
                size,
                self.available()
            );
            return false;
        }

        item.is_stream = true;
        if item.is_control {
            self.control_size += size;
            self.control_list.push_back(item);
        } else {
            self.scheduler.add(item, false);
        }
        true
    }

    /// Extract the next segment of at most `max_bytes` serialized bytes,
    /// stamp it as sent, and return its wire encoding.
    ///
    /// Control stream data is drained first, one whole item per call.
    /// Returns `Error::Done` if there is nothing to send.
    pub fn next_segment(
        &mut self,
        max_bytes: usize,
        seq: u64,
        tcb: &mut ConnectionState,
        now: Instant,
    ) -> Result<Bytes> {
        let mut item = match self.control_list.pop_front() {
            Some(item) => {
                self.control_size -= item.size();
                item
            }
            None => self.scheduler.get_new_segment(max_bytes, now),
        };
        if item.size() == 0 {
            return Err(Error::Done);
        }

        item.packet_number = seq;
        item.time_sent = now;
        self.stamp_packet_sent(&mut item, tcb, now);

        let mut buf = vec![0_u8; item.wire_len()];
        let mut off = 0;
        for frame in &item.frames {
            off += frame.to_bytes(&mut buf[off..])?;
        }

        trace!(
            "tx buffer: sending packet {} with {} payload bytes",
            seq,
            item.size()
        );
        self.sent_size += item.size();
        self.sent_list.push_back(item);

        tcb.high_tx_mark = tcb.high_tx_mark.max(seq);
        tcb.bytes_in_flight = self.bytes_in_flight();
        Ok(Bytes::from(buf))
    }

    /// Snapshot the connection's delivery counters into an item as it is
    /// handed to the wire.
    fn stamp_packet_sent(&self, item: &mut TxItem, tcb: &mut ConnectionState, now: Instant) {
        if tcb.bytes_in_flight == 0 {
            tcb.first_sent_time = Some(now);
            tcb.delivered_time = Some(now);
        }

        item.rate_state = RateSampleState {
            delivered: tcb.delivered,
            delivered_time: tcb.delivered_time,
            first_sent_time: tcb.first_sent_time,
            is_app_limited: tcb.app_limited_until > tcb.delivered,
            ack_bytes_sent: tcb.ack_bytes_sent,
        };
    }

    /// Account pure-ACK bytes handed to the wire outside this buffer.
    pub fn update_ack_sent(&mut self, tcb: &mut ConnectionState, bytes: u64) {
        tcb.ack_bytes_sent += bytes;
    }

    /// Process an acknowledgment covering `largest_acked` and the given
    /// additional ACK blocks, with `gaps` the unacknowledged ranges between
    /// consecutive blocks.
    ///
    /// Marks covered items sacked, runs loss detection, retires the acked
    /// prefix of the sent list and updates the delivery rate bookkeeping.
    /// Returns the packet numbers of newly sacked items.
    pub fn on_ack_update(
        &mut self,
        tcb: &mut ConnectionState,
        largest_acked: u64,
        ack_blocks: &[u64],
        gaps: &[u64],
        now: Instant,
    ) -> Vec<u64> {
        self.rs.prior_in_flight = tcb.bytes_in_flight;
        let lost_before = self.lost_bytes();
        let delivered_before = tcb.delivered;

        // The largest acknowledged number is the upper end of the first
        // ACK block.
        let mut blocks = Vec::with_capacity(ack_blocks.len() + 1);
        blocks.push(largest_acked);
        blocks.extend_from_slice(ack_blocks);

        let mut newly_acked = Vec::new();
        for (i, &block) in blocks.iter().enumerate() {
            let gap = gaps.get(i).copied();

            // Newest to oldest: everything at or below the block and above
            // the next gap is acknowledged.
            for item in self.sent_list.iter_mut().rev() {
                if let Some(gap) = gap {
                    if item.packet_number <= gap {
                        break;
                    }
                }
                if item.packet_number <= block && !item.sacked {
                    item.sacked = true;
                    item.time_acked = Some(now);
                    newly_acked.push(item.packet_number);
                    update_rate_sample(&mut self.rs, tcb, item, now);
                }
            }
        }

        self.detect_lost_on_ack(tcb, largest_acked);
        self.clean_sent_list();

        tcb.bytes_in_flight = self.bytes_in_flight();
        self.rs.packet_loss = self.lost_bytes().abs_diff(lost_before);
        tcb.last_acked_sacked_bytes = tcb.delivered.saturating_sub(delivered_before);
        newly_acked
    }

    /// Reverse-pass loss detection, per Section 4.2.1 of
    /// draft-ietf-quic-recovery-15.
    fn detect_lost_on_ack(&mut self, tcb: &ConnectionState, largest_acked: u64) {
        let mut lost = false;
        let mut outstanding = false;
        let mut anchor_ack_time: Option<Instant> = None;

        for item in self.sent_list.iter_mut().rev() {
            // Loss is monotonic looking backward: once one item is lost,
            // every older unacknowledged item is too.
            if lost {
                if !item.sacked {
                    item.lost = true;
                }
                continue;
            }

            if item.packet_number == largest_acked {
                anchor_ack_time = item.time_acked;
                outstanding = true;
            } else if outstanding && !item.sacked {
                if largest_acked.saturating_sub(item.packet_number) >= tcb.reordering_threshold {
                    trace!(
                        "tx buffer: packet {} lost by reordering threshold",
                        item.packet_number
                    );
                    item.lost = true;
                    lost = true;
                }
                if tcb.time_loss_detection {
                    if let Some(ack_time) = anchor_ack_time {
                        let threshold =
                            tcb.smoothed_rtt.mul_f64(tcb.time_reordering_fraction);
                        if ack_time.saturating_duration_since(item.time_sent) >= threshold {
                            trace!(
                                "tx buffer: packet {} lost by time threshold",
                                item.packet_number
                            );
                            item.lost = true;
                            lost = true;
                        }
                    }
                }
            }
        }
    }

    /// Retire the contiguous acknowledged prefix of the sent list.
    fn clean_sent_list(&mut self) {
        while let Some(front) = self.sent_list.front_mut() {
            if !front.sacked || front.lost {
                break;
            }
            front.acked = true;
            self.sent_size -= front.size();
            self.sent_list.pop_front();
        }
    }

    /// Mark all but the newest `keep` unacknowledged sent items as lost.
    /// Used when a retransmission timeout invalidates the flight.
    pub fn reset_sent_list(&mut self, keep: usize) {
        for (kept, item) in self.sent_list.iter_mut().rev().enumerate() {
            if kept >= keep && !item.sacked {
                item.lost = true;
            }
        }
    }

    /// Externally mark a sent packet as lost. Returns whether the packet
    /// number was found.
    pub fn mark_lost(&mut self, seq: u64) -> bool {
        let mut found = false;
        for item in self.sent_list.iter_mut() {
            if item.packet_number == seq {
                item.lost = true;
                found = true;
            }
        }
        found
    }

    /// Rewrap every lost sent item as a fresh retransmission and re-queue
    /// it, consuming packet numbers starting from `next_seq`. Returns the
    /// total payload bytes staged for retransmission.
    pub fn retransmit(&mut self, next_seq: u64) -> u64 {
        let mut seq = next_seq;
        let mut staged = 0;

        // Newest first, matching the reverse scan used by loss detection.
        let mut rewrapped: Vec<TxItem> = Vec::new();
        for item in self.sent_list.iter().rev() {
            if !item.lost {
                continue;
            }
            let mut retx = item.clone();
            retx.packet_number = seq;
            seq += 1;
            retx.lost = false;
            retx.retransmitted = true;
            retx.sacked = false;
            retx.acked = false;
            retx.time_acked = None;
            retx.rate_state = RateSampleState::default();

            trace!(
                "tx buffer: retx packet {} as {}",
                item.packet_number,
                retx.packet_number
            );
            staged += retx.size() as u64;
            self.sent_size -= retx.size();
            rewrapped.push(retx);
        }

        for retx in rewrapped {
            if retx.is_control {
                self.control_size += retx.size();
                self.control_list.push_front(retx);
            } else {
                self.scheduler.add(retx, true);
            }
        }

        self.sent_list.retain(|item| !item.lost);
        staged
    }

    /// Packet numbers of sent items currently marked lost.
    pub fn detect_lost(&self) -> Vec<u64> {
        self.sent_list
            .iter()
            .filter(|item| item.lost)
            .map(|item| item.packet_number)
            .collect()
    }

    /// Payload bytes of sent items currently marked lost.
    pub fn lost_bytes(&self) -> u64 {
        self.sent_list
            .iter()
            .filter(|item| item.lost)
            .map(|item| item.size() as u64)
            .sum()
    }

    /// Payload bytes sent but not yet selectively acknowledged, excluding
    /// control stream data.
    pub fn bytes_in_flight(&self) -> u64 {
        self.sent_list
            .iter()
            .filter(|item| item.is_stream && !item.is_control && !item.sacked)
            .map(|item| item.size() as u64)
            .sum()
    }

    /// Queued payload bytes not yet handed to the wire.
    pub fn app_size(&self) -> usize {
        self.control_size + self.scheduler.app_size()
    }

    /// Remaining buffer budget for new data.
    pub fn available(&self) -> usize {
        self.max_buffer
            .saturating_sub(self.control_size + self.scheduler.app_size())
    }

    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer
    }

    pub fn set_max_buffer_size(&mut self, n: usize) {
        self.max_buffer = n;
    }

    /// Latency bound passthroughs, meaningful for deadline-aware
    /// schedulers and a no-op otherwise.
    pub fn set_latency(&mut self, stream_id: u64, latency: Duration) {
        self.scheduler.set_latency(stream_id, latency);
    }

    pub fn latency(&self, stream_id: u64) -> Duration {
        self.scheduler.latency(stream_id)
    }

    pub fn set_default_latency(&mut self, latency: Duration) {
        self.scheduler.set_default_latency(latency);
    }

    /// The running delivery rate measurement.
    pub fn rate_sample(&self) -> &RateSample {
        &self.rs
    }

    /// Finalize the delivery rate sample for the latest ACK batch.
    ///
    /// Returns false when the sample is unusable: nothing has been
    /// delivered yet, or the sampling interval is shorter than the minimum
    /// RTT and would produce an inflated rate.
    pub fn generate_rate_sample(&mut self, tcb: &mut ConnectionState) -> bool {
        let rs = &mut self.rs;
        if rs.prior_time.is_none() {
            return false;
        }

        rs.interval = rs.send_elapsed.max(rs.ack_elapsed);
        rs.delivered = tcb.delivered.saturating_sub(rs.prior_delivered);

        // Discount bytes attributable to pure-ACK traffic, tracked with a
        // small bounded max-window so a stale discount ages out.
        let new_ack_bytes = tcb.ack_bytes_sent.saturating_sub(rs.prior_ack_bytes_sent);
        if rs.ack_bytes_sent < new_ack_bytes {
            rs.ack_bytes_sent = new_ack_bytes;
            rs.ack_bytes_max_win = 0;
        } else {
            rs.ack_bytes_max_win += 1;
            if rs.ack_bytes_max_win > 5 {
                rs.ack_bytes_sent = new_ack_bytes;
                rs.ack_bytes_max_win = 0;
            }
        }
        let discounted = rs.delivered.saturating_sub(rs.ack_bytes_sent);

        if rs.interval < tcb.min_rtt {
            rs.interval = Duration::ZERO;
            return false;
        }
        if !rs.interval.is_zero() {
            rs.delivery_rate = (discounted as f64 * 8.0 / rs.interval.as_secs_f64()) as u64;
        }
        true
    }
}

/// Update the connection's delivery bookkeeping for a newly sacked item.
fn update_rate_sample(
    rs: &mut RateSample,
    tcb: &mut ConnectionState,
    item: &mut TxItem,
    now: Instant,
) {
    // Items are consumed at most once; the cleared delivered time marks a
    // previously consumed item.
    let item_delivered_time = match item.rate_state.delivered_time {
        Some(t) => t,
        None => return,
    };

    tcb.delivered += item.size() as u64;
    tcb.delivered_time = Some(now);

    if item.rate_state.delivered > rs.prior_delivered {
        rs.prior_delivered = item.rate_state.delivered;
        rs.prior_time = Some(item_delivered_time);
        rs.is_app_limited = item.rate_state.is_app_limited;
        rs.send_elapsed = item
            .time_sent
            .saturating_duration_since(item.rate_state.first_sent_time.unwrap_or(item.time_sent));
        rs.ack_elapsed = now.saturating_duration_since(item_delivered_time);
        rs.prior_ack_bytes_sent = item.rate_state.ack_bytes_sent;
        tcb.first_sent_time = Some(item.time_sent);
    }

    item.rate_state.delivered_time = None;
    tcb.tx_item_delivered = item.rate_state.delivered;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::frame::CONTROL_STREAM_ID;
    use crate::scheduler::tests::segment_layout;
    use crate::scheduler::tests::stream_item;

    fn new_buffer(conf: &Config) -> (TxBuffer, ConnectionState) {
        (TxBuffer::new(conf), ConnectionState::new(conf))
    }

    // Queue one item and immediately hand it to the wire as its own packet.
    fn send_one(
        buf: &mut TxBuffer,
        tcb: &mut ConnectionState,
        offset: u64,
        len: usize,
        seq: u64,
        now: Instant,
    ) -> Bytes {
        assert!(buf.add(stream_item(4, offset, len, now)));
        buf.next_segment(usize::MAX, seq, tcb, now).unwrap()
    }

    #[test]
    fn buffer_add_rejection() {
        let conf = Config::default();
        let (mut buf, _) = new_buffer(&conf);
        let now = Instant::now();

        assert!(!buf.add(stream_item(4, 0, 0, now)));
        assert!(!buf.add(stream_item(4, 0, conf.max_tx_buffer_size + 1, now)));

        assert!(buf.add(stream_item(4, 0, conf.max_tx_buffer_size, now)));
        assert_eq!(buf.available(), 0);
        assert!(!buf.add(stream_item(4, 0, 1, now)));
        assert_eq!(buf.app_size(), conf.max_tx_buffer_size);
    }

    #[test]
    fn buffer_control_drained_first() {
        let conf = Config::default();
        let (mut buf, mut tcb) = new_buffer(&conf);
        let now = Instant::now();

        assert!(buf.add(stream_item(4, 0, 100, now)));
        assert!(buf.add(stream_item(CONTROL_STREAM_ID, 0, 50, now)));

        let seg = buf.next_segment(usize::MAX, 0, &mut tcb, now).unwrap();
        let (frame, _) = Frame::from_bytes(&seg).unwrap();
        assert_eq!(frame.stream_id(), CONTROL_STREAM_ID);

        let seg = buf.next_segment(usize::MAX, 1, &mut tcb, now).unwrap();
        let (frame, _) = Frame::from_bytes(&seg).unwrap();
        assert_eq!(frame.stream_id(), 4);

        assert_eq!(
            buf.next_segment(usize::MAX, 2, &mut tcb, now).unwrap_err(),
            Error::Done
        );
    }

    #[test]
    fn buffer_large_control_frame() {
        let conf = Config::default();
        let (mut buf, mut tcb) = new_buffer(&conf);
        let now = Instant::now();

        // Control items are drained whole regardless of the segment budget,
        // so a payload longer than the 2 byte varint range must survive the
        // wire encoding intact.
        assert!(buf.add(stream_item(CONTROL_STREAM_ID, 0, 20000, now)));
        let seg = buf.next_segment(1200, 0, &mut tcb, now).unwrap();

        let (frame, read) = Frame::from_bytes(&seg).unwrap();
        assert_eq!(read, seg.len());
        assert_eq!(frame.stream_id(), CONTROL_STREAM_ID);
        assert_eq!(frame.data_len(), 20000);
    }

    #[test]
    fn buffer_send_stamps_flight() {
        let conf = Config::default();
        let (mut buf, mut tcb) = new_buffer(&conf);
        let now = Instant::now();

        send_one(&mut buf, &mut tcb, 0, 100, 3, now);

        assert_eq!(tcb.high_tx_mark, 3);
        assert_eq!(tcb.bytes_in_flight, 100);
        assert_eq!(buf.bytes_in_flight(), 100);

        // The first packet of a flight seeds the delivery clock.
        assert_eq!(tcb.first_sent_time, Some(now));
        assert_eq!(tcb.delivered_time, Some(now));
        let sent = buf.sent_list.back().unwrap();
        assert_eq!(sent.packet_number, 3);
        assert_eq!(sent.rate_state.delivered_time, Some(now));
    }

    #[test]
    fn buffer_ack_retires_prefix() {
        let conf = Config::default();
        let (mut buf, mut tcb) = new_buffer(&conf);
        let now = Instant::now();

        for seq in 0..5 {
            send_one(&mut buf, &mut tcb, seq * 100, 100, seq, now);
        }

        let later = now + Duration::from_millis(30);
        let acked = buf.on_ack_update(&mut tcb, 2, &[], &[], later);
        assert_eq!(acked, vec![2, 1, 0]);

        assert_eq!(tcb.delivered, 300);
        assert_eq!(tcb.last_acked_sacked_bytes, 300);
        assert_eq!(tcb.bytes_in_flight, 200);
        assert_eq!(buf.sent_list.len(), 2);
        assert_eq!(buf.sent_list.front().unwrap().packet_number, 3);
    }

    #[test]
    fn buffer_ack_blocks_and_gaps() {
        let conf = Config::default();
        let (mut buf, mut tcb) = new_buffer(&conf);
        let now = Instant::now();

        for seq in 0..5 {
            send_one(&mut buf, &mut tcb, seq * 100, 100, seq, now);
        }

        // Blocks [4..=3] and [1..=0], with packet 2 in the gap.
        let later = now + Duration::from_millis(30);
        let acked = buf.on_ack_update(&mut tcb, 4, &[1], &[2], later);
        assert_eq!(acked, vec![4, 3, 1, 0]);

        // The acknowledged prefix is retired up to the hole.
        assert_eq!(buf.sent_list.front().unwrap().packet_number, 2);
        assert!(!buf.sent_list.front().unwrap().sacked);

        // Packet 2 trails the largest by less than the reordering
        // threshold, so it is not yet deemed lost.
        assert!(buf.detect_lost().is_empty());
        assert_eq!(tcb.bytes_in_flight, 100);
    }

    #[test]
    fn buffer_reordering_loss_and_retransmit() {
        let conf = Config::default();
        let (mut buf, mut tcb) = new_buffer(&conf);
        let now = Instant::now();

        for seq in 0..5 {
            send_one(&mut buf, &mut tcb, seq * 100, 100, seq, now);
        }

        // Only the newest packet is acknowledged. Packets 1 and 0 trail it
        // by at least the reordering threshold; loss then cascades to every
        // older unacknowledged packet.
        let later = now + Duration::from_millis(30);
        let acked = buf.on_ack_update(&mut tcb, 4, &[], &[3], later);
        assert_eq!(acked, vec![4]);
        assert_eq!(buf.detect_lost(), vec![0, 1]);
        assert_eq!(buf.lost_bytes(), 200);
        assert_eq!(buf.rate_sample().packet_loss, 200);

        let staged = buf.retransmit(5);
        assert_eq!(staged, 200);
        assert!(buf.detect_lost().is_empty());
        assert_eq!(buf.app_size(), 200);

        // Both rewrapped pieces fit one segment, oldest data first.
        let seg = buf.next_segment(usize::MAX, 5, &mut tcb, later).unwrap();
        assert!(!seg.is_empty());
        let sent = buf.sent_list.back().unwrap();
        assert!(sent.retransmitted);
        assert_eq!(segment_layout(sent), vec![(4, 0, 100), (4, 100, 100)]);
        assert_eq!(tcb.bytes_in_flight, 400);
    }

    #[test]
    fn buffer_control_retransmission() {
        let conf = Config::default();
        let (mut buf, mut tcb) = new_buffer(&conf);
        let now = Instant::now();

        assert!(buf.add(stream_item(CONTROL_STREAM_ID, 0, 50, now)));
        buf.next_segment(usize::MAX, 0, &mut tcb, now).unwrap();
        assert!(buf.add(stream_item(4, 0, 100, now)));

        assert!(buf.mark_lost(0));
        assert!(!buf.mark_lost(9));
        buf.retransmit(1);

        // Lost control data jumps ahead of queued stream data.
        let seg = buf.next_segment(usize::MAX, 1, &mut tcb, now).unwrap();
        let (frame, _) = Frame::from_bytes(&seg).unwrap();
        assert_eq!(frame.stream_id(), CONTROL_STREAM_ID);
        assert!(buf.sent_list.back().unwrap().retransmitted);
    }

    #[test]
    fn buffer_time_threshold_loss() {
        let mut conf = Config::default();
        conf.set_time_reordering_fraction(9.0 / 8.0);
        let (mut buf, mut tcb) = new_buffer(&conf);
        let now = Instant::now();

        tcb.update_rtt(Duration::from_millis(80));

        send_one(&mut buf, &mut tcb, 0, 100, 0, now);
        send_one(&mut buf, &mut tcb, 100, 100, 1, now);

        // Packet 0 trails by one number only, but its age at the anchor's
        // ack time exceeds 9/8 of the smoothed RTT.
        let later = now + Duration::from_millis(200);
        buf.on_ack_update(&mut tcb, 1, &[], &[0], later);
        assert_eq!(buf.detect_lost(), vec![0]);
    }

    #[test]
    fn buffer_reset_sent_list() {
        let conf = Config::default();
        let (mut buf, mut tcb) = new_buffer(&conf);
        let now = Instant::now();

        for seq in 0..4 {
            send_one(&mut buf, &mut tcb, seq * 100, 100, seq, now);
        }

        buf.reset_sent_list(2);
        assert_eq!(buf.detect_lost(), vec![0, 1]);
    }

    #[test]
    fn buffer_rate_sample_lifecycle() {
        let conf = Config::default();
        let (mut buf, mut tcb) = new_buffer(&conf);
        tcb.update_rtt(Duration::from_millis(10));

        let t0 = Instant::now();
        send_one(&mut buf, &mut tcb, 0, 1000, 0, t0);
        send_one(&mut buf, &mut tcb, 1000, 1000, 1, t0 + Duration::from_millis(10));

        // The first flight was sent before anything had been delivered,
        // so it cannot prime the sampler.
        let t2 = t0 + Duration::from_millis(100);
        buf.on_ack_update(&mut tcb, 1, &[], &[], t2);
        assert_eq!(tcb.delivered, 2000);
        assert!(!buf.generate_rate_sample(&mut tcb));

        // The second flight carries a delivery snapshot and yields a rate
        // over the ack interval.
        let t3 = t0 + Duration::from_millis(150);
        send_one(&mut buf, &mut tcb, 2000, 1000, 2, t3);
        let t4 = t3 + Duration::from_millis(50);
        buf.on_ack_update(&mut tcb, 2, &[], &[], t4);
        assert!(buf.generate_rate_sample(&mut tcb));

        let rs = buf.rate_sample();
        assert_eq!(rs.interval, Duration::from_millis(50));
        assert_eq!(rs.delivered, 1000);
        assert_eq!(rs.delivery_rate, (1000.0 * 8.0 / 0.05) as u64);
        assert_eq!(tcb.tx_item_delivered, 2000);
    }

    #[test]
    fn buffer_rate_sample_short_interval() {
        let conf = Config::default();
        let (mut buf, mut tcb) = new_buffer(&conf);
        tcb.update_rtt(Duration::from_millis(10));

        let t0 = Instant::now();
        send_one(&mut buf, &mut tcb, 0, 1000, 0, t0);
        buf.on_ack_update(&mut tcb, 0, &[], &[], t0 + Duration::from_millis(20));

        send_one(&mut buf, &mut tcb, 1000, 1000, 1, t0 + Duration::from_millis(30));
        buf.on_ack_update(&mut tcb, 1, &[], &[], t0 + Duration::from_millis(35));

        // An interval below the minimum RTT would inflate the rate. The
        // sample is discarded and the interval cleared.
        assert!(!buf.generate_rate_sample(&mut tcb));
        assert_eq!(buf.rate_sample().interval, Duration::ZERO);
    }

    #[test]
    fn buffer_app_limited_sample() {
        let conf = Config::default();
        let (mut buf, mut tcb) = new_buffer(&conf);
        tcb.update_rtt(Duration::from_millis(10));

        let t0 = Instant::now();
        send_one(&mut buf, &mut tcb, 0, 1000, 0, t0);
        buf.on_ack_update(&mut tcb, 0, &[], &[], t0 + Duration::from_millis(20));

        // Mark the flow application limited before the next flight.
        tcb.app_limited_until = tcb.delivered + 1;
        send_one(&mut buf, &mut tcb, 1000, 1000, 1, t0 + Duration::from_millis(30));
        buf.on_ack_update(&mut tcb, 1, &[], &[], t0 + Duration::from_millis(60));

        assert!(buf.generate_rate_sample(&mut tcb));
        assert!(buf.rate_sample().is_app_limited);
    }
}

pub mod tx_item;

mod stream_buffer;

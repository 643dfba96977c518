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

pub use bbr::Bbr;
pub use bbr::BbrConfig;
use crate::buffer::RateSample;
use crate::Config;
use crate::Error;
use crate::Result;

/// Available congestion control algorithm
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub enum CongestionControlAlgorithm {
    /// BBR uses recent measurements of a transport connection's delivery rate,
    /// round-trip time, and packet loss rate to build an explicit model of the
    /// network path. The model is then used to control data transmission speed
    /// and the maximum volume of data allowed in flight in the network at any
    /// time.
    #[default]
    Bbr,
}

impl FromStr for CongestionControlAlgorithm {
    type Err = Error;

    fn from_str(algor: &str) -> Result<CongestionControlAlgorithm> {
        if algor.eq_ignore_ascii_case("bbr") {
            Ok(CongestionControlAlgorithm::Bbr)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

/// Congestion avoidance state of the connection.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub enum CongestionState {
    /// Normal operation, no loss in progress.
    #[default]
    Open,

    /// Fast-retransmit recovery after packet loss.
    Recovery,

    /// Retransmission-timeout loss, window collapsed.
    Loss,
}

/// Window-related events reported to the congestion controller.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum CongestionEvent {
    /// First transmission after an idle period.
    TxStart,

    /// Recovery finished, congestion window reduction is complete.
    CompleteCwr,
}

/// Per-connection transmission state shared between the transmission
/// buffer and the congestion controller.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Congestion avoidance state.
    pub cong_state: CongestionState,

    /// Congestion window, in bytes.
    pub congestion_window: u64,

    /// Initial congestion window, in bytes.
    pub initial_cwnd: u64,

    /// Initial slow start threshold, in bytes.
    pub initial_ssthresh: u64,

    /// Current slow start threshold, in bytes.
    pub ssthresh: u64,

    /// Maximum payload bytes of an outgoing packet.
    pub segment_size: u64,

    /// Pacing rate, in bits per second.
    pub pacing_rate: u64,

    /// Upper bound on the pacing rate, in bits per second.
    pub max_pacing_rate: u64,

    /// Bytes sent but not yet acknowledged, excluding control data.
    pub bytes_in_flight: u64,

    /// Most recent RTT measurement.
    pub latest_rtt: Duration,

    /// Smoothed RTT estimate.
    pub smoothed_rtt: Duration,

    /// Minimum RTT observed over the connection lifetime.
    pub min_rtt: Duration,

    /// Packet reordering threshold for fast-retransmit loss detection.
    pub reordering_threshold: u64,

    /// Fraction of the smoothed RTT used by time-based loss detection.
    pub time_reordering_fraction: f64,

    /// Whether time-based loss detection is enabled.
    pub time_loss_detection: bool,

    /// Highest packet number sent so far.
    pub high_tx_mark: u64,

    /// Packet number marking the end of the current recovery episode.
    pub end_of_recovery: u64,

    /// Total bytes delivered to the peer.
    pub delivered: u64,

    /// Time of the latest delivery update.
    pub delivered_time: Option<Instant>,

    /// Send time of the first packet of the current flight.
    pub first_sent_time: Option<Instant>,

    /// The connection is application limited until this many bytes have
    /// been delivered.
    pub app_limited_until: u64,

    /// `delivered` snapshot of the item that produced the latest rate
    /// sample. Drives BBR round counting.
    pub tx_item_delivered: u64,

    /// Bytes newly acknowledged by the latest ACK batch.
    pub last_acked_sacked_bytes: u64,

    /// Total pure-ACK bytes sent, discounted from delivery rates.
    pub ack_bytes_sent: u64,
}

impl ConnectionState {
    pub fn new(conf: &Config) -> ConnectionState {
        let initial_cwnd = conf.initial_congestion_window * conf.max_datagram_size;
        ConnectionState {
            cong_state: CongestionState::Open,
            congestion_window: initial_cwnd,
            initial_cwnd,
            initial_ssthresh: conf.initial_ssthresh,
            ssthresh: conf.initial_ssthresh,
            segment_size: conf.max_datagram_size,
            pacing_rate: 0,
            max_pacing_rate: conf.max_pacing_rate,
            bytes_in_flight: 0,
            latest_rtt: Duration::ZERO,
            smoothed_rtt: Duration::ZERO,
            min_rtt: Duration::MAX,
            reordering_threshold: conf.reordering_threshold,
            time_reordering_fraction: conf.time_reordering_fraction,
            time_loss_detection: conf.time_loss_detection,
            high_tx_mark: 0,
            end_of_recovery: 0,
            delivered: 0,
            delivered_time: None,
            first_sent_time: None,
            app_limited_until: 0,
            tx_item_delivered: 0,
            last_acked_sacked_bytes: 0,
            ack_bytes_sent: 0,
        }
    }

    /// Incorporate a new RTT measurement, RFC 6298 style.
    pub fn update_rtt(&mut self, latest_rtt: Duration) {
        self.latest_rtt = latest_rtt;
        self.min_rtt = self.min_rtt.min(latest_rtt);
        if self.smoothed_rtt.is_zero() {
            self.smoothed_rtt = latest_rtt;
        } else {
            self.smoothed_rtt = (self.smoothed_rtt * 7 + latest_rtt) / 8;
        }
    }
}

/// Congestion control interfaces shared by different algorithms.
///
/// The controller never reads the clock or the network itself: all inputs
/// arrive through the connection state, the latest rate sample, and the
/// caller-provided `now`.
pub trait CongestionController {
    /// Name of congestion control algorithm.
    fn name(&self) -> &str;

    /// Per-delivery model and control update, once per ACK batch.
    fn congestion_control(
        &mut self,
        tcb: &mut ConnectionState,
        rs: &RateSample,
        now: Instant,
    );

    /// Callback invoked when the connection enters a new congestion state.
    fn congestion_state_set(
        &mut self,
        tcb: &mut ConnectionState,
        state: CongestionState,
        now: Instant,
    );

    /// Callback for window-related events.
    fn cwnd_event(&mut self, tcb: &mut ConnectionState, event: CongestionEvent, now: Instant) {}

    /// Callback after a packet was sent out.
    fn on_packet_sent(
        &mut self,
        tcb: &mut ConnectionState,
        packet_number: u64,
        is_ack_only: bool,
        now: Instant,
    ) {
    }

    /// The slow start threshold to adopt after a loss event.
    fn get_ss_thresh(&mut self, tcb: &mut ConnectionState, bytes_in_flight: u64) -> u64;
}

/// Build a congestion controller
pub fn build_congestion_controller(conf: &Config) -> Box<dyn CongestionController> {
    match conf.congestion_control_algorithm {
        CongestionControlAlgorithm::Bbr => Box::new(Bbr::new(BbrConfig::from_config(conf))),
    }
}


mod bbr;
mod minmax;

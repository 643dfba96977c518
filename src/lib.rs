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

//! Quictx implements the sender-side data path of a QUIC endpoint: stream
//! data buffering and segmentation, acknowledgment and loss bookkeeping,
//! delivery rate estimation, and model-based congestion control.
//!
//! The building blocks are deliberately decoupled from sockets and timers.
//! The embedding transport feeds packets, ACK ranges, and timestamps in, and
//! reads the pacing rate and congestion window out:
//!
//! * [`TxBuffer`] queues application data, assembles outgoing segments
//!   through a pluggable scheduler, tracks sent packets until they are
//!   acknowledged, detects losses, and produces delivery rate samples.
//! * [`StreamTxBuffer`] is the per-stream counterpart that retires data
//!   acknowledged at the stream level.
//! * The scheduler family ([`SchedulerAlgorithm`]) decides which buffered
//!   data forms the next segment: FIFO, stream-priority FIFO, or
//!   earliest-deadline-first.
//! * [`Bbr`] consumes the rate samples and drives the pacing rate and the
//!   congestion window of the shared [`ConnectionState`].

#![allow(unused_imports)]
#![allow(dead_code)]

use std::cmp;
use std::time::Duration;

/// A specialized `Result` type for quictx operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The stream id carrying connection control data.
pub const CONTROL_STREAM_ID: u64 = crate::frame::CONTROL_STREAM_ID;

/// Default outgoing udp datagram payload size.
pub const DEFAULT_MAX_DATAGRAM_SIZE: u64 = 1200;

/// Default capacity of the transmission buffer, in bytes.
const DEFAULT_MAX_TX_BUFFER_SIZE: usize = 32768;

/// Default initial RTT used before an RTT sample is taken.
/// See RFC 9002 Section 6.2.2.
pub const INITIAL_RTT: Duration = Duration::from_millis(333);

/// The lowest value an RTT estimate can be clamped to.
const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// Default initial congestion window, in packets.
const DEFAULT_INITIAL_CONGESTION_WINDOW: u64 = 10;

/// Default minimal congestion window, in packets.
const DEFAULT_MIN_CONGESTION_WINDOW: u64 = 4;

/// Default per-stream latency target for the deadline scheduler.
const DEFAULT_SCHEDULER_LATENCY: Duration = Duration::from_millis(100);

/// Default packet reordering threshold before a packet is declared lost.
/// See RFC 9002 Section 6.1.1.
const DEFAULT_REORDERING_THRESHOLD: u64 = 3;

/// Default fraction of the smoothed RTT used by time-based loss detection.
const DEFAULT_TIME_REORDERING_FRACTION: f64 = 9.0 / 8.0;

/// Configurations for the transmission buffer, the segment scheduler, loss
/// detection, and congestion control.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of the transmission buffer, in bytes.
    pub max_tx_buffer_size: usize,

    /// Scheduling discipline used to assemble outgoing segments.
    pub scheduler_algorithm: SchedulerAlgorithm,

    /// Whether retransmitted data preempts new data in the scheduler.
    pub retransmit_first: bool,

    /// Latency target applied to streams without an explicit one, used by
    /// the deadline scheduler.
    pub default_latency: Duration,

    /// Congestion control algorithm.
    pub congestion_control_algorithm: CongestionControlAlgorithm,

    /// Maximum payload bytes of an outgoing packet.
    pub max_datagram_size: u64,

    /// Initial congestion window, in packets.
    pub initial_congestion_window: u64,

    /// Minimal congestion window, in packets.
    pub min_congestion_window: u64,

    /// Initial slow start threshold, in bytes.
    pub initial_ssthresh: u64,

    /// Initial RTT used before an RTT sample is taken.
    pub initial_rtt: Duration,

    /// Upper bound on the pacing rate, in bits per second.
    pub max_pacing_rate: u64,

    /// Packet reordering threshold before a packet is declared lost.
    pub reordering_threshold: u64,

    /// Fraction of the smoothed RTT used by time-based loss detection.
    pub time_reordering_fraction: f64,

    /// Whether time-based loss detection is enabled.
    pub time_loss_detection: bool,
}

impl Config {
    /// Create default configuration.
    ///
    /// The configuration may be customized by calling related set methods.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity of the transmission buffer, in bytes.
    pub fn set_max_tx_buffer_size(&mut self, v: usize) {
        self.max_tx_buffer_size = v;
    }

    /// Set the scheduling discipline used to assemble outgoing segments.
    pub fn set_scheduler_algorithm(&mut self, v: SchedulerAlgorithm) {
        self.scheduler_algorithm = v;
    }

    /// Let retransmitted data preempt new data in the scheduler.
    pub fn set_retransmit_first(&mut self, v: bool) {
        self.retransmit_first = v;
    }

    /// Set the latency target applied to streams without an explicit one.
    pub fn set_default_latency(&mut self, v: Duration) {
        self.default_latency = v;
    }

    /// Set the congestion control algorithm.
    pub fn set_congestion_control_algorithm(&mut self, v: CongestionControlAlgorithm) {
        self.congestion_control_algorithm = v;
    }

    /// Set the maximum payload bytes of an outgoing packet.
    pub fn set_max_datagram_size(&mut self, v: u64) {
        self.max_datagram_size = cmp::max(v, 1);
    }

    /// Set the initial congestion window in packets.
    pub fn set_initial_congestion_window(&mut self, v: u64) {
        self.initial_congestion_window = cmp::max(v, 1);
    }

    /// Set the minimal congestion window in packets.
    pub fn set_min_congestion_window(&mut self, v: u64) {
        self.min_congestion_window = cmp::max(v, 1);
    }

    /// Set the initial RTT in milliseconds. The value is clamped to be at
    /// least the timer granularity.
    pub fn set_initial_rtt(&mut self, v: u64) {
        self.initial_rtt = cmp::max(Duration::from_millis(v), TIMER_GRANULARITY);
    }

    /// Set the upper bound on the pacing rate, in bits per second.
    pub fn set_max_pacing_rate(&mut self, v: u64) {
        self.max_pacing_rate = v;
    }

    /// Set the packet reordering threshold before a packet is declared lost.
    pub fn set_reordering_threshold(&mut self, v: u64) {
        self.reordering_threshold = v;
    }

    /// Set the fraction of the smoothed RTT used by time-based loss
    /// detection and enable it.
    pub fn set_time_reordering_fraction(&mut self, v: f64) {
        self.time_reordering_fraction = v;
        self.time_loss_detection = true;
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_tx_buffer_size: DEFAULT_MAX_TX_BUFFER_SIZE,
            scheduler_algorithm: SchedulerAlgorithm::default(),
            retransmit_first: false,
            default_latency: DEFAULT_SCHEDULER_LATENCY,
            congestion_control_algorithm: CongestionControlAlgorithm::default(),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            initial_congestion_window: DEFAULT_INITIAL_CONGESTION_WINDOW,
            min_congestion_window: DEFAULT_MIN_CONGESTION_WINDOW,
            initial_ssthresh: u64::MAX,
            initial_rtt: INITIAL_RTT,
            max_pacing_rate: u64::MAX,
            reordering_threshold: DEFAULT_REORDERING_THRESHOLD,
            time_reordering_fraction: DEFAULT_TIME_REORDERING_FRACTION,
            time_loss_detection: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::str::FromStr;

    #[ctor::ctor]
    fn init() {
        env_logger::builder()
            .filter_level(log::LevelFilter::Trace)
            .format_timestamp_millis()
            .is_test(true)
            .init();
    }

    #[test]
    fn config_default() {
        let conf = Config::new();
        assert_eq!(conf.max_tx_buffer_size, DEFAULT_MAX_TX_BUFFER_SIZE);
        assert_eq!(conf.scheduler_algorithm, SchedulerAlgorithm::Fifo);
        assert_eq!(
            conf.congestion_control_algorithm,
            CongestionControlAlgorithm::Bbr
        );
        assert_eq!(conf.max_datagram_size, DEFAULT_MAX_DATAGRAM_SIZE);
        assert!(!conf.retransmit_first);
        assert!(!conf.time_loss_detection);
    }

    #[test]
    fn config_initial_rtt() {
        let mut conf = Config::new();

        conf.set_initial_rtt(0);
        assert_eq!(conf.initial_rtt, TIMER_GRANULARITY);

        conf.set_initial_rtt(100);
        assert_eq!(conf.initial_rtt, Duration::from_millis(100));
    }

    #[test]
    fn config_scheduler() {
        let mut conf = Config::new();

        conf.set_scheduler_algorithm(SchedulerAlgorithm::from_str("edf").unwrap());
        assert_eq!(conf.scheduler_algorithm, SchedulerAlgorithm::Edf);

        conf.set_retransmit_first(true);
        assert!(conf.retransmit_first);
    }

    #[test]
    fn config_time_loss_detection() {
        let mut conf = Config::new();

        conf.set_time_reordering_fraction(1.25);
        assert!(conf.time_loss_detection);
        assert_eq!(conf.time_reordering_fraction, 1.25);
    }
}

pub use crate::buffer::tx_item::TxItem;
pub use crate::buffer::RateSample;
pub use crate::buffer::StreamTxBuffer;
pub use crate::buffer::TxBuffer;
pub use crate::congestion::build_congestion_controller;
pub use crate::congestion::Bbr;
pub use crate::congestion::CongestionControlAlgorithm;
pub use crate::congestion::BbrConfig;
pub use crate::congestion::CongestionController;
pub use crate::congestion::CongestionEvent;
pub use crate::congestion::CongestionState;
pub use crate::congestion::ConnectionState;
pub use crate::error::Error;
pub use crate::frame::Frame;
pub use crate::scheduler::build_scheduler;
pub use crate::scheduler::SchedulerAlgorithm;
pub use crate::scheduler::TxScheduler;

#[path = "buffer/buffer.rs"]
pub mod buffer;

#[path = "congestion/congestion.rs"]
pub mod congestion;

#[path = "scheduler/scheduler.rs"]
pub mod scheduler;

mod codec;
pub mod error;
mod frame;

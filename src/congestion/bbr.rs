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

//! BBR Congestion Control
//!
//! BBR uses recent measurements of a transport connection's delivery rate
//! and round-trip time to build an explicit model that includes both the
//! maximum recent bandwidth available to that connection, and its minimum
//! recent round-trip delay. BBR then uses this model to control both how
//! fast it sends data and the maximum amount of data it allows in flight
//! in the network at any time.
//!
//! See draft-cardwell-iccrg-bbr-congestion-control-00.

use std::time::Duration;
use std::time::Instant;

use log::*;
use rand::Rng;

use super::minmax::FilterKind;
use super::minmax::MinMax;
use super::CongestionController;
use super::CongestionEvent;
use super::CongestionState;
use super::ConnectionState;
use crate::buffer::RateSample;
use crate::Config;

/// BBR configurable parameters.
#[derive(Debug)]
pub struct BbrConfig {
    /// Minimal congestion window in bytes.
    min_cwnd: u64,

    /// Initial congestion window in bytes.
    initial_cwnd: u64,

    /// Fallback RTT used before the first RTT sample arrives.
    initial_rtt: Duration,

    /// Max datagram size in bytes.
    max_datagram_size: u64,
}

impl BbrConfig {
    pub fn from_config(conf: &Config) -> Self {
        Self {
            min_cwnd: conf.min_congestion_window * conf.max_datagram_size,
            initial_cwnd: conf.initial_congestion_window * conf.max_datagram_size,
            initial_rtt: conf.initial_rtt,
            max_datagram_size: conf.max_datagram_size,
        }
    }
}

/// BtlBwFilterLen: A constant specifying the length of the BBR.BtlBw max
/// filter window for BBR.BtlBwFilter, BtlBwFilterLen is `10` packet-timed
/// round trips.
const BTLBW_FILTER_LEN: u64 = 10;

/// RTpropFilterLen: A constant specifying the length of the RTProp min
/// filter window, RTpropFilterLen is `10` secs.
const RTPROP_FILTER_LEN: Duration = Duration::from_secs(10);

/// BBRHighGain: A constant specifying the minimum gain value that will
/// allow the sending rate to double each round (`2/ln(2)` ~= `2.89`), used
/// in Startup mode for both BBR.pacing_gain and BBR.cwnd_gain.
const HIGH_GAIN: f64 = 2.89;

/// Bandwidth growth rate before the pipe is considered filled.
const BTLBW_GROWTH_RATE: f64 = 0.25;

/// Rounds without bandwidth growth before the pipe is supposed to be full.
const FULL_BW_COUNT_THRESHOLD: u64 = 3;

/// BBRGainCycleLen: the number of phases in the BBR ProbeBW gain cycle: 8.
const GAIN_CYCLE_LEN: usize = 8;

/// Pacing Gain Cycles. Each phase normally lasts for roughly BBR.RTprop.
const PACING_GAIN_CYCLE: [f64; GAIN_CYCLE_LEN] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];

/// ProbeRTTDuration: A constant specifying the minimum duration for
/// which ProbeRTT state holds inflight to BBRMinPipeCwnd or fewer
/// packets: 200 ms.
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);

/// BBR State Machine.
///
/// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 3.4.
#[derive(Debug, PartialEq, Eq)]
enum BbrStateMachine {
    Startup,
    Drain,
    ProbeBW,
    ProbeRTT,
}

/// Round trip counter for tracking packet-timed round trips which start
/// at the transmission of some segment, and end at the ack of that segment.
#[derive(Debug, Default)]
struct RoundTripCounter {
    /// BBR.round_count: Count of packet-timed round trips.
    pub round_count: u64,

    /// BBR.round_start: A boolean that BBR sets to true once per packet-
    /// timed round trip, on ACKs that advance BBR.round_count.
    pub is_round_start: bool,

    /// BBR.next_round_delivered: packet.delivered value denoting the end of
    /// a packet-timed round trip.
    pub next_round_delivered: u64,
}

/// Estimator for tracking if the bottleneck bandwidth is fully utilized.
#[derive(Debug, Default)]
struct FullPipeEstimator {
    /// BBR.filled_pipe: A boolean that records whether BBR estimates that it
    /// has ever fully utilized its available bandwidth.
    pub is_filled_pipe: bool,

    /// Baseline level delivery rate for full pipe estimator.
    pub full_bw: u64,

    /// The number of round trips without growth of full pipe estimator.
    pub full_bw_count: u64,
}

/// BBR congestion control.
///
/// Model updates and control outputs are driven by the shared connection
/// state and the rate sample produced by the transmission buffer, once per
/// ACK batch.
#[derive(Debug)]
pub struct Bbr {
    /// Configurable parameters.
    config: BbrConfig,

    /// Current state of BBR state machine.
    state: BbrStateMachine,

    /// Whether the one-time initialization has run.
    is_initialized: bool,

    /// BBR.btlbw_filter: the windowed max filter estimating the bottleneck
    /// bandwidth, in bits per second.
    btlbw_filter: MinMax,

    /// BBR.rtprop: BBR's estimated two-way round-trip propagation delay of
    /// the path, estimated from the windowed minimum recent round-trip delay
    /// sample.
    rtprop: Duration,

    /// BBR.rtprop_stamp: The wall clock time at which the current
    /// BBR.RTProp sample was obtained.
    rtprop_stamp: Instant,

    /// BBR.rtprop_expired: A boolean recording whether the BBR.RTprop has
    /// expired and is due for a refresh with an application idle period or a
    /// transition into ProbeRTT state.
    is_rtprop_expired: bool,

    /// BBR.pacing_gain: The dynamic gain factor used to scale BBR.BtlBw to
    /// produce BBR.pacing_rate.
    pacing_gain: f64,

    /// BBR.cwnd_gain: The dynamic gain factor used to scale the estimated
    /// BDP to produce a congestion window (cwnd).
    cwnd_gain: f64,

    /// Packet-timed round trip counter.
    round: RoundTripCounter,

    /// Full pipe estimator.
    full_pipe: FullPipeEstimator,

    /// Timestamp when ProbeRTT state may end, None while outside ProbeRTT
    /// or before inflight has drained to BBRMinPipeCwnd.
    probe_rtt_done_stamp: Option<Instant>,

    /// A boolean recording whether the flow has passed through at least one
    /// full packet-timed round trip in ProbeRTT.
    probe_rtt_round_done: bool,

    /// A boolean that is true while the flow restricts itself to the data
    /// already in flight after entering loss recovery.
    packet_conservation: bool,

    /// The last-known good congestion window before loss recovery or
    /// ProbeRTT began.
    prior_cwnd: u64,

    /// A boolean that is true if and only if the connection is restarting
    /// after being idle.
    is_idle_restart: bool,

    /// BBRMinPipeCwnd: the minimal cwnd value BBR tries to target, in bytes.
    min_pipe_cwnd: u64,

    /// The maximum size of a data aggregate scheduled and transmitted
    /// together, in bytes.
    send_quantum: u64,

    /// The time at which the current pacing gain cycle phase began.
    cycle_stamp: Instant,

    /// The current index of pacing_gain cycle array.
    cycle_index: usize,

    /// BBR.target_cwnd: the upper bound on the volume of data BBR allows in
    /// flight.
    target_cwnd: u64,
}

impl Bbr {
    pub fn new(config: BbrConfig) -> Self {
        let now = Instant::now();

        Self {
            config,
            state: BbrStateMachine::Startup,
            is_initialized: false,
            btlbw_filter: MinMax::new(FilterKind::Max, BTLBW_FILTER_LEN),
            rtprop: Duration::MAX,
            rtprop_stamp: now,
            is_rtprop_expired: false,
            pacing_gain: HIGH_GAIN,
            cwnd_gain: HIGH_GAIN,
            round: Default::default(),
            full_pipe: Default::default(),
            probe_rtt_done_stamp: None,
            probe_rtt_round_done: false,
            packet_conservation: false,
            prior_cwnd: 0,
            is_idle_restart: false,
            min_pipe_cwnd: 0,
            send_quantum: 0,
            cycle_stamp: now,
            cycle_index: 0,
            target_cwnd: 0,
        }
    }

    /// Estimated bottleneck bandwidth, in bits per second.
    fn btlbw(&self) -> u64 {
        self.btlbw_filter.get()
    }

    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.1.1.3.
    fn init_round_counting(&mut self) {
        self.round.next_round_delivered = 0;
        self.round.round_count = 0;
        self.round.is_round_start = false;
    }

    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.2.2.
    fn init_full_pipe(&mut self) {
        self.full_pipe.is_filled_pipe = false;
        self.full_pipe.full_bw = 0;
        self.full_pipe.full_bw_count = 0;
    }

    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.2.1.
    fn init_pacing_rate(&mut self, tcb: &mut ConnectionState) {
        // When a BBR flow starts it has no BBR.BtlBw estimate, so it sets an
        // initial pacing rate from the initial congestion window and the
        // first RTT sample, or the configured fallback RTT before one exists.
        let rtt = if !tcb.latest_rtt.is_zero() {
            tcb.latest_rtt
        } else {
            self.config.initial_rtt
        };

        let nominal_bandwidth = self.config.initial_cwnd as f64 * 8.0 / rtt.as_secs_f64();
        tcb.pacing_rate = (self.pacing_gain * nominal_bandwidth) as u64;
    }

    /// Enter the Startup state.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.2.1.
    fn enter_startup(&mut self) {
        self.state = BbrStateMachine::Startup;

        // Upon entry into Startup, BBR sets BBR.pacing_gain and BBR.cwnd_gain
        // to BBRHighGain, the minimum gain value that will allow the sending
        // rate to double each round.
        self.pacing_gain = HIGH_GAIN;
        self.cwnd_gain = HIGH_GAIN;
    }

    /// Estimate whether the pipe is full by looking for a plateau in the
    /// BBR.BtlBw estimate.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.2.2.
    fn check_full_pipe(&mut self, rs: &RateSample) {
        // No need to check for a full pipe now.
        if self.full_pipe.is_filled_pipe || !self.round.is_round_start || rs.is_app_limited {
            return;
        }

        // BBR.BtlBw still growing?
        if self.btlbw() as f64 >= self.full_pipe.full_bw as f64 * (1.0 + BTLBW_GROWTH_RATE) {
            // Record new baseline level.
            self.full_pipe.full_bw = self.btlbw();
            self.full_pipe.full_bw_count = 0;
            return;
        }

        // Another round without much growth. BBR waits three rounds in order
        // to have solid evidence that the sender is not seeing a delivery
        // rate plateau that was temporarily imposed by the receive window.
        self.full_pipe.full_bw_count += 1;
        if self.full_pipe.full_bw_count >= FULL_BW_COUNT_THRESHOLD {
            debug!("bbr pipe filled at {} bits/s", self.full_pipe.full_bw);
            self.full_pipe.is_filled_pipe = true;
        }
    }

    /// Update the virtual time tracked by BBR.round_count, a count of
    /// "packet-timed" round trips: BBR records state about a sentinel packet
    /// and waits for an ACK of any data packet that was sent after it.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.1.1.3.
    fn update_round(&mut self, tcb: &ConnectionState) {
        if tcb.tx_item_delivered >= self.round.next_round_delivered {
            self.round.next_round_delivered = tcb.delivered;
            self.round.round_count += 1;
            self.round.is_round_start = true;
        } else {
            self.round.is_round_start = false;
        }
    }

    /// Try to update the pacing rate using the given pacing gain.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.2.1.
    fn set_pacing_rate_with_gain(&mut self, tcb: &mut ConnectionState, pacing_gain: f64) {
        let rate = ((pacing_gain * self.btlbw() as f64) as u64).min(tcb.max_pacing_rate);

        // On each data ACK BBR updates its pacing rate to be proportional to
        // BBR.BtlBw, as long as it estimates that it has filled the pipe, or
        // doing so increases the pacing rate.
        if self.full_pipe.is_filled_pipe || rate > tcb.pacing_rate {
            tcb.pacing_rate = rate;
        }
    }

    /// In Drain, BBR aims to quickly drain any queue created in Startup by
    /// switching to a pacing_gain well below 1.0.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.3.
    fn enter_drain(&mut self) {
        self.state = BbrStateMachine::Drain;
        self.pacing_gain = 1.0 / HIGH_GAIN; // pace slowly
        self.cwnd_gain = HIGH_GAIN; // maintain cwnd
    }

    /// Calculate the upper bound on the volume of data BBR allows in flight.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.2.3.2.
    fn inflight(&self, tcb: &ConnectionState, gain: f64) -> u64 {
        // No valid RTT samples yet.
        if self.rtprop == Duration::MAX {
            return tcb.initial_cwnd;
        }

        // The "quanta" term allows enough quanta in flight on the sending
        // and receiving hosts to reach full utilization even in
        // high-throughput environments.
        let quanta = 3 * self.send_quantum;

        // The "estimated_bdp" term allows enough packets in flight to fully
        // utilize the estimated BDP of the path, by allowing the flow to send
        // at BBR.BtlBw for a duration of BBR.RTprop.
        let estimated_bdp = self.btlbw() as f64 * self.rtprop.as_secs_f64() / 8.0;

        (gain * estimated_bdp) as u64 + quanta
    }

    /// On each ACK, BBR calculates the BBR.target_cwnd.
    fn update_target_cwnd(&mut self, tcb: &ConnectionState) {
        self.target_cwnd = self.inflight(tcb, self.cwnd_gain);
    }

    /// Check and try to enter or leave the Drain state.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.3.
    fn check_drain(&mut self, tcb: &ConnectionState, now: Instant) {
        // In Startup, when the "full pipe" estimator estimates that BBR has
        // filled the pipe, BBR switches to its Drain state.
        if self.state == BbrStateMachine::Startup && self.full_pipe.is_filled_pipe {
            self.enter_drain();
        }

        // In Drain, when the amount of data in flight matches the estimated
        // BDP, the queue has been fully drained but the pipe is still full,
        // so BBR leaves Drain and enters ProbeBW.
        if self.state == BbrStateMachine::Drain && tcb.bytes_in_flight <= self.inflight(tcb, 1.0) {
            self.enter_probe_bw(now);
        }
    }

    /// Enter the ProbeBW state. BBR flows spend the vast majority of their
    /// time in ProbeBW, probing for bandwidth using gain cycling.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.4.3.
    fn enter_probe_bw(&mut self, now: Instant) {
        self.state = BbrStateMachine::ProbeBW;
        self.pacing_gain = 1.0;
        self.cwnd_gain = 2.0;

        // To improve mixing and fairness when multiple BBR flows share a
        // bottleneck, BBR randomizes the initial phase of gain cycling.
        self.cycle_index = GAIN_CYCLE_LEN - 1 - rand::thread_rng().gen_range(0..GAIN_CYCLE_LEN);
        self.advance_cycle_phase(now);
    }

    /// Check if it's time to advance to the next gain cycle phase.
    fn check_cycle_phase(&mut self, tcb: &ConnectionState, rs: &RateSample, now: Instant) {
        if self.state == BbrStateMachine::ProbeBW && self.is_next_cycle_phase(tcb, rs, now) {
            self.advance_cycle_phase(now);
        }
    }

    /// Advance the gain cycle phase during the ProbeBW state.
    fn advance_cycle_phase(&mut self, now: Instant) {
        self.cycle_stamp = now;
        self.cycle_index = (self.cycle_index + 1) % GAIN_CYCLE_LEN;
        self.pacing_gain = PACING_GAIN_CYCLE[self.cycle_index];
    }

    /// Check if it's time to advance to the next gain cycle phase in
    /// ProbeBW state.
    fn is_next_cycle_phase(&self, tcb: &ConnectionState, rs: &RateSample, now: Instant) -> bool {
        // Each cycle phase normally lasts for roughly BBR.RTprop.
        let is_full_length = now.saturating_duration_since(self.cycle_stamp) > self.rtprop;

        if self.pacing_gain > 1.0 {
            // The 5/4 phase lasts until the elapsed time in the phase has
            // been at least BBR.RTprop, and either inflight has reached
            // 5/4 * estimated_BDP or some packets have been lost.
            is_full_length
                && (rs.packet_loss > 0
                    || rs.prior_in_flight >= self.inflight(tcb, self.pacing_gain))
        } else if self.pacing_gain < 1.0 {
            // The 3/4 phase lasts until either a full BBR.RTprop has elapsed
            // or inflight drops below the estimated BDP.
            is_full_length || rs.prior_in_flight <= self.inflight(tcb, 1.0)
        } else {
            is_full_length
        }
    }

    /// When restarting from idle, BBR leaves its cwnd as-is and paces
    /// packets at exactly BBR.BtlBw, aiming to return as quickly as possible
    /// to its target operating point.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.4.4.
    fn handle_restart_from_idle(&mut self, tcb: &mut ConnectionState) {
        if tcb.bytes_in_flight == 0 && tcb.app_limited_until > tcb.delivered {
            self.is_idle_restart = true;

            if self.state == BbrStateMachine::ProbeBW {
                self.set_pacing_rate_with_gain(tcb, 1.0);
            }
        }
    }

    /// Update the minimum round-trip propagation delay estimate.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.1.2.3.
    fn update_rtprop(&mut self, tcb: &ConnectionState, now: Instant) {
        self.is_rtprop_expired = now > self.rtprop_stamp + RTPROP_FILTER_LEN;

        if !tcb.latest_rtt.is_zero() && (tcb.latest_rtt <= self.rtprop || self.is_rtprop_expired) {
            self.rtprop = tcb.latest_rtt;
            self.rtprop_stamp = now;
        }
    }

    /// Save the last-known good cwnd, the latest cwnd unmodulated by loss
    /// recovery or ProbeRTT.
    fn save_cwnd(&mut self, tcb: &ConnectionState) {
        if tcb.cong_state != CongestionState::Recovery && self.state != BbrStateMachine::ProbeRTT {
            self.prior_cwnd = tcb.congestion_window;
        } else {
            self.prior_cwnd = self.prior_cwnd.max(tcb.congestion_window);
        }
    }

    /// Restore the last-known good cwnd.
    fn restore_cwnd(&self, tcb: &mut ConnectionState) {
        tcb.congestion_window = tcb.congestion_window.max(self.prior_cwnd);
    }

    /// Enter the ProbeRTT state.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.5.
    fn enter_probe_rtt(&mut self) {
        self.state = BbrStateMachine::ProbeRTT;
        self.pacing_gain = 1.0;
        self.cwnd_gain = 1.0;
    }

    /// Leave ProbeRTT for ProbeBW if the pipe was previously estimated to be
    /// full, or Startup otherwise.
    fn exit_probe_rtt(&mut self, now: Instant) {
        if self.full_pipe.is_filled_pipe {
            self.enter_probe_bw(now);
        } else {
            self.enter_startup();
        }
    }

    /// Drain the pipe to BBRMinPipeCwnd, hold for ProbeRTTDuration plus one
    /// round trip, then refresh BBR.rtprop_stamp and leave.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.5.
    fn handle_probe_rtt(&mut self, tcb: &mut ConnectionState, now: Instant) {
        // Ignore low rate samples during ProbeRTT.
        tcb.app_limited_until = (tcb.delivered + tcb.bytes_in_flight).max(1);

        if self.probe_rtt_done_stamp.is_none() && tcb.bytes_in_flight <= self.min_pipe_cwnd {
            // Wait for at least ProbeRTTDuration to elapse and at least one
            // round trip to pass.
            self.probe_rtt_done_stamp = Some(now + PROBE_RTT_DURATION);
            self.probe_rtt_round_done = false;
            self.round.next_round_delivered = tcb.delivered;
        } else if let Some(done_stamp) = self.probe_rtt_done_stamp {
            if self.round.is_round_start {
                self.probe_rtt_round_done = true;
            }
            if self.probe_rtt_round_done && now > done_stamp {
                self.rtprop_stamp = now;
                self.restore_cwnd(tcb);
                self.exit_probe_rtt(now);
            }
        }
    }

    /// Check and handle the ProbeRTT state.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.5.
    fn check_probe_rtt(&mut self, tcb: &mut ConnectionState, now: Instant) {
        if self.state != BbrStateMachine::ProbeRTT
            && self.is_rtprop_expired
            && !self.is_idle_restart
        {
            self.enter_probe_rtt();
            self.save_cwnd(tcb);
            self.probe_rtt_done_stamp = None;
        }

        if self.state == BbrStateMachine::ProbeRTT {
            self.handle_probe_rtt(tcb, now);
        }

        self.is_idle_restart = false;
    }

    /// Update the maximum size of a data aggregate scheduled and transmitted
    /// together. Without segmentation offload this is one segment.
    fn set_send_quantum(&mut self, tcb: &ConnectionState) {
        self.send_quantum = tcb.segment_size;
    }

    /// Modulate the cwnd during loss recovery.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.2.3.4.
    fn modulate_cwnd_for_recovery(&mut self, tcb: &mut ConnectionState, rs: &RateSample) {
        if rs.packet_loss > 0 {
            tcb.congestion_window = tcb
                .congestion_window
                .saturating_sub(rs.packet_loss)
                .max(tcb.segment_size);
        }

        // On the first round of recovery only grow the window by the amount
        // of data newly delivered.
        if self.packet_conservation {
            tcb.congestion_window = tcb
                .congestion_window
                .max(tcb.bytes_in_flight + tcb.last_acked_sacked_bytes);
        }
    }

    /// Cap the cwnd to BBRMinPipeCwnd while in ProbeRTT.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.2.3.5.
    fn modulate_cwnd_for_probe_rtt(&mut self, tcb: &mut ConnectionState) {
        if self.state == BbrStateMachine::ProbeRTT {
            tcb.congestion_window = tcb.congestion_window.min(self.min_pipe_cwnd);
        }
    }

    /// Update the cwnd from the network model.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.2.3.
    fn set_cwnd(&mut self, tcb: &mut ConnectionState, rs: &RateSample) {
        self.update_target_cwnd(tcb);

        if tcb.cong_state == CongestionState::Recovery {
            self.modulate_cwnd_for_recovery(tcb, rs);
        }

        if !self.packet_conservation {
            if self.full_pipe.is_filled_pipe {
                // If BBR has measured enough samples to achieve confidence
                // that it has filled the pipe, it increases its cwnd based on
                // the number of bytes delivered, but bounds it to target_cwnd.
                tcb.congestion_window = (tcb.congestion_window + tcb.last_acked_sacked_bytes)
                    .min(self.target_cwnd);
            } else if tcb.congestion_window < self.target_cwnd || tcb.delivered < tcb.initial_cwnd
            {
                tcb.congestion_window += tcb.last_acked_sacked_bytes;
            }

            tcb.congestion_window = tcb.congestion_window.max(self.min_pipe_cwnd);
        }

        self.modulate_cwnd_for_probe_rtt(tcb);

        if tcb.cong_state == CongestionState::Recovery {
            self.packet_conservation = false;
        }
    }

    /// Update the network model: BBR.BtlBw and BBR.RTprop, and the state
    /// machine they drive.
    fn update_btlbw(&mut self, tcb: &ConnectionState, rs: &RateSample) {
        if rs.delivery_rate == 0 {
            return;
        }

        self.update_round(tcb);

        // The max filter is not fed by samples taken while the flow was
        // application limited, unless they raise the estimate anyway.
        if rs.delivery_rate >= self.btlbw() || !rs.is_app_limited {
            self.btlbw_filter.update(self.round.round_count, rs.delivery_rate);
        }
    }

    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.
    fn update_model_and_state(&mut self, tcb: &mut ConnectionState, rs: &RateSample, now: Instant) {
        self.update_btlbw(tcb, rs);
        self.check_cycle_phase(tcb, rs, now);
        self.check_full_pipe(rs);
        self.check_drain(tcb, now);
        self.update_rtprop(tcb, now);
        self.check_probe_rtt(tcb, now);
    }

    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.
    fn update_control_parameters(&mut self, tcb: &mut ConnectionState, rs: &RateSample) {
        self.set_pacing_rate_with_gain(tcb, self.pacing_gain);
        self.set_send_quantum(tcb);
        self.set_cwnd(tcb, rs);
    }
}

impl CongestionController for Bbr {
    fn name(&self) -> &str {
        "bbr"
    }

    fn congestion_control(&mut self, tcb: &mut ConnectionState, rs: &RateSample, now: Instant) {
        self.update_model_and_state(tcb, rs, now);
        self.update_control_parameters(tcb, rs);
    }

    fn congestion_state_set(
        &mut self,
        tcb: &mut ConnectionState,
        state: CongestionState,
        now: Instant,
    ) {
        match state {
            CongestionState::Open => {
                if self.is_initialized {
                    return;
                }
                trace!("bbr initialized on first transition to open");

                self.rtprop = if !tcb.latest_rtt.is_zero() {
                    tcb.latest_rtt
                } else {
                    Duration::MAX
                };
                self.rtprop_stamp = now;
                self.prior_cwnd = tcb.initial_cwnd;
                self.target_cwnd = tcb.initial_cwnd;
                self.min_pipe_cwnd = self.config.min_cwnd;
                self.send_quantum = tcb.segment_size;

                let initial_rate = if self.rtprop != Duration::MAX {
                    (tcb.initial_cwnd as f64 * 8.0 / self.rtprop.as_secs_f64()) as u64
                } else {
                    0
                };
                self.btlbw_filter.reset(0, initial_rate);

                self.init_round_counting();
                self.init_full_pipe();
                self.enter_startup();
                self.init_pacing_rate(tcb);
                self.is_initialized = true;
            }
            CongestionState::Loss => {
                self.save_cwnd(tcb);
                tcb.congestion_window = tcb.segment_size;
                self.round.is_round_start = true;
            }
            CongestionState::Recovery => {
                self.save_cwnd(tcb);
                tcb.congestion_window = tcb.bytes_in_flight
                    + tcb.last_acked_sacked_bytes.max(tcb.segment_size);
                self.packet_conservation = true;
            }
        }
    }

    fn cwnd_event(&mut self, tcb: &mut ConnectionState, event: CongestionEvent, now: Instant) {
        match event {
            CongestionEvent::CompleteCwr => {
                self.packet_conservation = false;
                self.restore_cwnd(tcb);
            }
            CongestionEvent::TxStart => {
                self.handle_restart_from_idle(tcb);
            }
        }
    }

    fn on_packet_sent(
        &mut self,
        tcb: &mut ConnectionState,
        packet_number: u64,
        is_ack_only: bool,
        now: Instant,
    ) {
        tcb.high_tx_mark = tcb.high_tx_mark.max(packet_number);
    }

    fn get_ss_thresh(&mut self, tcb: &mut ConnectionState, bytes_in_flight: u64) -> u64 {
        self.save_cwnd(tcb);
        tcb.initial_ssthresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_bbr(conf: &Config) -> (Bbr, ConnectionState) {
        let bbr = Bbr::new(BbrConfig::from_config(conf));
        let tcb = ConnectionState::new(conf);
        (bbr, tcb)
    }

    fn rate_sample(delivery_rate: u64) -> RateSample {
        RateSample {
            delivery_rate,
            ..Default::default()
        }
    }

    // Advance one packet-timed round and deliver a rate sample.
    fn deliver_round(bbr: &mut Bbr, tcb: &mut ConnectionState, rate: u64, now: Instant) {
        tcb.tx_item_delivered = tcb.delivered;
        tcb.delivered += tcb.segment_size;
        bbr.congestion_control(tcb, &rate_sample(rate), now);
    }

    #[test]
    fn bbr_startup_pacing() {
        let conf = Config::default();
        let (mut bbr, mut tcb) = new_bbr(&conf);
        let now = Instant::now();

        tcb.update_rtt(Duration::from_millis(100));
        bbr.congestion_state_set(&mut tcb, CongestionState::Open, now);

        assert_eq!(bbr.state, BbrStateMachine::Startup);
        assert_eq!(bbr.pacing_gain, HIGH_GAIN);
        assert_eq!(bbr.cwnd_gain, HIGH_GAIN);
        assert_eq!(bbr.min_pipe_cwnd, 4 * tcb.segment_size);
        assert_eq!(bbr.send_quantum, tcb.segment_size);

        // Pacing starts at high_gain times the nominal bandwidth derived
        // from the initial window and the first RTT sample.
        let nominal = tcb.initial_cwnd as f64 * 8.0 / 0.1;
        assert_eq!(tcb.pacing_rate, (HIGH_GAIN * nominal) as u64);

        // Initialization runs once.
        let prior_rate = tcb.pacing_rate;
        tcb.update_rtt(Duration::from_millis(10));
        bbr.congestion_state_set(&mut tcb, CongestionState::Open, now);
        assert_eq!(tcb.pacing_rate, prior_rate);
    }

    #[test]
    fn bbr_no_rtt_sample_inflight() {
        let conf = Config::default();
        let (mut bbr, mut tcb) = new_bbr(&conf);
        bbr.congestion_state_set(&mut tcb, CongestionState::Open, Instant::now());

        assert_eq!(bbr.rtprop, Duration::MAX);
        assert_eq!(bbr.inflight(&tcb, HIGH_GAIN), tcb.initial_cwnd);
    }

    #[test]
    fn bbr_startup_to_drain_to_probe_bw() {
        let conf = Config::default();
        let (mut bbr, mut tcb) = new_bbr(&conf);
        let now = Instant::now();

        tcb.update_rtt(Duration::from_millis(50));
        bbr.congestion_state_set(&mut tcb, CongestionState::Open, now);

        // A growing bandwidth estimate keeps the flow in Startup.
        let rate = 10_000_000;
        tcb.bytes_in_flight = tcb.initial_cwnd;
        deliver_round(&mut bbr, &mut tcb, rate, now);
        assert_eq!(bbr.state, BbrStateMachine::Startup);
        assert_eq!(bbr.full_pipe.full_bw, rate);

        // Three rounds without 25% growth fill the pipe and trigger Drain.
        // Inflight stays above the estimated BDP so Drain is observable.
        tcb.bytes_in_flight = 100_000;
        for _ in 0..3 {
            deliver_round(&mut bbr, &mut tcb, rate, now);
        }
        assert!(bbr.full_pipe.is_filled_pipe);
        assert_eq!(bbr.state, BbrStateMachine::Drain);
        assert_eq!(bbr.pacing_gain, 1.0 / HIGH_GAIN);
        assert_eq!(bbr.cwnd_gain, HIGH_GAIN);

        // Once inflight has drained to the estimated BDP, ProbeBW begins
        // with a randomized gain cycle phase.
        tcb.bytes_in_flight = 0;
        deliver_round(&mut bbr, &mut tcb, rate, now);
        assert_eq!(bbr.state, BbrStateMachine::ProbeBW);
        assert_eq!(bbr.cwnd_gain, 2.0);
        assert_eq!(bbr.pacing_gain, PACING_GAIN_CYCLE[bbr.cycle_index]);
    }

    #[test]
    fn bbr_gain_cycle_advances() {
        let conf = Config::default();
        let (mut bbr, mut tcb) = new_bbr(&conf);
        let now = Instant::now();

        tcb.update_rtt(Duration::from_millis(50));
        bbr.congestion_state_set(&mut tcb, CongestionState::Open, now);
        bbr.full_pipe.is_filled_pipe = true;
        bbr.enter_probe_bw(now);

        // Walk through one full cycle. Unity-gain phases end when a whole
        // rtprop has elapsed; probing phases additionally look at inflight.
        let start_index = bbr.cycle_index;
        tcb.bytes_in_flight = tcb.initial_cwnd;
        for _ in 0..GAIN_CYCLE_LEN {
            let later = bbr.cycle_stamp + bbr.rtprop + Duration::from_millis(1);
            let rs = RateSample {
                delivery_rate: 10_000_000,
                packet_loss: tcb.segment_size,
                prior_in_flight: tcb.initial_cwnd,
                ..Default::default()
            };
            tcb.tx_item_delivered = tcb.delivered;
            tcb.delivered += tcb.segment_size;
            bbr.congestion_control(&mut tcb, &rs, later);
        }
        assert_eq!(bbr.cycle_index, start_index);

        // The cycle average pacing gain is one.
        let sum: f64 = PACING_GAIN_CYCLE.iter().sum();
        assert!((sum / GAIN_CYCLE_LEN as f64 - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn bbr_probe_rtt_round_trip() {
        let conf = Config::default();
        let (mut bbr, mut tcb) = new_bbr(&conf);
        let now = Instant::now();

        tcb.update_rtt(Duration::from_millis(50));
        bbr.congestion_state_set(&mut tcb, CongestionState::Open, now);
        bbr.full_pipe.is_filled_pipe = true;

        // An rtprop sample older than the filter window forces ProbeRTT.
        let later = now + RTPROP_FILTER_LEN + Duration::from_secs(1);
        tcb.bytes_in_flight = tcb.initial_cwnd;
        deliver_round(&mut bbr, &mut tcb, 10_000_000, later);
        assert_eq!(bbr.state, BbrStateMachine::ProbeRTT);
        assert_eq!(bbr.pacing_gain, 1.0);
        assert_eq!(bbr.cwnd_gain, 1.0);
        assert!(tcb.congestion_window <= bbr.min_pipe_cwnd);

        // Once inflight drains to the minimal window, the done timer arms.
        tcb.bytes_in_flight = bbr.min_pipe_cwnd;
        deliver_round(&mut bbr, &mut tcb, 10_000_000, later);
        assert!(bbr.probe_rtt_done_stamp.is_some());

        // A round trip plus ProbeRTTDuration later, BBR restores the cwnd
        // and returns to ProbeBW since the pipe was filled.
        let done = later + PROBE_RTT_DURATION + Duration::from_millis(1);
        deliver_round(&mut bbr, &mut tcb, 10_000_000, done);
        deliver_round(&mut bbr, &mut tcb, 10_000_000, done);
        assert_eq!(bbr.state, BbrStateMachine::ProbeBW);
    }

    #[test]
    fn bbr_recovery_modulation() {
        let conf = Config::default();
        let (mut bbr, mut tcb) = new_bbr(&conf);
        let now = Instant::now();

        tcb.update_rtt(Duration::from_millis(50));
        bbr.congestion_state_set(&mut tcb, CongestionState::Open, now);

        let cwnd_before = tcb.congestion_window;
        tcb.bytes_in_flight = 6 * tcb.segment_size;
        tcb.last_acked_sacked_bytes = tcb.segment_size;

        tcb.cong_state = CongestionState::Recovery;
        bbr.congestion_state_set(&mut tcb, CongestionState::Recovery, now);
        assert!(bbr.packet_conservation);
        assert_eq!(bbr.prior_cwnd, cwnd_before);
        assert_eq!(tcb.congestion_window, 7 * tcb.segment_size);

        // Under packet conservation the window tracks inflight plus newly
        // acked data, shrinking by the bytes reported lost.
        let rs = RateSample {
            delivery_rate: 10_000_000,
            packet_loss: 2 * tcb.segment_size,
            ..Default::default()
        };
        tcb.tx_item_delivered = tcb.delivered;
        tcb.delivered += tcb.segment_size;
        bbr.congestion_control(&mut tcb, &rs, now);
        assert!(tcb.congestion_window >= tcb.bytes_in_flight + tcb.last_acked_sacked_bytes);
        assert!(!bbr.packet_conservation);

        // Recovery completion restores the saved window.
        tcb.congestion_window = tcb.segment_size;
        tcb.cong_state = CongestionState::Open;
        bbr.cwnd_event(&mut tcb, CongestionEvent::CompleteCwr, now);
        assert_eq!(tcb.congestion_window, cwnd_before);
    }

    #[test]
    fn bbr_loss_collapses_window() {
        let conf = Config::default();
        let (mut bbr, mut tcb) = new_bbr(&conf);
        let now = Instant::now();

        bbr.congestion_state_set(&mut tcb, CongestionState::Open, now);
        let cwnd_before = tcb.congestion_window;

        tcb.cong_state = CongestionState::Loss;
        bbr.congestion_state_set(&mut tcb, CongestionState::Loss, now);
        assert_eq!(tcb.congestion_window, tcb.segment_size);
        assert!(bbr.round.is_round_start);
        assert_eq!(bbr.prior_cwnd, cwnd_before);
    }

    #[test]
    fn bbr_ss_thresh() {
        let conf = Config::default();
        let (mut bbr, mut tcb) = new_bbr(&conf);

        bbr.congestion_state_set(&mut tcb, CongestionState::Open, Instant::now());
        let bytes_in_flight = tcb.bytes_in_flight;
        assert_eq!(
            bbr.get_ss_thresh(&mut tcb, bytes_in_flight),
            tcb.initial_ssthresh
        );
        assert_eq!(bbr.prior_cwnd, tcb.congestion_window);
    }

    #[test]
    fn bbr_idle_restart() {
        let conf = Config::default();
        let (mut bbr, mut tcb) = new_bbr(&conf);
        let now = Instant::now();

        tcb.update_rtt(Duration::from_millis(50));
        bbr.congestion_state_set(&mut tcb, CongestionState::Open, now);
        bbr.full_pipe.is_filled_pipe = true;
        bbr.enter_probe_bw(now);
        bbr.btlbw_filter.reset(0, 8_000_000);

        // An app-limited flow with nothing in flight restarts at exactly
        // the estimated bottleneck bandwidth.
        tcb.bytes_in_flight = 0;
        tcb.app_limited_until = tcb.delivered + 1;
        bbr.cwnd_event(&mut tcb, CongestionEvent::TxStart, now);
        assert!(bbr.is_idle_restart);
        assert_eq!(tcb.pacing_rate, 8_000_000);
    }
}

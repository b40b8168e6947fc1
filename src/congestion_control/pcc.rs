// Copyright (c) 2024 The TQUIC Authors.
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

//! PCC: Performance-oriented Congestion Control.
//!
//! PCC selects a sending rate by running online experiments instead of
//! reacting to hardwired packet-level events. The sender holds a candidate
//! rate for one monitor interval, observes delivered and lost bytes, and
//! condenses them into a utility score. Short randomized A/B trials (a
//! "decision-making quartet" of slightly raised and lowered rates) detect
//! which direction improves utility; the rate then moves monotonically in
//! that direction until utility drops again.
//!
//! The engine only paces. It publishes a rate to the transport and takes the
//! congestion window out of the picture; segmentation, retransmission and
//! RTT estimation stay with the host.
//!
//! See <https://www.usenix.org/conference/nsdi15/technical-sessions/presentation/dong>.

use std::time::Instant;

use enumflags2::BitFlags;
use log::*;
use rand::Rng;

use super::fixedpoint::Fixedpt;
use super::monitor::Monitor;
use super::monitor::MonitorRing;
use super::monitor::NUMBER_OF_INTERVALS;
use super::CongestionController;
use super::CongestionStats;
use crate::tcp::seq_after;
use crate::tcp::AckEventFlag;
use crate::tcp::AckSample;
use crate::tcp::RateSample;
use crate::tcp::TcpState;
use crate::tcp::INFINITE_SSTHRESH;
use crate::PacingConfig;

/// Initial pacing rate in bytes per second, published before the first
/// interval produces a measurement.
pub const INITIAL_RATE: u64 = 1_000_000;

/// Lower bound for any chosen rate, in bytes per second.
pub const MINIMUM_RATE: u64 = 800_000;

/// Default clamp applied to the transport send window, in bytes.
pub const DEFAULT_SEND_WINDOW_CLAMP: u32 = 0xff_ffff;

/// Congestion window published to the transport, in segments. Large enough
/// that pacing is the only effective brake.
const LARGE_CWND: u32 = 20_000_000;

/// An interval must carry at least this many segments before its send
/// window is allowed to elapse; under-sampled experiments are worthless.
const MIN_INTERVAL_SEGMENTS: u64 = 20;

/// Step used to stretch an under-sampled interval, in microseconds.
const INTERVAL_EXTENSION_US: u64 = 50;

/// Segments that must have been sent on the connection before a utility
/// drop may end the Start or RateAdjustment run.
const STARTUP_GRACE_SEGMENTS: u64 = 3;

/// Rate-selection states.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PccState {
    /// Double the rate every interval until utility drops.
    #[default]
    Start,

    /// First quartet experiment.
    DecisionMaking1,

    /// Second quartet experiment.
    DecisionMaking2,

    /// Third quartet experiment.
    DecisionMaking3,

    /// Fourth quartet experiment.
    DecisionMaking4,

    /// Quartet fully sent; keep the base rate until its utilities are in.
    WaitForDecision,

    /// Monotone rate movement in the decided direction.
    RateAdjustment,
}

/// PCC configurable parameters.
#[derive(Debug)]
pub struct PccConfig {
    /// Pacing rate published at connection setup, in bytes per second.
    initial_rate: u64,

    /// Lower bound for any chosen rate, in bytes per second.
    min_rate: u64,

    /// Clamp written to the transport send window after each ack burst.
    /// `None` leaves the window alone.
    send_window_clamp: Option<u32>,

    /// Draw the quartet's probe directions at random instead of the fixed
    /// (+, -, +, -) pattern.
    shuffle_decision_directions: bool,
}

impl PccConfig {
    pub fn from(conf: &PacingConfig) -> Self {
        Self {
            initial_rate: conf.initial_pacing_rate.max(conf.min_pacing_rate),
            min_rate: conf.min_pacing_rate,
            send_window_clamp: conf.send_window_clamp,
            shuffle_decision_directions: conf.shuffle_decision_directions,
        }
    }
}

impl Default for PccConfig {
    fn default() -> Self {
        Self {
            initial_rate: INITIAL_RATE,
            min_rate: MINIMUM_RATE,
            send_window_clamp: Some(DEFAULT_SEND_WINDOW_CLAMP),
            shuffle_decision_directions: false,
        }
    }
}

/// Snapshot of a closed quartet interval, the fields decision making reads.
#[derive(Debug, Default, Clone, Copy)]
struct DecisionInterval {
    /// Utility of the closed interval, raw Q32.32.
    utility: i64,

    /// Rate the interval ran at, in bytes per second.
    rate: u64,
}

/// Per-connection controller body, allocated lazily on the first hook call
/// and dropped on release.
#[derive(Debug)]
struct PccData {
    /// The monitor interval ring.
    ring: MonitorRing,

    /// Snapshots of the current decision quartet, by quartet position.
    decision_intervals: [DecisionInterval; 4],

    /// Probe direction per quartet position, +1 raised or -1 dropped.
    decision_directions: [i8; 4],

    /// Current rate-selection state.
    state: PccState,

    /// Mirror of the transport's sent-segments counter.
    snd_count: u64,

    /// Cumulative ack frontier seen so far, for the byte counters.
    last_snd_una: u32,

    /// Last RTT sample, in microseconds.
    last_rtt_us: u32,

    /// Seed rate for the next interval, in bytes per second.
    next_rate: u64,

    /// Direction of rate adjustment, +1 raising or -1 lowering.
    direction: i8,

    /// Quartets finished without a consistent signal.
    decision_attempts: u64,

    /// Intervals spent in the current rate-adjustment run.
    rate_adjustment_tries: u64,

    /// Rate actually measured over the last closed interval.
    last_actual_rate: u64,
}

impl PccData {
    /// Build the controller and open the first interval at the initial
    /// rate. Doubling starts with the second interval.
    fn new(config: &PccConfig, tp: &mut TcpState, now: Instant) -> Box<Self> {
        let mut data = Box::new(PccData {
            ring: MonitorRing::new(now),
            decision_intervals: Default::default(),
            decision_directions: [1, -1, 1, -1],
            state: PccState::Start,
            snd_count: tp.data_segs_out,
            last_snd_una: tp.snd_una,
            last_rtt_us: 0,
            next_rate: config.initial_rate,
            direction: 1,
            decision_attempts: 0,
            rate_adjustment_tries: 0,
            last_actual_rate: config.initial_rate / 2,
        });

        let mon = data.ring.current_mut();
        mon.reset(now, tp.snd_nxt, tp.srtt_us, 0, PccState::Start);
        mon.rate = config.initial_rate;
        mon.valid = true;
        tp.pacing_rate = config.initial_rate;
        debug!("pcc controller initialized, pacing at {} B/s", tp.pacing_rate);

        data
    }

    /// Attribute transport send progress since the last hook call to the
    /// current interval.
    fn check_if_sent(&mut self, stats: &mut CongestionStats, tp: &TcpState) {
        if self.snd_count == tp.data_segs_out {
            return;
        }
        let delta = tp.data_segs_out.saturating_sub(self.snd_count);
        self.snd_count = tp.data_segs_out;
        self.ring.note_sent(delta, tp.snd_nxt);
        stats.bytes_sent_in_total = stats
            .bytes_sent_in_total
            .saturating_add(delta.saturating_mul(tp.advmss as u64));
    }

    /// Fold the transport's ack state into every valid interval.
    fn update_with_acks(&mut self, stats: &mut CongestionStats, tp: &TcpState) {
        if seq_after(tp.snd_una, self.last_snd_una) {
            let delta = tp.snd_una.wrapping_sub(self.last_snd_una) as u64;
            self.last_snd_una = tp.snd_una;
            stats.bytes_acked_in_total = stats.bytes_acked_in_total.saturating_add(delta);
        }

        let newly_lost =
            self.ring
                .on_ack_received(tp.snd_una, &tp.recv_sack_cache, tp.sacked_out > 0);
        stats.bytes_lost_in_total = stats.bytes_lost_in_total.saturating_add(newly_lost as u64);
    }

    /// Pick the new interval's rate from `next_rate` and the current state,
    /// and advance the state machine for interval-open transitions.
    fn on_monitor_open(&mut self, config: &PccConfig, index: usize) {
        let mut rate = self.next_rate;
        let mut update_base_rate = false;
        let mut decision_id = 0u8;

        match self.state {
            PccState::Start => {
                rate = rate.saturating_mul(2);
                update_base_rate = true;
            }
            PccState::DecisionMaking1 => {
                if config.shuffle_decision_directions {
                    self.shuffle_decision_directions();
                }
                rate = probe_rate(rate, self.decision_directions[0], self.decision_attempts);
                self.state = PccState::DecisionMaking2;
                decision_id = 1;
            }
            PccState::DecisionMaking2 => {
                rate = probe_rate(rate, self.decision_directions[1], self.decision_attempts);
                self.state = PccState::DecisionMaking3;
                decision_id = 2;
            }
            PccState::DecisionMaking3 => {
                rate = probe_rate(rate, self.decision_directions[2], self.decision_attempts);
                self.state = PccState::DecisionMaking4;
                decision_id = 3;
            }
            PccState::DecisionMaking4 => {
                rate = probe_rate(rate, self.decision_directions[3], self.decision_attempts);
                self.state = PccState::WaitForDecision;
                decision_id = 4;
            }
            PccState::RateAdjustment => {
                let base = rate as i128;
                let stepped = base
                    + (base / 100) * self.direction as i128 * self.rate_adjustment_tries as i128;
                if stepped <= 0 || stepped > u64::MAX as i128 {
                    // The step ran past the representable range, which in
                    // wrapping arithmetic moves the rate against the chosen
                    // direction. Snap back and restart the run.
                    error!(
                        "rate adjustment overflow: base {} B/s, direction {}, tries {}",
                        rate, self.direction, self.rate_adjustment_tries
                    );
                    rate = self.next_rate;
                    self.rate_adjustment_tries = 1;
                } else {
                    rate = stepped as u64;
                    self.rate_adjustment_tries += 1;
                }
                update_base_rate = true;
            }
            PccState::WaitForDecision => {}
        }

        rate = rate.max(config.min_rate);
        if update_base_rate {
            self.next_rate = rate;
        }

        let mon = self.ring.get_mut(index);
        mon.rate = rate;
        mon.decision_id = decision_id;
        trace!(
            "interval {} opened at {} B/s in {:?}",
            index,
            rate,
            mon.state
        );
    }

    /// Close an interval: compute its utility, check for the end of a
    /// Start or RateAdjustment run, and feed the decision quartet.
    fn on_monitor_end(&mut self, index: usize, advmss: u16) {
        let prev = *self.ring.prev(index);

        if self.ring.get(index).segments_sent != 0 && self.ring.get(index).snd_end_seq != 0 {
            let (utility, actual_rate) = calc_utility(self.ring.get(index), advmss);
            let mon = self.ring.get_mut(index);
            mon.utility = utility;
            mon.actual_rate = actual_rate;
            self.last_actual_rate = actual_rate;
        }
        let mon = *self.ring.get(index);

        // The very first interval has no predecessor to compare against.
        if mon.state == PccState::Start && prev.snd_end_seq == 0 {
            return;
        }

        // A utility drop while growing or adjusting ends the run: go probe,
        // starting from the last rate that was still good.
        if mon.state != PccState::WaitForDecision
            && self.snd_count > STARTUP_GRACE_SEGMENTS
            && mon.utility < prev.utility
            && matches!(self.state, PccState::Start | PccState::RateAdjustment)
        {
            self.state = PccState::DecisionMaking1;
            self.decision_attempts = 1;
            self.next_rate = if mon.state == PccState::Start {
                debug!(
                    "start state over, falling back to measured {} B/s",
                    prev.actual_rate
                );
                prev.actual_rate
            } else {
                prev.rate
            };
        }

        if mon.decision_id != 0 {
            self.decision_intervals[mon.decision_id as usize - 1] = DecisionInterval {
                utility: mon.utility,
                rate: mon.rate,
            };
        }
        if mon.decision_id == 4 {
            self.make_decision();
        }
    }

    /// Interpret a finished quartet. Each half pairs one raised-rate and
    /// one dropped-rate experiment; a decision needs both halves to agree.
    fn make_decision(&mut self) {
        let mut raised = [0usize; 2];
        let mut dropped = [0usize; 2];
        let (mut nr, mut nd) = (0, 0);
        for (i, dir) in self.decision_directions.iter().enumerate() {
            if *dir > 0 && nr < 2 {
                raised[nr] = i;
                nr += 1;
            } else if *dir < 0 && nd < 2 {
                dropped[nd] = i;
                nd += 1;
            }
        }
        if nr != 2 || nd != 2 {
            error!(
                "unbalanced decision directions {:?}",
                self.decision_directions
            );
            self.state = PccState::DecisionMaking1;
            self.decision_attempts += 1;
            return;
        }

        let q = &self.decision_intervals;
        let raised_better = q[raised[0]].utility > q[dropped[0]].utility
            && q[raised[1]].utility > q[dropped[1]].utility;
        let dropped_better = q[raised[0]].utility < q[dropped[0]].utility
            && q[raised[1]].utility < q[dropped[1]].utility;

        if raised_better || dropped_better {
            self.direction = if raised_better { 1 } else { -1 };
            self.next_rate = if raised_better {
                q[raised[0]].rate
            } else {
                q[dropped[0]].rate
            };
            self.state = PccState::RateAdjustment;
            self.rate_adjustment_tries = 1;
            self.decision_intervals = Default::default();
            self.decision_attempts = 0;
            debug!(
                "decision made: direction {}, base rate {} B/s",
                self.direction, self.next_rate
            );
        } else {
            // The halves disagree. Probe again with a wider step.
            self.state = PccState::DecisionMaking1;
            self.decision_attempts += 1;
            debug!(
                "inconsistent quartet, retrying (attempt {})",
                self.decision_attempts
            );
        }
    }

    /// Draw a fresh direction vector for the next quartet: exactly two
    /// raised and two dropped rates, in random arrangement.
    fn shuffle_decision_directions(&mut self) {
        let mut rng = rand::thread_rng();
        let mut ups = 0;
        for dir in self.decision_directions.iter_mut().take(2) {
            *dir = if rng.gen::<bool>() {
                ups += 1;
                1
            } else {
                -1
            };
        }
        match ups {
            2 => {
                self.decision_directions[2] = -1;
                self.decision_directions[3] = -1;
            }
            0 => {
                self.decision_directions[2] = 1;
                self.decision_directions[3] = 1;
            }
            _ => {
                self.decision_directions[2] = if rng.gen::<bool>() {
                    ups += 1;
                    1
                } else {
                    -1
                };
                self.decision_directions[3] = if ups == 2 { -1 } else { 1 };
            }
        }
    }

    /// Stretch or graduate the current interval, close every interval whose
    /// send window elapsed and whose ack frontier caught up, and reopen the
    /// current slot if it was freed.
    fn check_monitor_deadlines(&mut self, config: &PccConfig, tp: &mut TcpState, now: Instant) {
        let index = self.ring.current_index();
        let mon = self.ring.current_mut();
        let elapsed_us = mon.elapsed_us(now);
        if mon.segments_sent < MIN_INTERVAL_SEGMENTS {
            // Too few samples to be a meaningful experiment yet.
            while elapsed_us > mon.end_time_us {
                mon.end_time_us += INTERVAL_EXTENSION_US;
            }
        } else if mon.has_sent() && elapsed_us > mon.end_time_us {
            trace!(
                "interval {} finished sending after {} us (window was {} us)",
                index,
                elapsed_us,
                mon.end_time_us
            );
            mon.end_time_us = elapsed_us;
            self.ring.advance();
        }

        for index in 0..NUMBER_OF_INTERVALS {
            let mon = self.ring.get(index);
            if !mon.valid {
                continue;
            }
            if mon.has_sent()
                && mon.elapsed_us(now) > mon.end_time_us
                && !seq_after(mon.snd_end_seq, mon.last_acked_seq)
            {
                debug!(
                    "graceful end for interval {}: seqs {}-{}, {} segments, {} bytes lost, rtt {} us",
                    index,
                    mon.snd_start_seq,
                    mon.snd_end_seq,
                    mon.segments_sent,
                    mon.bytes_lost,
                    mon.rtt_us
                );
                self.on_monitor_end(index, tp.advmss);
                self.ring.get_mut(index).valid = false;
            }
        }

        if !self.ring.current().valid {
            let index = self.ring.current_index();
            let state = self.state;
            let last_rtt = self.last_rtt_us;
            self.ring
                .current_mut()
                .reset(now, tp.snd_nxt, tp.srtt_us, last_rtt, state);
            self.on_monitor_open(config, index);
            self.ring.current_mut().valid = true;
            tp.pacing_rate = self.ring.current().rate;
            trace!(
                "pacing rate set to {} B/s ({} kbit/s), {} intervals in flight",
                tp.pacing_rate,
                tp.pacing_rate * 8 / 1000,
                self.ring.valid_count()
            );
        }
    }

    /// One hook pass: account send progress, then interval deadlines.
    fn do_checks(
        &mut self,
        config: &PccConfig,
        stats: &mut CongestionStats,
        tp: &mut TcpState,
        now: Instant,
    ) {
        self.check_if_sent(stats, tp);
        self.check_monitor_deadlines(config, tp, now);
    }
}

/// Apply a probe of `attempts` percent to `rate`, raised or dropped
/// according to `direction`.
fn probe_rate(rate: u64, direction: i8, attempts: u64) -> u64 {
    let delta = (rate / 100).saturating_mul(attempts);
    if direction >= 0 {
        rate.saturating_add(delta)
    } else {
        rate.saturating_sub(delta)
    }
}

/// Compute the utility of a closed interval and the rate it actually
/// achieved.
///
/// utility = goodput/time * gate(p) - lost/time, with
/// gate(p) = 1 - 1 / (1 + exp(-100 * (p - 0.05))),
///
/// a sigmoid that barely taxes throughput below 5% loss and wipes it out
/// above. All arithmetic is Q32.32; the returned utility is the raw value.
fn calc_utility(mon: &Monitor, advmss: u16) -> (i64, u64) {
    let sent = mon.segments_sent.saturating_mul(advmss as u64);
    let lost = mon.bytes_lost as u64;
    let length_us = mon.end_time_us + 1;

    let rate = Fixedpt::from_int(sent as i64)
        .div(Fixedpt::from_int(length_us as i64))
        .mul(Fixedpt::from_int(1_000_000));
    let actual_rate = rate.to_int() as u64;

    if mon.end_time_us == 0 {
        error!("monitor closed with a zero-length send window");
    }
    if sent < lost {
        error!("monitor lost more bytes ({}) than it sent ({})", lost, sent);
    }
    if actual_rate > mon.rate {
        error!(
            "measured rate {} B/s overshoots the pacing limit {} B/s",
            actual_rate, mon.rate
        );
    }

    let time = Fixedpt::from_int(length_us as i64).div(Fixedpt::from_int(1_000_000));
    let loss_ratio = Fixedpt::from_int(lost as i64).div(Fixedpt::from_int(sent as i64));
    let goodput = Fixedpt::from_int(sent.saturating_sub(lost) as i64);

    let gate_arg = Fixedpt::from_int(-100).mul(loss_ratio - Fixedpt::from_ratio(5, 100));
    let gate = Fixedpt::ONE - Fixedpt::ONE.div(Fixedpt::ONE + gate_arg.exp());
    let utility = goodput.div(time).mul(gate) - Fixedpt::from_int(lost as i64).div(time);

    trace!(
        "utility: limit {} B/s, actual {} B/s, sent {} B, lost {} B, window {} us, utility {}",
        mon.rate,
        actual_rate,
        sent,
        lost,
        length_us,
        utility.to_int()
    );

    (utility.raw(), actual_rate)
}

/// PCC pacing engine for one connection.
#[derive(Debug)]
pub struct Pcc {
    /// Config.
    config: PccConfig,

    /// Statistics.
    stats: CongestionStats,

    /// Controller body, allocated on the first hook call that needs it.
    pcc: Option<Box<PccData>>,
}

impl Pcc {
    pub fn new(config: PccConfig) -> Self {
        Self {
            config,
            stats: Default::default(),
            pcc: None,
        }
    }

    fn ensure_controller(&mut self, tp: &mut TcpState, now: Instant) {
        if self.pcc.is_none() {
            self.pcc = Some(PccData::new(&self.config, tp, now));
        }
    }
}

impl CongestionController for Pcc {
    fn name(&self) -> &str {
        "pcc"
    }

    fn init(&mut self, tp: &mut TcpState) {
        tp.pacing_rate = self.config.initial_rate;
    }

    fn ssthresh(&mut self, tp: &mut TcpState, now: Instant) -> u32 {
        self.ensure_controller(tp, now);
        if let Some(pcc) = self.pcc.as_deref_mut() {
            pcc.do_checks(&self.config, &mut self.stats, tp, now);
        }
        INFINITE_SSTHRESH
    }

    fn pkts_acked(&mut self, tp: &mut TcpState, sample: &AckSample, now: Instant) {
        self.ensure_controller(tp, now);
        if let Some(pcc) = self.pcc.as_deref_mut() {
            if sample.rtt_us > 0 {
                pcc.last_rtt_us = sample.rtt_us.min(u32::MAX as i64) as u32;
            }
            pcc.update_with_acks(&mut self.stats, tp);
            pcc.do_checks(&self.config, &mut self.stats, tp, now);
        }

        // Window limits must not interfere; pacing is the only brake.
        tp.snd_cwnd = LARGE_CWND;
        if let Some(clamp) = self.config.send_window_clamp {
            tp.snd_wnd = clamp;
        }
    }

    fn in_ack_event(&mut self, tp: &mut TcpState, _flags: BitFlags<AckEventFlag>, now: Instant) {
        self.ensure_controller(tp, now);
        if let Some(pcc) = self.pcc.as_deref_mut() {
            pcc.update_with_acks(&mut self.stats, tp);
        }
    }

    fn cong_control(&mut self, _tp: &mut TcpState, _sample: &RateSample, _now: Instant) {
        // Rate selection happens at interval boundaries, not per rate
        // sample.
    }

    fn release(&mut self, _tp: &mut TcpState) {
        if let Some(pcc) = self.pcc.as_deref() {
            debug!(
                "pcc controller released, last measured rate {} B/s",
                pcc.last_actual_rate
            );
        }
        self.pcc = None;
    }

    fn stats(&self) -> &CongestionStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MSS: u16 = 1000;
    const SRTT_US: u32 = 30_000;

    fn new_tp() -> TcpState {
        TcpState {
            advmss: MSS,
            srtt_us: SRTT_US,
            ..TcpState::default()
        }
    }

    /// A connection with the controller already built.
    fn new_pcc(now: Instant) -> (Pcc, TcpState) {
        let mut pcc = Pcc::new(PccConfig::default());
        let mut tp = new_tp();
        pcc.init(&mut tp);
        pcc.ensure_controller(&mut tp, now);
        (pcc, tp)
    }

    fn send_segments(tp: &mut TcpState, segments: u64) {
        tp.data_segs_out += segments;
        tp.snd_nxt = tp.snd_nxt.wrapping_add(segments as u32 * MSS as u32);
    }

    fn ack_sample() -> AckSample {
        AckSample {
            pkts_acked: 25,
            rtt_us: SRTT_US as i64,
            in_flight: 0,
        }
    }

    /// Send `segments`, ack everything, and run a hook pass after the
    /// interval's send window has elapsed.
    fn run_clean_round(pcc: &mut Pcc, tp: &mut TcpState, now: &mut Instant) {
        send_segments(tp, 25);
        tp.snd_una = tp.snd_nxt;
        *now += Duration::from_millis(50);
        pcc.pkts_acked(tp, &ack_sample(), *now);
    }

    #[test]
    fn pcc_cold_start_doubles_rate() {
        let mut now = Instant::now();
        let mut pcc = Pcc::new(PccConfig::default());
        let mut tp = new_tp();

        pcc.init(&mut tp);
        assert_eq!(tp.pacing_rate, INITIAL_RATE);

        // The first hook call builds the controller and opens the first
        // interval at the initial rate itself.
        assert_eq!(pcc.ssthresh(&mut tp, now), INFINITE_SSTHRESH);
        assert_eq!(tp.pacing_rate, INITIAL_RATE);
        {
            let data = pcc.pcc.as_deref().unwrap();
            assert_eq!(data.ring.current().rate, INITIAL_RATE);
            assert_eq!(data.ring.valid_count(), 1);
            assert_eq!(data.state, PccState::Start);
        }

        // Five loss-free rounds double the published rate every time:
        // 2M, 4M, 8M, 16M, 32M.
        for round in 0..5u32 {
            run_clean_round(&mut pcc, &mut tp, &mut now);
            assert_eq!(tp.pacing_rate, INITIAL_RATE << (round + 1));
            assert_eq!(pcc.pcc.as_deref().unwrap().state, PccState::Start);
        }

        assert_eq!(tp.snd_cwnd, LARGE_CWND);
        assert_eq!(tp.snd_wnd, DEFAULT_SEND_WINDOW_CLAMP);
        assert_eq!(pcc.stats().bytes_sent_in_total, 5 * 25 * MSS as u64);
        assert_eq!(pcc.stats().bytes_acked_in_total, 5 * 25 * MSS as u64);
        assert_eq!(pcc.stats().bytes_lost_in_total, 0);
    }

    #[test]
    fn pcc_published_rate_never_below_minimum() {
        let mut now = Instant::now();
        let (mut pcc, mut tp) = new_pcc(now);

        // Force a probing state with a base rate at the floor; the dropped
        // probe would go below it.
        {
            let data = pcc.pcc.as_deref_mut().unwrap();
            data.state = PccState::DecisionMaking2;
            data.next_rate = MINIMUM_RATE;
            data.decision_attempts = 50;
            data.ring.current_mut().valid = false;
        }
        now += Duration::from_millis(1);
        pcc.ssthresh(&mut tp, now);
        assert_eq!(tp.pacing_rate, MINIMUM_RATE);
    }

    #[test]
    fn pcc_start_exit_on_utility_drop() {
        let now = Instant::now();
        let (mut pcc, _tp) = new_pcc(now);
        let data = pcc.pcc.as_deref_mut().unwrap();
        data.snd_count = 100;

        // Previous interval: clean, measured close to 8M B/s.
        {
            let mon = data.ring.get_mut(0);
            mon.reset(now, 0, SRTT_US, SRTT_US, PccState::Start);
            mon.segments_sent = 100;
            mon.snd_end_seq = 100_000;
            mon.rate = 16_000_000;
            mon.actual_rate = 8_000_000;
            mon.utility = Fixedpt::from_int(500_000).raw();
        }
        // Closing interval: 10% loss at twice the rate.
        {
            let mon = data.ring.get_mut(1);
            mon.reset(now, 100_000, SRTT_US, SRTT_US, PccState::Start);
            mon.segments_sent = 100;
            mon.snd_end_seq = 200_000;
            mon.rate = 32_000_000;
            mon.bytes_lost = 10_000;
        }
        data.state = PccState::Start;
        data.on_monitor_end(1, MSS);

        assert_eq!(data.state, PccState::DecisionMaking1);
        assert_eq!(data.decision_attempts, 1);
        // Leaving Start falls back to the previous interval's measured
        // rate, not its target.
        assert_eq!(data.next_rate, 8_000_000);
        assert!(data.ring.get(1).utility < data.ring.get(0).utility);
    }

    #[test]
    fn pcc_rate_adjustment_exit_restores_previous_target() {
        let now = Instant::now();
        let (mut pcc, _tp) = new_pcc(now);
        let data = pcc.pcc.as_deref_mut().unwrap();
        data.snd_count = 100;

        {
            let mon = data.ring.get_mut(0);
            mon.reset(now, 0, SRTT_US, SRTT_US, PccState::RateAdjustment);
            mon.segments_sent = 100;
            mon.snd_end_seq = 100_000;
            mon.rate = 10_000_000;
            mon.actual_rate = 9_000_000;
            mon.utility = Fixedpt::from_int(500_000).raw();
        }
        {
            let mon = data.ring.get_mut(1);
            mon.reset(now, 100_000, SRTT_US, SRTT_US, PccState::RateAdjustment);
            mon.segments_sent = 100;
            mon.snd_end_seq = 200_000;
            mon.rate = 11_000_000;
            mon.bytes_lost = 20_000;
        }
        data.state = PccState::RateAdjustment;
        data.on_monitor_end(1, MSS);

        assert_eq!(data.state, PccState::DecisionMaking1);
        // Leaving RateAdjustment restores the previous target rate.
        assert_eq!(data.next_rate, 10_000_000);
    }

    #[test]
    fn pcc_quartet_probe_sequence() {
        let now = Instant::now();
        let (mut pcc, _tp) = new_pcc(now);
        let config = PccConfig::default();
        let data = pcc.pcc.as_deref_mut().unwrap();

        data.state = PccState::DecisionMaking1;
        data.decision_attempts = 2;
        data.next_rate = 10_000_000;

        let mut rates = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let index = data.ring.current_index();
            let state = data.state;
            data.ring.current_mut().reset(now, 0, SRTT_US, 0, state);
            data.on_monitor_open(&config, index);
            rates.push(data.ring.get(index).rate);
            ids.push(data.ring.get(index).decision_id);
            data.ring.advance();
        }

        // +2%, -2%, +2%, -2% around the untouched base rate.
        assert_eq!(rates, vec![10_200_000, 9_800_000, 10_200_000, 9_800_000]);
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(data.state, PccState::WaitForDecision);
        assert_eq!(data.next_rate, 10_000_000);

        // Further opens keep the base rate while waiting.
        let index = data.ring.current_index();
        data.ring
            .current_mut()
            .reset(now, 0, SRTT_US, 0, PccState::WaitForDecision);
        data.on_monitor_open(&config, index);
        assert_eq!(data.ring.get(index).rate, 10_000_000);
        assert_eq!(data.ring.get(index).decision_id, 0);
        assert_eq!(data.state, PccState::WaitForDecision);
    }

    #[test]
    fn pcc_make_decision_raise() {
        let now = Instant::now();
        let (mut pcc, _tp) = new_pcc(now);
        let data = pcc.pcc.as_deref_mut().unwrap();

        data.state = PccState::WaitForDecision;
        data.decision_attempts = 1;
        data.decision_intervals = [
            DecisionInterval {
                utility: 100,
                rate: 10_100_000,
            },
            DecisionInterval {
                utility: 90,
                rate: 9_900_000,
            },
            DecisionInterval {
                utility: 100,
                rate: 10_100_000,
            },
            DecisionInterval {
                utility: 90,
                rate: 9_900_000,
            },
        ];
        data.make_decision();

        assert_eq!(data.state, PccState::RateAdjustment);
        assert_eq!(data.direction, 1);
        assert_eq!(data.next_rate, 10_100_000);
        assert_eq!(data.rate_adjustment_tries, 1);
        assert_eq!(data.decision_attempts, 0);
        // A consistent quartet clears the snapshot buffer.
        for q in data.decision_intervals.iter() {
            assert_eq!(q.utility, 0);
            assert_eq!(q.rate, 0);
        }
    }

    #[test]
    fn pcc_make_decision_drop() {
        let now = Instant::now();
        let (mut pcc, _tp) = new_pcc(now);
        let data = pcc.pcc.as_deref_mut().unwrap();

        data.state = PccState::WaitForDecision;
        data.decision_intervals = [
            DecisionInterval {
                utility: 90,
                rate: 10_100_000,
            },
            DecisionInterval {
                utility: 100,
                rate: 9_900_000,
            },
            DecisionInterval {
                utility: 90,
                rate: 10_100_000,
            },
            DecisionInterval {
                utility: 100,
                rate: 9_900_000,
            },
        ];
        data.make_decision();

        assert_eq!(data.state, PccState::RateAdjustment);
        assert_eq!(data.direction, -1);
        assert_eq!(data.next_rate, 9_900_000);
        assert_eq!(data.rate_adjustment_tries, 1);
    }

    #[test]
    fn pcc_make_decision_inconsistent() {
        let now = Instant::now();
        let (mut pcc, _tp) = new_pcc(now);
        let data = pcc.pcc.as_deref_mut().unwrap();

        data.state = PccState::WaitForDecision;
        data.decision_attempts = 1;
        data.decision_intervals = [
            DecisionInterval {
                utility: 100,
                rate: 10_100_000,
            },
            DecisionInterval {
                utility: 90,
                rate: 9_900_000,
            },
            DecisionInterval {
                utility: 90,
                rate: 10_100_000,
            },
            DecisionInterval {
                utility: 100,
                rate: 9_900_000,
            },
        ];
        data.make_decision();

        assert_eq!(data.state, PccState::DecisionMaking1);
        assert_eq!(data.decision_attempts, 2);
        // The snapshot buffer is left alone; the next quartet overwrites it.
        assert_eq!(data.decision_intervals[0].utility, 100);
        assert_eq!(data.decision_intervals[0].rate, 10_100_000);
    }

    #[test]
    fn pcc_quartet_snapshot_feeds_decision() {
        let now = Instant::now();
        let (mut pcc, _tp) = new_pcc(now);
        let data = pcc.pcc.as_deref_mut().unwrap();
        data.snd_count = 100;
        data.state = PccState::WaitForDecision;

        // Three quartet slots already closed.
        data.decision_intervals[0] = DecisionInterval {
            utility: 100,
            rate: 10_100_000,
        };
        data.decision_intervals[1] = DecisionInterval {
            utility: 90,
            rate: 9_900_000,
        };
        data.decision_intervals[2] = DecisionInterval {
            utility: 100,
            rate: 10_100_000,
        };

        // The fourth closes now: its snapshot lands in slot 3, and the
        // decision fires off the quartet.
        {
            let mon = data.ring.get_mut(1);
            mon.reset(now, 0, SRTT_US, SRTT_US, PccState::WaitForDecision);
            mon.decision_id = 4;
            mon.rate = 9_900_000;
            mon.utility = 90;
        }
        data.on_monitor_end(1, MSS);

        assert_eq!(data.state, PccState::RateAdjustment);
        assert_eq!(data.direction, 1);
        assert_eq!(data.next_rate, 10_100_000);
    }

    #[test]
    fn pcc_rate_adjustment_steps() {
        let now = Instant::now();
        let (mut pcc, _tp) = new_pcc(now);
        let config = PccConfig::default();
        let data = pcc.pcc.as_deref_mut().unwrap();

        data.state = PccState::RateAdjustment;
        data.direction = 1;
        data.next_rate = 10_000_000;
        data.rate_adjustment_tries = 3;

        let index = data.ring.current_index();
        data.ring
            .current_mut()
            .reset(now, 0, SRTT_US, 0, PccState::RateAdjustment);
        data.on_monitor_open(&config, index);

        assert_eq!(data.ring.get(index).rate, 10_300_000);
        assert_eq!(data.next_rate, 10_300_000);
        assert_eq!(data.rate_adjustment_tries, 4);
        assert_eq!(data.state, PccState::RateAdjustment);
    }

    #[test]
    fn pcc_rate_adjustment_overflow_snaps_back() {
        let now = Instant::now();
        let (mut pcc, _tp) = new_pcc(now);
        let config = PccConfig::default();
        let data = pcc.pcc.as_deref_mut().unwrap();

        // A dropped step big enough to run the rate negative.
        data.state = PccState::RateAdjustment;
        data.direction = -1;
        data.next_rate = 2_000_000;
        data.rate_adjustment_tries = 300;

        let index = data.ring.current_index();
        data.ring
            .current_mut()
            .reset(now, 0, SRTT_US, 0, PccState::RateAdjustment);
        data.on_monitor_open(&config, index);

        assert_eq!(data.ring.get(index).rate, 2_000_000);
        assert_eq!(data.next_rate, 2_000_000);
        assert_eq!(data.rate_adjustment_tries, 1);
        assert_eq!(data.state, PccState::RateAdjustment);
    }

    #[test]
    fn pcc_under_sampled_interval_extends() {
        let mut now = Instant::now();
        let (mut pcc, mut tp) = new_pcc(now);

        // Only 5 segments; the send window elapses but the interval must
        // stretch instead of graduating.
        send_segments(&mut tp, 5);
        now += Duration::from_millis(100);
        pcc.ssthresh(&mut tp, now);

        let data = pcc.pcc.as_deref().unwrap();
        assert_eq!(data.ring.current_index(), 0);
        assert!(data.ring.current().valid);
        assert!(data.ring.current().end_time_us >= 100_000);
        assert_eq!(tp.pacing_rate, INITIAL_RATE);
    }

    #[test]
    fn pcc_interval_closes_only_after_acks_catch_up() {
        let mut now = Instant::now();
        let (mut pcc, mut tp) = new_pcc(now);

        // Send a full interval without acking it.
        send_segments(&mut tp, 25);
        now += Duration::from_millis(50);
        pcc.ssthresh(&mut tp, now);

        // The sender moved on, but the unacked interval stays valid.
        {
            let data = pcc.pcc.as_deref().unwrap();
            assert_eq!(data.ring.current_index(), 1);
            assert!(data.ring.get(0).valid);
            assert_eq!(data.ring.get(0).utility, 0);
        }

        // Acks catch up; the next pass closes it and computes utility.
        tp.snd_una = tp.snd_nxt;
        now += Duration::from_millis(50);
        pcc.pkts_acked(&mut tp, &ack_sample(), now);
        {
            let data = pcc.pcc.as_deref().unwrap();
            assert!(!data.ring.get(0).valid);
            assert!(data.ring.get(0).utility > 0);
            assert!(data.ring.get(0).actual_rate > 0);
        }
    }

    #[test]
    fn pcc_start_exit_full_loop() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut now = Instant::now();
        let (mut pcc, mut tp) = new_pcc(now);

        // Two clean rounds leave the controller in Start.
        for _ in 0..2 {
            run_clean_round(&mut pcc, &mut tp, &mut now);
        }
        assert_eq!(pcc.pcc.as_deref().unwrap().state, PccState::Start);

        // Next round: a SACK hole marks 2000 of 25000 bytes lost (8%).
        let base = tp.snd_nxt;
        send_segments(&mut tp, 25);
        now += Duration::from_millis(10);
        pcc.ssthresh(&mut tp, now);

        tp.snd_una = base.wrapping_add(10_000);
        tp.sacked_out = 13;
        tp.recv_sack_cache[0] = crate::tcp::SackBlock {
            start_seq: base.wrapping_add(12_000),
            end_seq: tp.snd_nxt,
        };
        now += Duration::from_millis(45);
        pcc.pkts_acked(&mut tp, &ack_sample(), now);

        // The lossy interval graduates above; one more pass closes it and
        // ends the Start run.
        tp.snd_una = tp.snd_nxt;
        tp.sacked_out = 0;
        tp.recv_sack_cache[0] = Default::default();
        now += Duration::from_millis(10);
        pcc.ssthresh(&mut tp, now);

        let data = pcc.pcc.as_deref().unwrap();
        assert_eq!(data.state, PccState::DecisionMaking1);
        assert_eq!(data.decision_attempts, 1);
        // The fallback is the previous interval's measured rate, well
        // below the doubled target.
        assert!(data.next_rate < INITIAL_RATE);
        assert!(pcc.stats().bytes_lost_in_total >= 2000);
    }

    #[test]
    fn pcc_zero_segment_interval_keeps_zero_utility() {
        let now = Instant::now();
        let (mut pcc, _tp) = new_pcc(now);
        let data = pcc.pcc.as_deref_mut().unwrap();
        data.snd_count = 100;

        {
            let mon = data.ring.get_mut(3);
            mon.reset(now, 0, SRTT_US, 0, PccState::WaitForDecision);
        }
        data.on_monitor_end(3, MSS);
        assert_eq!(data.ring.get(3).utility, 0);
        assert_eq!(data.ring.get(3).actual_rate, 0);
    }

    #[test]
    fn pcc_calc_utility_loss_free() {
        let now = Instant::now();
        let mut mon = Monitor {
            valid: true,
            decision_id: 0,
            state: PccState::Start,
            start_time: now,
            end_time_us: 10_000,
            snd_start_seq: 0,
            snd_end_seq: 50_000,
            last_acked_seq: 50_000,
            segments_sent: 50,
            bytes_lost: 0,
            rate: 6_000_000,
            utility: 0,
            rtt_us: SRTT_US,
            actual_rate: 0,
        };

        let (utility, actual_rate) = calc_utility(&mon, MSS);
        // 50000 bytes over 10001 us is a bit under 5 MB/s.
        assert_eq!(actual_rate, 4_999_500);
        // Nearly the whole goodput survives the gate at zero loss.
        let utility = Fixedpt::from_raw(utility).to_int();
        assert!(utility > 4_900_000 && utility < 5_000_000, "{}", utility);

        // The same interval with 10% loss lands deep underwater.
        mon.bytes_lost = 5_000;
        let (lossy_utility, _) = calc_utility(&mon, MSS);
        let lossy_utility = Fixedpt::from_raw(lossy_utility).to_int();
        assert!(lossy_utility < 0, "{}", lossy_utility);
        assert!(
            lossy_utility > -600_000 && lossy_utility < -400_000,
            "{}",
            lossy_utility
        );
    }

    #[test]
    fn pcc_release_and_lazy_rebuild() {
        let mut now = Instant::now();
        let (mut pcc, mut tp) = new_pcc(now);
        assert!(pcc.pcc.is_some());

        pcc.release(&mut tp);
        assert!(pcc.pcc.is_none());

        // Any hook lazily rebuilds the controller.
        now += Duration::from_millis(1);
        pcc.in_ack_event(&mut tp, BitFlags::empty(), now);
        assert!(pcc.pcc.is_some());
        assert_eq!(tp.pacing_rate, INITIAL_RATE);
    }

    #[test]
    fn pcc_negative_rtt_sample_ignored() {
        let mut now = Instant::now();
        let (mut pcc, mut tp) = new_pcc(now);

        now += Duration::from_millis(1);
        pcc.pkts_acked(
            &mut tp,
            &AckSample {
                pkts_acked: 1,
                rtt_us: -1,
                in_flight: 0,
            },
            now,
        );
        assert_eq!(pcc.pcc.as_deref().unwrap().last_rtt_us, 0);

        now += Duration::from_millis(1);
        pcc.pkts_acked(
            &mut tp,
            &AckSample {
                pkts_acked: 1,
                rtt_us: 25_000,
                in_flight: 0,
            },
            now,
        );
        assert_eq!(pcc.pcc.as_deref().unwrap().last_rtt_us, 25_000);
    }

    #[test]
    fn pcc_send_window_clamp_configurable() {
        let mut now = Instant::now();
        let (mut pcc, mut tp) = new_pcc(now);
        now += Duration::from_millis(1);
        pcc.pkts_acked(&mut tp, &ack_sample(), now);
        assert_eq!(tp.snd_wnd, DEFAULT_SEND_WINDOW_CLAMP);

        // With the clamp disabled the window is left alone.
        let conf = PacingConfig {
            send_window_clamp: None,
            ..PacingConfig::default()
        };
        let mut pcc = Pcc::new(PccConfig::from(&conf));
        let mut tp = new_tp();
        tp.snd_wnd = 123;
        pcc.pkts_acked(&mut tp, &ack_sample(), now);
        assert_eq!(tp.snd_wnd, 123);
        assert_eq!(tp.snd_cwnd, LARGE_CWND);
    }

    #[test]
    fn pcc_shuffled_directions_stay_balanced() {
        let now = Instant::now();
        let (mut pcc, _tp) = new_pcc(now);
        let data = pcc.pcc.as_deref_mut().unwrap();

        for _ in 0..64 {
            data.shuffle_decision_directions();
            let ups = data
                .decision_directions
                .iter()
                .filter(|d| **d == 1)
                .count();
            let downs = data
                .decision_directions
                .iter()
                .filter(|d| **d == -1)
                .count();
            assert_eq!(ups, 2);
            assert_eq!(downs, 2);
        }
    }

    #[test]
    fn pcc_make_decision_with_shuffled_directions() {
        let now = Instant::now();
        let (mut pcc, _tp) = new_pcc(now);
        let data = pcc.pcc.as_deref_mut().unwrap();

        // Directions (-, +, +, -): the raised slots are 1 and 2, and both
        // beat their dropped partners (0 and 3), so the rate goes up from
        // the first raised slot's rate.
        data.state = PccState::WaitForDecision;
        data.decision_directions = [-1, 1, 1, -1];
        data.decision_intervals = [
            DecisionInterval {
                utility: 90,
                rate: 9_900_000,
            },
            DecisionInterval {
                utility: 100,
                rate: 10_100_000,
            },
            DecisionInterval {
                utility: 100,
                rate: 10_100_000,
            },
            DecisionInterval {
                utility: 90,
                rate: 9_900_000,
            },
        ];
        data.make_decision();

        assert_eq!(data.state, PccState::RateAdjustment);
        assert_eq!(data.direction, 1);
        assert_eq!(data.next_rate, 10_100_000);
    }
}

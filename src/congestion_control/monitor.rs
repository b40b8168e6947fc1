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

//! Monitor intervals and the per-connection interval ring.
//!
//! A monitor interval is one experimental slot: the sender holds a chosen
//! pacing rate for roughly 4/3 of an RTT and records what happened (bytes
//! sent, bytes lost, elapsed time). Exactly one interval is the current
//! sender at any time; closed-but-unacked intervals stay valid in the ring
//! until their acknowledgement frontier catches up with the last byte they
//! sent.

use std::time::Instant;

use log::*;

use super::pcc::PccState;
use crate::tcp::seq_after;
use crate::tcp::seq_before;
use crate::tcp::SackBlock;
use crate::tcp::MAX_SACK_BLOCKS;

/// Number of slots in the interval ring. An interval only occupies its slot
/// while acknowledgements for it are still outstanding, so the ring needs to
/// cover a few RTTs worth of intervals at most.
pub(crate) const NUMBER_OF_INTERVALS: usize = 30;

/// One monitor interval.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Monitor {
    /// Whether the slot is in use (still sending or awaiting acks).
    pub valid: bool,

    /// Position in the decision-making quartet, 1..=4. Zero means the
    /// interval is not part of a quartet.
    pub decision_id: u8,

    /// Controller state at the moment the interval opened.
    pub state: PccState,

    /// Timestamp of the start of the interval.
    pub start_time: Instant,

    /// Length of the send window, in microseconds from `start_time`.
    pub end_time_us: u64,

    /// First sequence number to be sent in the interval.
    pub snd_start_seq: u32,

    /// Highest sequence number sent while the interval was current. Zero
    /// until something is sent.
    pub snd_end_seq: u32,

    /// Highest sequence whose fate is known, from cumulative acks or SACK
    /// upper bounds. May run past `snd_end_seq`.
    pub last_acked_seq: u32,

    /// Data segments attributed to the interval.
    pub segments_sent: u64,

    /// Gap bytes inferred from SACK holes.
    pub bytes_lost: u32,

    /// Pacing rate the interval was opened with, in bytes per second.
    pub rate: u64,

    /// Utility computed when the interval closed, as a raw Q32.32 value.
    pub utility: i64,

    /// Last RTT sample at open time, in microseconds.
    pub rtt_us: u32,

    /// Measured sending rate, computed when the interval closed.
    pub actual_rate: u64,
}

impl Monitor {
    fn new(now: Instant) -> Self {
        Self {
            valid: false,
            decision_id: 0,
            state: PccState::default(),
            start_time: now,
            end_time_us: 0,
            snd_start_seq: 0,
            snd_end_seq: 0,
            last_acked_seq: 0,
            segments_sent: 0,
            bytes_lost: 0,
            rate: 0,
            utility: 0,
            rtt_us: 0,
            actual_rate: 0,
        }
    }

    /// Re-initialize the slot for a fresh interval and mark it inactive.
    /// The caller opens it by assigning a rate and setting `valid`.
    pub fn reset(&mut self, now: Instant, snd_nxt: u32, srtt_us: u32, rtt_us: u32, state: PccState) {
        self.valid = false;
        self.decision_id = 0;
        self.state = state;
        self.start_time = now;
        self.end_time_us = srtt_us as u64 * 4 / 3;
        self.snd_start_seq = snd_nxt;
        self.snd_end_seq = 0;
        self.last_acked_seq = snd_nxt;
        self.segments_sent = 0;
        self.bytes_lost = 0;
        self.rate = 0;
        self.utility = 0;
        self.rtt_us = rtt_us;
        self.actual_rate = 0;
    }

    /// Microseconds elapsed since the interval opened.
    pub fn elapsed_us(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.start_time).as_micros() as u64
    }

    /// Whether the interval sent anything while it was current.
    pub fn has_sent(&self) -> bool {
        self.snd_start_seq != self.snd_end_seq
    }
}

/// Fixed-capacity ring of monitor intervals. `current` indexes the one
/// interval that is the sender.
#[derive(Debug)]
pub(crate) struct MonitorRing {
    slots: [Monitor; NUMBER_OF_INTERVALS],
    current: usize,
}

impl MonitorRing {
    pub fn new(now: Instant) -> Self {
        Self {
            slots: [Monitor::new(now); NUMBER_OF_INTERVALS],
            current: 0,
        }
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> &Monitor {
        &self.slots[self.current]
    }

    pub fn current_mut(&mut self) -> &mut Monitor {
        &mut self.slots[self.current]
    }

    pub fn get(&self, index: usize) -> &Monitor {
        &self.slots[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Monitor {
        &mut self.slots[index]
    }

    /// Index of the interval preceding `index` in ring order.
    pub fn prev_index(index: usize) -> usize {
        if index > 0 {
            index - 1
        } else {
            NUMBER_OF_INTERVALS - 1
        }
    }

    /// The interval preceding `index` in ring order.
    pub fn prev(&self, index: usize) -> &Monitor {
        &self.slots[Self::prev_index(index)]
    }

    /// Move `current` to the next slot. The target slot is expected to be
    /// free; a still-valid slot indicates the ring was overrun and is
    /// forcibly reclaimed.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % NUMBER_OF_INTERVALS;
        if self.slots[self.current].valid {
            error!(
                "monitor ring overrun, reclaiming still-valid interval {}",
                self.current
            );
            self.slots[self.current].valid = false;
        }
    }

    /// Attribute freshly sent segments to the current interval.
    pub fn note_sent(&mut self, delta_segments: u64, snd_nxt: u32) {
        if delta_segments == 0 {
            return;
        }
        let mon = &mut self.slots[self.current];
        mon.segments_sent += delta_segments;
        mon.snd_end_seq = snd_nxt;
    }

    /// Fold an ACK event into every valid interval: advance the acked
    /// frontier from the cumulative ack, then walk the SACK blocks in
    /// sequence order, counting the holes in front of each block as lost
    /// bytes. Returns the total bytes newly marked lost.
    pub fn on_ack_received(
        &mut self,
        snd_una: u32,
        blocks: &[SackBlock; MAX_SACK_BLOCKS],
        has_sacks: bool,
    ) -> u32 {
        let mut sacks = *blocks;
        if has_sacks {
            // Sort by start sequence, wrap aware. Four entries, so a
            // quadratic pass is enough.
            for i in 0..MAX_SACK_BLOCKS {
                for j in i + 1..MAX_SACK_BLOCKS {
                    if seq_after(sacks[i].start_seq, sacks[j].start_seq) {
                        sacks.swap(i, j);
                    }
                }
            }
        }

        let mut newly_lost: u32 = 0;
        for (i, mon) in self.slots.iter_mut().enumerate() {
            if !mon.valid {
                continue;
            }

            if seq_after(snd_una, mon.last_acked_seq) {
                mon.last_acked_seq = snd_una;
            }

            if !has_sacks {
                continue;
            }
            for block in sacks.iter() {
                // Nothing in this interval is still unaccounted for.
                if !seq_before(mon.last_acked_seq, mon.snd_end_seq) {
                    continue;
                }
                if block.is_empty() {
                    continue;
                }

                if seq_before(mon.last_acked_seq, block.start_seq) {
                    // The hole between the acked frontier and the block is
                    // lost, bounded by what this interval actually sent.
                    let lost = if seq_before(block.start_seq, mon.snd_end_seq) {
                        block.start_seq.wrapping_sub(mon.last_acked_seq)
                    } else {
                        mon.snd_end_seq.wrapping_sub(mon.last_acked_seq)
                    };
                    mon.bytes_lost = mon.bytes_lost.saturating_add(lost);
                    newly_lost = newly_lost.saturating_add(lost);
                    trace!(
                        "monitor {} lost {} bytes before sack block {}-{}",
                        i,
                        lost,
                        block.start_seq,
                        block.end_seq
                    );
                }
                if seq_after(block.end_seq, mon.last_acked_seq) {
                    mon.last_acked_seq = block.end_seq;
                }
            }
        }
        newly_lost
    }

    /// Count of valid slots, for diagnostics.
    pub fn valid_count(&self) -> usize {
        self.slots.iter().filter(|m| m.valid).count()
    }
}

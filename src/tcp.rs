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

//! The transport capability surface consumed by the pacing engine.
//!
//! The host transport owns segmentation, retransmission, RTT estimation and
//! SACK parsing. It exposes its per-connection counters to the engine as a
//! mutable [`TcpState`] view and invokes the engine hooks with it. The engine
//! reads the sequence counters and writes back `pacing_rate`, `snd_cwnd` and
//! `snd_wnd`; it never owns the connection.

use enumflags2::bitflags;

/// The ssthresh value meaning "no slow start threshold".
pub const INFINITE_SSTHRESH: u32 = 0x7fff_ffff;

/// Number of SACK blocks the transport reports per ACK event.
pub const MAX_SACK_BLOCKS: usize = 4;

/// Return true if sequence `a` is strictly before `b`.
///
/// Sequence numbers are 32-bit modular counters. The comparison is wrap
/// aware: it holds whenever `a` precedes `b` by less than 2^31.
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Return true if sequence `a` is strictly after `b`.
pub fn seq_after(a: u32, b: u32) -> bool {
    seq_before(b, a)
}

/// A selective acknowledgement block reported by the peer.
///
/// A block of `(0, 0)` means the slot is unused.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SackBlock {
    /// First sequence number covered by the block.
    pub start_seq: u32,

    /// Sequence number one past the last covered byte.
    pub end_seq: u32,
}

impl SackBlock {
    /// Check whether the slot carries a block.
    pub fn is_empty(&self) -> bool {
        self.start_seq == 0 && self.end_seq == 0
    }
}

/// Mutable per-connection view of the host transport.
///
/// Field names follow the conventional TCP sender variables. All sequence
/// counters are modular; compare them with [`seq_before`] / [`seq_after`].
#[derive(Debug, Clone)]
pub struct TcpState {
    /// Next sequence number to be sent.
    pub snd_nxt: u32,

    /// Highest cumulatively acknowledged sequence number.
    pub snd_una: u32,

    /// Number of segments the transport currently counts as SACKed.
    /// Non-zero means `recv_sack_cache` carries fresh blocks.
    pub sacked_out: u32,

    /// Most recently received SACK blocks. Unused slots are `(0, 0)`.
    pub recv_sack_cache: [SackBlock; MAX_SACK_BLOCKS],

    /// Monotonic count of data segments sent on the connection.
    pub data_segs_out: u64,

    /// Advertised MSS, in bytes per segment.
    pub advmss: u16,

    /// Smoothed RTT estimate in microseconds.
    pub srtt_us: u32,

    /// Pacing rate in bytes per second. Written by the engine.
    pub pacing_rate: u64,

    /// Congestion window in segments. Written by the engine.
    pub snd_cwnd: u32,

    /// Send window in bytes. Optionally clamped by the engine.
    pub snd_wnd: u32,
}

impl Default for TcpState {
    fn default() -> Self {
        Self {
            snd_nxt: 0,
            snd_una: 0,
            sacked_out: 0,
            recv_sack_cache: [SackBlock::default(); MAX_SACK_BLOCKS],
            data_segs_out: 0,
            advmss: 1460,
            srtt_us: 0,
            pacing_rate: 0,
            snd_cwnd: 0,
            snd_wnd: 0,
        }
    }
}

/// A rate/RTT sample delivered together with a `pkts_acked` hook call.
#[derive(Debug, Default, Clone, Copy)]
pub struct AckSample {
    /// Number of packets acknowledged by this event.
    pub pkts_acked: u32,

    /// RTT sample in microseconds. Negative means no valid sample.
    pub rtt_us: i64,

    /// Bytes in flight when the acked packets were sent.
    pub in_flight: u32,
}

/// A delivery rate sample for the `cong_control` hook.
#[derive(Debug, Default, Clone, Copy)]
pub struct RateSample {
    /// Bytes delivered over the sample interval.
    pub delivered: u64,

    /// Length of the sample interval in microseconds.
    pub interval_us: i64,

    /// RTT sample in microseconds. Negative means no valid sample.
    pub rtt_us: i64,

    /// Packets marked lost during this event.
    pub losses: u32,

    /// Packets newly acked or sacked during this event.
    pub acked_sacked: u32,

    /// Whether the sample was taken while the sender was application
    /// limited.
    pub is_app_limited: bool,
}

/// Properties of an incoming ACK, passed to the `in_ack_event` hook.
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckEventFlag {
    /// The ACK was processed on the transport's slow path.
    SlowPath = 1 << 0,

    /// The ACK updated the peer receive window.
    WinUpdate = 1 << 1,

    /// The ACK carried an ECN echo.
    Ece = 1 << 2,
}

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

#![allow(unused_variables)]

use core::str::FromStr;
use std::fmt;
use std::time::Instant;

use enumflags2::BitFlags;

use crate::tcp::AckEventFlag;
use crate::tcp::AckSample;
use crate::tcp::RateSample;
use crate::tcp::TcpState;
use crate::Error;
use crate::PacingConfig;
use crate::Result;
pub use dummy::Dummy;
pub use dummy::DummyConfig;
pub use fixedpoint::Fixedpt;
pub use pcc::Pcc;
pub use pcc::PccConfig;
pub use pcc::PccState;
pub use pcc::DEFAULT_SEND_WINDOW_CLAMP;
pub use pcc::INITIAL_RATE;
pub use pcc::MINIMUM_RATE;

/// Available congestion control algorithms.
#[repr(C)]
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub enum CongestionControlAlgorithm {
    /// PCC runs online rate experiments over short monitor intervals and
    /// moves the pacing rate in whichever direction a utility function
    /// (sigmoid-gated throughput minus loss) says is better.
    #[default]
    Pcc,

    /// Dummy is a simple controller that paces at a static rate. It is
    /// intended to be used for testing and experiments.
    Dummy,
}

impl FromStr for CongestionControlAlgorithm {
    type Err = Error;

    fn from_str(algor: &str) -> Result<CongestionControlAlgorithm> {
        if algor.eq_ignore_ascii_case("pcc") {
            Ok(CongestionControlAlgorithm::Pcc)
        } else if algor.eq_ignore_ascii_case("dummy") {
            Ok(CongestionControlAlgorithm::Dummy)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

/// Congestion control statistics.
#[derive(Debug, Default, Clone)]
pub struct CongestionStats {
    /// Total bytes sent.
    pub bytes_sent_in_total: u64,

    /// Total bytes acked.
    pub bytes_acked_in_total: u64,

    /// Total bytes lost.
    pub bytes_lost_in_total: u64,
}

/// The hook record a congestion controller exposes to the host transport.
///
/// The host calls every hook under its per-connection lock, so a controller
/// never observes concurrent invocations for one connection. Hooks must not
/// block; the monotonic clock is passed in rather than sampled internally.
pub trait CongestionController {
    /// Name of the congestion control algorithm, as used for registration.
    fn name(&self) -> &str;

    /// Callback when the connection is set up.
    fn init(&mut self, tp: &mut TcpState);

    /// Return the slow start threshold. Controllers that do not use one
    /// return [`crate::tcp::INFINITE_SSTHRESH`].
    fn ssthresh(&mut self, tp: &mut TcpState, now: Instant) -> u32;

    /// Callback after the transport processed a burst of acked packets.
    fn pkts_acked(&mut self, tp: &mut TcpState, sample: &AckSample, now: Instant);

    /// Callback for every incoming ACK, before `pkts_acked`.
    fn in_ack_event(&mut self, tp: &mut TcpState, flags: BitFlags<AckEventFlag>, now: Instant) {}

    /// Callback with a delivery rate sample. Optional.
    fn cong_control(&mut self, tp: &mut TcpState, sample: &RateSample, now: Instant) {}

    /// Callback when the connection is torn down.
    fn release(&mut self, tp: &mut TcpState);

    /// Congestion stats.
    fn stats(&self) -> &CongestionStats;
}

impl fmt::Debug for dyn CongestionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "congestion controller.")
    }
}

/// Build a congestion controller.
pub fn build_congestion_controller(conf: &PacingConfig) -> Box<dyn CongestionController> {
    match conf.congestion_control_algorithm {
        CongestionControlAlgorithm::Pcc => Box::new(Pcc::new(PccConfig::from(conf))),
        CongestionControlAlgorithm::Dummy => Box::new(Dummy::new(DummyConfig::from(conf))),
    }
}


mod dummy;
mod fixedpoint;
mod monitor;
mod pcc;

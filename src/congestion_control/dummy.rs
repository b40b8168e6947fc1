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

use std::time::Instant;

use super::CongestionController;
use super::CongestionStats;
use crate::tcp::AckSample;
use crate::tcp::TcpState;
use crate::tcp::INFINITE_SSTHRESH;
use crate::PacingConfig;

/// Dummy configurable parameters.
#[derive(Debug)]
pub struct DummyConfig {
    /// The static pacing rate, in bytes per second.
    pacing_rate: u64,
}

impl DummyConfig {
    pub fn from(conf: &PacingConfig) -> Self {
        Self {
            pacing_rate: conf.initial_pacing_rate,
        }
    }
}

/// Dummy is a simple controller that paces at a static rate. It is intended
/// to be used for testing and experiments.
#[derive(Debug)]
pub struct Dummy {
    /// Config.
    config: DummyConfig,

    /// Statistics.
    stats: CongestionStats,
}

impl Dummy {
    pub fn new(config: DummyConfig) -> Self {
        Self {
            config,
            stats: Default::default(),
        }
    }
}

impl CongestionController for Dummy {
    fn name(&self) -> &str {
        "dummy"
    }

    fn init(&mut self, tp: &mut TcpState) {
        tp.pacing_rate = self.config.pacing_rate;
    }

    fn ssthresh(&mut self, tp: &mut TcpState, now: Instant) -> u32 {
        INFINITE_SSTHRESH
    }

    fn pkts_acked(&mut self, tp: &mut TcpState, sample: &AckSample, now: Instant) {
        let acked_bytes = sample.pkts_acked as u64 * tp.advmss as u64;
        self.stats.bytes_acked_in_total =
            self.stats.bytes_acked_in_total.saturating_add(acked_bytes);
        tp.pacing_rate = self.config.pacing_rate;
    }

    fn release(&mut self, tp: &mut TcpState) {
        // Nothing to free.
    }

    fn stats(&self) -> &CongestionStats {
        &self.stats
    }
}

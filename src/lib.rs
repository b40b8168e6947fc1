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

//! tcp-pcc is a sender-side pacing engine implementing Performance-oriented
//! Congestion Control (PCC) for TCP-like reliable byte-stream transports.
//!
//! Instead of reacting to individual loss events, PCC runs continuous online
//! experiments: it holds a candidate pacing rate for one monitor interval,
//! scores the outcome with a utility function, and steers the rate toward
//! higher utility. The engine plugs into a host transport through a small
//! hook record ([`congestion_control::CongestionController`]) and a mutable
//! per-connection view of the transport's counters ([`tcp::TcpState`]).
//!
//! The engine paces; it does not decide what to send or retransmit, it does
//! not smooth RTTs, and it holds no state shared between connections. All
//! hooks run under the host's per-connection lock, never block, and finish
//! in bounded time.
//!
//! ## Example
//!
//! ```
//! use tcp_pcc::congestion_control::build_congestion_controller;
//!
//! let mut config = tcp_pcc::Config::new();
//! config.set_initial_pacing_rate(2_000_000);
//!
//! let mut cc = build_congestion_controller(config.pacing());
//! let mut tp = tcp_pcc::tcp::TcpState::default();
//! cc.init(&mut tp);
//! assert_eq!(tp.pacing_rate, 2_000_000);
//! ```

use crate::congestion_control::CongestionControlAlgorithm;
use crate::congestion_control::DEFAULT_SEND_WINDOW_CLAMP;
use crate::congestion_control::INITIAL_RATE;
use crate::congestion_control::MINIMUM_RATE;
pub use crate::error::Error;

/// Result type for pacing engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Configurations about the pacing engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Configurations about pacing and congestion control.
    pacing: PacingConfig,
}

impl Config {
    /// Create default configuration.
    ///
    /// The configuration may be customized by calling related set methods.
    pub fn new() -> Self {
        Self {
            pacing: PacingConfig::default(),
        }
    }

    /// Set the congestion control algorithm used for a connection.
    /// The default value is `Pcc`.
    pub fn set_congestion_control_algorithm(&mut self, v: CongestionControlAlgorithm) {
        self.pacing.congestion_control_algorithm = v;
    }

    /// Set the pacing rate published at connection setup, in bytes per
    /// second. Values below the minimum pacing rate are raised to it.
    /// The default value is `1_000_000`.
    pub fn set_initial_pacing_rate(&mut self, v: u64) {
        self.pacing.initial_pacing_rate = v.max(self.pacing.min_pacing_rate);
    }

    /// Set the lower bound for any chosen pacing rate, in bytes per second.
    /// The default value is `800_000`.
    pub fn set_min_pacing_rate(&mut self, v: u64) {
        self.pacing.min_pacing_rate = v;
        self.pacing.initial_pacing_rate = self.pacing.initial_pacing_rate.max(v);
    }

    /// Set the clamp written to the transport send window after each ack
    /// burst, or `None` to leave the window alone.
    /// The default value is `Some(0xff_ffff)`.
    pub fn set_send_window_clamp(&mut self, v: Option<u32>) {
        self.pacing.send_window_clamp = v;
    }

    /// Draw each decision quartet's probe directions at random instead of
    /// the fixed (+, -, +, -) pattern. Disabled by default.
    pub fn enable_shuffle_decision_directions(&mut self, v: bool) {
        self.pacing.shuffle_decision_directions = v;
    }

    /// Configurations about pacing and congestion control.
    pub fn pacing(&self) -> &PacingConfig {
        &self.pacing
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Configurations about pacing and congestion control.
#[doc(hidden)]
#[derive(Debug, Clone)]
pub struct PacingConfig {
    /// The congestion control algorithm used for a connection.
    pub congestion_control_algorithm: CongestionControlAlgorithm,

    /// Pacing rate published at connection setup, in bytes per second.
    pub initial_pacing_rate: u64,

    /// Lower bound for any chosen pacing rate, in bytes per second.
    pub min_pacing_rate: u64,

    /// Clamp written to the transport send window after each ack burst.
    /// `None` leaves the window alone.
    pub send_window_clamp: Option<u32>,

    /// Draw each decision quartet's probe directions at random instead of
    /// the fixed (+, -, +, -) pattern.
    pub shuffle_decision_directions: bool,
}

impl Default for PacingConfig {
    fn default() -> PacingConfig {
        PacingConfig {
            congestion_control_algorithm: CongestionControlAlgorithm::Pcc,
            initial_pacing_rate: INITIAL_RATE,
            min_pacing_rate: MINIMUM_RATE,
            send_window_clamp: Some(DEFAULT_SEND_WINDOW_CLAMP),
            shuffle_decision_directions: false,
        }
    }
}


#[path = "congestion_control/congestion_control.rs"]
pub mod congestion_control;

pub mod error;
pub mod tcp;

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

//! Error type for pacing engine operations.
//!
//! The hooks themselves are infallible: invariant breaches are logged and
//! fixed up in place, never surfaced. The only fallible surface is
//! configuration, so that is the only error the crate produces.

use strum_macros::EnumIter;

/// Pacing engine error.
#[derive(Clone, Debug, PartialEq, Eq, EnumIter)]
pub enum Error {
    /// The configuration is invalid.
    InvalidConfig(String),
}

impl Error {
    /// Return the error number used by C callers.
    pub fn to_errno(&self) -> i64 {
        match self {
            Error::InvalidConfig(_) => -1,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

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

//! Signed 64-bit fixed-point arithmetic with 32 fractional bits (Q32.32).
//!
//! The utility computation runs in an execution context that may not permit
//! floating point, so rate and loss-ratio arithmetic is done on a fixed-point
//! representation instead. Intermediate products and quotients are widened to
//! 128 bits and saturated back into the 64-bit range, so out-of-range inputs
//! degrade to the extreme representable values instead of wrapping.
//!
//! `exp` uses range reduction by powers of two followed by a Maclaurin
//! series on the small residual; `ln` normalizes the argument into `[1, 2)`
//! and evaluates the inverse hyperbolic tangent series; `pow` composes the
//! two. All three are accurate to well below one part in 2^30 over the range
//! the utility function exercises.

use std::ops::Add;
use std::ops::Neg;
use std::ops::Sub;

/// Number of fractional bits in the representation.
pub const FRACTION_BITS: u32 = 32;

/// ln(2) in Q32.32.
const LN2: Fixedpt = Fixedpt(2_977_044_472);

/// Number of Maclaurin terms used by `exp`. The reduced argument is below
/// ln(2)/2, where 13 terms leave an error under 2^-48.
const EXP_TERMS: i64 = 13;

/// Number of series terms used by `ln`. The series variable is below 1/3,
/// so 10 odd-power terms leave an error under 2^-40.
const LN_TERMS: i64 = 10;

/// A Q32.32 fixed-point number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fixedpt(i64);

impl Fixedpt {
    pub const ZERO: Fixedpt = Fixedpt(0);
    pub const ONE: Fixedpt = Fixedpt(1 << FRACTION_BITS);
    pub const MAX: Fixedpt = Fixedpt(i64::MAX);
    pub const MIN: Fixedpt = Fixedpt(i64::MIN);

    /// Convert an integer, saturating at the representable range.
    pub fn from_int(v: i64) -> Self {
        Fixedpt(saturate((v as i128) << FRACTION_BITS))
    }

    /// Convert a ratio `num / den`. A zero denominator saturates the same
    /// way `div` does.
    pub fn from_ratio(num: i64, den: i64) -> Self {
        Self::from_int(num).div(Self::from_int(den))
    }

    /// Construct from a raw Q32.32 bit pattern.
    pub fn from_raw(raw: i64) -> Self {
        Fixedpt(raw)
    }

    /// The raw Q32.32 bit pattern.
    pub fn raw(self) -> i64 {
        self.0
    }

    /// Truncate to an integer (round toward negative infinity).
    pub fn to_int(self) -> i64 {
        self.0 >> FRACTION_BITS
    }

    /// Saturating fixed-point multiplication.
    pub fn mul(self, other: Fixedpt) -> Fixedpt {
        Fixedpt(saturate(
            (self.0 as i128 * other.0 as i128) >> FRACTION_BITS,
        ))
    }

    /// Saturating fixed-point division. Division by zero saturates in the
    /// direction of the numerator's sign.
    pub fn div(self, other: Fixedpt) -> Fixedpt {
        if other.0 == 0 {
            return if self.0 >= 0 {
                Fixedpt::MAX
            } else {
                Fixedpt::MIN
            };
        }
        Fixedpt(saturate(
            ((self.0 as i128) << FRACTION_BITS) / other.0 as i128,
        ))
    }

    /// e raised to `self`.
    pub fn exp(self) -> Fixedpt {
        if self.0 == 0 {
            return Fixedpt::ONE;
        }
        // Results below 2^-32 or above 2^31 are not representable.
        if self.to_int() <= -23 {
            return Fixedpt::ZERO;
        }
        if self.to_int() >= 22 {
            return Fixedpt::MAX;
        }

        // Reduce: self = k * ln2 + r with |r| <= ln2 / 2, so that
        // exp(self) = 2^k * exp(r).
        let k = div_round_nearest(self.0, LN2.0);
        let r = Fixedpt(self.0 - k * LN2.0);

        // exp(r) by Maclaurin series.
        let mut term = Fixedpt::ONE;
        let mut sum = Fixedpt::ONE;
        for n in 1..=EXP_TERMS {
            term = term.mul(r).div(Fixedpt::from_int(n));
            sum = sum + term;
        }

        // Scale by 2^k.
        if k >= 0 {
            Fixedpt(saturate((sum.0 as i128) << k as u32))
        } else {
            Fixedpt(sum.0 >> (-k).min(63) as u32)
        }
    }

    /// Natural logarithm. Non-positive arguments saturate to `MIN`.
    pub fn ln(self) -> Fixedpt {
        if self.0 <= 0 {
            return Fixedpt::MIN;
        }

        // Normalize: self = m * 2^k with m in [1, 2).
        let k = 63 - self.0.leading_zeros() as i64 - FRACTION_BITS as i64;
        let m = if k >= 0 {
            Fixedpt(self.0 >> k as u32)
        } else {
            Fixedpt(self.0 << (-k) as u32)
        };

        // ln(m) = 2 * artanh(z) with z = (m - 1) / (m + 1) in [0, 1/3).
        let z = (m - Fixedpt::ONE).div(m + Fixedpt::ONE);
        let z2 = z.mul(z);
        let mut power = z;
        let mut sum = z;
        for n in 1..LN_TERMS {
            power = power.mul(z2);
            sum = sum + power.div(Fixedpt::from_int(2 * n + 1));
        }

        Fixedpt(2 * sum.0 + k * LN2.0)
    }

    /// `self` raised to `exponent`, for positive `self`. A non-positive base
    /// yields zero.
    pub fn pow(self, exponent: Fixedpt) -> Fixedpt {
        if self.0 <= 0 {
            return Fixedpt::ZERO;
        }
        if exponent.0 == 0 {
            return Fixedpt::ONE;
        }
        exponent.mul(self.ln()).exp()
    }
}

impl Add for Fixedpt {
    type Output = Fixedpt;

    fn add(self, other: Fixedpt) -> Fixedpt {
        Fixedpt(self.0.saturating_add(other.0))
    }
}

impl Sub for Fixedpt {
    type Output = Fixedpt;

    fn sub(self, other: Fixedpt) -> Fixedpt {
        Fixedpt(self.0.saturating_sub(other.0))
    }
}

impl Neg for Fixedpt {
    type Output = Fixedpt;

    fn neg(self) -> Fixedpt {
        Fixedpt(self.0.saturating_neg())
    }
}

/// Clamp a 128-bit intermediate into the 64-bit raw range.
fn saturate(v: i128) -> i64 {
    if v > i64::MAX as i128 {
        i64::MAX
    } else if v < i64::MIN as i128 {
        i64::MIN
    } else {
        v as i64
    }
}

/// Signed division rounded to the nearest integer, half away from zero.
fn div_round_nearest(num: i64, den: i64) -> i64 {
    let half = if num >= 0 { den / 2 } else { -(den / 2) };
    (num + half) / den
}

//! Difficulty and 256-bit target arithmetic.
//!
//! A PoW value is valid for a target when `value <= target`. Difficulty and
//! target are inversely related through `MAX_TARGET`:
//! ```text
//! target     = MAX_TARGET / difficulty
//! difficulty = MAX_TARGET / target
//! ```
//! All comparisons used for share classification happen on [`Target`] values
//! (exact big-integer arithmetic). [`Difficulty`] is the integer multiplier
//! miners see on the wire.

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Largest representable target (difficulty 1): 2^256 - 1.
pub fn max_target() -> &'static BigUint {
    static MAX: OnceLock<BigUint> = OnceLock::new();
    MAX.get_or_init(|| (BigUint::one() << 256u32) - BigUint::one())
}

/// Integer mining difficulty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Difficulty(u64);

impl Difficulty {
    pub const ONE: Difficulty = Difficulty(1);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64
    }

    /// Difficulty represented by a target. A zero target saturates to `u64::MAX`.
    pub fn from_target(target: &Target) -> Self {
        if target.0.is_zero() {
            return Self(u64::MAX);
        }
        let diff = max_target() / &target.0;
        Self(diff.to_u64().unwrap_or(u64::MAX))
    }

    /// Target a PoW value must not exceed to satisfy this difficulty.
    pub fn to_target(self) -> Target {
        if self.0 <= 1 {
            return Target(max_target().clone());
        }
        Target(max_target() / BigUint::from(self.0))
    }

    /// Multiply by a floating factor, rounding to the nearest integer (at least 1).
    pub fn scaled(self, factor: f64) -> Self {
        let next = (self.0.max(1) as f64 * factor).round();
        if !next.is_finite() || next < 1.0 {
            return Self::ONE;
        }
        if next >= u64::MAX as f64 {
            return Self(u64::MAX);
        }
        Self(next as u64)
    }

    pub fn clamp_to(self, min: Difficulty, max: Difficulty) -> Self {
        Self(self.0.clamp(min.0, max.0.max(min.0)))
    }
}

impl From<u64> for Difficulty {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Difficulty> for u64 {
    fn from(diff: Difficulty) -> Self {
        diff.0
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0 as f64;
        let (scaled, suffix) = if value >= 1e15 {
            (value / 1e15, "P")
        } else if value >= 1e12 {
            (value / 1e12, "T")
        } else if value >= 1e9 {
            (value / 1e9, "G")
        } else if value >= 1e6 {
            (value / 1e6, "M")
        } else if value >= 1e3 {
            (value / 1e3, "K")
        } else {
            return write!(f, "{}", self.0);
        };

        if scaled >= 100.0 {
            write!(f, "{:.0}{}", scaled, suffix)
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix)
        } else {
            write!(f, "{:.2}{}", scaled, suffix)
        }
    }
}

/// 256-bit unsigned target (or PoW value).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target(BigUint);

impl Target {
    pub fn max() -> Self {
        Self(max_target().clone())
    }

    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    /// Interpret a hash as a little-endian 256-bit integer.
    pub fn from_le_bytes(bytes: &[u8; 32]) -> Self {
        Self(BigUint::from_bytes_le(bytes))
    }

    pub fn to_le_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        let bytes = self.0.to_bytes_le();
        let n = bytes.len().min(32);
        out[..n].copy_from_slice(&bytes[..n]);
        out
    }

    /// Decode compact "bits" (8-bit exponent, 23-bit mantissa, sign bit).
    ///
    /// A set sign bit or zero mantissa decodes to zero, which no PoW value can
    /// satisfy except zero itself.
    pub fn from_compact(bits: u32) -> Self {
        let exponent = bits >> 24;
        let mantissa = bits & 0x007f_ffff;
        if bits & 0x0080_0000 != 0 || mantissa == 0 {
            return Self::zero();
        }

        let value = if exponent <= 3 {
            BigUint::from(mantissa >> (8 * (3 - exponent)))
        } else {
            BigUint::from(mantissa) << (8 * (exponent - 3))
        };

        // Anything past 256 bits is clamped to the maximum.
        if value > *max_target() {
            return Self::max();
        }
        Self(value)
    }

    /// Encode to compact bits. Exact for every value produced by `from_compact`.
    pub fn to_compact(&self) -> u32 {
        if self.0.is_zero() {
            return 0;
        }

        let mut size = ((self.0.bits() + 7) / 8) as u32;
        let mut compact: u32 = if size <= 3 {
            let low = self.0.to_u32().unwrap_or(0);
            low << (8 * (3 - size))
        } else {
            let shifted: BigUint = &self.0 >> (8 * (size - 3));
            shifted.to_u32().unwrap_or(0)
        };

        if compact & 0x0080_0000 != 0 {
            compact >>= 8;
            size += 1;
        }

        compact | (size << 24)
    }

    /// Whether a PoW value satisfies this target.
    pub fn is_met_by(&self, pow_value: &Target) -> bool {
        pow_value.0 <= self.0
    }

    pub fn to_hex(&self) -> String {
        format!("{:064x}", self.0)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

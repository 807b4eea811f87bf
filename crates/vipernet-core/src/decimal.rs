//! Fixed-point decimal with 18 fractional digits
//!
//! QoS scores live in `[0, 1]` and are summed into report cards, so an
//! unsigned 128-bit mantissa is plenty. On the wire a `Dec` is a string
//! with exactly 18 fractional digits, e.g. `"0.500000000000000000"`.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Number of fractional digits
pub const PRECISION: u32 = 18;

const SCALE: u128 = 1_000_000_000_000_000_000;

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dec(u128);

impl Dec {
    pub const fn zero() -> Self {
        Dec(0)
    }

    pub const fn one() -> Self {
        Dec(SCALE)
    }

    /// Build from the raw scaled mantissa.
    pub const fn from_raw(raw: u128) -> Self {
        Dec(raw)
    }

    pub fn raw(&self) -> u128 {
        self.0
    }

    pub fn from_int(n: u64) -> Self {
        Dec(n as u128 * SCALE)
    }

    /// `numerator / denominator`, truncated.
    pub fn from_ratio(numerator: u64, denominator: u64) -> Result<Self> {
        if denominator == 0 {
            return Err(Error::Decimal("division by zero".into()));
        }
        Ok(Dec(numerator as u128 * SCALE / denominator as u128))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Dec) -> Result<Dec> {
        self.0
            .checked_add(other.0)
            .map(Dec)
            .ok_or_else(|| Error::Decimal("addition overflow".into()))
    }

    pub fn checked_sub(self, other: Dec) -> Result<Dec> {
        self.0
            .checked_sub(other.0)
            .map(Dec)
            .ok_or_else(|| Error::Decimal("subtraction underflow".into()))
    }

    /// Fixed-point multiply, truncated.
    pub fn checked_mul(self, other: Dec) -> Result<Dec> {
        self.0
            .checked_mul(other.0)
            .map(|p| Dec(p / SCALE))
            .ok_or_else(|| Error::Decimal("multiplication overflow".into()))
    }

    /// Fixed-point divide, truncated.
    pub fn checked_quo(self, other: Dec) -> Result<Dec> {
        if other.0 == 0 {
            return Err(Error::Decimal("division by zero".into()));
        }
        self.0
            .checked_mul(SCALE)
            .map(|n| Dec(n / other.0))
            .ok_or_else(|| Error::Decimal("division overflow".into()))
    }

    /// Divide by an integer. Division by zero yields zero.
    pub fn div_int(self, n: u128) -> Dec {
        if n == 0 {
            return Dec::zero();
        }
        Dec(self.0 / n)
    }

    pub fn clamp_unit(self) -> Dec {
        self.min(Dec::one())
    }

    /// Integer part, truncated.
    pub fn truncate(self) -> u128 {
        self.0 / SCALE
    }
}

impl fmt::Display for Dec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:0width$}",
            self.0 / SCALE,
            self.0 % SCALE,
            width = PRECISION as usize
        )
    }
}

impl fmt::Debug for Dec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dec({self})")
    }
}

impl FromStr for Dec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        if int_part.is_empty() || frac_part.len() > PRECISION as usize {
            return Err(Error::Decimal(format!("malformed decimal {s}")));
        }
        let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if !digits(int_part) || !digits(frac_part) {
            return Err(Error::Decimal(format!("malformed decimal {s}")));
        }
        let int: u128 = int_part
            .parse()
            .map_err(|_| Error::Decimal(format!("malformed decimal {s}")))?;
        let frac: u128 = if frac_part.is_empty() {
            0
        } else {
            let padded = format!("{frac_part:0<width$}", width = PRECISION as usize);
            padded
                .parse()
                .map_err(|_| Error::Decimal(format!("malformed decimal {s}")))?
        };
        int.checked_mul(SCALE)
            .and_then(|v| v.checked_add(frac))
            .map(Dec)
            .ok_or_else(|| Error::Decimal(format!("decimal out of range {s}")))
    }
}

impl Serialize for Dec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Dec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

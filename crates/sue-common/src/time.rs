//! Virtual time and link rates.
//!
//! The simulator runs on an integer nanosecond clock. `Nanos` doubles as an
//! absolute timestamp and a duration; arithmetic saturates so a misconfigured
//! delay can never wrap the clock backwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};
use thiserror::Error;

/// Errors from the human-readable duration / rate parsers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid duration string {0:?} (expected e.g. \"10ns\", \"5us\", \"1ms\", \"2s\")")]
    Duration(String),
    #[error("invalid rate string {0:?} (expected e.g. \"10Gbps\", \"200Mbps\", \"32768bps\")")]
    Rate(String),
}

// ─── Nanos ──────────────────────────────────────────────────────────────────

/// A point in simulated time, or a span of it, in integer nanoseconds.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct Nanos(pub u64);

impl Nanos {
    pub const ZERO: Nanos = Nanos(0);

    #[inline]
    pub fn from_micros(us: u64) -> Self {
        Nanos(us * 1_000)
    }

    #[inline]
    pub fn from_millis(ms: u64) -> Self {
        Nanos(ms * 1_000_000)
    }

    #[inline]
    pub fn from_secs_f64(s: f64) -> Self {
        Nanos((s * 1e9).round() as u64)
    }

    #[inline]
    pub fn as_nanos(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1e9
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Nanos) -> Nanos {
        Nanos(self.0.saturating_sub(rhs.0))
    }

    /// Parse a duration string with an `ns`/`us`/`ms`/`s` suffix.
    pub fn parse(s: &str) -> Result<Nanos, ParseError> {
        let s = s.trim();
        let (num, mult) = if let Some(v) = s.strip_suffix("ns") {
            (v, 1.0)
        } else if let Some(v) = s.strip_suffix("us") {
            (v, 1e3)
        } else if let Some(v) = s.strip_suffix("ms") {
            (v, 1e6)
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1e9)
        } else {
            return Err(ParseError::Duration(s.to_string()));
        };
        num.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| *v >= 0.0)
            .map(|v| Nanos((v * mult).round() as u64))
            .ok_or_else(|| ParseError::Duration(s.to_string()))
    }
}

impl Add for Nanos {
    type Output = Nanos;
    #[inline]
    fn add(self, rhs: Nanos) -> Nanos {
        Nanos(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Nanos {
    #[inline]
    fn add_assign(&mut self, rhs: Nanos) {
        *self = *self + rhs;
    }
}

impl Sub for Nanos {
    type Output = Nanos;
    #[inline]
    fn sub(self, rhs: Nanos) -> Nanos {
        Nanos(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for Nanos {
    fn sum<I: Iterator<Item = Nanos>>(iter: I) -> Nanos {
        iter.fold(Nanos::ZERO, Add::add)
    }
}

impl fmt::Display for Nanos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

// ─── Rate ───────────────────────────────────────────────────────────────────

/// A data rate in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rate(pub u64);

impl Rate {
    #[inline]
    pub fn bits_per_sec(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_mbps(mbps: f64) -> Self {
        Rate((mbps * 1e6).round() as u64)
    }

    /// Serialization time for `len` bytes at this rate, rounded up to a
    /// whole nanosecond. A zero rate yields zero time (infinitely fast).
    pub fn time_for_bytes(self, len: usize) -> Nanos {
        if self.0 == 0 {
            return Nanos::ZERO;
        }
        let bits = len as u128 * 8;
        let ns = (bits * 1_000_000_000).div_ceil(self.0 as u128);
        Nanos(ns as u64)
    }

    /// Parse a rate string with a `bps`/`Kbps`/`Mbps`/`Gbps` suffix.
    pub fn parse(s: &str) -> Result<Rate, ParseError> {
        let s = s.trim();
        let lower = s.to_ascii_lowercase();
        let (num, mult) = if let Some(v) = lower.strip_suffix("gbps") {
            (v, 1e9)
        } else if let Some(v) = lower.strip_suffix("mbps") {
            (v, 1e6)
        } else if let Some(v) = lower.strip_suffix("kbps") {
            (v, 1e3)
        } else if let Some(v) = lower.strip_suffix("bps") {
            (v, 1.0)
        } else {
            return Err(ParseError::Rate(s.to_string()));
        };
        num.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| *v >= 0.0)
            .map(|v| Rate((v * mult).round() as u64))
            .ok_or_else(|| ParseError::Rate(s.to_string()))
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}bps", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Nanos ──────────────────────────────────────────────────────────

    #[test]
    fn nanos_arithmetic_saturates() {
        assert_eq!(Nanos(5) - Nanos(10), Nanos::ZERO);
        assert_eq!(Nanos(u64::MAX) + Nanos(1), Nanos(u64::MAX));
    }

    #[test]
    fn nanos_parse_suffixes() {
        assert_eq!(Nanos::parse("10ns").unwrap(), Nanos(10));
        assert_eq!(Nanos::parse("5us").unwrap(), Nanos(5_000));
        assert_eq!(Nanos::parse("1ms").unwrap(), Nanos(1_000_000));
        assert_eq!(Nanos::parse("2s").unwrap(), Nanos(2_000_000_000));
        assert_eq!(Nanos::parse("1.5us").unwrap(), Nanos(1_500));
        assert!(Nanos::parse("10").is_err());
        assert!(Nanos::parse("abcus").is_err());
    }

    #[test]
    fn nanos_from_secs() {
        assert_eq!(Nanos::from_secs_f64(0.5), Nanos(500_000_000));
    }

    // ─── Rate ───────────────────────────────────────────────────────────

    #[test]
    fn rate_parse_suffixes() {
        assert_eq!(Rate::parse("10Gbps").unwrap(), Rate(10_000_000_000));
        assert_eq!(Rate::parse("200Mbps").unwrap(), Rate(200_000_000));
        assert_eq!(Rate::parse("32768bps").unwrap(), Rate(32_768));
        assert!(Rate::parse("fast").is_err());
    }

    #[test]
    fn rate_time_for_bytes() {
        // 1 Gbps: one byte every 8 ns.
        let r = Rate(1_000_000_000);
        assert_eq!(r.time_for_bytes(1), Nanos(8));
        assert_eq!(r.time_for_bytes(1500), Nanos(12_000));
        // Rounds up to the next nanosecond.
        let r = Rate(3_000_000_000);
        assert_eq!(r.time_for_bytes(1), Nanos(3));
    }

    #[test]
    fn zero_rate_is_instant() {
        assert_eq!(Rate(0).time_for_bytes(4096), Nanos::ZERO);
    }
}

//! Core types with newtype pattern for type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Presentation or decode time in microseconds.
///
/// Integer microseconds are what capture sources and hardware codecs report,
/// and the unit timestamp repair works in.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub fn from_micros(us: i64) -> Self {
        Self(us)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * 1_000_000.0).round() as i64)
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Convert to a container timescale, rounding to the nearest tick.
    pub fn to_ticks(self, timescale: u32) -> i64 {
        let scaled = self.0 as i128 * timescale as i128;
        let half = if scaled >= 0 { 500_000 } else { -500_000 };
        ((scaled + half) / 1_000_000) as i64
    }
}

impl Add<i64> for Timestamp {
    type Output = Self;
    fn add(self, rhs: i64) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub for Timestamp {
    type Output = i64;
    fn sub(self, rhs: Self) -> i64 {
        self.0 - rhs.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Rational number for frame rates (e.g., 30000/1001 for 29.97fps).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    pub const FPS_24: Self = Self { num: 24, den: 1 };
    pub const FPS_25: Self = Self { num: 25, den: 1 };
    pub const FPS_30: Self = Self { num: 30, den: 1 };
    pub const FPS_29_97: Self = Self {
        num: 30000,
        den: 1001,
    };
    pub const FPS_60: Self = Self { num: 60, den: 1 };

    pub fn new(num: u32, den: u32) -> Self {
        assert!(den > 0, "Rational denominator must be > 0");
        Self { num, den }
    }

    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Duration of one frame in microseconds.
    pub fn frame_duration_us(self) -> i64 {
        if self.num == 0 {
            return 0;
        }
        (self.den as i64 * 1_000_000) / self.num as i64
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

/// Video resolution.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Self = Self {
        width: 1280,
        height: 720,
    };
    pub const FHD: Self = Self {
        width: 1920,
        height: 1080,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Identifier of a stream inside a muxer (1-based, doubles as the MP4 track ID).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_to_ticks_rounds() {
        assert_eq!(Timestamp::from_micros(1_000_000).to_ticks(90_000), 90_000);
        assert_eq!(Timestamp::from_micros(33_333).to_ticks(90_000), 3_000);
        assert_eq!(Timestamp::from_micros(23_220).to_ticks(44_100), 1_024);
        assert_eq!(Timestamp::from_micros(-11).to_ticks(1_000_000), -11);
    }

    #[test]
    fn timestamp_arithmetic() {
        let a = Timestamp::from_micros(150);
        let b = a + 10;
        assert_eq!(b.as_micros(), 160);
        assert_eq!(b - a, 10);
        assert_eq!(Timestamp::from_secs_f64(1.5).as_micros(), 1_500_000);
    }

    #[test]
    fn rational_display() {
        assert_eq!(Rational::FPS_30.to_string(), "30");
        assert_eq!(Rational::FPS_29_97.to_string(), "30000/1001");
    }

    #[test]
    fn rational_frame_duration() {
        assert_eq!(Rational::FPS_30.frame_duration_us(), 33_333);
        assert_eq!(Rational::FPS_25.frame_duration_us(), 40_000);
    }

    #[test]
    fn resolution_display_and_empty() {
        assert_eq!(Resolution::FHD.to_string(), "1920x1080");
        assert!(Resolution::new(0, 720).is_empty());
        assert!(!Resolution::HD.is_empty());
    }
}

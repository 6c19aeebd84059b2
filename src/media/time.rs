//! Rational media time
//!
//! Presentation timestamps and durations are rational numbers (a value over
//! a timescale) rather than floating-point seconds, so that a 30 fps stream
//! can represent `1/30 s` steps exactly and duplicate detection never
//! depends on rounding. Two times are equal only when every field matches;
//! ordering is computed with exact cross-multiplied arithmetic.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

/// Timescale used when converting from wall-clock durations.
pub const DEFAULT_TIMESCALE: i32 = 600;

/// Classification carried alongside the rational value.
///
/// A time is only meaningful for arithmetic and comparison when it is
/// `Valid`; the remaining variants mirror the sentinel times a host media
/// stack hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeFlags {
    Invalid,
    Valid,
    PositiveInfinity,
    NegativeInfinity,
    Indefinite,
}

/// A rational point on a media timeline.
///
/// `value / timescale` seconds, offset into playback epoch `epoch`. Epochs
/// separate repeated passes over the same material (loop iterations); times
/// from different epochs never compare equal and order by epoch first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: i32,
    pub epoch: i64,
    pub flags: TimeFlags,
}

impl MediaTime {
    /// Create a valid time of `value / timescale` seconds in epoch 0.
    pub fn new(value: i64, timescale: i32) -> Self {
        debug_assert!(timescale > 0, "timescale must be positive");
        Self {
            value,
            timescale,
            epoch: 0,
            flags: TimeFlags::Valid,
        }
    }

    pub fn with_epoch(mut self, epoch: i64) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn zero() -> Self {
        Self::new(0, 1)
    }

    pub fn invalid() -> Self {
        Self {
            value: 0,
            timescale: 1,
            epoch: 0,
            flags: TimeFlags::Invalid,
        }
    }

    pub fn indefinite() -> Self {
        Self {
            value: 0,
            timescale: 1,
            epoch: 0,
            flags: TimeFlags::Indefinite,
        }
    }

    pub fn positive_infinity() -> Self {
        Self {
            value: 0,
            timescale: 1,
            epoch: 0,
            flags: TimeFlags::PositiveInfinity,
        }
    }

    /// Create a time from seconds, rounding toward zero at `timescale`.
    pub fn from_seconds(seconds: f64, timescale: i32) -> Self {
        debug_assert!(timescale > 0, "timescale must be positive");
        Self::new((seconds * timescale as f64) as i64, timescale)
    }

    pub fn from_duration(duration: Duration, timescale: i32) -> Self {
        Self::from_seconds(duration.as_secs_f64(), timescale)
    }

    pub fn is_valid(&self) -> bool {
        self.flags == TimeFlags::Valid
    }

    pub fn is_indefinite(&self) -> bool {
        self.flags == TimeFlags::Indefinite
    }

    /// Numeric value in seconds. Sentinel times map to `0.0` or infinity.
    pub fn seconds(&self) -> f64 {
        match self.flags {
            TimeFlags::Valid => self.value as f64 / self.timescale as f64,
            TimeFlags::PositiveInfinity => f64::INFINITY,
            TimeFlags::NegativeInfinity => f64::NEG_INFINITY,
            TimeFlags::Invalid | TimeFlags::Indefinite => 0.0,
        }
    }

    /// Re-express this time at another timescale, rounding toward zero.
    pub fn converted(&self, timescale: i32) -> Self {
        debug_assert!(timescale > 0, "timescale must be positive");
        if !self.is_valid() || self.timescale == timescale {
            let mut out = *self;
            if out.is_valid() {
                out.timescale = timescale;
            }
            return out;
        }
        let value = (self.value as i128 * timescale as i128) / self.timescale as i128;
        Self {
            value: value as i64,
            timescale,
            epoch: self.epoch,
            flags: TimeFlags::Valid,
        }
    }

    /// Exact ordering across timescales. Epoch dominates, then the rational
    /// value compared by cross-multiplication (no overflow for any i64
    /// value against an i32 timescale).
    pub fn compare(&self, other: &MediaTime) -> Ordering {
        use TimeFlags::*;
        match (self.flags, other.flags) {
            (Valid, Valid) => self
                .epoch
                .cmp(&other.epoch)
                .then_with(|| {
                    let lhs = self.value as i128 * other.timescale as i128;
                    let rhs = other.value as i128 * self.timescale as i128;
                    lhs.cmp(&rhs)
                }),
            (PositiveInfinity, PositiveInfinity) => Ordering::Equal,
            (NegativeInfinity, NegativeInfinity) => Ordering::Equal,
            (PositiveInfinity, _) => Ordering::Greater,
            (_, PositiveInfinity) => Ordering::Less,
            (NegativeInfinity, _) => Ordering::Less,
            (_, NegativeInfinity) => Ordering::Greater,
            // Invalid and indefinite times sort below everything valid so
            // that min-scans skip them deterministically.
            (Invalid | Indefinite, Valid) => Ordering::Less,
            (Valid, Invalid | Indefinite) => Ordering::Greater,
            _ => Ordering::Equal,
        }
    }
}

impl PartialOrd for MediaTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Add for MediaTime {
    type Output = MediaTime;

    fn add(self, rhs: MediaTime) -> MediaTime {
        if !self.is_valid() || !rhs.is_valid() {
            return MediaTime::invalid();
        }
        let scale = self.timescale.max(rhs.timescale);
        let lhs = self.converted(scale);
        let rhs = rhs.converted(scale);
        MediaTime {
            value: lhs.value.saturating_add(rhs.value),
            timescale: scale,
            epoch: self.epoch,
            flags: TimeFlags::Valid,
        }
    }
}

impl Sub for MediaTime {
    type Output = MediaTime;

    fn sub(self, rhs: MediaTime) -> MediaTime {
        if !self.is_valid() || !rhs.is_valid() {
            return MediaTime::invalid();
        }
        let scale = self.timescale.max(rhs.timescale);
        let lhs = self.converted(scale);
        let rhs = rhs.converted(scale);
        MediaTime {
            value: lhs.value.saturating_sub(rhs.value),
            timescale: scale,
            epoch: self.epoch,
            flags: TimeFlags::Valid,
        }
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.flags {
            TimeFlags::Valid => write!(f, "{}/{}s", self.value, self.timescale),
            TimeFlags::Invalid => write!(f, "invalid"),
            TimeFlags::Indefinite => write!(f, "indefinite"),
            TimeFlags::PositiveInfinity => write!(f, "+inf"),
            TimeFlags::NegativeInfinity => write!(f, "-inf"),
        }
    }
}

/// A half-open span on the timeline: `[start, start + duration)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaTimeRange {
    pub start: MediaTime,
    pub duration: MediaTime,
}

impl MediaTimeRange {
    pub fn new(start: MediaTime, duration: MediaTime) -> Self {
        Self { start, duration }
    }

    pub fn from_seconds(start: f64, end: f64) -> Self {
        let start = MediaTime::from_seconds(start, DEFAULT_TIMESCALE);
        let end = MediaTime::from_seconds(end, DEFAULT_TIMESCALE);
        Self {
            start,
            duration: end - start,
        }
    }

    pub fn end(&self) -> MediaTime {
        self.start + self.duration
    }

    /// Containment test against the half-open interval.
    pub fn contains(&self, time: MediaTime) -> bool {
        time.compare(&self.start) != Ordering::Less && time.compare(&self.end()) == Ordering::Less
    }
}

//! Packet timestamps and timestamp arithmetic.
//!
//! Every packet flowing through a graph carries a [`Timestamp`], and every
//! stream tracks a timestamp *bound*: the lower limit on the timestamp of any
//! packet that may still arrive. Timestamps form a total order over a bounded
//! integer range plus a handful of sentinel values that mark the edges of a
//! stream's lifetime.

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub};

/// A point on the timestamp axis.
///
/// The representable domain is `MIN..=MAX` plus five sentinels:
///
/// | value | meaning |
/// |---|---|
/// | [`Timestamp::UNSET`] | below everything; the state of an unstamped packet |
/// | [`Timestamp::PRE_STREAM`] | allowed in a stream only as its sole packet, before all regular data |
/// | [`Timestamp::MIN`]..=[`Timestamp::MAX`] | the regular range |
/// | [`Timestamp::POST_STREAM`] | allowed only as a stream's sole packet; end-of-stream-with-value |
/// | [`Timestamp::DONE`] | bound sentinel: the stream is permanently closed |
///
/// Timestamps emitted on a single stream must be strictly increasing; the
/// framework enforces this at the point a packet is added to an output stream.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Below every other value. Initial state; never allowed in a stream.
    pub const UNSET: Timestamp = Timestamp(i64::MIN);
    /// Allowed in a stream only as the sole packet, preceding all regular data.
    pub const PRE_STREAM: Timestamp = Timestamp(i64::MIN + 1);
    /// Smallest regular timestamp.
    pub const MIN: Timestamp = Timestamp(i64::MIN + 2);
    /// Largest regular timestamp.
    pub const MAX: Timestamp = Timestamp(i64::MAX - 2);
    /// Allowed in a stream only as the sole packet; signals end-of-stream-with-value.
    pub const POST_STREAM: Timestamp = Timestamp(i64::MAX - 1);
    /// Upper bound sentinel: the stream is closed and will never carry data again.
    pub const DONE: Timestamp = Timestamp(i64::MAX);

    /// Creates a timestamp from a raw value in the regular range.
    ///
    /// # Panics
    ///
    /// Panics if `value` falls outside `MIN..=MAX`. Sentinels are reached
    /// through the associated constants, never constructed from raw integers.
    pub fn new(value: i64) -> Timestamp {
        let ts = Timestamp(value);
        assert!(
            ts.is_range_value(),
            "timestamp value {value} is outside the regular range"
        );
        ts
    }

    /// The raw underlying value.
    pub fn value(self) -> i64 {
        self.0
    }

    /// True for values in the regular `MIN..=MAX` range.
    pub fn is_range_value(self) -> bool {
        Timestamp::MIN <= self && self <= Timestamp::MAX
    }

    /// True if a packet carrying this timestamp may be added to a stream.
    pub fn is_allowed_in_stream(self) -> bool {
        self.is_range_value() || self == Timestamp::PRE_STREAM || self == Timestamp::POST_STREAM
    }

    /// True for any of the sentinel values.
    pub fn is_special(self) -> bool {
        !self.is_range_value()
    }

    /// The smallest stream-allowed timestamp strictly greater than `self`,
    /// saturating at [`Timestamp::DONE`] when none exists.
    pub fn next_allowed_in_stream(self) -> Timestamp {
        match self {
            Timestamp::UNSET => Timestamp::PRE_STREAM,
            Timestamp::PRE_STREAM => Timestamp::MIN,
            ts if ts.is_range_value() && ts < Timestamp::MAX => Timestamp(ts.0 + 1),
            _ => Timestamp::DONE,
        }
    }

    /// The largest stream-allowed timestamp strictly less than `self`,
    /// saturating at [`Timestamp::PRE_STREAM`]. Used to name the latest fully
    /// settled timestamp below a bound.
    pub fn previous_allowed_in_stream(self) -> Timestamp {
        match self {
            Timestamp::DONE => Timestamp::POST_STREAM,
            Timestamp::POST_STREAM => Timestamp::MAX,
            ts if ts.is_range_value() && ts > Timestamp::MIN => Timestamp(ts.0 - 1),
            _ => Timestamp::PRE_STREAM,
        }
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::UNSET
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Timestamp::UNSET => write!(f, "Timestamp::Unset"),
            Timestamp::PRE_STREAM => write!(f, "Timestamp::PreStream"),
            Timestamp::POST_STREAM => write!(f, "Timestamp::PostStream"),
            Timestamp::DONE => write!(f, "Timestamp::Done"),
            Timestamp(v) => write!(f, "{v}"),
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A signed distance between two timestamps.
///
/// Adding a `TimestampDiff` to a regular timestamp saturates at the domain
/// extremes rather than wrapping; sentinels pass through arithmetic unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimestampDiff(pub i64);

impl From<i64> for TimestampDiff {
    fn from(value: i64) -> Self {
        TimestampDiff(value)
    }
}

impl Neg for TimestampDiff {
    type Output = TimestampDiff;

    fn neg(self) -> TimestampDiff {
        TimestampDiff(-self.0)
    }
}

impl Add<TimestampDiff> for Timestamp {
    type Output = Timestamp;

    fn add(self, diff: TimestampDiff) -> Timestamp {
        if !self.is_range_value() {
            return self;
        }
        let raw = self.0.saturating_add(diff.0);
        Timestamp(raw.clamp(Timestamp::MIN.0, Timestamp::MAX.0))
    }
}

impl AddAssign<TimestampDiff> for Timestamp {
    fn add_assign(&mut self, diff: TimestampDiff) {
        *self = *self + diff;
    }
}

impl Sub<TimestampDiff> for Timestamp {
    type Output = Timestamp;

    fn sub(self, diff: TimestampDiff) -> Timestamp {
        self + TimestampDiff(-diff.0)
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = TimestampDiff;

    /// The distance between two regular timestamps.
    ///
    /// # Panics
    ///
    /// Panics if either operand is a sentinel; distances are only defined on
    /// the regular range.
    fn sub(self, other: Timestamp) -> TimestampDiff {
        assert!(
            self.is_range_value() && other.is_range_value(),
            "timestamp difference is only defined on the regular range ({self} - {other})"
        );
        TimestampDiff(self.0 - other.0)
    }
}

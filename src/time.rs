use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

use serde::{Serialize, Serializer};

const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// Time expressed as `(ticks, timescale)`, as carried in segment indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticks {
    pub ticks: i64,
    pub timescale: u32,
}

impl Ticks {
    pub fn new(ticks: i64, timescale: u32) -> Self {
        Self { ticks, timescale }
    }

    /// Whole milliseconds, truncated.
    pub fn in_millis(&self) -> i64 {
        self.ticks * 1000 / self.timescale as i64
    }
}

/// Scalar media time backed by an integer nanosecond count.
///
/// Absolute positions flow through the whole subsystem as seconds since the
/// Unix epoch. Two positions produced by the same `(ticks, timescale)`
/// arithmetic must compare equal exactly, which plain `f64` does not
/// guarantee over a long playback session. Comparisons against `f64`
/// truncate the float side to the nanosecond base first; there is no
/// epsilon anywhere.
///
/// The conversion from [`Ticks`] is lossy one-way: original tick values
/// cannot be recovered through the float accessors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaTime {
    base: i64,
}

impl MediaTime {
    pub const ZERO: MediaTime = MediaTime { base: 0 };

    /// Construct from seconds, truncating below nanosecond resolution.
    pub fn from_secs_f64(seconds: f64) -> Self {
        Self {
            base: (seconds * NANOS_PER_SEC as f64) as i64,
        }
    }

    /// Seconds as `f64`, for the API boundary only.
    pub fn as_secs_f64(&self) -> f64 {
        self.base as f64 / NANOS_PER_SEC as f64
    }

    /// Whole seconds, truncated.
    pub fn seconds(&self) -> i64 {
        self.base / NANOS_PER_SEC
    }

    /// Whole milliseconds, truncated.
    pub fn milliseconds(&self) -> i64 {
        self.base / NANOS_PER_MILLI
    }

    /// Nearest whole second, rounding half up. Integer-domain `round()`.
    pub fn nearest_second(&self) -> i64 {
        let mut whole = self.seconds();
        let frac = self.base - whole * NANOS_PER_SEC;
        if frac >= NANOS_PER_SEC / 2 {
            whole += 1;
        }
        whole
    }

    pub fn is_zero(&self) -> bool {
        self.base == 0
    }

    pub fn abs(&self) -> f64 {
        self.as_secs_f64().abs()
    }

    pub fn round(&self) -> f64 {
        self.as_secs_f64().round()
    }

    pub fn floor(&self) -> f64 {
        self.as_secs_f64().floor()
    }
}

impl From<f64> for MediaTime {
    fn from(seconds: f64) -> Self {
        Self::from_secs_f64(seconds)
    }
}

impl From<Ticks> for MediaTime {
    fn from(t: Ticks) -> Self {
        // Widen before scaling; 90 kHz tick counts near the epoch would
        // overflow an i64 multiplied by 1e9.
        Self {
            base: (t.ticks as i128 * NANOS_PER_SEC as i128 / t.timescale as i128) as i64,
        }
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_secs_f64())
    }
}

impl Serialize for MediaTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_secs_f64())
    }
}

// Comparisons against raw seconds truncate the float into the base
// timescale, so `t == 0.5` means bit-for-bit equality at nanosecond
// resolution.

impl PartialEq<f64> for MediaTime {
    fn eq(&self, rhs: &f64) -> bool {
        self.base == (rhs * NANOS_PER_SEC as f64) as i64
    }
}

impl PartialEq<MediaTime> for f64 {
    fn eq(&self, rhs: &MediaTime) -> bool {
        rhs == self
    }
}

impl PartialOrd<f64> for MediaTime {
    fn partial_cmp(&self, rhs: &f64) -> Option<std::cmp::Ordering> {
        self.base.partial_cmp(&((rhs * NANOS_PER_SEC as f64) as i64))
    }
}

impl PartialOrd<MediaTime> for f64 {
    fn partial_cmp(&self, rhs: &MediaTime) -> Option<std::cmp::Ordering> {
        ((self * NANOS_PER_SEC as f64) as i64).partial_cmp(&rhs.base)
    }
}

impl Neg for MediaTime {
    type Output = MediaTime;
    fn neg(self) -> MediaTime {
        MediaTime { base: -self.base }
    }
}

impl Add for MediaTime {
    type Output = MediaTime;
    fn add(self, rhs: MediaTime) -> MediaTime {
        MediaTime {
            base: self.base + rhs.base,
        }
    }
}

impl Add<f64> for MediaTime {
    type Output = MediaTime;
    fn add(self, rhs: f64) -> MediaTime {
        self + MediaTime::from_secs_f64(rhs)
    }
}

impl Add<MediaTime> for f64 {
    type Output = MediaTime;
    fn add(self, rhs: MediaTime) -> MediaTime {
        rhs + self
    }
}

impl Sub for MediaTime {
    type Output = MediaTime;
    fn sub(self, rhs: MediaTime) -> MediaTime {
        MediaTime {
            base: self.base - rhs.base,
        }
    }
}

impl Sub<f64> for MediaTime {
    type Output = MediaTime;
    fn sub(self, rhs: f64) -> MediaTime {
        self - MediaTime::from_secs_f64(rhs)
    }
}

impl Sub<MediaTime> for f64 {
    type Output = MediaTime;
    fn sub(self, rhs: MediaTime) -> MediaTime {
        -rhs + self
    }
}

impl AddAssign for MediaTime {
    fn add_assign(&mut self, rhs: MediaTime) {
        self.base += rhs.base;
    }
}

impl AddAssign<f64> for MediaTime {
    fn add_assign(&mut self, rhs: f64) {
        *self = *self + rhs;
    }
}

/// Lets a plain `f64` accumulator absorb a `MediaTime`, reading it back as
/// seconds. Lossy by construction; callers wanting exactness keep the sum
/// in `MediaTime`.
impl AddAssign<MediaTime> for f64 {
    fn add_assign(&mut self, rhs: MediaTime) {
        *self += rhs.as_secs_f64();
    }
}

impl SubAssign for MediaTime {
    fn sub_assign(&mut self, rhs: MediaTime) {
        self.base -= rhs.base;
    }
}

impl SubAssign<f64> for MediaTime {
    fn sub_assign(&mut self, rhs: f64) {
        *self = *self - rhs;
    }
}

impl Mul<f64> for MediaTime {
    type Output = MediaTime;
    fn mul(self, rhs: f64) -> MediaTime {
        MediaTime {
            base: (self.base as f64 * rhs) as i64,
        }
    }
}

impl Div<f64> for MediaTime {
    type Output = MediaTime;
    fn div(self, rhs: f64) -> MediaTime {
        MediaTime {
            base: (self.base as f64 / rhs) as i64,
        }
    }
}

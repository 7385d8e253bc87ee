//! UTC timestamps with 100-nanosecond resolution.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of ticks in one second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Nanoseconds represented by a single tick.
const NANOS_PER_TICK: u128 = 100;

/// A UTC point in time counted in 100 ns ticks since the Unix epoch.
///
/// This is the resolution recorded for a file's last write time. Values
/// before the epoch are negative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UtcTicks(i64);

impl UtcTicks {
    /// Creates a timestamp from a raw tick count.
    pub const fn new(ticks: i64) -> Self {
        Self(ticks)
    }

    /// Returns the raw tick count.
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Converts a [`SystemTime`], truncating to tick resolution.
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(after) => Self((after.as_nanos() / NANOS_PER_TICK) as i64),
            Err(before) => Self(-((before.duration().as_nanos() / NANOS_PER_TICK) as i64)),
        }
    }

    /// Splits the timestamp into whole seconds and sub-second nanoseconds
    /// relative to the Unix epoch, with nanoseconds always non-negative.
    pub fn to_unix_parts(self) -> (i64, u32) {
        let secs = self.0.div_euclid(TICKS_PER_SECOND);
        let nanos = (self.0.rem_euclid(TICKS_PER_SECOND) as u32) * NANOS_PER_TICK as u32;
        (secs, nanos)
    }

    /// Absolute distance between two timestamps.
    pub fn abs_diff(self, other: Self) -> Duration {
        let ticks = self.0.abs_diff(other.0);
        Duration::from_nanos(ticks.saturating_mul(NANOS_PER_TICK as u64))
    }
}

impl fmt::Display for UtcTicks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (secs, nanos) = self.to_unix_parts();
        write!(f, "{secs}.{:07}s", nanos / NANOS_PER_TICK as u32)
    }
}

use std::{fmt, ops::Add, time::Duration};

use rand::Rng;
use tokio::time::Instant;

/*
    Correct clocks are synchronized: at any real time t, the readings of any
    two correct clocks differ by at most ε (the maximum clock synchronization
    error). We model each processor's clock as real time plus a fixed offset
    drawn once from [-ε/2, +ε/2), so every correct clock stays within ε/2 of
    real time and within ε of every other correct clock.

    Real time is the Tokio clock measured from the channel's origin, which
    lets tests pause and advance it deterministically.
*/

/// A reading of a processor's local clock, in seconds since the channel origin.
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug, Default)]
pub struct Timestamp(f64);

impl Timestamp {
    pub fn from_secs(secs: f64) -> Self {
        Timestamp(secs)
    }

    pub fn as_secs(&self) -> f64 {
        self.0
    }

    pub fn max(self, other: Timestamp) -> Timestamp {
        Timestamp(self.0.max(other.0))
    }

    /// Time from `self` until `later`, zero if `later` is not in the future.
    pub fn saturating_duration_until(&self, later: Timestamp) -> Duration {
        let secs = later.0 - self.0;
        if secs.is_finite() && secs > 0.0 {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        }
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs.as_secs_f64())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct Clock {
    origin: Instant,
    offset: f64,
}

impl Clock {
    pub fn new(origin: Instant, offset: f64) -> Self {
        Clock { origin, offset }
    }

    /// Samples a fixed offset uniformly from `[-max_sync_error/2, +max_sync_error/2)`.
    pub fn with_skew<R: Rng + ?Sized>(origin: Instant, max_sync_error: Duration, rng: &mut R) -> Self {
        let half = max_sync_error.as_secs_f64() / 2.0;
        let offset = if half > 0.0 {
            rng.gen_range(-half..half)
        } else {
            0.0
        };
        Clock { origin, offset }
    }

    pub fn now(&self) -> Timestamp {
        Timestamp(self.origin.elapsed().as_secs_f64() + self.offset)
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }
}

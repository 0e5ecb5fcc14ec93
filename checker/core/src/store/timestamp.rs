// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::Instant;

use parking_lot::Mutex;

/// Stamp of one persistent commit. The high 48 bits count seconds since the
/// analysis started, the low 16 bits distinguish commits within a second.
/// If more than 2^16 commits land in one second the second is bumped early.
pub type TimeStamp = u64;

pub type TimeSeconds = u64;

pub fn time_stamp_to_seconds(stamp: TimeStamp) -> TimeSeconds {
    stamp >> 16
}

pub fn time_seconds_to_stamp(seconds: TimeSeconds) -> TimeStamp {
    seconds << 16
}

/// The stamp `delta` seconds before `stamp`, saturating at zero.
pub fn time_stamp_delta_before(stamp: TimeStamp, delta: TimeSeconds) -> TimeStamp {
    time_seconds_to_stamp(time_stamp_to_seconds(stamp).saturating_sub(delta))
}

/// Monotonic stamp source for one backend. Never returns zero, and each
/// call returns a strictly larger stamp than the one before.
pub struct TimeStampGenerator {
    start: Instant,
    last: Mutex<TimeStamp>,
}

impl TimeStampGenerator {
    pub fn new() -> TimeStampGenerator {
        TimeStampGenerator {
            start: Instant::now(),
            last: Mutex::new(0),
        }
    }

    pub fn advance(&self) -> TimeStamp {
        let mut last = self.last.lock();
        let seconds = self.start.elapsed().as_secs();
        let candidate = time_seconds_to_stamp(seconds).max(*last + 1);
        *last = candidate;
        candidate
    }
}

impl Default for TimeStampGenerator {
    fn default() -> Self {
        TimeStampGenerator::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stamps_strictly_increase() {
        let generator = TimeStampGenerator::new();
        let mut prev = 0;
        for _ in 0..1000 {
            let stamp = generator.advance();
            assert!(stamp > prev);
            prev = stamp;
        }
    }

    #[test]
    fn test_delta_before_saturates() {
        let stamp = time_seconds_to_stamp(5) | 7;
        assert_eq!(time_stamp_delta_before(stamp, 2), time_seconds_to_stamp(3));
        assert_eq!(time_stamp_delta_before(stamp, 100), 0);
    }
}

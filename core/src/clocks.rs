// PQWork
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Sources of time for job timestamps.

use std::time::Duration;
use time::OffsetDateTime;

/// Truncates `ts` to microsecond resolution, which is what PostgreSQL timestamps can hold.
fn truncate_to_micros(ts: OffsetDateTime) -> OffsetDateTime {
    let nanos = ts.unix_timestamp_nanos() / 1000 * 1000;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .expect("Truncating a valid timestamp cannot take it out of range")
}

/// Generic definition of a clock.
pub trait Clock: Send + Sync {
    /// Returns the current UTC time.
    fn now_utc(&self) -> OffsetDateTime;

    /// Returns the time at which `delay` will have elapsed from now.
    fn now_plus(&self, delay: Duration) -> OffsetDateTime {
        self.now_utc() + delay
    }
}

/// Clock implementation that uses the system clock.
///
/// Timestamps are truncated to microseconds so that values written to and read back from the
/// database compare equal.
#[derive(Clone, Default)]
pub struct SystemClock {}

impl Clock for SystemClock {
    fn now_utc(&self) -> OffsetDateTime {
        truncate_to_micros(OffsetDateTime::now_utc())
    }
}

/// Test utilities.
#[cfg(any(test, feature = "testutils"))]
pub mod testutils {
    use super::*;
    use std::sync::Mutex;

    /// A clock that only moves when told to, which lets tests step across retention windows and
    /// stale-claim thresholds.
    pub struct SettableClock {
        /// Current fake time.
        now: Mutex<OffsetDateTime>,
    }

    impl SettableClock {
        /// Creates a new clock that returns `now` until reconfigured.
        pub fn new(now: OffsetDateTime) -> Self {
            assert_eq!(now, truncate_to_micros(now), "Nanosecond precision not supported");
            Self { now: Mutex::new(now) }
        }

        /// Sets the new value of `now` that the clock returns.
        pub fn set(&self, now: OffsetDateTime) {
            assert_eq!(now, truncate_to_micros(now), "Nanosecond precision not supported");
            *self.now.lock().unwrap() = now;
        }

        /// Advances the current time by `delta`.
        pub fn advance(&self, delta: Duration) {
            assert_eq!(0, delta.as_nanos() % 1000, "Nanosecond precision not supported");
            let mut now = self.now.lock().unwrap();
            *now += delta;
        }
    }

    impl Clock for SettableClock {
        fn now_utc(&self) -> OffsetDateTime {
            *self.now.lock().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutils::SettableClock;
    use super::*;
    use std::panic::catch_unwind;
    use time::macros::datetime;

    #[test]
    fn test_systemclock_is_monotonic_enough() {
        let clock = SystemClock::default();
        let now1 = clock.now_utc();
        let now2 = clock.now_utc();
        assert!(now2 >= now1);
    }

    #[test]
    fn test_systemclock_microsecond_resolution() {
        let clock = SystemClock::default();
        assert_eq!(0, clock.now_utc().nanosecond() % 1000);
    }

    #[test]
    fn test_now_plus() {
        let clock = SettableClock::new(datetime!(2023-12-01 10:15:00 UTC));
        assert_eq!(
            datetime!(2023-12-01 10:20:00 UTC),
            clock.now_plus(Duration::from_secs(5 * 60))
        );
    }

    #[test]
    fn test_settableclock_set_and_advance() {
        let clock = SettableClock::new(datetime!(2023-12-01 10:15:00.123456 UTC));
        assert_eq!(datetime!(2023-12-01 10:15:00.123456 UTC), clock.now_utc());

        clock.set(datetime!(2023-12-01 10:15:00.987654 UTC));
        clock.advance(Duration::from_micros(1));
        assert_eq!(datetime!(2023-12-01 10:15:00.987655 UTC), clock.now_utc());
    }

    #[test]
    fn test_settableclock_rejects_nanoseconds() {
        catch_unwind(|| {
            SettableClock::new(datetime!(2023-12-01 10:20:00.123456001 UTC));
        })
        .unwrap_err();

        let clock = SettableClock::new(datetime!(2023-12-01 10:20:00 UTC));
        catch_unwind(|| clock.advance(Duration::from_nanos(1))).unwrap_err();
    }

    #[test]
    fn test_settableclock_now_plus_follows_advance() {
        let clock = SettableClock::new(datetime!(2023-12-01 10:40:00 UTC));
        assert_eq!(datetime!(2023-12-01 10:45:00 UTC), clock.now_plus(Duration::from_secs(300)));

        clock.advance(Duration::from_secs(3600));
        assert_eq!(datetime!(2023-12-01 11:45:00 UTC), clock.now_plus(Duration::from_secs(300)));
    }
}

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Wall-clock source. Injected so that every time-dependent path
/// (token lifetimes, code expiry, modification stamps) is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// UUID source, injected for the same reason.
pub trait IdSource: Send + Sync {
    fn new_id(&self) -> Uuid;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct RandomIds;

impl IdSource for RandomIds {
    fn new_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Epoch seconds as the wire protocol carries them.
pub fn epoch_secs(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
pub mod test_support {
    use std::sync::atomic::{AtomicI64, Ordering};

    use chrono::TimeZone;

    use super::*;

    /// Clock pinned to a fixed instant, advanceable by tests.
    pub struct FixedClock {
        epoch: AtomicI64,
    }

    impl FixedClock {
        pub fn at(secs: i64) -> Self {
            FixedClock {
                epoch: AtomicI64::new(secs),
            }
        }

        pub fn advance(&self, secs: i64) {
            self.epoch.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            Utc.timestamp_opt(self.epoch.load(Ordering::SeqCst), 0)
                .unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FixedClock;
    use super::*;

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::at(1_700_000_000);
        let before = clock.now();
        clock.advance(90);
        assert_eq!((clock.now() - before).num_seconds(), 90);
    }

    #[test]
    fn epoch_secs_keeps_millis() {
        let clock = FixedClock::at(1_700_000_000);
        assert_eq!(epoch_secs(clock.now()), 1_700_000_000.0);
    }
}

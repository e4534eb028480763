// Veritas Trust Engine: Clock and ID Injection
// Time and identifier generation are injected so evaluation is deterministic
// under test; business logic never calls Utc::now() or Uuid::new_v4() directly.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self, prefix: &str) -> String;
}

// Production clock backed by the system time
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// Production ID generator backed by UUID v4
#[derive(Clone, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, Uuid::new_v4())
    }
}

// Manually advanced clock for tests
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// Sequential generator for deterministic IDs in tests
pub struct SequentialIdGenerator {
    counter: Mutex<u64>,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        SequentialIdGenerator {
            counter: Mutex::new(0),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self, prefix: &str) -> String {
        let mut counter = self.counter.lock();
        *counter += 1;
        format!("{}_{}", prefix, counter)
    }
}

pub type SharedClock = Arc<dyn Clock>;
pub type SharedIdGenerator = Arc<dyn IdGenerator>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIdGenerator::new();
        assert_eq!(ids.next_id("risk"), "risk_1");
        assert_eq!(ids.next_id("risk"), "risk_2");
        assert_eq!(ids.next_id("event"), "event_3");
    }

    #[test]
    fn test_uuid_ids_are_prefixed_and_unique() {
        let ids = UuidIdGenerator;
        let a = ids.next_id("dev");
        let b = ids.next_id("dev");
        assert!(a.starts_with("dev_"));
        assert_ne!(a, b);
    }
}

//! Monotonic-ish millisecond timestamps and opaque id generation.
//!
//! Every timestamp in the store is a wall-clock millisecond integer rather
//! than an `Instant`-plus-`DateTime` dual-clock scheme: the durable and
//! file backends persist `lease_expires_at` directly, so there is nothing
//! to reconstruct on load and no serde-skip field to repopulate.

use chrono::Utc;
use uuid::Uuid;

/// Abstracts "now" and "a fresh id" so tests can inject determinism.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
    fn new_id(&self) -> String;
}

/// The real clock: wall time plus random v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

    /// A clock whose `now_ms()` is set explicitly and whose ids are
    /// sequential, for deterministic property and scenario tests.
    pub struct FakeClock {
        now: AtomicI64,
        seq: AtomicU64,
    }

    impl FakeClock {
        pub fn new(start_ms: i64) -> Self {
            Self {
                now: AtomicI64::new(start_ms),
                seq: AtomicU64::new(0),
            }
        }

        pub fn advance_ms(&self, delta: i64) {
            self.now.fetch_add(delta, Ordering::SeqCst);
        }

        pub fn set_ms(&self, value: i64) {
            self.now.store(value, Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now_ms(&self) -> i64 {
            self.now.load(Ordering::SeqCst)
        }

        fn new_id(&self) -> String {
            format!("fake-{:08}", self.seq.fetch_add(1, Ordering::SeqCst))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeClock;
    use super::*;

    #[test]
    fn system_clock_produces_unique_ids() {
        let clock = SystemClock;
        let a = clock.new_id();
        let b = clock.new_id();
        assert_ne!(a, b);
    }

    #[test]
    fn fake_clock_advances_deterministically() {
        let clock = FakeClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance_ms(500);
        assert_eq!(clock.now_ms(), 1_500);
        assert_eq!(clock.new_id(), "fake-00000000");
        assert_eq!(clock.new_id(), "fake-00000001");
    }
}

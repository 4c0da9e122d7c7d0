//! Monotonically-refilling token bucket used to rate-limit bytes read off
//! the replication socket (spec.md §3 "Token bucket", §4.3).

use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct Inner {
    current: f64,
    last_time: Instant,
}

/// `{burst, current, max_rate, refill_interval, last_time}` from spec.md §3.
/// `consume` never blocks; callers spin-sleep on a miss themselves (per
/// §4.3, 500ms), which keeps this type synchronous and cheap to share.
pub struct TokenBucket {
    burst: f64,
    max_rate: f64,
    refill_interval: Duration,
    inner: Mutex<Inner>,
}

impl TokenBucket {
    pub fn new(burst: u64, max_rate: u64, refill_interval: Duration) -> Self {
        TokenBucket {
            burst: burst as f64,
            max_rate: max_rate as f64,
            refill_interval,
            inner: Mutex::new(Inner {
                current: burst as f64,
                last_time: Instant::now(),
            }),
        }
    }

    fn refill(&self, inner: &mut Inner) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(inner.last_time);
        if elapsed >= self.refill_interval {
            let periods = elapsed.as_secs_f64() / self.refill_interval.as_secs_f64();
            let refilled = periods * (self.max_rate / self.refill_interval.as_secs_f64())
                * self.refill_interval.as_secs_f64();
            inner.current = (inner.current + refilled).min(self.burst);
            inner.last_time = now;
        }
    }

    /// Attempts to consume `n` tokens. Returns `true` on success, `false`
    /// if the caller should retry later (spec.md §4.3: "spin-sleep 500ms
    /// when starved").
    pub fn consume(&self, n: u64) -> bool {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        if inner.current >= n as f64 {
            inner.current -= n as f64;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_respects_burst_and_refills() {
        let bucket = TokenBucket::new(100, 100, Duration::from_millis(10));
        assert!(bucket.consume(100));
        // Exhausted immediately after burst.
        assert!(!bucket.consume(1));
        std::thread::sleep(Duration::from_millis(50));
        assert!(bucket.consume(1));
    }
}

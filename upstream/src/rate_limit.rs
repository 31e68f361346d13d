use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Global minimum-interval gate for upstream requests.
///
/// A single atomic "next allowed at" timestamp is advanced with CAS, so the
/// interval cannot be punched through under concurrency. Callers are spaced
/// by at least the interval but are not served in FIFO order.
pub struct RateLimiter {
    interval: Duration,
    anchor: Instant,
    next_allowed_at: AtomicU64,
}

impl RateLimiter {
    pub fn new(interval_ms: u64) -> Self {
        RateLimiter {
            interval: Duration::from_millis(interval_ms),
            anchor: Instant::now(),
            next_allowed_at: AtomicU64::new(0),
        }
    }

    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        let interval = self.interval.as_nanos() as u64;
        loop {
            let now = self.anchor.elapsed().as_nanos() as u64;
            let prev = self.next_allowed_at.load(Ordering::Acquire);
            let start = now.max(prev);
            if self
                .next_allowed_at
                .compare_exchange(prev, start + interval, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if start > now {
                    tokio::time::sleep(Duration::from_nanos(start - now)).await;
                }
                return;
            }
        }
    }
}

use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Per-session bandwidth ceiling. Holds at most one second worth of burst.
pub(crate) struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last: Instant,
}

impl TokenBucket {
    /// A bucket refilling at `bytes_per_sec`, or `None` when throttling is off.
    pub(crate) fn per_second(bytes_per_sec: u64) -> Option<Self> {
        (bytes_per_sec > 0).then(|| {
            let rate = bytes_per_sec as f64;
            TokenBucket {
                capacity: rate,
                tokens: rate,
                refill_rate: rate,
                last: Instant::now(),
            }
        })
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last = now;
    }

    /// Wait until `amount` bytes may be sent. Amounts above the capacity are
    /// paid off in capacity-sized steps.
    pub(crate) async fn consume(&mut self, amount: usize) {
        let mut owed = amount as f64;
        while owed > 0.0 {
            let step = owed.min(self.capacity);
            loop {
                self.refill();
                if self.tokens >= step {
                    self.tokens -= step;
                    break;
                }
                let wait = (step - self.tokens) / self.refill_rate;
                sleep(Duration::from_secs_f64(wait)).await;
            }
            owed -= step;
        }
    }
}

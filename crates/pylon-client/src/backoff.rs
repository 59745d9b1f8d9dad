use std::time::Duration;

/// Jitter fraction applied to each delay (±10 %).
const JITTER_FRACTION: f64 = 0.10;

/// Exponential reconnect schedule: base → 2·base → … → cap, with jitter.
/// Reset to the floor on any clean connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Delay for the next attempt; doubles the schedule for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current + jitter(self.current);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60))
    }
}

/// Jitter offset (0 … `JITTER_FRACTION * base`) derived from the current
/// clock nanos, avoiding a rand dependency.
fn jitter(base: Duration) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    let max_jitter = (base.as_millis() as f64 * JITTER_FRACTION) as u64;
    if max_jitter == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis((nanos as u64) % max_jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within_jitter(delay: Duration, expected: Duration) -> bool {
        let upper = expected + Duration::from_millis(
            (expected.as_millis() as f64 * JITTER_FRACTION) as u64,
        );
        delay >= expected && delay <= upper
    }

    #[test]
    fn schedule_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(10));
        assert!(within_jitter(backoff.next_delay(), Duration::from_secs(2)));
        assert!(within_jitter(backoff.next_delay(), Duration::from_secs(4)));
        assert!(within_jitter(backoff.next_delay(), Duration::from_secs(8)));
        // capped
        assert!(within_jitter(backoff.next_delay(), Duration::from_secs(10)));
        assert!(within_jitter(backoff.next_delay(), Duration::from_secs(10)));
    }

    #[test]
    fn reset_returns_to_floor() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert!(within_jitter(backoff.next_delay(), Duration::from_secs(2)));
    }
}

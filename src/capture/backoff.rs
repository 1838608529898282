use std::time::Duration;

/// Capped exponential backoff: `base`, `2*base`, `4*base`, ... up to `max`.
///
/// The attempt counter grows with each `next_delay` and is cleared by
/// `reset` after a successful connect.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    /// Delay for the given 1-based attempt; attempt 0 is treated as 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = 2u32.saturating_pow(exp);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Count one more failure and return how long to wait.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay_for(self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_doubles_then_caps() {
        let mut backoff = Backoff::from_millis(1_000, 30_000);
        let secs: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(backoff.attempt(), 8);
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = Backoff::from_millis(1_000, 30_000);
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempt_counts_stay_capped() {
        let backoff = Backoff::from_millis(1_000, 60_000);
        assert_eq!(backoff.delay_for(200), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
    }

    #[test]
    fn max_below_base_is_raised_to_base() {
        let backoff = Backoff::from_millis(5_000, 1_000);
        assert_eq!(backoff.max(), Duration::from_secs(5));
    }
}

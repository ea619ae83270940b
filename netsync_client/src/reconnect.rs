//! Exponential backoff after server-initiated disconnects.
//!
//! Ordinary link loss is retried by the transport itself; this policy only
//! runs when the server closed the session on purpose.

use std::time::Duration;

use netsync_shared::config::ReconnectSettings;

/// Raised when the attempt budget is spent. Only a manual refresh recovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("gave up after {attempts} reconnection attempts, refresh required")]
pub struct ReconnectExhausted {
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max_delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(settings: &ReconnectSettings) -> Self {
        Self {
            base: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            max_attempts: settings.max_attempts,
            attempts: 0,
        }
    }

    /// Delay before attempt `n` (1-indexed): `min(2^(n-1) * base, max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Claims the next attempt and returns how long to wait before it.
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectExhausted> {
        if self.attempts >= self.max_attempts {
            return Err(ReconnectExhausted {
                attempts: self.attempts,
            });
        }
        self.attempts += 1;
        Ok(self.delay_for(self.attempts))
    }

    /// Attempts claimed since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A reconnection cycle is underway.
    pub fn is_active(&self) -> bool {
        self.attempts > 0
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(&ReconnectSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(d: Duration) -> u64 {
        d.as_millis() as u64
    }

    #[test]
    fn doubles_from_one_second() {
        let mut policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..5).map(|_| ms(policy.next_delay().unwrap())).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn caps_at_thirty_seconds() {
        let policy = ReconnectPolicy::default();
        assert_eq!(ms(policy.delay_for(6)), 30_000);
        assert_eq!(ms(policy.delay_for(15)), 30_000);
        assert_eq!(ms(policy.delay_for(40)), 30_000);
    }

    #[test]
    fn sixteenth_attempt_is_rejected() {
        let mut policy = ReconnectPolicy::default();
        for _ in 0..15 {
            policy.next_delay().unwrap();
        }
        let err = policy.next_delay().unwrap_err();
        assert_eq!(err.attempts, 15);
        assert!(err.to_string().contains("refresh required"));
        // Still rejected on further calls.
        assert!(policy.next_delay().is_err());
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut policy = ReconnectPolicy::default();
        policy.next_delay().unwrap();
        policy.next_delay().unwrap();
        assert_eq!(policy.attempts(), 2);
        policy.reset();
        assert!(!policy.is_active());
        assert_eq!(ms(policy.next_delay().unwrap()), 1000);
    }
}

//! Linear backoff for reconnection

use std::time::Duration;

use ew_core::config::ReconnectConfig;

/// Linear backoff: retry `n` waits `base * n`, up to `max_attempts` retries
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    /// Delay unit
    base: Duration,
    /// Retries allowed before giving up
    max_attempts: u32,
    /// Retries scheduled since the last reset
    attempt: u32,
}

impl LinearBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.base_delay, config.max_attempts)
    }

    /// Create a new backoff with custom parameters
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempt: 0,
        }
    }

    /// Get the next delay and advance, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.base.saturating_mul(self.attempt))
    }

    /// Retries scheduled since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Start counting from zero again
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_linearly() {
        let mut backoff = LinearBackoff::new(Duration::from_millis(500), 5);

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1000)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1500)));
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn test_backoff_exhausts() {
        let mut backoff = LinearBackoff::new(Duration::from_secs(1), 2);

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let mut backoff = LinearBackoff::from_config(&ReconnectConfig {
            enabled: true,
            base_delay: Duration::from_secs(1),
            max_attempts: 0,
        });
        assert_eq!(backoff.next_delay(), None);
    }
}

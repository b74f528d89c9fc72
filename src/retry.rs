use std::time::Duration;

/// Bounded-attempt policy shared by the upload client (network retries with
/// exponential backoff) and the health monitor (sensor restart cap).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
        }
    }

    /// Network upload: 3 attempts total, backing off 1s / 2s between them.
    pub const fn upload() -> Self {
        Self::new(3, Duration::from_secs(1))
    }

    /// Sensor restarts: 5 attempts, no sleeping between health checks.
    pub const fn sensor_restart() -> Self {
        Self::new(5, Duration::ZERO)
    }

    /// Delay to wait after the given zero-based failed attempt: base * 2^n.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt)
    }

    pub fn is_exhausted(&self, attempts_made: u32) -> bool {
        attempts_made >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_backoff_doubles_from_one_second() {
        let policy = RetryPolicy::upload();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn exhaustion_boundaries() {
        let policy = RetryPolicy::upload();
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));

        let restarts = RetryPolicy::sensor_restart();
        assert!(!restarts.is_exhausted(4));
        assert!(restarts.is_exhausted(5));
    }
}

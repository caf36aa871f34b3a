use std::time::Duration;

use probe_core::config::RetryConfig;
use uuid::Uuid;

/// Message fragments that mark an error as worth another attempt.
const TRANSIENT_MARKERS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "429",
    "502",
    "503",
    "504",
    "socket",
    "connection",
    "econnreset",
    "econnrefused",
    "etimedout",
    "enotfound",
    "overloaded",
    "temporarily unavailable",
    "service unavailable",
    "bad gateway",
];

/// Heuristic transient-error check on a rendered error message.
pub fn is_transient_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Attempt budget and backoff schedule for one scenario.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            attempts: config.retries.max(1),
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            factor: config.factor,
            jitter: config.jitter,
        }
    }

    /// No waiting between attempts.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
            jitter: false,
        }
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }

    /// Delay after failed attempt number `attempt` (1-based).
    ///
    /// `initial * factor^(attempt-1)`, capped at `max_delay`; with jitter the
    /// result is scaled into 50-100% of that value.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_millis() as f64 * self.factor.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64).max(0.0);
        let ms = if self.jitter {
            capped * (0.5 + unit_random() * 0.5)
        } else {
            capped
        };
        Duration::from_millis(ms as u64)
    }

    /// Like [`delay_for`](Self::delay_for), but never shorter than a
    /// server-provided retry-after hint.
    pub fn delay_with_hint(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay_for(attempt);
        match retry_after {
            Some(hint) if hint > delay => hint,
            _ => delay,
        }
    }
}

/// Uniform value in [0, 1) from the top 48 bits of a v4 uuid, which hold
/// no version or variant bits.
fn unit_random() -> f64 {
    let bits = (Uuid::new_v4().as_u128() >> 80) as u64;
    bits as f64 / (1u64 << 48) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy {
            attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn transient_heuristics() {
        assert!(is_transient_message("HTTP error: connection reset by peer"));
        assert!(is_transient_message("API error (503): Service Unavailable"));
        assert!(is_transient_message("rate limited: retry after Some(3)s"));
        assert!(is_transient_message("read ECONNRESET"));
        assert!(!is_transient_message("model produced no final answer"));
        assert!(!is_transient_message("provider not configured: ANTHROPIC_API_KEY"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = policy(false);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(10), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_in_range() {
        let p = policy(true);
        for _ in 0..200 {
            let d = p.delay_for(2);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[test]
    fn retry_after_hint_is_a_floor() {
        let p = policy(false);
        assert_eq!(
            p.delay_with_hint(1, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(
            p.delay_with_hint(3, Some(Duration::from_millis(10))),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn attempts_are_total() {
        let p = RetryPolicy::immediate(3);
        assert!(p.has_attempts_left(1));
        assert!(p.has_attempts_left(2));
        assert!(!p.has_attempts_left(3));
        assert_eq!(RetryPolicy::immediate(0).attempts, 1);
    }
}

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::sync::lock;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffOptions {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// A failure older than this no longer escalates the delay.
    pub cooldown: Duration,
    pub multiplier: f64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            cooldown: Duration::from_secs(21),
            multiplier: 2.0,
        }
    }
}

impl BackoffOptions {
    pub fn validate(&self) -> Result<()> {
        if self.initial_delay.is_zero() {
            return Err(Error::Config("initial delay must be > 0".to_owned()));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::Config(
                "max delay must be >= initial delay".to_owned(),
            ));
        }
        if self.cooldown.is_zero() {
            return Err(Error::Config("cooldown must be > 0".to_owned()));
        }
        if self.multiplier.is_nan() || self.multiplier <= 1.0 {
            return Err(Error::Config("multiplier must be > 1.0".to_owned()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BackoffState {
    failures: u32,
    last_failure: Option<Instant>,
}

/// Reconnect pacing driven by consecutive failures.
///
/// The delay after `n` failures is `initial * multiplier^(n-1)`, capped at
/// `max_delay` and measured from the last failure. Shareable between threads.
#[derive(Debug)]
pub struct ExponentialBackoff {
    options: BackoffOptions,
    state: Mutex<BackoffState>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            options: BackoffOptions::default(),
            state: Mutex::new(BackoffState::default()),
        }
    }
}

impl ExponentialBackoff {
    pub fn new(options: BackoffOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            state: Mutex::new(BackoffState::default()),
        })
    }

    pub fn options(&self) -> &BackoffOptions {
        &self.options
    }

    pub fn register_failure(&self) {
        self.register_failure_at(Instant::now());
    }

    pub fn register_failure_at(&self, now: Instant) {
        let mut state = lock(&self.state);
        if let Some(last) = state.last_failure {
            if now.saturating_duration_since(last) >= self.options.cooldown {
                state.failures = 0;
            }
        }
        state.failures = state.failures.saturating_add(1);
        state.last_failure = Some(now);
    }

    pub fn register_success(&self) {
        let mut state = lock(&self.state);
        state.failures = 0;
        state.last_failure = None;
    }

    pub fn failures(&self) -> u32 {
        lock(&self.state).failures
    }

    /// Time left until the next attempt may be made. Zero means now.
    pub fn next_attempt_delay(&self, now: Instant) -> Duration {
        let state = lock(&self.state);
        let Some(last) = state.last_failure else {
            return Duration::ZERO;
        };
        if state.failures == 0 {
            return Duration::ZERO;
        }

        let failures = if now.saturating_duration_since(last) >= self.options.cooldown {
            1
        } else {
            state.failures
        };

        let delay = self.delay_for(failures);
        delay.saturating_sub(now.saturating_duration_since(last))
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.options.initial_delay.as_secs_f64() * self.options.multiplier.powi(exponent);
        let capped = scaled.min(self.options.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.options.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> BackoffOptions {
        BackoffOptions {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            cooldown: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }

    // ==================== Configuration tests ====================

    /// Each invalid parameter is rejected at construction
    #[test]
    fn invalid_options_are_rejected() {
        let bad = [
            BackoffOptions {
                initial_delay: Duration::ZERO,
                ..options()
            },
            BackoffOptions {
                max_delay: Duration::from_millis(500),
                ..options()
            },
            BackoffOptions {
                cooldown: Duration::ZERO,
                ..options()
            },
            BackoffOptions {
                multiplier: 1.0,
                ..options()
            },
            BackoffOptions {
                multiplier: f64::NAN,
                ..options()
            },
        ];

        for opts in bad {
            assert!(
                matches!(ExponentialBackoff::new(opts), Err(Error::Config(_))),
                "{opts:?} should be rejected"
            );
        }
        assert!(ExponentialBackoff::new(options()).is_ok());
    }

    // ==================== Delay tests ====================

    /// No failures means try immediately
    #[test]
    fn fresh_backoff_has_no_delay() {
        let backoff = ExponentialBackoff::new(options()).unwrap();
        assert_eq!(backoff.next_attempt_delay(Instant::now()), Duration::ZERO);
    }

    /// Consecutive failures never shrink the delay and stop at the cap
    #[test]
    fn delays_grow_monotonically_to_cap() {
        let backoff = ExponentialBackoff::new(options()).unwrap();
        let now = Instant::now();

        let mut previous = Duration::ZERO;
        let mut seen = Vec::new();
        for _ in 0..10 {
            backoff.register_failure_at(now);
            let delay = backoff.next_attempt_delay(now);
            assert!(delay >= previous);
            assert!(delay <= options().max_delay);
            previous = delay;
            seen.push(delay.as_secs());
        }

        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);
    }

    /// Remaining delay shrinks as time passes since the failure
    #[test]
    fn delay_counts_down_from_last_failure() {
        let backoff = ExponentialBackoff::new(options()).unwrap();
        let now = Instant::now();
        backoff.register_failure_at(now);
        backoff.register_failure_at(now);

        assert_eq!(
            backoff.next_attempt_delay(now + Duration::from_millis(500)),
            Duration::from_millis(1500)
        );
        assert_eq!(
            backoff.next_attempt_delay(now + Duration::from_secs(5)),
            Duration::ZERO
        );
    }

    /// A success resets escalation to the first step
    #[test]
    fn success_resets_escalation() {
        let backoff = ExponentialBackoff::new(options()).unwrap();
        let now = Instant::now();
        for _ in 0..4 {
            backoff.register_failure_at(now);
        }
        backoff.register_success();
        assert_eq!(backoff.next_attempt_delay(now), Duration::ZERO);

        backoff.register_failure_at(now);
        assert_eq!(backoff.next_attempt_delay(now), options().initial_delay);
    }

    /// An unbounded cap saturates instead of overflowing
    #[test]
    fn huge_cap_saturates() {
        let backoff = ExponentialBackoff::new(BackoffOptions {
            max_delay: Duration::MAX,
            cooldown: Duration::MAX,
            ..options()
        })
        .unwrap();
        let now = Instant::now();
        for _ in 0..2000 {
            backoff.register_failure_at(now);
        }
        assert_eq!(backoff.next_attempt_delay(now), Duration::MAX);
    }

    /// Once the cooldown has passed the next failure starts over
    #[test]
    fn cooldown_resets_escalation() {
        let backoff = ExponentialBackoff::new(options()).unwrap();
        let start = Instant::now();
        for _ in 0..5 {
            backoff.register_failure_at(start);
        }

        let later = start + options().cooldown;
        backoff.register_failure_at(later);
        assert_eq!(backoff.failures(), 1);
        assert_eq!(backoff.next_attempt_delay(later), options().initial_delay);
    }

    /// Concurrent failures are all counted
    #[test]
    fn concurrent_failures_are_counted() {
        let backoff = std::sync::Arc::new(ExponentialBackoff::new(options()).unwrap());
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let backoff = backoff.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        backoff.register_failure_at(now);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(backoff.failures(), 800);
        assert_eq!(backoff.next_attempt_delay(now), options().max_delay);
    }
}

use rand::Rng;
use std::time::Duration;

/// Delay shape between queue-consumer attempts for one destination.
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

/// Per-destination retry policy. `max_attempts` counts every attempt for an
/// item, including the inline first attempt; `None` retries without bound.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: Option<u32>, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
            jitter: 0.0,
        }
    }

    pub fn exponential(
        max_attempts: Option<u32>,
        initial: Duration,
        max: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial,
                max: max.max(initial),
                multiplier,
            },
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Whether the policy still permits the attempt with the given 1-based
    /// number.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        match self.max_attempts {
            None => true,
            Some(limit) => attempt <= limit,
        }
    }

    /// Delay slept before the given attempt. The first retry is attempt 2 and
    /// waits the initial delay; later attempts grow per the backoff shape.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let base = match &self.backoff {
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(2).min(32);
                let scaled = initial.as_secs_f64() * multiplier.powi(exponent as i32);
                Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
            }
        };
        apply_jitter(base, self.jitter)
    }
}

fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || delay.is_zero() {
        return delay;
    }
    let fraction = fraction.clamp(0.0, 1.0);
    let base = delay.as_secs_f64();
    let sample = rand::thread_rng().gen_range(base * (1.0 - fraction)..=base * (1.0 + fraction));
    Duration::from_secs_f64(sample)
}

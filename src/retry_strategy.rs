use crate::config::{RetryStrategyConfig, StrategyType};
use rand::{thread_rng, Rng};
use std::ops::Mul;
use std::time::Duration;

/// Back-off schedule between attempts of a retried store call.
pub trait RetryStrategy: Send + Sync {
    /// Delay before retry number `attempt` (0-based).
    fn delay(&self, attempt: usize) -> Duration;
}

pub struct FixedDelayStrategy {
    pub delay_duration: Duration,
}

impl RetryStrategy for FixedDelayStrategy {
    fn delay(&self, _attempt: usize) -> Duration {
        self.delay_duration
    }
}

pub struct ExponentialBackoffStrategy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryStrategy for ExponentialBackoffStrategy {
    fn delay(&self, attempt: usize) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(u32::MAX as usize) as u32);
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        std::cmp::min(delay, self.max_delay)
    }
}

pub struct LinearBackoffStrategy {
    pub initial_delay: Duration,
    pub increment: Duration,
    pub max_delay: Duration,
}

impl RetryStrategy for LinearBackoffStrategy {
    fn delay(&self, attempt: usize) -> Duration {
        let delay = if attempt == 0 {
            self.initial_delay
        } else {
            self.initial_delay + self.increment.mul(attempt as u32)
        };
        std::cmp::min(delay, self.max_delay)
    }
}

pub struct RandomDelayStrategy {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryStrategy for RandomDelayStrategy {
    fn delay(&self, _attempt: usize) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        if min >= max {
            return self.min_delay;
        }
        let mut rng = thread_rng();
        Duration::from_millis(rng.gen_range(min..=max))
    }
}

pub struct JitterBackoffStrategy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryStrategy for JitterBackoffStrategy {
    fn delay(&self, attempt: usize) -> Duration {
        let exp_delay = std::cmp::min(
            self.initial_delay
                .mul_f64(self.multiplier.powi(attempt.min(i32::MAX as usize) as i32)),
            self.max_delay,
        );
        if exp_delay.is_zero() {
            return exp_delay;
        }
        let mut rng = thread_rng();
        let jitter = rng.gen_range(Duration::ZERO..exp_delay);
        std::cmp::min(exp_delay + jitter, self.max_delay)
    }
}

/// Builds the strategy named by the configuration.
pub fn from_config(config: &RetryStrategyConfig) -> Box<dyn RetryStrategy> {
    let initial_delay = Duration::from_millis(config.initial_delay_millis);
    let max_delay = Duration::from_secs(config.max_delay_secs);

    match config.strategy_type {
        StrategyType::FixedDelay => Box::new(FixedDelayStrategy {
            delay_duration: std::cmp::min(initial_delay, max_delay),
        }),
        StrategyType::ExponentialBackoff => Box::new(ExponentialBackoffStrategy {
            initial_delay,
            max_delay,
        }),
        StrategyType::LinearBackoff => Box::new(LinearBackoffStrategy {
            initial_delay,
            increment: Duration::from_millis(
                config.increment_millis.unwrap_or(config.initial_delay_millis),
            ),
            max_delay,
        }),
        StrategyType::RandomDelay => Box::new(RandomDelayStrategy {
            min_delay: Duration::from_millis(config.min_delay_millis.unwrap_or(0)),
            max_delay,
        }),
        StrategyType::JitterBackoff => Box::new(JitterBackoffStrategy {
            initial_delay,
            max_delay,
            multiplier: config.multiplier.unwrap_or(2.0),
        }),
    }
}

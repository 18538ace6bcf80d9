//! Knobs shared by every node of a cluster.

use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;

use crate::node::DEFAULT_CS_DURATION;
use crate::transport::{DelayStrategy, FixedDelay, NoDelay, RandomDelay};

/// Upper bound of the random per-message delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(250);

/// How links delay the messages they carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DelayMode {
    None,
    /// Every message waits exactly `max_delay`.
    Fixed,
    /// Every message waits a uniform random time in `0..=max_delay`.
    Random,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// How long a node stays inside the critical section.
    pub cs_duration: Duration,
    pub delay: DelayMode,
    pub max_delay: Duration,
    /// Seed for [`DelayMode::Random`], so runs can be replayed.
    pub seed: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cs_duration: DEFAULT_CS_DURATION,
            delay: DelayMode::None,
            max_delay: DEFAULT_MAX_DELAY,
            seed: 0,
        }
    }
}

impl ClusterConfig {
    pub fn delay_strategy(&self) -> Arc<dyn DelayStrategy> {
        match self.delay {
            DelayMode::None => Arc::new(NoDelay),
            DelayMode::Fixed => Arc::new(FixedDelay(self.max_delay)),
            DelayMode::Random => Arc::new(RandomDelay::new(self.max_delay, self.seed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_mode_uses_max_delay() {
        let config = ClusterConfig {
            delay: DelayMode::Fixed,
            max_delay: Duration::from_millis(40),
            ..ClusterConfig::default()
        };
        assert_eq!(config.delay_strategy().delay(0, 1), Duration::from_millis(40));
    }

    #[test]
    fn default_is_instant_delivery() {
        let config = ClusterConfig::default();
        assert_eq!(config.cs_duration, Duration::from_secs(1));
        assert_eq!(config.delay_strategy().delay(3, 4), Duration::ZERO);
    }
}

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::{ClusterConfig, DelayMode};

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulate Raymond's tree mutual exclusion with crash recovery")]
pub struct Cli {
    /// How long a node stays in the critical section, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub cs_millis: u64,

    /// Delay applied by the links to every message.
    #[arg(long, value_enum, default_value_t = DelayMode::Random)]
    pub delay: DelayMode,

    /// Upper bound (random) or exact value (fixed) of the link delay.
    #[arg(long, default_value_t = 250)]
    pub max_delay_millis: u64,

    /// Seed for the random link delay. Defaults to a fresh one per run.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Script to run before reading commands from stdin.
    #[arg(long)]
    pub script: Option<PathBuf>,
}

impl Cli {
    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            cs_duration: Duration::from_millis(self.cs_millis),
            delay: self.delay,
            max_delay: Duration::from_millis(self.max_delay_millis),
            seed: self.seed.unwrap_or_else(rand::random),
        }
    }
}

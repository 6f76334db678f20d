//! gridsim.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::class::WorkloadClass;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Nodes created at startup, in registry order.
    #[serde(default)]
    pub nodes: Vec<SeedNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Countdown granularity for running tasks (e.g., "1s", "250ms").
    #[serde(default = "default_tick")]
    pub tick: String,
    /// Period of the background queue pass; "0s" disables it.
    #[serde(default = "default_queue_interval")]
    pub queue_interval: String,
    /// Length of generated node ids.
    #[serde(default = "default_id_length")]
    pub id_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedNode {
    pub name: String,
    pub cpu_cores: u32,
    #[serde(default)]
    pub class: WorkloadClass,
}

fn default_tick() -> String {
    "1s".to_string()
}

fn default_queue_interval() -> String {
    "2s".to_string()
}

fn default_id_length() -> usize {
    6
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: default_tick(),
            queue_interval: default_queue_interval(),
            id_length: default_id_length(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> anyhow::Result<Duration> {
        let tick = parse_duration(&self.tick).context("scheduler.tick")?;
        if tick.is_zero() {
            bail!("scheduler.tick must be non-zero");
        }
        Ok(tick)
    }

    /// `None` when periodic processing is disabled.
    pub fn queue_interval(&self) -> anyhow::Result<Option<Duration>> {
        let interval = parse_duration(&self.queue_interval).context("scheduler.queue_interval")?;
        Ok((!interval.is_zero()).then_some(interval))
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: GridConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the scheduler would refuse later anyway.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.scheduler.tick()?;
        self.scheduler.queue_interval()?;
        if self.scheduler.id_length == 0 {
            bail!("scheduler.id_length must be positive");
        }
        for node in &self.nodes {
            if node.cpu_cores == 0 {
                bail!("node '{}': cpu_cores must be positive", node.name);
            }
        }
        Ok(())
    }
}

/// Parse "250ms", "2s", "1.5s" or "3m".
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (number, unit_secs) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 0.001)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1.0)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60.0)
    } else {
        bail!("invalid duration '{s}': expected a number followed by ms, s or m");
    };

    let value: f64 = number
        .trim()
        .parse()
        .with_context(|| format!("invalid duration '{s}'"))?;
    if !value.is_finite() || value < 0.0 {
        bail!("invalid duration '{s}': must be non-negative");
    }
    Duration::try_from_secs_f64(value * unit_secs)
        .with_context(|| format!("invalid duration '{s}': out of range"))
}

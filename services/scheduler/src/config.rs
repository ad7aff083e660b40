//! Configuration for the subdist scheduler and its demo binary.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{ensure, Context, Result};

use crate::runtime::RuntimeConfig;
use crate::scheduler::SchedulerConfig;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Interval between rebalance ticks on the master.
    pub rebalance_interval: Duration,

    /// Interval between worker reconciliation passes.
    pub reconcile_interval: Duration,

    /// How long a cancelled handler may take before it is aborted.
    pub stop_timeout: Duration,

    /// Items registered at startup.
    pub initial_items: u32,

    /// Workers started at startup.
    pub initial_workers: u64,

    /// Interval between new items; `None` disables item growth.
    pub item_growth_interval: Option<Duration>,

    /// Interval between new workers; `None` disables worker growth.
    pub worker_growth_interval: Option<Duration>,

    /// Worker growth stops at this many workers.
    pub max_workers: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("SUBDIST_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let rebalance_interval =
            Duration::from_millis(parse_or(&lookup, "SUBDIST_REBALANCE_INTERVAL_MS", 1000)?);
        let reconcile_interval =
            Duration::from_millis(parse_or(&lookup, "SUBDIST_RECONCILE_INTERVAL_MS", 1000)?);
        let stop_timeout = Duration::from_secs(parse_or(&lookup, "SUBDIST_STOP_TIMEOUT_SECS", 30)?);

        ensure!(!rebalance_interval.is_zero(), "SUBDIST_REBALANCE_INTERVAL_MS must be positive");
        ensure!(!reconcile_interval.is_zero(), "SUBDIST_RECONCILE_INTERVAL_MS must be positive");

        let initial_items = parse_or(&lookup, "SUBDIST_INITIAL_ITEMS", 20)?;
        let initial_workers = parse_or(&lookup, "SUBDIST_INITIAL_WORKERS", 2)?;
        let item_growth_interval =
            growth_interval(parse_or(&lookup, "SUBDIST_ITEM_GROWTH_INTERVAL_MS", 1000)?);
        let worker_growth_interval =
            growth_interval(parse_or(&lookup, "SUBDIST_WORKER_GROWTH_INTERVAL_MS", 5000)?);
        let max_workers = parse_or(&lookup, "SUBDIST_MAX_WORKERS", 8)?;

        ensure!(
            initial_workers <= max_workers,
            "SUBDIST_INITIAL_WORKERS ({initial_workers}) exceeds SUBDIST_MAX_WORKERS ({max_workers})"
        );

        Ok(Self {
            log_level,
            rebalance_interval,
            reconcile_interval,
            stop_timeout,
            initial_items,
            initial_workers,
            item_growth_interval,
            worker_growth_interval,
            max_workers,
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            rebalance_interval: self.rebalance_interval,
            runtime: RuntimeConfig {
                reconcile_interval: self.reconcile_interval,
                stop_timeout: self.stop_timeout,
            },
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {value:?}")),
        None => Ok(default),
    }
}

fn growth_interval(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.rebalance_interval, Duration::from_secs(1));
        assert_eq!(config.reconcile_interval, Duration::from_secs(1));
        assert_eq!(config.stop_timeout, Duration::from_secs(30));
        assert_eq!(config.initial_items, 20);
        assert_eq!(config.initial_workers, 2);
        assert_eq!(config.item_growth_interval, Some(Duration::from_secs(1)));
        assert_eq!(config.worker_growth_interval, Some(Duration::from_secs(5)));
        assert_eq!(config.max_workers, 8);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("SUBDIST_REBALANCE_INTERVAL_MS", "250"),
            ("SUBDIST_ITEM_GROWTH_INTERVAL_MS", "0"),
            ("SUBDIST_STOP_TIMEOUT_SECS", " 5 "),
        ])
        .unwrap();
        assert_eq!(config.rebalance_interval, Duration::from_millis(250));
        assert_eq!(config.item_growth_interval, None);
        assert_eq!(config.scheduler_config().runtime.stop_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[("SUBDIST_MAX_WORKERS", "many")]).unwrap_err();
        assert!(err.to_string().contains("SUBDIST_MAX_WORKERS"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(load(&[("SUBDIST_RECONCILE_INTERVAL_MS", "0")]).is_err());
    }

    #[test]
    fn test_initial_workers_bounded() {
        assert!(load(&[("SUBDIST_INITIAL_WORKERS", "9")]).is_err());
    }
}

//! # Engine Configuration
//!
//! All tunables of the change-execution protocol live in [`EngineConfig`].
//! Defaults are chosen for a handful of workers sharing one store; every
//! field can be overridden from `REVSTORE_*` environment variables.
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `REVSTORE_CHANGE_TIMEOUT_MS` | `change_timeout` | 10 s |
//! | `REVSTORE_WAIT_INITIAL_MS` | `wait_initial` | 10 ms |
//! | `REVSTORE_WAIT_MAX_MS` | `wait_max` | 1000 ms |
//! | `REVSTORE_EXECUTION_BUDGET_MS` | `execution_budget` | 8 s |
//! | `REVSTORE_INLINE_VALUE_LIMIT` | `inline_value_limit` | 1024 bytes |
//! | `REVSTORE_SNAPSHOT_CACHE_SIZE` | `snapshot_cache_size` | 64 |
//! | `REVSTORE_STRATEGY` | `strategy` | `direct` |
//! | `REVSTORE_WORKERS` | `workers` | available parallelism, 1..=16 |

use std::env;
use std::time::Duration;

use crate::error::{Error, Result};

const DEFAULT_CHANGE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_WAIT_INITIAL_MS: u64 = 10;
const DEFAULT_WAIT_MAX_MS: u64 = 1_000;
const DEFAULT_EXECUTION_BUDGET_MS: u64 = 8_000;
const DEFAULT_INLINE_VALUE_LIMIT: usize = 1024;
const DEFAULT_SNAPSHOT_CACHE_SIZE: usize = 64;
const MAX_DEFAULT_WORKERS: usize = 16;

/// How the base view of a change is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    /// Read the materialized entities covered by the change's locks.
    #[default]
    Direct,
    /// Start from a cached snapshot and replay committed events.
    Snapshot,
}

impl StrategyKind {
    pub fn parse(text: &str) -> Result<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(StrategyKind::Direct),
            "snapshot" => Ok(StrategyKind::Snapshot),
            other => Err(Error::Config(format!("unknown strategy '{other}'"))),
        }
    }
}

/// Configuration for an [`Engine`](crate::engine::Engine) and the worker pool.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Inactivity after which a pending change may be rolled forward or
    /// failed by a peer.
    pub change_timeout: Duration,

    /// First delay when polling a conflicting predecessor.
    pub wait_initial: Duration,

    /// Cap for the doubling poll delay.
    pub wait_max: Duration,

    /// Wall-clock budget for one command. A worker that exhausts it while
    /// waiting gives up its own change; one that exhausts it while applying
    /// leaves the rest to roll-forward. Shorter than `change_timeout`.
    pub execution_budget: Duration,

    /// Encoded values larger than this are stored out of line.
    pub inline_value_limit: usize,

    /// Capacity of the snapshot LRU used by [`StrategyKind::Snapshot`].
    pub snapshot_cache_size: usize,

    /// Base view strategy.
    pub strategy: StrategyKind,

    /// Worker threads started by [`RevStore`](crate::api::RevStore).
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            change_timeout: Duration::from_millis(DEFAULT_CHANGE_TIMEOUT_MS),
            wait_initial: Duration::from_millis(DEFAULT_WAIT_INITIAL_MS),
            wait_max: Duration::from_millis(DEFAULT_WAIT_MAX_MS),
            execution_budget: Duration::from_millis(DEFAULT_EXECUTION_BUDGET_MS),
            inline_value_limit: DEFAULT_INLINE_VALUE_LIMIT,
            snapshot_cache_size: DEFAULT_SNAPSHOT_CACHE_SIZE,
            strategy: StrategyKind::Direct,
            workers: default_workers(),
        }
    }
}

impl EngineConfig {
    /// Loads the configuration from `REVSTORE_*` environment variables,
    /// falling back to defaults for unset ones.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "REVSTORE_CHANGE_TIMEOUT_MS")? {
            config.change_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "REVSTORE_WAIT_INITIAL_MS")? {
            config.wait_initial = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "REVSTORE_WAIT_MAX_MS")? {
            config.wait_max = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "REVSTORE_EXECUTION_BUDGET_MS")? {
            config.execution_budget = Duration::from_millis(ms);
        }
        if let Some(limit) = parse_var::<usize>(&lookup, "REVSTORE_INLINE_VALUE_LIMIT")? {
            config.inline_value_limit = limit;
        }
        if let Some(size) = parse_var::<usize>(&lookup, "REVSTORE_SNAPSHOT_CACHE_SIZE")? {
            config.snapshot_cache_size = size;
        }
        if let Some(strategy) = lookup("REVSTORE_STRATEGY") {
            config.strategy = StrategyKind::parse(&strategy)?;
        }
        if let Some(workers) = parse_var::<usize>(&lookup, "REVSTORE_WORKERS")? {
            config.workers = workers;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn change_timeout_ms(&self) -> u64 {
        self.change_timeout.as_millis() as u64
    }

    /// How often a live worker heartbeats its own change.
    pub fn heartbeat_interval_ms(&self) -> u64 {
        (self.change_timeout_ms() / 4).max(1)
    }

    /// Rejects combinations the protocol can't run with.
    pub fn validate(&self) -> Result<()> {
        if self.change_timeout.is_zero() {
            return Err(Error::Config("change_timeout must be positive".into()));
        }
        if self.wait_initial.is_zero() || self.wait_initial > self.wait_max {
            return Err(Error::Config(
                "wait_initial must be positive and not exceed wait_max".into(),
            ));
        }
        if self.execution_budget.is_zero() {
            return Err(Error::Config("execution_budget must be positive".into()));
        }
        // A worker must give up before peers may take its change over.
        if self.execution_budget >= self.change_timeout {
            return Err(Error::Config(
                "execution_budget must be shorter than change_timeout".into(),
            ));
        }
        if self.snapshot_cache_size == 0 {
            return Err(Error::Config("snapshot_cache_size must be positive".into()));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be positive".into()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key} must be a number, got '{raw}'"))),
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_DEFAULT_WORKERS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.change_timeout, Duration::from_secs(10));
        assert_eq!(config.wait_initial, Duration::from_millis(10));
        assert_eq!(config.wait_max, Duration::from_millis(1000));
        assert_eq!(config.execution_budget, Duration::from_secs(8));
        assert_eq!(config.inline_value_limit, 1024);
        assert_eq!(config.strategy, StrategyKind::Direct);
        assert!((1..=16).contains(&config.workers));
        config.validate().unwrap();
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("REVSTORE_CHANGE_TIMEOUT_MS", "250"),
            ("REVSTORE_EXECUTION_BUDGET_MS", "200"),
            ("REVSTORE_WAIT_MAX_MS", "40"),
            ("REVSTORE_STRATEGY", "Snapshot"),
            ("REVSTORE_WORKERS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.change_timeout, Duration::from_millis(250));
        assert_eq!(config.execution_budget, Duration::from_millis(200));
        assert_eq!(config.heartbeat_interval_ms(), 62);
        assert_eq!(config.wait_max, Duration::from_millis(40));
        assert_eq!(config.strategy, StrategyKind::Snapshot);
        assert_eq!(config.workers, 3);
    }

    #[test]
    fn test_bad_values_are_config_errors() {
        let err = EngineConfig::from_lookup(lookup_from(&[("REVSTORE_WAIT_MAX_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = EngineConfig::from_lookup(lookup_from(&[("REVSTORE_STRATEGY", "psychic")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = EngineConfig::from_lookup(lookup_from(&[
            ("REVSTORE_CHANGE_TIMEOUT_MS", "1000"),
            ("REVSTORE_EXECUTION_BUDGET_MS", "1000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = EngineConfig::from_lookup(lookup_from(&[
            ("REVSTORE_WAIT_INITIAL_MS", "500"),
            ("REVSTORE_WAIT_MAX_MS", "100"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}

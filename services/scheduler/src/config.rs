use std::time::Duration;

use anyhow::{Context, Result};
use mlsched_events::{DEFAULT_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY};

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub retry_interval: Duration,
    pub cleanup_interval: Duration,
    /// Per-consumer event queue capacity.
    pub event_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            retry_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(30),
            event_queue_size: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let log_level = lookup("MLSCHED_LOG_LEVEL").unwrap_or(defaults.log_level);

        let retry_interval = match lookup("MLSCHED_RETRY_INTERVAL_SECS") {
            Some(v) => Duration::from_secs(
                v.parse()
                    .with_context(|| format!("invalid MLSCHED_RETRY_INTERVAL_SECS: {v}"))?,
            ),
            None => defaults.retry_interval,
        };

        let cleanup_interval = match lookup("MLSCHED_CLEANUP_INTERVAL_SECS") {
            Some(v) => Duration::from_secs(
                v.parse()
                    .with_context(|| format!("invalid MLSCHED_CLEANUP_INTERVAL_SECS: {v}"))?,
            ),
            None => defaults.cleanup_interval,
        };

        let event_queue_size = match lookup("MLSCHED_EVENT_QUEUE_SIZE") {
            Some(v) => v
                .parse()
                .with_context(|| format!("invalid MLSCHED_EVENT_QUEUE_SIZE: {v}"))?,
            None => defaults.event_queue_size,
        };

        if retry_interval.is_zero() || cleanup_interval.is_zero() {
            anyhow::bail!("sweep intervals must be at least one second");
        }
        if event_queue_size == 0 || event_queue_size > MAX_QUEUE_CAPACITY {
            anyhow::bail!(
                "MLSCHED_EVENT_QUEUE_SIZE must be between 1 and {MAX_QUEUE_CAPACITY}, got {event_queue_size}"
            );
        }

        Ok(Self {
            log_level,
            retry_interval,
            cleanup_interval,
            event_queue_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.cleanup_interval, Duration::from_secs(30));
        assert_eq!(config.event_queue_size, 1000);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("MLSCHED_LOG_LEVEL", "debug"),
            ("MLSCHED_RETRY_INTERVAL_SECS", "1"),
            ("MLSCHED_EVENT_QUEUE_SIZE", "64"),
        ]))
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.retry_interval, Duration::from_secs(1));
        assert_eq!(config.event_queue_size, 64);
    }

    #[test]
    fn test_invalid_values() {
        assert!(Config::from_lookup(lookup(&[("MLSCHED_RETRY_INTERVAL_SECS", "soon")])).is_err());
        assert!(Config::from_lookup(lookup(&[("MLSCHED_CLEANUP_INTERVAL_SECS", "0")])).is_err());
    }

    #[test]
    fn test_event_queue_size_bounds() {
        let max = MAX_QUEUE_CAPACITY.to_string();
        let config = Config::from_lookup(lookup(&[("MLSCHED_EVENT_QUEUE_SIZE", max.as_str())])).unwrap();
        assert_eq!(config.event_queue_size, MAX_QUEUE_CAPACITY);

        let over = (MAX_QUEUE_CAPACITY + 1).to_string();
        for value in ["0", over.as_str(), "18446744073709551615"] {
            let err = Config::from_lookup(lookup(&[("MLSCHED_EVENT_QUEUE_SIZE", value)])).unwrap_err();
            assert!(err.to_string().contains("MLSCHED_EVENT_QUEUE_SIZE"), "{err}");
        }
    }
}

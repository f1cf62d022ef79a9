// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Defaults suit tests and small programs. Every field can be overridden
//! from the environment with `Config::from_env`.

use std::time::Duration;

use crate::error::{Error, Result};

pub const ENV_POLL_INTERVAL_US: &str = "FLOWER_POLL_INTERVAL_US";
pub const ENV_STACK_SIZE: &str = "FLOWER_STACK_SIZE";
pub const ENV_THREAD_NAME_PREFIX: &str = "FLOWER_THREAD_NAME_PREFIX";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// How long `run()` parks between checks while its tasks wait on
    /// external completions.
    pub poll_interval: Duration,
    /// Stack size of the thread backing each task. `None` keeps the
    /// platform default.
    pub stack_size: Option<usize>,
    /// Task threads are named `{prefix}-{id}`.
    pub thread_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_micros(100),
            stack_size: None,
            thread_name_prefix: "flower-task".to_string(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(ENV_POLL_INTERVAL_US) {
            let micros = parse_number(ENV_POLL_INTERVAL_US, &raw)?;
            if micros == 0 {
                return Err(invalid(ENV_POLL_INTERVAL_US, &raw, "must be positive"));
            }
            self.poll_interval = Duration::from_micros(micros as u64);
        }
        if let Some(raw) = lookup(ENV_STACK_SIZE) {
            let bytes = parse_number(ENV_STACK_SIZE, &raw)?;
            if bytes < 16 * 1024 {
                return Err(invalid(ENV_STACK_SIZE, &raw, "must be at least 16384"));
            }
            self.stack_size = Some(bytes);
        }
        if let Some(raw) = lookup(ENV_THREAD_NAME_PREFIX) {
            let prefix = raw.trim();
            if prefix.is_empty() {
                return Err(invalid(ENV_THREAD_NAME_PREFIX, &raw, "must not be empty"));
            }
            self.thread_name_prefix = prefix.to_string();
        }
        Ok(())
    }
}

fn parse_number(var: &'static str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse::<usize>()
        .map_err(|e| invalid(var, raw, &e.to_string()))
}

fn invalid(var: &'static str, value: &str, reason: &str) -> Error {
    Error::Config {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.poll_interval, Duration::from_micros(100));
        assert_eq!(config.stack_size, None);
        assert_eq!(config.thread_name_prefix, "flower-task");
    }

    #[test]
    fn env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env_of(&[
                (ENV_POLL_INTERVAL_US, "250"),
                (ENV_STACK_SIZE, "65536"),
                (ENV_THREAD_NAME_PREFIX, " fl "),
            ]))
            .unwrap();
        assert_eq!(config.poll_interval, Duration::from_micros(250));
        assert_eq!(config.stack_size, Some(65536));
        assert_eq!(config.thread_name_prefix, "fl");
    }

    #[test]
    fn rejects_garbage() {
        let mut config = Config::default();
        let err = config
            .apply_env(env_of(&[(ENV_POLL_INTERVAL_US, "soon")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config { var: ENV_POLL_INTERVAL_US, .. }));

        let err = config
            .apply_env(env_of(&[(ENV_STACK_SIZE, "1024")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config { var: ENV_STACK_SIZE, .. }));
    }

    #[test]
    fn builder_setters() {
        let config = Config::new()
            .poll_interval(Duration::from_millis(1))
            .stack_size(1 << 20)
            .thread_name_prefix("worker");
        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert_eq!(config.stack_size, Some(1 << 20));
        assert_eq!(config.thread_name_prefix, "worker");
    }
}

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{rlog_debug, Error, Result};

/// Settings for the descriptor aggregation lock-file protocol.
///
/// A lock is considered stale once its own timestamp is older than
/// `staleness_secs`; the retry loop only bounds how long a writer waits
/// for a fresh lock, it never condemns one by itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockConfig {
    /// Age in seconds after which an existing lock is reclaimed as abandoned.
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
    /// Seconds to sleep between acquisition attempts.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    /// Maximum acquisition attempts before giving up on a fresh lock.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_staleness_secs() -> u64 {
    30
}

fn default_retry_interval_secs() -> u64 {
    2
}

fn default_max_retries() -> u32 {
    5
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            staleness_secs: default_staleness_secs(),
            retry_interval_secs: default_retry_interval_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl LockConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Maximum number of tasks executed concurrently (0 means one worker).
    #[serde(default)]
    pub max_workers: usize,
    #[serde(default)]
    pub lock: LockConfig,
}

impl Config {
    pub fn rigpipe_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".rigpipe"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::rigpipe_dir()?.join("rigpipe.toml"))
    }

    pub fn effective_workers(&self) -> usize {
        self.max_workers.max(1)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        rlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            rlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        rlog_debug!(
            "Config loaded: max_workers={}, lock={:?}",
            config.max_workers,
            config.lock
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::rigpipe_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        rlog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_workers, 0);
        assert_eq!(config.effective_workers(), 1);
        assert_eq!(config.lock.staleness_secs, 30);
        assert_eq!(config.lock.retry_interval_secs, 2);
        assert_eq!(config.lock.max_retries, 5);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config {
            max_workers: 4,
            lock: LockConfig {
                staleness_secs: 60,
                retry_interval_secs: 1,
                max_retries: 10,
            },
        };
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_workers, 4);
        assert_eq!(parsed.lock, config.lock);
    }

    #[test]
    fn test_lock_config_durations() {
        let lock = LockConfig::default();
        assert_eq!(lock.staleness(), Duration::from_secs(30));
        assert_eq!(lock.retry_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str("max_workers = 2").unwrap();
        assert_eq!(parsed.max_workers, 2);
        assert_eq!(parsed.lock, LockConfig::default());
    }
}

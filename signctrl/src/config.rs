//! Configuration file handling.
//!
//! SignCTRL keeps `config.toml` and `conn.key` in its configuration directory,
//! `$SIGNCTRL_CONFIG_DIR` or `~/.signctrl` by default.

use crate::counter::MIN_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File name of the configuration inside the configuration directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "SIGNCTRL_CONFIG_DIR";

const DEFAULT_CONFIG_DIR: &str = ".signctrl";
const TCP_SCHEME: &str = "tcp://";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("couldn't access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("couldn't parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("couldn't serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("threshold must be at least {MIN_THRESHOLD}, got {0}")]
    InvalidThreshold(u32),

    #[error("rank must be at least 1, got {0}")]
    InvalidRank(u32),

    #[error("invalid validator_laddr {0:?}, expected tcp://host:port")]
    InvalidLaddr(String),

    #[error("retry_dial_after must be greater than zero")]
    InvalidRetryInterval,

    #[error("log_level must not be empty")]
    EmptyLogLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub init: InitConfig,
    pub backend: BackendConfig,
}

/// Settings for the rank counter and the validator connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    /// Default log filter, overridden by `RUST_LOG`
    pub log_level: String,
    /// Missed blocks in a row that trigger a promotion
    pub threshold: u32,
    /// Starting rank, 1 is the active signer
    pub rank: u32,
    /// Private validator listen address of the validator node
    pub validator_laddr: String,
    /// Pause between two attempts to dial the validator
    #[serde(with = "humantime_duration")]
    pub retry_dial_after: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unix socket of the keystore/chain backend
    pub socket_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            init: InitConfig {
                log_level: "info".to_string(),
                threshold: 10,
                rank: 1,
                validator_laddr: "tcp://127.0.0.1:3000".to_string(),
                retry_dial_after: Duration::from_secs(15),
            },
            backend: BackendConfig {
                socket_path: PathBuf::from("/var/run/signctrl-backend.sock"),
            },
        }
    }
}

/// Resolve the configuration directory.
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(DEFAULT_CONFIG_DIR),
        None => PathBuf::from(DEFAULT_CONFIG_DIR),
    }
}

impl Config {
    pub fn path(config_dir: &Path) -> PathBuf {
        config_dir.join(CONFIG_FILE)
    }

    /// Load and validate the configuration from `config_dir`.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(config_dir);
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration into `config_dir`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let path = Self::path(config_dir);
        let io_err = |source: io::Error| ConfigError::Io {
            path: path.clone(),
            source,
        };

        let contents = toml::to_string(self)?;
        fs::create_dir_all(config_dir).map_err(io_err)?;
        fs::write(&path, contents).map_err(io_err)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.init.log_level.trim().is_empty() {
            return Err(ConfigError::EmptyLogLevel);
        }
        if self.init.threshold < MIN_THRESHOLD {
            return Err(ConfigError::InvalidThreshold(self.init.threshold));
        }
        if self.init.rank < 1 {
            return Err(ConfigError::InvalidRank(self.init.rank));
        }
        if self.init.retry_dial_after.is_zero() {
            return Err(ConfigError::InvalidRetryInterval);
        }
        self.validator_address()?;
        Ok(())
    }

    /// The validator address in `host:port` form.
    pub fn validator_address(&self) -> Result<String, ConfigError> {
        let laddr = self.init.validator_laddr.trim();
        let invalid = || ConfigError::InvalidLaddr(self.init.validator_laddr.clone());

        let address = match laddr.split_once("://") {
            Some(_) => laddr.strip_prefix(TCP_SCHEME).ok_or_else(invalid)?,
            None => laddr,
        };
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        match port.parse::<u16>() {
            Ok(port) if port != 0 => Ok(address.to_string()),
            _ => Err(invalid()),
        }
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[init]
log_level = "debug"
threshold = 3
rank = 2
validator_laddr = "tcp://10.0.0.5:26659"
retry_dial_after = "2s 500ms"

[backend]
socket_path = "/tmp/backend.sock"
"#;

    fn with_init(f: impl FnOnce(&mut InitConfig)) -> Config {
        let mut config = Config::default();
        f(&mut config.init);
        config
    }

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.init.threshold, 3);
        assert_eq!(config.init.rank, 2);
        assert_eq!(config.init.retry_dial_after, Duration::from_millis(2500));
        assert_eq!(config.validator_address().unwrap(), "10.0.0.5:26659");
        assert_eq!(config.backend.socket_path, PathBuf::from("/tmp/backend.sock"));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::default();
        config.save(temp_dir.path()).unwrap();

        assert_eq!(Config::load(temp_dir.path()).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            Config::load(temp_dir.path()),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            Config::path(temp_dir.path()),
            SAMPLE.replace("threshold = 3", "threshold = 1"),
        )
        .unwrap();

        assert!(matches!(
            Config::load(temp_dir.path()),
            Err(ConfigError::InvalidThreshold(1))
        ));
    }

    #[test]
    fn test_validation() {
        assert!(Config::default().validate().is_ok());
        assert!(matches!(
            with_init(|c| c.rank = 0).validate(),
            Err(ConfigError::InvalidRank(0))
        ));
        assert!(matches!(
            with_init(|c| c.threshold = 0).validate(),
            Err(ConfigError::InvalidThreshold(0))
        ));
        assert!(matches!(
            with_init(|c| c.retry_dial_after = Duration::ZERO).validate(),
            Err(ConfigError::InvalidRetryInterval)
        ));
        assert!(matches!(
            with_init(|c| c.log_level = " ".to_string()).validate(),
            Err(ConfigError::EmptyLogLevel)
        ));
    }

    #[test]
    fn test_validator_laddr_forms() {
        let address = |laddr: &str| {
            with_init(|c| c.validator_laddr = laddr.to_string()).validator_address()
        };

        assert_eq!(address("tcp://127.0.0.1:3000").unwrap(), "127.0.0.1:3000");
        assert_eq!(address("localhost:3000").unwrap(), "localhost:3000");
        for bad in ["", "tcp://", "127.0.0.1", "unix:///tmp/pv.sock", ":3000", "host:0", "host:99999"] {
            assert!(
                matches!(address(bad), Err(ConfigError::InvalidLaddr(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}

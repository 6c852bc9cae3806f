//! Server configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::controller::TimingConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Use the simulated pulse controller instead of the real one.
    pub dummy: bool,
    /// Address the request server binds to.
    pub listen: String,
    /// Directory holding startup.cmdbin, ttl.yaml and dds.yaml.
    pub runtime_dir: PathBuf,
    /// How far sequence time is kept ahead of wall clock.
    pub min_lead_ms: u64,
    /// Sleep inside a long sequence wait when there is nothing else to do.
    pub idle_sleep_us: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            dummy: false,
            listen: "0.0.0.0:7777".into(),
            runtime_dir: "/var/lib/pulsebox".into(),
            min_lead_ms: 500,
            idle_sleep_us: 1000,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn timing(&self) -> TimingConfig {
        TimingConfig {
            min_lead: Duration::from_millis(self.min_lead_ms),
            idle_sleep: Duration::from_micros(self.idle_sleep_us),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_defaults() {
        let conf: Config =
            serde_yaml::from_str("dummy: true\nlisten: \"127.0.0.1:9000\"\n").unwrap();
        assert!(conf.dummy);
        assert_eq!(conf.listen, "127.0.0.1:9000");
        assert_eq!(conf.runtime_dir, PathBuf::from("/var/lib/pulsebox"));
        assert_eq!(conf.min_lead_ms, 500);
        assert_eq!(conf.timing().idle_sleep, Duration::from_micros(1000));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(serde_yaml::from_str::<Config>("bogus: 1\n").is_err());
    }
}

//! Configuration for the cosmicd application
//!
//! Loads configuration from a TOML file: network ports, protocol timing,
//! the re-handshake policy, and logging.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub timing: TimingConfig,
    pub policy: PolicyConfig,
    pub logging: LoggingConfig,
}

/// Network configuration (rendezvous and bridge ports)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Address to bind all listeners on
    pub bind_address: String,
    /// Well-known port nodes connect to for the powerup handshake
    pub rendezvous_port: u16,
    /// Base port for per-node AUXIO bridges (bound port = base + node id)
    pub auxio_base_port: u16,
    /// Base port for per-node UART bridges (bound port = base + node id)
    pub uart_base_port: u16,
}

/// Protocol timing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    /// How long a new main connection may sit without a valid powerup line
    pub handshake_timeout_secs: u64,
    /// Interval between server heartbeat ticks
    pub heartbeat_interval_secs: u64,
    /// A node silent for more than multiplier x interval is marked stale
    pub staleness_multiplier: u32,
}

/// What to do when a node id that is already registered handshakes again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RehandshakePolicy {
    /// Tear down the old registration and its bridges, then register anew
    Replace,
    /// Refuse the new handshake and keep the existing registration
    Reject,
}

/// Registration policy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    pub rehandshake: RehandshakePolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    pub level: String,
    /// Directory for per-bridge transcript files
    pub transcript_dir: String,
}

impl NetworkConfig {
    /// Listen address for the main rendezvous server
    pub fn rendezvous_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.rendezvous_port)
    }
}

impl TimingConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Silence threshold after which a node is considered stale
    pub fn staleness_threshold(&self) -> Duration {
        self.heartbeat_interval() * self.staleness_multiplier
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        use crate::error::Error;
        if self.timing.staleness_multiplier == 0 {
            return Err(Error::Config(
                "staleness_multiplier must be at least 1".to_string(),
            ));
        }
        if self.timing.heartbeat_interval_secs == 0 {
            return Err(Error::Config(
                "heartbeat_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Default configuration matching the deployed site conventions.
    ///
    /// Suitable for testing and development. Production deployments
    /// should use a proper TOML configuration file.
    pub fn site_defaults() -> Self {
        Self {
            network: NetworkConfig {
                bind_address: "0.0.0.0".to_string(),
                rendezvous_port: 26766,
                auxio_base_port: 52737,
                uart_base_port: 63766,
            },
            timing: TimingConfig {
                handshake_timeout_secs: 30,
                heartbeat_interval_secs: 300,
                staleness_multiplier: 3,
            },
            policy: PolicyConfig {
                rehandshake: RehandshakePolicy::Replace,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                transcript_dir: ".".to_string(),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::site_defaults()
    }
}

//! Runtime configuration.

use std::net::SocketAddr;
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::provisioner::ProvisionConfig;
use crate::reaper::ReaperConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("port range {start}..{end} is empty")]
    EmptyPortRange { start: u16, end: u16 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on.
    pub listen: SocketAddr,
    /// SQLite file; in-memory when `None`.
    pub db_path: Option<PathBuf>,
    /// JSON template list; built-in catalog when `None`.
    pub catalog_path: Option<PathBuf>,
    /// Front-end page that answers 200 for logged-in sessions.
    pub auth_url: String,
    pub auth_timeout: Duration,
    pub docker_bin: String,
    pub ports: Range<u16>,
    pub max_port_attempts: u32,
    pub provision: ProvisionConfig,
    pub reaper: ReaperConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8888)),
            db_path: Some(PathBuf::from("./warden.db")),
            catalog_path: None,
            auth_url: "http://127.0.0.1:4000/user".to_string(),
            auth_timeout: Duration::from_secs(5),
            docker_bin: "docker".to_string(),
            ports: 10000..20000,
            max_port_attempts: 64,
            provision: ProvisionConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::EmptyPortRange {
                start: self.ports.start,
                end: self.ports.end,
            });
        }
        if self.max_port_attempts == 0 {
            return Err(ConfigError::Zero("max port attempts"));
        }
        if self.provision.spawn_timeout.is_zero() {
            return Err(ConfigError::Zero("spawn timeout"));
        }
        if self.reaper.interval.is_zero() {
            return Err(ConfigError::Zero("sweep interval"));
        }
        if self.reaper.stop_timeout.is_zero() {
            return Err(ConfigError::Zero("stop timeout"));
        }
        if self.reaper.concurrency == 0 {
            return Err(ConfigError::Zero("reclaim concurrency"));
        }
        Ok(())
    }
}

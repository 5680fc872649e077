//! Pipeline configuration: defaults, optional JSON file, then CLI/env
//! overrides applied by the binaries.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::affinity::{self, InvalidCore};
use crate::listener::ListenerConfig;
use crate::replayer::ReplayConfig;

pub const DEFAULT_PORT: u16 = 5555;
pub const DEFAULT_RING_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("ring_capacity {0} must be a power of two and at least 2")]
    RingCapacity(usize),
    #[error("speed_factor must be finite and positive, got {0}")]
    SpeedFactor(f64),
    #[error("listen_port must not be 0")]
    ListenPort,
    #[error("{field}: {source}")]
    Core {
        field: &'static str,
        #[source]
        source: InvalidCore,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub listen_port: u16,
    pub bind_ip: IpAddr,
    pub destination: SocketAddr,
    pub ring_capacity: usize,
    pub listener_core: Option<usize>,
    pub consumer_core: Option<usize>,
    pub replayer_core: Option<usize>,
    pub speed_factor: f64,
    pub capture_path: Option<PathBuf>,
    pub idle_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            destination: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            ring_capacity: DEFAULT_RING_CAPACITY,
            listener_core: None,
            consumer_core: None,
            replayer_core: None,
            speed_factor: 1.0,
            capture_path: None,
            idle_timeout_secs: None,
        }
    }
}

impl PipelineConfig {
    /// Missing fields take their defaults. The result is not validated.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Defaults when `path` is `None`.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_json(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_capacity < 2 || !self.ring_capacity.is_power_of_two() {
            return Err(ConfigError::RingCapacity(self.ring_capacity));
        }
        if !self.speed_factor.is_finite() || self.speed_factor <= 0.0 {
            return Err(ConfigError::SpeedFactor(self.speed_factor));
        }
        if self.listen_port == 0 {
            return Err(ConfigError::ListenPort);
        }
        for (field, core) in [
            ("listener_core", self.listener_core),
            ("consumer_core", self.consumer_core),
            ("replayer_core", self.replayer_core),
        ] {
            affinity::check_core(core).map_err(|source| ConfigError::Core { field, source })?;
        }
        Ok(())
    }

    pub fn listener(&self) -> ListenerConfig {
        ListenerConfig { bind_ip: self.bind_ip, port: self.listen_port, core: self.listener_core }
    }

    pub fn replay(&self) -> ReplayConfig {
        ReplayConfig::new(self.destination).with_speed(self.speed_factor).pinned_to(self.replayer_core)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.filter(|&s| s > 0).map(Duration::from_secs)
    }
}

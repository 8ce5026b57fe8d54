//! Runtime configuration.
//!
//! Defaults come from the environment ([`Config::load`]) or from a YAML file
//! ([`Config::from_file`]); command line flags are applied on top in `main`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub scope: ScopeConfig,
    pub drain: DrainConfig,
    pub storage: StorageConfig,
    /// Maximum number of unanswered requests buffered per connection.
    pub queue_capacity: usize,
    /// Log every captured packet at trace level.
    pub log_packets: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Interface used for live capture.
    pub interface: String,
    /// Capture file to replay instead of capturing live.
    pub input_file: Option<PathBuf>,
    pub snaplen: i32,
    /// Kernel-side filter for live capture. Left unset, it is built from
    /// `scope.ports` by [`Config::resolve`].
    pub bpf_filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// TCP ports whose traffic is reassembled.
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    pub after_exhaustion_secs: u64,
    pub after_command_secs: u64,
    pub join_grace_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Optional JSON-lines file receiving every storage event.
    pub events_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            scope: ScopeConfig::default(),
            drain: DrainConfig::default(),
            storage: StorageConfig::default(),
            queue_capacity: 100,
            log_packets: false,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            input_file: None,
            snaplen: 1600,
            bpf_filter: None,
        }
    }
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self { ports: vec![80] }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            after_exhaustion_secs: 0,
            after_command_secs: 10,
            join_grace_secs: 5,
        }
    }
}

impl DrainConfig {
    pub fn after_exhaustion(&self) -> Duration {
        Duration::from_secs(self.after_exhaustion_secs)
    }

    pub fn after_command(&self) -> Duration {
        Duration::from_secs(self.after_command_secs)
    }

    pub fn join_grace(&self) -> Duration {
        Duration::from_secs(self.join_grace_secs)
    }
}

impl Config {
    /// Builds the configuration from defaults overridden by `HTTPTAP_*`
    /// environment variables.
    pub fn load() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Reads a YAML configuration file, then applies environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut cfg = Self::from_yaml_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Fills in settings derived from others. Call once every override has
    /// been applied.
    pub fn resolve(&mut self) {
        if self.capture.bpf_filter.is_none() {
            self.capture.bpf_filter = Some(port_filter(&self.scope.ports));
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        if self.scope.ports.is_empty() {
            anyhow::bail!("scope.ports must name at least one port");
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(iface) = std::env::var("HTTPTAP_IFACE") {
            self.capture.interface = iface;
        }
        if let Ok(file) = std::env::var("HTTPTAP_INFILE") {
            if !file.trim().is_empty() {
                self.capture.input_file = Some(PathBuf::from(file));
            }
        }
        if let Ok(ports) = std::env::var("HTTPTAP_PORTS") {
            let parsed: Vec<u16> = ports
                .split(',')
                .filter_map(|p| p.trim().parse().ok())
                .collect();
            if !parsed.is_empty() {
                self.scope.ports = parsed;
            }
        }
        if let Ok(filter) = std::env::var("HTTPTAP_BPF_FILTER") {
            if !filter.trim().is_empty() {
                self.capture.bpf_filter = Some(filter);
            }
        }
        if let Ok(path) = std::env::var("HTTPTAP_EVENTS") {
            if !path.trim().is_empty() {
                self.storage.events_path = Some(PathBuf::from(path));
            }
        }
    }
}

/// BPF expression matching TCP traffic on any of `ports`, e.g.
/// `tcp and (port 80 or port 8080)`.
pub fn port_filter(ports: &[u16]) -> String {
    match ports {
        [] => "tcp".to_string(),
        [port] => format!("tcp and port {port}"),
        _ => {
            let alternatives: Vec<String> = ports.iter().map(|p| format!("port {p}")).collect();
            format!("tcp and ({})", alternatives.join(" or "))
        }
    }
}

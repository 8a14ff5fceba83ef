//! Link configuration: defaults, optional TOML file, environment overrides.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use peerlink_core::DEFAULT_MAX_PAYLOAD;
use serde::Deserialize;
use tracing::warn;

/// Link tuning. File: ~/.config/peerlink/config.toml or /etc/peerlink/config.toml.
/// Env overrides: PEERLINK_MAX_PAYLOAD, PEERLINK_DATA_PORT, PEERLINK_FILE_PORT,
/// PEERLINK_CONNECT_TIMEOUT_MS, PEERLINK_ACCEPT_TIMEOUT_MS, PEERLINK_RECV_TIMEOUT_MS,
/// PEERLINK_CONN_INTERVAL_MS, PEERLINK_HEARTBEAT_INTERVAL_MS, PEERLINK_ACCEPT_BUDGET.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    /// Largest payload per block, and the receive buffer capacity (default 4 MiB).
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    /// Well-known data port (default 8301).
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    /// Well-known file port (default 8302).
    #[serde(default = "default_file_port")]
    pub file_port: u16,
    /// Bound on a single connect attempt (default 5 s).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bound on a single accept wait (default 3 s).
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
    /// Readability poll period of the receive task (default 5 s).
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
    /// Pause between connector attempts (default 5 s).
    #[serde(default = "default_conn_interval_ms")]
    pub conn_interval_ms: u64,
    /// Heartbeat probe period (default 5 s).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Number of accepts a listener performs before it stops; absent = unlimited.
    #[serde(default)]
    pub accept_budget: Option<u32>,
}

fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}
fn default_data_port() -> u16 {
    8301
}
fn default_file_port() -> u16 {
    8302
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_accept_timeout_ms() -> u64 {
    3_000
}
fn default_recv_timeout_ms() -> u64 {
    5_000
}
fn default_conn_interval_ms() -> u64 {
    5_000
}
fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_payload: default_max_payload(),
            data_port: default_data_port(),
            file_port: default_file_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            accept_timeout_ms: default_accept_timeout_ms(),
            recv_timeout_ms: default_recv_timeout_ms(),
            conn_interval_ms: default_conn_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            accept_budget: None,
        }
    }
}

/// Rejected configuration value.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_payload must be greater than zero")]
    ZeroMaxPayload,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("accept_budget must be at least 1 when set")]
    ZeroAcceptBudget,
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn conn_interval(&self) -> Duration {
        Duration::from_millis(self.conn_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload == 0 {
            return Err(ConfigError::ZeroMaxPayload);
        }
        let durations = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("accept_timeout_ms", self.accept_timeout_ms),
            ("recv_timeout_ms", self.recv_timeout_ms),
            ("conn_interval_ms", self.conn_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::ZeroDuration(*name));
        }
        if self.accept_budget == Some(0) {
            return Err(ConfigError::ZeroAcceptBudget);
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: LinkConfig = toml::from_str(s).context("parse link config")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::from_toml_str(&s).with_context(|| format!("load {}", path.display()))
    }

    /// Apply overrides from `lookup` (variable name → value). Unparsable values are skipped.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_field(&lookup, "PEERLINK_MAX_PAYLOAD", &mut self.max_payload);
        override_field(&lookup, "PEERLINK_DATA_PORT", &mut self.data_port);
        override_field(&lookup, "PEERLINK_FILE_PORT", &mut self.file_port);
        override_field(&lookup, "PEERLINK_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms);
        override_field(&lookup, "PEERLINK_ACCEPT_TIMEOUT_MS", &mut self.accept_timeout_ms);
        override_field(&lookup, "PEERLINK_RECV_TIMEOUT_MS", &mut self.recv_timeout_ms);
        override_field(&lookup, "PEERLINK_CONN_INTERVAL_MS", &mut self.conn_interval_ms);
        override_field(&lookup, "PEERLINK_HEARTBEAT_INTERVAL_MS", &mut self.heartbeat_interval_ms);
        if let Some(s) = lookup("PEERLINK_ACCEPT_BUDGET") {
            match s.trim() {
                "" | "infinite" | "-1" => self.accept_budget = None,
                n => {
                    if let Ok(n) = n.parse::<u32>() {
                        self.accept_budget = Some(n);
                    }
                }
            }
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }
}

fn override_field<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, field: &mut T) {
    if let Some(s) = lookup(name) {
        if let Ok(v) = s.trim().parse::<T>() {
            *field = v;
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
/// A config that fails validation after overrides falls back to defaults.
pub fn load() -> LinkConfig {
    let mut c = load_file().unwrap_or_default();
    c.apply_env();
    if let Err(e) = c.validate() {
        warn!("invalid link config ({e}), using defaults");
        return LinkConfig::default();
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/config.toml"));
    out
}

fn load_file() -> Option<LinkConfig> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match LinkConfig::from_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!("ignoring config file: {e:#}");
            None
        }
    }
}

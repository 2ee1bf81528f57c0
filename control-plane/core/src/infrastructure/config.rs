// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Control-plane configuration, loaded from `fleet-control.yaml`.
/// Every field has a default so an empty file (or none at all) yields
/// a working development setup against a local backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Base URL of the backend control-plane API.
    pub backend_url: String,

    /// Address the dashboard API binds to.
    pub bind_addr: String,

    /// Full-snapshot poll interval in seconds. The correctness backstop;
    /// push only lowers latency.
    pub poll_interval_secs: u64,

    /// Whether to attach to the backend push channel.
    pub push_enabled: bool,

    /// Log buffer retention: entry count bound.
    pub log_max_entries: usize,

    /// Log buffer retention: age bound in hours.
    pub log_max_age_hours: i64,

    /// Registry event bus capacity.
    pub event_bus_capacity: usize,

    /// Port for the Prometheus scrape endpoint; disabled when unset.
    pub metrics_port: Option<u16>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8800".to_string(),
            bind_addr: "127.0.0.1:7700".to_string(),
            poll_interval_secs: 30,
            push_enabled: true,
            log_max_entries: crate::application::logs::DEFAULT_MAX_ENTRIES,
            log_max_age_hours: crate::application::logs::DEFAULT_MAX_AGE_HOURS,
            event_bus_capacity: 1000,
            metrics_port: None,
        }
    }
}

impl ControlPlaneConfig {
    /// Load from a YAML file if it exists, then apply environment
    /// overrides (`FLEET_BACKEND_URL`, `FLEET_BIND_ADDR`).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var("FLEET_BACKEND_URL") {
            config.backend_url = url;
        }
        if let Ok(addr) = std::env::var("FLEET_BIND_ADDR") {
            config.bind_addr = addr;
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn log_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.log_max_age_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = ControlPlaneConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.log_max_entries, 10_000);
        assert!(config.push_enabled);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let config: ControlPlaneConfig =
            serde_yaml::from_str("backend_url: http://fleet.internal:9000\npoll_interval_secs: 10\n")
                .unwrap();
        assert_eq!(config.backend_url, "http://fleet.internal:9000");
        assert_eq!(config.poll_interval_secs, 10);
        assert_eq!(config.log_max_age_hours, 24);
    }
}

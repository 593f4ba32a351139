//! TOML configuration -- loaded at startup, re-loadable at runtime via the API.
//!
//! Every field has a serde default so a minimal (or empty) config file still
//! yields a runnable daemon. A reload swaps the whole `Config` behind the
//! shared lock and re-arms the scheduler; in-flight jobs keep running under
//! the snapshot they took at dispatch.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub check: CheckConfig,
    pub ip_check: IpCheckConfig,
    pub output: OutputConfig,
    /// Proxy endpoints to test. Opaque beyond the fields the client factory
    /// understands (type/server/port/credentials).
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/proxypulse.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Fixed-interval period in minutes. Ignored when `cron` is set.
    pub interval_minutes: u64,
    /// Cron expression (7-field, with seconds). Empty means interval mode.
    pub cron: String,
    /// Concurrent node tests per pass.
    pub concurrency: usize,
    /// Small request used for delay measurement.
    pub test_url: String,
    /// Payload used for download speed measurement.
    pub download_url: String,
    /// Cap on how long one node's download measurement may run.
    pub download_secs: u64,
    /// Per-request timeout for node clients.
    pub timeout_secs: u64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
            cron: String::new(),
            concurrency: 16,
            test_url: "https://www.gstatic.com/generate_204".to_string(),
            download_url: "https://speed.cloudflare.com/__down?bytes=10000000".to_string(),
            download_secs: 10,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpCheckConfig {
    pub enabled: bool,
    /// Cron expression for scheduled quality checks (7-field, with seconds).
    /// Defaults to monthly.
    pub cron: String,
    /// Deadline for one whole quality run.
    pub timeout_secs: u64,
    /// External probe script (bash). Relative paths are resolved against the
    /// executable's directory.
    pub script_path: String,
    /// When true, probe the TopN best recent nodes instead of running the
    /// single default-egress probe.
    pub use_top_n: bool,
    pub top_n: u32,
    /// Selection metric: "download_speed" (highest first) or "delay" (lowest first).
    pub select_by: String,
    /// Only consider speed results newer than this many hours.
    pub window_hours: u32,
    /// Global probe submission ceiling; 0 means unpaced.
    pub rate_per_minute: u32,
    /// Concurrent per-node probes; 0 falls back to the pool default.
    pub concurrency: usize,
    /// Endpoint queried through each node to resolve its egress IP and country.
    pub geoip_url: String,
}

impl Default for IpCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: "0 0 0 1 * *".to_string(),
            timeout_secs: 300,
            script_path: String::new(),
            use_top_n: false,
            top_n: 10,
            select_by: "download_speed".to_string(),
            window_hours: 24,
            rate_per_minute: 0,
            concurrency: 3,
            geoip_url: "https://api.ip.sb/geoip".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for published result snapshots. None disables publishing.
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// Proxy scheme: "http" or "socks5".
    #[serde(rename = "type", default = "default_node_type")]
    pub kind: String,
    pub server: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_node_type() -> String {
    "http".to_string()
}

impl NodeConfig {
    /// Opaque mapping form, as persisted alongside speed results and consumed
    /// by the client factory.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed to parse config file")
    }
}

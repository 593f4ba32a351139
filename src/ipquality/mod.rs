//! IP reputation ("quality") checks: risk classification, the per-node client
//! factory, and the job that orchestrates single-probe and TopN batch runs.

pub mod probe;

use crate::config::Config;
use crate::scheduler::{pool as batch, ScheduledJob};
use crate::storage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Ordinal risk classification derived from a fraud score, lowest severity
/// first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, Deserialize,
)]
pub enum RiskLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
    #[default]
    Unknown,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::VeryLow => "VeryLow",
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
            RiskLevel::VeryHigh => "VeryHigh",
            RiskLevel::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a fraud score. `None` means no score was actually measured
/// (provider absent or unparseable) and maps to `Unknown`; a measured zero is
/// `VeryLow`.
pub fn classify(score: Option<u32>) -> RiskLevel {
    match score {
        None => RiskLevel::Unknown,
        Some(s) if s <= 10 => RiskLevel::VeryLow,
        Some(s) if s <= 25 => RiskLevel::Low,
        Some(s) if s <= 50 => RiskLevel::Medium,
        Some(s) if s <= 75 => RiskLevel::High,
        Some(_) => RiskLevel::VeryHigh,
    }
}

/// One persisted quality measurement. Duplicates across runs are expected;
/// results form a time series.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QualityResult {
    pub subscription_id: Option<i64>,
    pub ip: String,
    pub fraud_score: Option<u32>,
    pub risk_level: RiskLevel,
    pub is_proxy: Option<bool>,
    pub is_vpn: Option<bool>,
    pub is_tor: Option<bool>,
    pub country_code: String,
}

/// Builds an HTTP client routed through one proxy node and resolves the
/// node's egress identity. Failures are signalled as `None`: a node we cannot
/// reach is skipped, not an error.
#[async_trait]
pub trait NodeClientFactory: Send + Sync {
    fn build(&self, node: &serde_json::Value) -> Option<reqwest::Client>;
    /// Resolve (country_code, egress ip) through the given client.
    async fn egress(&self, client: &reqwest::Client) -> Option<(String, String)>;
}

/// reqwest-backed factory for http/socks5 nodes.
pub struct ReqwestNodeFactory {
    config: Arc<RwLock<Config>>,
}

impl ReqwestNodeFactory {
    pub fn new(config: Arc<RwLock<Config>>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl NodeClientFactory for ReqwestNodeFactory {
    fn build(&self, node: &serde_json::Value) -> Option<reqwest::Client> {
        let server = node.get("server")?.as_str()?;
        let port = node.get("port")?.as_u64()?;
        let kind = node.get("type").and_then(|v| v.as_str()).unwrap_or("http");
        let scheme = match kind {
            "http" | "https" => "http",
            // socks5h so DNS resolves on the far side too
            "socks5" | "socks5h" | "socks" => "socks5h",
            other => {
                debug!(kind = %other, "unsupported proxy type");
                return None;
            }
        };
        let mut proxy = reqwest::Proxy::all(format!("{scheme}://{server}:{port}")).ok()?;
        if let (Some(user), Some(pass)) = (
            node.get("username").and_then(|v| v.as_str()),
            node.get("password").and_then(|v| v.as_str()),
        ) {
            proxy = proxy.basic_auth(user, pass);
        }
        let timeout = self
            .config
            .read()
            .expect("config lock poisoned")
            .check
            .timeout_secs;
        reqwest::Client::builder()
            .proxy(proxy)
            .timeout(Duration::from_secs(timeout.max(1)))
            .build()
            .ok()
    }

    async fn egress(&self, client: &reqwest::Client) -> Option<(String, String)> {
        #[derive(Deserialize)]
        struct GeoIp {
            ip: Option<String>,
            country_code: Option<String>,
        }
        let url = self
            .config
            .read()
            .expect("config lock poisoned")
            .ip_check
            .geoip_url
            .clone();
        let geo: GeoIp = client
            .get(&url)
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?
            .json()
            .await
            .ok()?;
        let ip = geo.ip.filter(|ip| !ip.is_empty())?;
        Some((geo.country_code.unwrap_or_default(), ip))
    }
}

/// Orchestrates one quality run: either a single default-egress probe or a
/// rate-limited batch over the TopN best recent nodes. Mode is picked from
/// config at run time; both modes share one single-flight guard upstream.
pub struct IpQualityJob {
    config: Arc<RwLock<Config>>,
    db: storage::Pool,
    probe: Arc<dyn probe::QualityProbe>,
    factory: Arc<dyn NodeClientFactory>,
}

impl IpQualityJob {
    pub fn new(
        config: Arc<RwLock<Config>>,
        db: storage::Pool,
        probe: Arc<dyn probe::QualityProbe>,
        factory: Arc<dyn NodeClientFactory>,
    ) -> Self {
        Self {
            config,
            db,
            probe,
            factory,
        }
    }

    async fn run_single(&self) -> Result<()> {
        let output = self
            .probe
            .run_full()
            .await
            .context("ip quality probe failed")?;
        let core = probe::extract_core(&output);
        if core.ip.is_empty() {
            warn!("ip quality probe returned no usable result, nothing persisted");
            return Ok(());
        }
        let result = QualityResult {
            subscription_id: None,
            ip: core.ip,
            fraud_score: core.fraud_score,
            risk_level: core.risk_level,
            is_proxy: Some(core.is_proxy),
            is_vpn: Some(core.is_vpn),
            is_tor: Some(core.is_tor),
            country_code: core.country_code,
        };
        storage::save_quality_result(&self.db, &result)
            .context("failed to save ip quality result")?;
        info!(ip = %result.ip, risk = %result.risk_level, "ip quality result saved");
        Ok(())
    }

    async fn run_top_n(&self, cfg: &crate::config::IpCheckConfig) -> Result<()> {
        let select_by = storage::SelectBy::parse(&cfg.select_by);
        let items =
            storage::query_top_n_proxy_configs(&self.db, select_by, cfg.top_n, cfg.window_hours)
                .context("failed to query top-n proxies")?;
        if items.is_empty() {
            warn!("no recent proxy results to probe");
            return Ok(());
        }

        let total = items.len();
        let db = self.db.clone();
        let probe = Arc::clone(&self.probe);
        let factory = Arc::clone(&self.factory);
        batch::run(items, cfg.concurrency, cfg.rate_per_minute, |raw| {
            let db = db.clone();
            let probe = Arc::clone(&probe);
            let factory = Arc::clone(&factory);
            async move {
                let Ok(node) = serde_json::from_str::<serde_json::Value>(&raw) else {
                    return;
                };
                let Some(client) = factory.build(&node) else {
                    return;
                };
                let Some((country, ip)) = factory.egress(&client).await else {
                    return;
                };
                let score = match probe.fraud_score(&client, &ip).await {
                    Ok(score) => score,
                    Err(e) => {
                        debug!(%ip, "fraud score lookup failed: {e:#}");
                        return;
                    }
                };
                let result = QualityResult {
                    subscription_id: None,
                    ip: ip.clone(),
                    fraud_score: score,
                    risk_level: classify(score),
                    is_proxy: None,
                    is_vpn: None,
                    is_tor: None,
                    country_code: country,
                };
                if let Err(e) = storage::save_quality_result(&db, &result) {
                    error!(%ip, "failed to save ip quality result: {e:#}");
                }
            }
        })
        .await;
        info!(count = total, "per-node ip quality check complete");
        Ok(())
    }
}

#[async_trait]
impl ScheduledJob for IpQualityJob {
    async fn run(&self) -> Result<()> {
        let cfg = self
            .config
            .read()
            .expect("config lock poisoned")
            .ip_check
            .clone();
        if cfg.use_top_n {
            self.run_top_n(&cfg).await
        } else {
            self.run_single().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_boundaries() {
        assert_eq!(classify(Some(0)), RiskLevel::VeryLow);
        assert_eq!(classify(Some(10)), RiskLevel::VeryLow);
        assert_eq!(classify(Some(11)), RiskLevel::Low);
        assert_eq!(classify(Some(25)), RiskLevel::Low);
        assert_eq!(classify(Some(26)), RiskLevel::Medium);
        assert_eq!(classify(Some(50)), RiskLevel::Medium);
        assert_eq!(classify(Some(51)), RiskLevel::High);
        assert_eq!(classify(Some(75)), RiskLevel::High);
        assert_eq!(classify(Some(76)), RiskLevel::VeryHigh);
        assert_eq!(classify(Some(100)), RiskLevel::VeryHigh);
    }

    #[test]
    fn test_classify_unmeasured_score_is_unknown() {
        // A zero that never came from a parsed value must not read as VeryLow.
        assert_eq!(classify(None), RiskLevel::Unknown);
    }

    #[test]
    fn test_risk_level_severity_order() {
        assert!(RiskLevel::VeryLow < RiskLevel::Low);
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::VeryHigh);
    }

    #[test]
    fn test_factory_rejects_unknown_proxy_type() {
        let factory = ReqwestNodeFactory::new(Arc::new(RwLock::new(Config::default())));
        let node = serde_json::json!({"type": "vmess", "server": "x", "port": 443});
        assert!(factory.build(&node).is_none());
    }

    #[test]
    fn test_factory_builds_http_and_socks_clients() {
        let factory = ReqwestNodeFactory::new(Arc::new(RwLock::new(Config::default())));
        let http = serde_json::json!({"type": "http", "server": "proxy.example", "port": 8080});
        assert!(factory.build(&http).is_some());
        let socks = serde_json::json!({
            "type": "socks5", "server": "proxy.example", "port": 1080,
            "username": "u", "password": "p"
        });
        assert!(factory.build(&socks).is_some());
    }

    #[test]
    fn test_factory_requires_server_and_port() {
        let factory = ReqwestNodeFactory::new(Arc::new(RwLock::new(Config::default())));
        assert!(factory.build(&serde_json::json!({"type": "http"})).is_none());
        assert!(factory
            .build(&serde_json::json!({"server": "x", "type": "http"}))
            .is_none());
    }
}

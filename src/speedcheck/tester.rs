//! Default reqwest-backed proxy tester: per-node delay and download speed
//! through a proxied client, bounded by the batch pool.

use super::{Progress, ProxyResult, ProxyTester};
use crate::config::Config;
use crate::ipquality::NodeClientFactory;
use crate::scheduler::pool as batch;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub struct ReqwestProxyTester {
    config: Arc<RwLock<Config>>,
    factory: Arc<dyn NodeClientFactory>,
    progress: Arc<Progress>,
    force_close: Arc<AtomicBool>,
}

impl ReqwestProxyTester {
    pub fn new(
        config: Arc<RwLock<Config>>,
        factory: Arc<dyn NodeClientFactory>,
        progress: Arc<Progress>,
        force_close: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            factory,
            progress,
            force_close,
        }
    }
}

#[async_trait]
impl ProxyTester for ReqwestProxyTester {
    async fn run_test_pass(&self) -> Result<Vec<ProxyResult>> {
        let (cfg, nodes) = {
            let c = self.config.read().expect("config lock poisoned");
            let nodes: Vec<serde_json::Value> = c.nodes.iter().map(|n| n.to_value()).collect();
            (c.check.clone(), nodes)
        };
        if nodes.is_empty() {
            info!("no nodes configured, nothing to test");
            return Ok(Vec::new());
        }

        self.progress.begin(nodes.len() as u64);
        let results: Arc<Mutex<Vec<ProxyResult>>> = Arc::new(Mutex::new(Vec::new()));

        let factory = Arc::clone(&self.factory);
        let progress = Arc::clone(&self.progress);
        let force_close = Arc::clone(&self.force_close);
        let cfg = Arc::new(cfg);
        batch::run(nodes, cfg.concurrency, 0, |node| {
            let factory = Arc::clone(&factory);
            let progress = Arc::clone(&progress);
            let force_close = Arc::clone(&force_close);
            let cfg = Arc::clone(&cfg);
            let results = Arc::clone(&results);
            async move {
                if force_close.load(Ordering::Relaxed) {
                    progress.record(false);
                    return;
                }
                let name = node
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let Some(client) = factory.build(&node) else {
                    debug!(%name, "could not build client for node");
                    progress.record(false);
                    return;
                };

                let Some(delay_ms) = measure_delay(&client, &cfg.test_url).await else {
                    debug!(%name, "node unreachable");
                    progress.record(false);
                    return;
                };

                let download_kbps = measure_download(
                    &client,
                    &cfg.download_url,
                    Duration::from_secs(cfg.download_secs.max(1)),
                    &force_close,
                )
                .await;
                let ip = factory.egress(&client).await.map(|(_, ip)| ip);

                debug!(%name, delay_ms, ?download_kbps, "node tested");
                progress.record(true);
                results
                    .lock()
                    .expect("results lock poisoned")
                    .push(ProxyResult {
                        name,
                        delay_ms: Some(delay_ms),
                        download_kbps,
                        upload_kbps: None,
                        ip,
                        proxy: node,
                    });
            }
        })
        .await;

        let snapshot = self.progress.snapshot();
        info!(
            total = snapshot.proxy_count,
            available = snapshot.available,
            "test pass finished"
        );
        let out = std::mem::take(&mut *results.lock().expect("results lock poisoned"));
        Ok(out)
    }
}

/// Round-trip delay of one small request, None if the node is unusable.
async fn measure_delay(client: &reqwest::Client, url: &str) -> Option<u32> {
    let start = Instant::now();
    let resp = client.get(url).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    Some(start.elapsed().as_millis() as u32)
}

/// Average download throughput in KB/s over at most `window`, None if no
/// payload byte arrived. Observes the force-close flag between chunks so an
/// operator abort is cooperative.
async fn measure_download(
    client: &reqwest::Client,
    url: &str,
    window: Duration,
    force_close: &AtomicBool,
) -> Option<f64> {
    let start = Instant::now();
    let mut resp = client.get(url).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let mut bytes: u64 = 0;
    while let Ok(Some(chunk)) = resp.chunk().await {
        bytes += chunk.len() as u64;
        if start.elapsed() >= window || force_close.load(Ordering::Relaxed) {
            break;
        }
    }
    let secs = start.elapsed().as_secs_f64();
    if bytes == 0 || secs <= 0.0 {
        return None;
    }
    Some(bytes as f64 / 1024.0 / secs)
}

//! Result publishing: fan-out of a finished test pass to configured outputs.
//!
//! Publishing is fire-and-forget from the scheduler's perspective; a failing
//! backend is logged and never affects the pass.

use crate::config::Config;
use crate::speedcheck::ProxyResult;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &'static str;
    async fn publish(&self, results: &[ProxyResult]) -> Result<()>;
}

/// Writes each pass as a timestamped JSON snapshot plus a stable
/// `latest.json`.
pub struct JsonFilePublisher {
    dir: PathBuf,
}

impl JsonFilePublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Publisher for JsonFilePublisher {
    fn name(&self) -> &'static str {
        "json-file"
    }

    async fn publish(&self, results: &[ProxyResult]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("failed to create output directory")?;
        let payload = serde_json::to_vec_pretty(results)?;
        let stamped = self
            .dir
            .join(format!("results-{}.json", Utc::now().format("%Y%m%d-%H%M%S")));
        tokio::fs::write(&stamped, &payload)
            .await
            .with_context(|| format!("failed to write {}", stamped.display()))?;
        tokio::fs::write(self.dir.join("latest.json"), &payload)
            .await
            .context("failed to write latest.json")?;
        info!(path = %stamped.display(), count = results.len(), "results published");
        Ok(())
    }
}

/// Build the publisher set from config.
pub fn from_config(config: &Config) -> Vec<Arc<dyn Publisher>> {
    let mut publishers: Vec<Arc<dyn Publisher>> = Vec::new();
    if let Some(dir) = &config.output.dir {
        publishers.push(Arc::new(JsonFilePublisher::new(dir)));
    }
    publishers
}

/// Fan one pass out to every publisher concurrently, containing failures.
pub async fn save_and_publish(publishers: &[Arc<dyn Publisher>], results: &[ProxyResult]) {
    let futs = publishers.iter().map(|p| {
        let p = Arc::clone(p);
        async move {
            if let Err(e) = p.publish(results).await {
                error!(publisher = p.name(), "publish failed: {e:#}");
            }
        }
    });
    futures::future::join_all(futs).await;
}

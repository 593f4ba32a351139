//! Proxy pool speed testing: the test-pass collaborator contract, shared
//! progress counters, and the job that persists and publishes a pass.

pub mod tester;

use crate::publish::{self, Publisher};
use crate::scheduler::ScheduledJob;
use crate::storage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// One node's outcome from a test pass. Failed nodes are omitted from the
/// pass; partial failure is normal.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProxyResult {
    pub name: String,
    pub delay_ms: Option<u32>,
    pub download_kbps: Option<f64>,
    pub upload_kbps: Option<f64>,
    pub ip: Option<String>,
    /// The node's opaque configuration, persisted for later TopN selection.
    pub proxy: serde_json::Value,
}

/// Executes one full speed-test pass over the configured proxy pool.
#[async_trait]
pub trait ProxyTester: Send + Sync {
    async fn run_test_pass(&self) -> Result<Vec<ProxyResult>>;
}

/// Pool-wide counters surfaced by the status API while a pass runs.
#[derive(Debug, Default)]
pub struct Progress {
    total: AtomicU64,
    done: AtomicU64,
    available: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ProgressSnapshot {
    pub proxy_count: u64,
    pub progress: u64,
    pub available: u64,
}

impl Progress {
    pub fn begin(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
        self.available.store(0, Ordering::Relaxed);
    }

    pub fn record(&self, available: bool) {
        self.done.fetch_add(1, Ordering::Relaxed);
        if available {
            self.available.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            proxy_count: self.total.load(Ordering::Relaxed),
            progress: self.done.load(Ordering::Relaxed),
            available: self.available.load(Ordering::Relaxed),
        }
    }
}

/// One full speed-check pass: run the tester, persist every result row, then
/// hand the pass to the publishers fire-and-forget. An `Err` here means the
/// whole pass failed and is escalated by the scheduler.
pub struct SpeedCheckJob {
    db: storage::Pool,
    tester: Arc<dyn ProxyTester>,
    publishers: Vec<Arc<dyn Publisher>>,
}

impl SpeedCheckJob {
    pub fn new(
        db: storage::Pool,
        tester: Arc<dyn ProxyTester>,
        publishers: Vec<Arc<dyn Publisher>>,
    ) -> Self {
        Self {
            db,
            tester,
            publishers,
        }
    }
}

#[async_trait]
impl ScheduledJob for SpeedCheckJob {
    async fn run(&self) -> Result<()> {
        let results = self
            .tester
            .run_test_pass()
            .await
            .context("proxy test pass failed")?;

        for r in &results {
            if let Err(e) = storage::save_speed_result(&self.db, r) {
                error!(node = %r.name, "failed to save speed result: {e:#}");
            }
        }

        if !self.publishers.is_empty() {
            let publishers = self.publishers.clone();
            let snapshot = results.clone();
            tokio::spawn(async move { publish::save_and_publish(&publishers, &snapshot).await });
        }

        info!(count = results.len(), "speed check pass complete");
        Ok(())
    }
}

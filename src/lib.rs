//! proxypulse -- scheduled proxy pool speed testing and IP reputation
//! monitoring.
//!
//! The library wires together the configuration layer, the re-armable job
//! scheduler, the speed-check and IP-quality jobs, SQLite result storage,
//! and the admin HTTP API.

pub mod api;
pub mod config;
pub mod ipquality;
pub mod publish;
pub mod scheduler;
pub mod speedcheck;
pub mod storage;

use crate::api::state::AppState;
use crate::config::Config;
use crate::ipquality::probe::{QualityProbe, ScriptProbe};
use crate::ipquality::{IpQualityJob, NodeClientFactory, ReqwestNodeFactory};
use crate::scheduler::{ScheduleMode, Scheduler, TriggerChannel};
use crate::speedcheck::tester::ReqwestProxyTester;
use crate::speedcheck::{Progress, SpeedCheckJob};
use anyhow::Result;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

struct App {
    config: Arc<RwLock<Config>>,
    db: storage::Pool,
    scheduler: Arc<Scheduler>,
    progress: Arc<Progress>,
    force_close: Arc<AtomicBool>,
}

/// Wire storage, jobs, and the scheduler up from one loaded config.
fn build_app(config: Config) -> Result<App> {
    let db_path = config.database.path.clone();
    let config = Arc::new(RwLock::new(config));
    tracing::info!(%db_path, "initializing database");
    let db = storage::open_pool(&db_path)?;

    let force_close = Arc::new(AtomicBool::new(false));
    let progress = Arc::new(Progress::default());
    let factory: Arc<dyn NodeClientFactory> =
        Arc::new(ReqwestNodeFactory::new(Arc::clone(&config)));
    let probe: Arc<dyn QualityProbe> = Arc::new(ScriptProbe::new(Arc::clone(&config)));
    let publishers = publish::from_config(&config.read().expect("config lock poisoned"));

    let tester = Arc::new(ReqwestProxyTester::new(
        Arc::clone(&config),
        Arc::clone(&factory),
        Arc::clone(&progress),
        Arc::clone(&force_close),
    ));
    let speed_job = Arc::new(SpeedCheckJob::new(db.clone(), tester, publishers));
    let quality_job = Arc::new(IpQualityJob::new(
        Arc::clone(&config),
        db.clone(),
        probe,
        factory,
    ));
    let scheduler = Scheduler::new(Arc::clone(&config), speed_job, quality_job);

    Ok(App {
        config,
        db,
        scheduler,
        progress,
        force_close,
    })
}

/// Start the proxypulse daemon: scheduler, trigger mailbox, and admin API.
pub async fn serve(config_path: &Path, bind: &str) -> Result<()> {
    let app = build_app(Config::load(config_path)?)?;

    let mode = {
        let cfg = app.config.read().expect("config lock poisoned");
        ScheduleMode::from_check_config(&cfg.check)
    };
    let cron_mode = matches!(mode, ScheduleMode::Cron(_));
    app.scheduler.arm(mode);
    app.scheduler.arm_quality();

    let (trigger, rx) = TriggerChannel::channel();
    tokio::spawn(Arc::clone(&app.scheduler).run_trigger_consumer(rx));

    // Interval mode runs a check straight away; cron waits for its first
    // scheduled fire.
    if cron_mode {
        tracing::warn!("using cron expression, skipping initial check");
    } else {
        let scheduler = Arc::clone(&app.scheduler);
        tokio::spawn(async move { scheduler.run_speed_check().await });
    }

    let state = AppState {
        db: app.db.clone(),
        scheduler: Arc::clone(&app.scheduler),
        trigger,
        config: Arc::clone(&app.config),
        config_path: config_path.to_path_buf(),
        progress: Arc::clone(&app.progress),
        force_close: Arc::clone(&app.force_close),
    };

    let addr: std::net::SocketAddr = bind.parse()?;
    let router = api::router(state);
    tracing::info!(%addr, "proxypulse listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let force_close = Arc::clone(&app.force_close);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            force_close.store(true, Ordering::Relaxed);
        })
        .await?;

    app.scheduler.shutdown();
    Ok(())
}

/// Run a single speed-check pass and return.
pub async fn run_check_once(config_path: &Path) -> Result<()> {
    let app = build_app(Config::load(config_path)?)?;
    app.scheduler.run_speed_check().await;
    Ok(())
}

/// Run a single IP-quality check and return. The check is forced on even
/// when the scheduled variant is disabled in config.
pub async fn run_ip_check_once(config_path: &Path) -> Result<()> {
    let mut config = Config::load(config_path)?;
    config.ip_check.enabled = true;
    let app = build_app(config)?;
    app.scheduler.run_quality_check().await;
    Ok(())
}

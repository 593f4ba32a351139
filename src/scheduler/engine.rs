//! The scheduler engine: owns the active timer (cron or fixed interval),
//! re-arms live on configuration change, and drives guarded job execution.
//!
//! Every `arm()` creates a fresh cancellation token that the delivery task
//! captures at start; re-arming cancels the old token before spawning the new
//! task, so two delivery mechanisms can never be simultaneously armed and
//! there is no shared primitive to double-close.

use crate::config::Config;
use crate::scheduler::{ScheduleMode, ScheduledJob, SingleFlightGuard};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_QUALITY_CRON: &str = "0 0 0 1 * *";
const DEFAULT_QUALITY_TIMEOUT: Duration = Duration::from_secs(300);

enum ArmedKind {
    Idle,
    Interval(Duration),
    Cron(CronSchedule),
}

struct ArmState {
    token: CancellationToken,
    kind: ArmedKind,
}

/// In-progress flags and next-fire info, as surfaced by the status API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStatus {
    pub speed_check_in_progress: bool,
    pub ip_quality_in_progress: bool,
    pub mode: &'static str,
    pub next_check: Option<String>,
}

pub struct Scheduler {
    config: Arc<RwLock<Config>>,
    speed_job: Arc<dyn ScheduledJob>,
    quality_job: Arc<dyn ScheduledJob>,
    speed_guard: Arc<SingleFlightGuard>,
    quality_guard: Arc<SingleFlightGuard>,
    armed: Mutex<ArmState>,
    quality_token: Mutex<CancellationToken>,
    /// Next automatic fire in interval mode. Pushed forward by every
    /// completed run, so the effective period is measured from completion.
    interval_deadline: Mutex<Option<Instant>>,
}

impl Scheduler {
    pub fn new(
        config: Arc<RwLock<Config>>,
        speed_job: Arc<dyn ScheduledJob>,
        quality_job: Arc<dyn ScheduledJob>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            speed_job,
            quality_job,
            speed_guard: SingleFlightGuard::new("speed-check"),
            quality_guard: SingleFlightGuard::new("ip-quality"),
            armed: Mutex::new(ArmState {
                token: CancellationToken::new(),
                kind: ArmedKind::Idle,
            }),
            quality_token: Mutex::new(CancellationToken::new()),
            interval_deadline: Mutex::new(None),
        })
    }

    /// Install the speed-check timer, retiring any previous delivery task
    /// first. A bad cron expression falls back to the configured interval and
    /// is never fatal.
    pub fn arm(self: &Arc<Self>, mode: ScheduleMode) {
        let mut armed = self.armed.lock().expect("scheduler state poisoned");
        armed.token.cancel();
        let token = CancellationToken::new();
        armed.token = token.clone();

        match mode {
            ScheduleMode::Cron(spec) => match CronSchedule::from_str(&spec) {
                Ok(schedule) => {
                    info!(cron = %spec, "using cron schedule");
                    armed.kind = ArmedKind::Cron(schedule.clone());
                    let sched = Arc::clone(self);
                    tokio::spawn(async move { sched.cron_loop(schedule, token).await });
                }
                Err(e) => {
                    error!(
                        cron = %spec,
                        "failed to parse cron expression: {e}, falling back to interval timer"
                    );
                    let cfg = self.config.read().expect("config lock poisoned");
                    let period = Duration::from_secs(cfg.check.interval_minutes.max(1) * 60);
                    drop(cfg);
                    self.arm_interval(&mut armed, period, token);
                }
            },
            ScheduleMode::Interval(period) => {
                info!(period_secs = period.as_secs(), "using interval schedule");
                self.arm_interval(&mut armed, period, token);
            }
        }
    }

    fn arm_interval(self: &Arc<Self>, armed: &mut ArmState, period: Duration, token: CancellationToken) {
        armed.kind = ArmedKind::Interval(period);
        *self.interval_deadline.lock().expect("scheduler state poisoned") =
            Some(Instant::now() + period);
        let sched = Arc::clone(self);
        tokio::spawn(async move { sched.interval_loop(period, token).await });
    }

    async fn interval_loop(self: Arc<Self>, period: Duration, token: CancellationToken) {
        loop {
            let deadline = self
                .interval_deadline
                .lock()
                .expect("scheduler state poisoned")
                .unwrap_or_else(|| Instant::now() + period);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }
            // A run that completed meanwhile (manual trigger) pushes the
            // deadline forward; go back to sleep instead of firing.
            let pushed = self
                .interval_deadline
                .lock()
                .expect("scheduler state poisoned")
                .is_some_and(|d| d > Instant::now());
            if pushed {
                continue;
            }
            self.run_speed_check().await;
            // A lost guard race leaves the deadline in the past; reschedule so
            // an overlap costs one skip per period, not a hot loop.
            let mut deadline = self
                .interval_deadline
                .lock()
                .expect("scheduler state poisoned");
            if deadline.map_or(true, |d| d <= Instant::now()) {
                *deadline = Some(Instant::now() + period);
            }
        }
    }

    async fn cron_loop(self: Arc<Self>, schedule: CronSchedule, token: CancellationToken) {
        let mut after = Utc::now();
        loop {
            let Some(next) = schedule.after(&after).next() else {
                warn!("cron schedule has no future fire times, delivery stopped");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            after = next;
            // Fire on the absolute schedule regardless of job duration;
            // overlapping fires collapse on the guard.
            let sched = Arc::clone(&self);
            tokio::spawn(async move { sched.run_speed_check().await });
        }
    }

    /// Install (or tear down) the quality-check cron from the current config.
    pub fn arm_quality(self: &Arc<Self>) {
        let mut current = self.quality_token.lock().expect("scheduler state poisoned");
        current.cancel();
        let token = CancellationToken::new();
        *current = token.clone();
        drop(current);

        let cfg = self.config.read().expect("config lock poisoned").ip_check.clone();
        if !cfg.enabled {
            warn!("scheduled ip quality checks are not enabled");
            return;
        }
        let spec = if cfg.cron.trim().is_empty() {
            DEFAULT_QUALITY_CRON
        } else {
            cfg.cron.trim()
        };
        match CronSchedule::from_str(spec) {
            Ok(schedule) => {
                info!(cron = %spec, "ip quality check schedule armed");
                let sched = Arc::clone(self);
                tokio::spawn(async move { sched.quality_cron_loop(schedule, token).await });
            }
            Err(e) => {
                // Optional feature: skip it rather than take the process down.
                error!(cron = %spec, "failed to parse ip quality cron: {e}, scheduled quality checks disabled");
            }
        }
    }

    async fn quality_cron_loop(self: Arc<Self>, schedule: CronSchedule, token: CancellationToken) {
        let mut after = Utc::now();
        loop {
            let Some(next) = schedule.after(&after).next() else {
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            after = next;
            let sched = Arc::clone(&self);
            tokio::spawn(async move { sched.run_quality_check().await });
        }
    }

    /// One guarded speed-check run. Timer fires, cron fires, and manual
    /// triggers all land here; losers of the guard race skip this cycle.
    pub async fn run_speed_check(&self) {
        let Some(_permit) = self.speed_guard.try_enter() else {
            warn!("check already in progress, skipping this run");
            return;
        };
        let run_id = Uuid::new_v4();
        info!(%run_id, "speed check starting");
        if let Err(e) = self.speed_job.run().await {
            error!(%run_id, "speed check failed: {e:#}");
            // Unrecoverable at this layer: exit non-zero so a supervisor
            // restarts the process.
            std::process::exit(1);
        }
        info!(%run_id, "speed check finished");
        self.note_next_fire();
    }

    /// One guarded ip-quality run, bounded by the configured deadline.
    /// Errors are logged and contained; they never reach the process level.
    pub async fn run_quality_check(&self) {
        let (enabled, timeout_secs) = {
            let cfg = self.config.read().expect("config lock poisoned");
            (cfg.ip_check.enabled, cfg.ip_check.timeout_secs)
        };
        if !enabled {
            return;
        }
        let Some(_permit) = self.quality_guard.try_enter() else {
            warn!("ip quality check already in progress, skipping this run");
            return;
        };
        let timeout = if timeout_secs == 0 {
            DEFAULT_QUALITY_TIMEOUT
        } else {
            Duration::from_secs(timeout_secs)
        };
        let run_id = Uuid::new_v4();
        info!(%run_id, "ip quality check starting");
        match tokio::time::timeout(timeout, self.quality_job.run()).await {
            Ok(Ok(())) => info!(%run_id, "ip quality check finished"),
            Ok(Err(e)) => error!(%run_id, "ip quality check failed: {e:#}"),
            Err(_) => error!(%run_id, timeout_secs = timeout.as_secs(), "ip quality check timed out"),
        }
    }

    /// Consume manual-trigger signals, spawning the guarded job
    /// fire-and-forget so a burst collapses to at most one pending run.
    pub async fn run_trigger_consumer(self: Arc<Self>, mut rx: mpsc::Receiver<()>) {
        while rx.recv().await.is_some() {
            let sched = Arc::clone(&self);
            tokio::spawn(async move { sched.run_speed_check().await });
        }
        info!("trigger consumer stopped");
    }

    fn note_next_fire(&self) {
        {
            let armed = self.armed.lock().expect("scheduler state poisoned");
            if let ArmedKind::Interval(period) = &armed.kind {
                *self
                    .interval_deadline
                    .lock()
                    .expect("scheduler state poisoned") = Some(Instant::now() + *period);
            }
        }
        if let Some(next) = self.next_fire() {
            info!("next check at {}", next.format("%Y-%m-%d %H:%M:%S"));
        }
    }

    /// Next scheduled fire, purely observational.
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        let armed = self.armed.lock().expect("scheduler state poisoned");
        match &armed.kind {
            ArmedKind::Idle => None,
            ArmedKind::Interval(_) => self
                .interval_deadline
                .lock()
                .expect("scheduler state poisoned")
                .map(|d| {
                    let remaining = d.saturating_duration_since(Instant::now());
                    Utc::now()
                        + chrono::Duration::from_std(remaining)
                            .unwrap_or_else(|_| chrono::Duration::zero())
                }),
            ArmedKind::Cron(schedule) => schedule.upcoming(Utc).next(),
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self.armed.lock().expect("scheduler state poisoned").kind {
            ArmedKind::Idle => "idle",
            ArmedKind::Interval(_) => "interval",
            ArmedKind::Cron(_) => "cron",
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            speed_check_in_progress: self.speed_guard.in_progress(),
            ip_quality_in_progress: self.quality_guard.in_progress(),
            mode: self.mode_name(),
            next_check: self.next_fire().map(|t| t.to_rfc3339()),
        }
    }

    /// Stop delivery tasks, newest concern first. Safe to call more than once.
    pub fn shutdown(&self) {
        self.quality_token
            .lock()
            .expect("scheduler state poisoned")
            .cancel();
        let mut armed = self.armed.lock().expect("scheduler state poisoned");
        armed.token.cancel();
        armed.kind = ArmedKind::Idle;
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ScheduledJob for CountingJob {
        async fn run(&self) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(())
        }
    }

    fn make_scheduler(
        speed_delay: Duration,
        config: Config,
    ) -> (Arc<Scheduler>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let speed_runs = Arc::new(AtomicUsize::new(0));
        let quality_runs = Arc::new(AtomicUsize::new(0));
        let speed = Arc::new(CountingJob {
            runs: Arc::clone(&speed_runs),
            delay: speed_delay,
        });
        let quality = Arc::new(CountingJob {
            runs: Arc::clone(&quality_runs),
            delay: Duration::ZERO,
        });
        let sched = Scheduler::new(Arc::new(RwLock::new(config)), speed, quality);
        (sched, speed_runs, quality_runs)
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_mode_fires_and_measures_from_completion() {
        let (sched, runs, _) = make_scheduler(Duration::from_secs(1), Config::default());
        sched.arm(ScheduleMode::Interval(Duration::from_secs(2)));

        // Fires at t=2 (done t=3), t=5 (done t=6), t=8...
        tokio::time::sleep(Duration::from_millis(8500)).await;
        let n = runs.load(Ordering::SeqCst);
        assert!((2..=3).contains(&n), "expected 2-3 completion-paced runs, got {n}");
        sched.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_retires_previous_delivery_task() {
        let (sched, runs, _) = make_scheduler(Duration::ZERO, Config::default());
        sched.arm(ScheduleMode::Interval(Duration::from_millis(50)));
        // Far-future cron: fires once a year.
        sched.arm(ScheduleMode::Cron("0 0 0 1 1 *".to_string()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0, "interval fire observed after re-arm");
        assert_eq!(sched.mode_name(), "cron");
        sched.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_rearm_sequences_leave_one_mode_armed() {
        let (sched, runs, _) = make_scheduler(Duration::ZERO, Config::default());
        for i in 0..20 {
            if i % 2 == 0 {
                sched.arm(ScheduleMode::Interval(Duration::from_millis(10)));
            } else {
                sched.arm(ScheduleMode::Cron("0 0 0 1 1 *".to_string()));
            }
        }
        // Final mode is cron (far future): nothing may fire.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        sched.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_cron_falls_back_to_interval() {
        let mut config = Config::default();
        config.check.interval_minutes = 1;
        let (sched, runs, _) = make_scheduler(Duration::ZERO, config);
        sched.arm(ScheduleMode::Cron("not a spec".to_string()));

        assert_eq!(sched.mode_name(), "interval");
        assert!(sched.next_fire().is_some());

        // And the fallback interval actually delivers.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(runs.load(Ordering::SeqCst) >= 1);
        sched.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_runs_skip_on_guard() {
        let (sched, runs, _) = make_scheduler(Duration::from_secs(10), Config::default());
        let s1 = Arc::clone(&sched);
        let s2 = Arc::clone(&sched);
        let t1 = tokio::spawn(async move { s1.run_speed_check().await });
        tokio::task::yield_now().await;
        let t2 = tokio::spawn(async move { s2.run_speed_check().await });

        t2.await.unwrap();
        t1.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_held_overlap_skips_one_cycle_per_period() {
        // A long manual run holds the guard across several interval periods.
        // Each expiry must reschedule the deadline and go back to sleep; a
        // loop that retries a past deadline immediately would never yield to
        // the timer and this test would hang under paused time.
        let (sched, runs, _) = make_scheduler(Duration::from_secs(10), Config::default());
        let s1 = Arc::clone(&sched);
        let manual = tokio::spawn(async move { s1.run_speed_check().await });
        tokio::task::yield_now().await;
        sched.arm(ScheduleMode::Interval(Duration::from_secs(2)));

        // Manual run holds the guard until t=10; expiries at t=2,4,6,8 skip.
        // The first automatic fire lands at t=12.
        tokio::time::sleep(Duration::from_millis(12_500)).await;
        manual.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        sched.shutdown();
    }

    #[tokio::test]
    async fn test_quality_check_gated_on_enabled() {
        let (sched, _, quality_runs) = make_scheduler(Duration::ZERO, Config::default());
        sched.run_quality_check().await;
        assert_eq!(quality_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quality_timeout_releases_guard() {
        let mut config = Config::default();
        config.ip_check.enabled = true;
        config.ip_check.timeout_secs = 1;
        let quality_runs = Arc::new(AtomicUsize::new(0));
        let quality = Arc::new(CountingJob {
            runs: Arc::clone(&quality_runs),
            delay: Duration::from_secs(60),
        });
        let speed = Arc::new(CountingJob {
            runs: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        });
        let sched = Scheduler::new(Arc::new(RwLock::new(config)), speed, quality);

        sched.run_quality_check().await;
        assert_eq!(quality_runs.load(Ordering::SeqCst), 1);
        assert!(!sched.status().ip_quality_in_progress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_burst_collapses() {
        use crate::scheduler::TriggerChannel;

        let (sched, runs, _) = make_scheduler(Duration::from_secs(5), Config::default());
        let (trigger, rx) = TriggerChannel::channel();
        let consumer = tokio::spawn(Arc::clone(&sched).run_trigger_consumer(rx));

        assert!(trigger.signal());
        tokio::task::yield_now().await;
        for _ in 0..5 {
            trigger.signal();
        }
        // One run active plus at most one pending extra; 5 rapid signals
        // never become 5 runs.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(runs.load(Ordering::SeqCst) <= 2);

        drop(trigger);
        consumer.await.unwrap();
    }
}

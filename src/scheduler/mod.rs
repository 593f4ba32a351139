//! Scheduling and concurrency control: the timer/cron engine, the per-job
//! single-flight guards, the manual-trigger mailbox, and the rate-limited
//! batch pool.

pub mod engine;
pub mod guard;
pub mod pool;
pub mod trigger;

pub use self::engine::{Scheduler, SchedulerStatus};
pub use self::guard::{FlightPermit, SingleFlightGuard};
pub use self::trigger::TriggerChannel;

use crate::config::CheckConfig;
use std::time::Duration;

/// The active timer shape. Exactly one is armed at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Cron expression (7-field, with seconds).
    Cron(String),
    /// Fixed period, measured from job completion.
    Interval(Duration),
}

impl ScheduleMode {
    /// Non-empty cron expression wins; otherwise fixed interval, clamped to at
    /// least one minute.
    pub fn from_check_config(cfg: &CheckConfig) -> Self {
        if !cfg.cron.trim().is_empty() {
            ScheduleMode::Cron(cfg.cron.trim().to_string())
        } else {
            ScheduleMode::Interval(Duration::from_secs(cfg.interval_minutes.max(1) * 60))
        }
    }
}

/// A job the scheduler can drive. An `Err` from the speed-check job is fatal
/// to the process; quality-check errors are logged and contained.
#[async_trait::async_trait]
pub trait ScheduledJob: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_prefers_cron_when_set() {
        let cfg = CheckConfig {
            cron: "0 0 */6 * * *".into(),
            interval_minutes: 30,
            ..Default::default()
        };
        assert_eq!(
            ScheduleMode::from_check_config(&cfg),
            ScheduleMode::Cron("0 0 */6 * * *".into())
        );
    }

    #[test]
    fn test_mode_interval_clamps_to_one_minute() {
        let cfg = CheckConfig {
            interval_minutes: 0,
            ..Default::default()
        };
        assert_eq!(
            ScheduleMode::from_check_config(&cfg),
            ScheduleMode::Interval(Duration::from_secs(60))
        );
    }
}

//! Daily settlement trigger
//!
//! Sleeps until the configured UTC wall time, runs the engine for the new
//! day, and repeats. A failed run is logged and left unprocessed so the
//! next trigger (or a manual `nexa settle`) retries it.

use super::engine::{SettlementEngine, SettlementOutcome};
use crate::config::PlatformConfig;
use anyhow::Result;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// First instant strictly after `now` whose UTC wall time is `at`.
pub fn next_trigger_after(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today_at = now.date_naive().and_time(at).and_utc();
    if today_at > now {
        today_at
    } else {
        today_at + Duration::days(1)
    }
}

/// Whether the one-off startup run is allowed for this configuration.
pub fn startup_run_enabled(config: &PlatformConfig) -> bool {
    if !config.settlement.run_on_startup {
        return false;
    }
    if config.is_production() {
        warn!("settlement.run_on_startup is ignored in production");
        return false;
    }
    true
}

pub struct SettlementScheduler;

impl SettlementScheduler {
    /// Spawn the daily trigger loop for `engine`.
    pub fn spawn(engine: Arc<SettlementEngine>, config: &PlatformConfig) -> Result<JoinHandle<()>> {
        let trigger = config.settlement.trigger_time()?;
        let run_on_startup = startup_run_enabled(config);

        info!(
            "🗓️  Settlement scheduler armed for {} UTC daily{}",
            trigger.format("%H:%M"),
            if run_on_startup { " (plus startup run)" } else { "" }
        );

        Ok(tokio::spawn(async move {
            if run_on_startup {
                info!("Running startup settlement (non-production)");
                Self::run_once(&engine).await;
            }

            loop {
                let now = engine.ledger().clock().now();
                let next = next_trigger_after(now, trigger);
                let wait = (next - now).to_std().unwrap_or_default();
                info!(next_run = %next, "Next settlement trigger");
                tokio::time::sleep(wait).await;

                Self::run_once(&engine).await;
            }
        }))
    }

    async fn run_once(engine: &SettlementEngine) {
        match engine.run_for_today().await {
            Ok(SettlementOutcome::Settled(report)) => {
                info!(
                    date = %report.date,
                    investments = report.investments_processed,
                    "Scheduled settlement finished"
                );
            }
            Ok(SettlementOutcome::AlreadyProcessed { date }) => {
                info!(date = %date, "Scheduled settlement skipped, day already processed");
            }
            Err(e) => {
                error!(
                    error = %e,
                    "Scheduled settlement failed; day left unprocessed for retry"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    #[test]
    fn test_next_trigger_later_today() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 9, 30, 0).unwrap();
        let at = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        assert_eq!(
            next_trigger_after(now, at),
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_trigger_rolls_to_tomorrow() {
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();

        let now = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap();
        let next = next_trigger_after(now, midnight);
        assert_eq!(next.date_naive(), NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());

        // Exactly at the trigger means the next one is a day away.
        let at_trigger = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            next_trigger_after(at_trigger, midnight),
            Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_startup_run_gated_off_in_production() {
        let mut config = PlatformConfig::default();
        assert!(!startup_run_enabled(&config));

        config.settlement.run_on_startup = true;
        assert!(startup_run_enabled(&config));

        config.environment = "production".to_string();
        assert!(!startup_run_enabled(&config));
    }
}

//! Daily ROI Settlement Engine
//!
//! One run per calendar day:
//! 1. Skip if the day's settlement log is already marked processed
//! 2. Credit one day of ROI to every ACTIVE investment due on or before the day
//! 3. Advance (or complete) each investment's schedule
//! 4. Cascade referral commissions from each ROI credit
//! 5. Mark the day processed with the run totals
//!
//! Steps 1-5 share a single transaction. Any failure rolls the whole run
//! back, leaves the day unprocessed, and is returned to the caller.

use crate::{
    error::{LedgerError, LedgerResult},
    ledger::{credit_balance, due_investments, fetch_daily_log, save_schedule, LedgerStore},
    models::BalanceType,
    settlement::commission::distribute_commission,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Totals of one committed settlement run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReport {
    pub date: NaiveDate,
    pub run_id: String,
    pub investments_processed: usize,
    #[serde(rename = "totalROIDistributed")]
    pub roi_distributed: f64,
    pub completed_investments: usize,
    pub commissions_paid: usize,
    pub commission_total: f64,
}

impl SettlementReport {
    fn new(date: NaiveDate, run_id: String) -> Self {
        Self {
            date,
            run_id,
            investments_processed: 0,
            roi_distributed: 0.0,
            completed_investments: 0,
            commissions_paid: 0,
            commission_total: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettlementOutcome {
    /// The day was settled by an earlier run; nothing changed.
    AlreadyProcessed { date: NaiveDate },
    Settled(SettlementReport),
}

impl SettlementOutcome {
    pub fn report(&self) -> Option<&SettlementReport> {
        match self {
            SettlementOutcome::Settled(report) => Some(report),
            SettlementOutcome::AlreadyProcessed { .. } => None,
        }
    }
}

pub struct SettlementEngine {
    ledger: Arc<LedgerStore>,
    /// Serialises overlapping runs; the loser then sees the processed log.
    run_lock: Mutex<()>,
}

impl SettlementEngine {
    pub fn new(ledger: Arc<LedgerStore>) -> Self {
        Self {
            ledger,
            run_lock: Mutex::new(()),
        }
    }

    pub fn ledger(&self) -> &Arc<LedgerStore> {
        &self.ledger
    }

    /// Settle the clock's current UTC day.
    pub async fn run_for_today(&self) -> LedgerResult<SettlementOutcome> {
        let today = self.ledger.clock().today();
        self.run_daily_settlement(today).await
    }

    /// Operator-requested run for `date`, which must not be after the
    /// clock's current day. Past days re-run idempotently.
    pub async fn run_for_date(&self, date: NaiveDate) -> LedgerResult<SettlementOutcome> {
        let today = self.ledger.clock().today();
        if date > today {
            return Err(LedgerError::validation(format!(
                "cannot settle {} before it starts (today is {})",
                date, today
            )));
        }
        self.run_daily_settlement(date).await
    }

    /// Settle `today`. Safe to call any number of times for the same date.
    pub async fn run_daily_settlement(&self, today: NaiveDate) -> LedgerResult<SettlementOutcome> {
        let _guard = self.run_lock.lock().await;

        let run_id = Uuid::new_v4().to_string();
        let now = self.ledger.clock().now();
        let commissions = self.ledger.config().commissions.clone();

        info!(run_id = %run_id, date = %today, "⏰ Starting daily ROI settlement");

        let result = self
            .ledger
            .write(|tx| {
                if let Some(log) = fetch_daily_log(tx, today)? {
                    if log.is_processed {
                        return Ok(SettlementOutcome::AlreadyProcessed { date: today });
                    }
                }

                let due = due_investments(tx, today)?;
                let mut report = SettlementReport::new(today, run_id.clone());

                for mut investment in due {
                    let roi_amount = investment.daily_payout();

                    tx.execute(
                        "INSERT INTO roi_history (user_id, investment_id, amount_earned, date, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![investment.user_id, investment.id, roi_amount, today, now],
                    )?;
                    credit_balance(tx, investment.user_id, BalanceType::Roi, roi_amount)?;

                    if investment.advance_schedule() {
                        report.completed_investments += 1;
                    }
                    save_schedule(tx, &investment)?;

                    let paid = distribute_commission(
                        tx,
                        investment.user_id,
                        roi_amount,
                        &commissions,
                        now,
                    )?;
                    report.commissions_paid += paid.len();
                    report.commission_total += paid.iter().map(|p| p.amount).sum::<f64>();

                    report.investments_processed += 1;
                    report.roi_distributed += roi_amount;

                    debug!(
                        investment_id = investment.id,
                        user_id = investment.user_id,
                        amount = roi_amount,
                        status = investment.status.as_str(),
                        next_payment_date = %investment.next_payment_date,
                        "ROI credited"
                    );
                }

                mark_processed(tx, &report, now)?;
                Ok(SettlementOutcome::Settled(report))
            })
            .await;

        match &result {
            Ok(SettlementOutcome::AlreadyProcessed { .. }) => {
                info!(run_id = %run_id, date = %today, "Settlement already processed for this day");
            }
            Ok(SettlementOutcome::Settled(report)) => {
                info!(
                    run_id = %run_id,
                    date = %today,
                    investments = report.investments_processed,
                    roi = report.roi_distributed,
                    completed = report.completed_investments,
                    commissions = report.commissions_paid,
                    commission_total = report.commission_total,
                    "✅ Daily settlement committed"
                );
            }
            Err(e) => {
                error!(run_id = %run_id, date = %today, error = %e, "❌ Daily settlement rolled back");
            }
        }
        result
    }
}

/// Upsert the idempotency record for the run's day.
fn mark_processed(
    conn: &Connection,
    report: &SettlementReport,
    now: DateTime<Utc>,
) -> LedgerResult<()> {
    let processed = i64::try_from(report.investments_processed)
        .map_err(|_| LedgerError::validation("investment count out of range"))?;
    conn.execute(
        "INSERT INTO daily_settlement_log
            (date, is_processed, processed_at, total_roi_distributed, total_investments_processed, run_id)
         VALUES (?1, 1, ?2, ?3, ?4, ?5)
         ON CONFLICT(date) DO UPDATE SET
            is_processed = 1,
            processed_at = excluded.processed_at,
            total_roi_distributed = excluded.total_roi_distributed,
            total_investments_processed = excluded.total_investments_processed,
            run_id = excluded.run_id",
        params![report.date, now, report.roi_distributed, processed, report.run_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_support::{ledger, user};
    use crate::models::{InvestmentStatus, Plan};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    #[tokio::test]
    async fn test_nothing_due_still_marks_day() {
        let (store, _clock) = ledger();
        let engine = SettlementEngine::new(Arc::new(store));

        let outcome = engine.run_daily_settlement(day(1)).await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.investments_processed, 0);
        assert_eq!(report.roi_distributed, 0.0);

        let log = engine.ledger().daily_log(day(1)).await.unwrap().unwrap();
        assert!(log.is_processed);
        assert_eq!(log.total_investments_processed, 0);
        assert_eq!(log.run_id.as_deref(), Some(report.run_id.as_str()));
    }

    #[tokio::test]
    async fn test_investment_not_due_on_creation_day() {
        let (store, _clock) = ledger();
        let alice = user(&store, "alice@example.com", None).await;
        store
            .create_investment(alice.id, 1000.0, Plan::Starter)
            .await
            .unwrap();
        let engine = SettlementEngine::new(Arc::new(store));

        let outcome = engine.run_daily_settlement(day(1)).await.unwrap();
        assert_eq!(outcome.report().unwrap().investments_processed, 0);
        assert_eq!(
            engine.ledger().get_user(alice.id).await.unwrap().roi_balance,
            0.0
        );
    }

    #[tokio::test]
    async fn test_failure_rolls_back_the_whole_run() {
        let (store, _clock) = ledger();
        let alice = user(&store, "alice@example.com", None).await;
        let bob = user(&store, "bob@example.com", Some(&alice)).await;
        let first = store
            .create_investment(alice.id, 1000.0, Plan::Starter)
            .await
            .unwrap();
        let second = store
            .create_investment(bob.id, 500.0, Plan::Pro)
            .await
            .unwrap();
        let referral_before = store.get_user(alice.id).await.unwrap().referral_balance;

        // A conflicting ROI row for the second investment makes its insert fail.
        store
            .write(|tx| {
                tx.execute(
                    "INSERT INTO roi_history (user_id, investment_id, amount_earned, date, created_at)
                     VALUES (?1, ?2, 0.0, ?3, '2025-01-02 00:00:00+00:00')",
                    params![bob.id, second.id, day(2)],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let store = Arc::new(store);
        let engine = SettlementEngine::new(store.clone());
        let err = engine.run_daily_settlement(day(2)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Persistence(_)));

        let alice_after = store.get_user(alice.id).await.unwrap();
        assert_eq!(alice_after.roi_balance, 0.0);
        assert_eq!(alice_after.referral_balance, referral_before);
        assert_eq!(
            store.get_investment(alice.id, first.id).await.unwrap().next_payment_date,
            day(2)
        );
        assert!(store.roi_history_for_investment(first.id).await.unwrap().is_empty());
        assert!(store.daily_log(day(2)).await.unwrap().is_none());

        // Clearing the conflict lets the retry settle everything from scratch.
        store
            .write(|tx| {
                tx.execute("DELETE FROM roi_history", [])?;
                Ok(())
            })
            .await
            .unwrap();
        let retry = engine.run_daily_settlement(day(2)).await.unwrap();
        assert_eq!(retry.report().unwrap().investments_processed, 2);
        assert_eq!(store.get_user(alice.id).await.unwrap().roi_balance, 10.0);
    }

    #[tokio::test]
    async fn test_requested_date_cannot_be_ahead_of_clock() {
        let (store, clock) = ledger();
        let alice = user(&store, "alice@example.com", None).await;
        let inv = store
            .create_investment(alice.id, 1000.0, Plan::Starter)
            .await
            .unwrap();
        let store = Arc::new(store);
        let engine = SettlementEngine::new(store.clone());

        // Clock reads Jan 1; paying out the rest of the plan early must fail.
        for d in 2..=31 {
            let err = engine.run_for_date(day(d)).await.unwrap_err();
            assert!(matches!(err, LedgerError::Validation(_)));
        }
        assert_eq!(store.get_user(alice.id).await.unwrap().roi_balance, 0.0);
        assert!(store.roi_history_for_investment(inv.id).await.unwrap().is_empty());
        assert!(store.daily_log(day(2)).await.unwrap().is_none());

        // The current day and past days are accepted.
        clock.advance_days(1);
        let outcome = engine.run_for_date(day(2)).await.unwrap();
        assert_eq!(outcome.report().unwrap().investments_processed, 1);
        assert!(engine.run_for_date(day(1)).await.unwrap().report().is_some());
        assert!(matches!(
            engine.run_for_date(day(2)).await.unwrap(),
            SettlementOutcome::AlreadyProcessed { .. }
        ));
        assert_eq!(store.get_user(alice.id).await.unwrap().roi_balance, 10.0);
    }

    #[tokio::test]
    async fn test_missed_days_pay_one_day_per_run() {
        let (store, _clock) = ledger();
        let alice = user(&store, "alice@example.com", None).await;
        let inv = store
            .create_investment(alice.id, 1000.0, Plan::Starter)
            .await
            .unwrap();
        let store = Arc::new(store);
        let engine = SettlementEngine::new(store.clone());

        // First run only after a week of downtime.
        engine.run_daily_settlement(day(8)).await.unwrap();

        assert_eq!(store.get_user(alice.id).await.unwrap().roi_balance, 10.0);
        let after = store.get_investment(alice.id, inv.id).await.unwrap();
        assert_eq!(after.next_payment_date, day(3));
        assert_eq!(after.status, InvestmentStatus::Active);
    }

    #[tokio::test]
    async fn test_overlapping_runs_settle_once() {
        let (store, _clock) = ledger();
        let alice = user(&store, "alice@example.com", None).await;
        store
            .create_investment(alice.id, 1000.0, Plan::Starter)
            .await
            .unwrap();
        let store = Arc::new(store);
        let engine = Arc::new(SettlementEngine::new(store.clone()));

        let a = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_daily_settlement(day(2)).await }
        });
        let b = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_daily_settlement(day(2)).await }
        });
        let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];

        let settled = outcomes.iter().filter(|o| o.report().is_some()).count();
        assert_eq!(settled, 1);
        assert_eq!(store.get_user(alice.id).await.unwrap().roi_balance, 10.0);
    }
}

//! Investment creation and schedule persistence.

use super::{fetch_user, investment_from_row, LedgerStore, INVESTMENT_COLUMNS};
use crate::{
    error::{LedgerError, LedgerResult},
    models::{Investment, InvestmentStatus, Plan},
    settlement::commission::pay_instant_bonus,
};
use chrono::{Days, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

impl LedgerStore {
    /// Open a new investment for `user_id`.
    ///
    /// Snapshots the plan's daily rate, schedules the first payout for the
    /// next calendar day, adds the principal to `total_invested`, and pays
    /// the referrer's instant bonus, all in one transaction.
    pub async fn create_investment(
        &self,
        user_id: i64,
        amount: f64,
        plan: Plan,
    ) -> LedgerResult<Investment> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(LedgerError::validation(format!(
                "investment amount must be positive, got {}",
                amount
            )));
        }

        let terms = self.config.plans.terms(plan);
        let bonus_rate = self.config.commissions.instant_bonus_rate;
        let now = self.clock.now();
        let start_day = now.date_naive();
        let end_date = start_day
            .checked_add_days(Days::new(terms.duration_days as u64))
            .ok_or_else(|| LedgerError::validation("plan duration overflows the calendar"))?;
        let next_payment_date = start_day
            .succ_opt()
            .ok_or_else(|| LedgerError::validation("start date overflows the calendar"))?;

        let (investment, bonus) = self
            .write(|tx| {
                let investor = fetch_user(tx, user_id)?;

                tx.execute(
                    "INSERT INTO investments
                        (user_id, amount, plan, daily_roi, start_date, end_date, status, next_payment_date)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        user_id,
                        amount,
                        plan,
                        terms.daily_roi,
                        now,
                        end_date,
                        InvestmentStatus::Active,
                        next_payment_date
                    ],
                )?;
                let investment = Investment {
                    id: tx.last_insert_rowid(),
                    user_id,
                    amount,
                    plan,
                    daily_roi: terms.daily_roi,
                    start_date: now,
                    end_date,
                    status: InvestmentStatus::Active,
                    next_payment_date,
                };

                tx.execute(
                    "UPDATE users SET total_invested = total_invested + ?1 WHERE id = ?2",
                    params![amount, user_id],
                )?;

                let bonus = pay_instant_bonus(tx, &investor, &investment, bonus_rate, now)?;
                Ok((investment, bonus))
            })
            .await?;

        info!(
            user_id,
            investment_id = investment.id,
            amount,
            plan = plan.as_str(),
            "💰 Investment created, first payout {}",
            investment.next_payment_date
        );
        if let Some(bonus) = bonus {
            info!(
                user_id = bonus.user_id,
                from_user_id = user_id,
                amount = bonus.amount,
                "🎁 Instant referral bonus paid"
            );
        }
        Ok(investment)
    }

    /// Investments owned by `user_id`, newest first.
    pub async fn list_investments(&self, user_id: i64) -> LedgerResult<Vec<Investment>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {} FROM investments WHERE user_id = ?1 ORDER BY id DESC",
                INVESTMENT_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map([user_id], investment_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// One investment, visible only to its owner.
    pub async fn get_investment(&self, user_id: i64, investment_id: i64) -> LedgerResult<Investment> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {} FROM investments WHERE id = ?1 AND user_id = ?2",
                INVESTMENT_COLUMNS
            );
            conn.query_row(&sql, params![investment_id, user_id], investment_from_row)
                .optional()?
                .ok_or_else(|| LedgerError::not_found(format!("Investment {}", investment_id)))
        })
        .await
    }
}

/// Active investments whose next payout is on or before `today`.
pub(crate) fn due_investments(conn: &Connection, today: NaiveDate) -> LedgerResult<Vec<Investment>> {
    let sql = format!(
        "SELECT {} FROM investments
         WHERE status = ?1 AND next_payment_date <= ?2
         ORDER BY id ASC",
        INVESTMENT_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(params![InvestmentStatus::Active, today], investment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Persist the status and next payout date after a settlement step.
pub(crate) fn save_schedule(conn: &Connection, investment: &Investment) -> LedgerResult<()> {
    let changed = conn.execute(
        "UPDATE investments SET status = ?1, next_payment_date = ?2 WHERE id = ?3",
        params![investment.status, investment.next_payment_date, investment.id],
    )?;
    if changed == 0 {
        return Err(LedgerError::not_found(format!("Investment {}", investment.id)));
    }
    Ok(())
}

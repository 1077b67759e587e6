//! Referral Commission Distributor
//!
//! Two payout paths share the `level_income` audit table:
//! - the daily cascade, paid out of each settled ROI credit, walking up to
//!   three referrers with decaying rates
//! - the one-time instant bonus, paid to the direct referrer only when an
//!   investment is created
//!
//! Both run on a caller-supplied connection so they commit or roll back
//! together with the operation that triggered them.

use crate::{
    config::CommissionTable,
    error::LedgerResult,
    ledger::{credit_balance, referrer_of},
    models::{BalanceType, IncomeSource, Investment, LevelIncome, User},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Pay the daily cascade for one ROI credit earned by `investor_id`.
///
/// Stops early when the chain runs out of referrers. A referrer seen twice
/// ends the walk without paying the repeat.
pub fn distribute_commission(
    conn: &Connection,
    investor_id: i64,
    roi_amount: f64,
    table: &CommissionTable,
    now: DateTime<Utc>,
) -> LedgerResult<Vec<LevelIncome>> {
    let mut paid = Vec::with_capacity(table.depth());
    let mut visited = HashSet::from([investor_id]);
    let mut current = investor_id;

    for level in 1..=table.depth() {
        let Some(referrer) = referrer_of(conn, current)? else {
            break;
        };
        if !visited.insert(referrer) {
            warn!(
                investor_id,
                referrer, level, "Referral cycle detected, stopping commission walk"
            );
            break;
        }
        let Some(rate) = table.rate_for_level(level) else {
            break;
        };

        let amount = roi_amount * rate;
        if amount > 0.0 {
            let income = record_level_income(
                conn,
                referrer,
                investor_id,
                level as u8,
                amount,
                IncomeSource::DailyRoi,
                None,
                now,
            )?;
            credit_balance(conn, referrer, BalanceType::Referral, amount)?;
            debug!(
                user_id = referrer,
                from_user_id = investor_id,
                level,
                amount,
                "Level commission credited"
            );
            paid.push(income);
        }

        current = referrer;
    }

    Ok(paid)
}

/// Pay the one-time level-1 bonus for a freshly created investment.
///
/// Returns `None` when the investor has no referrer or the bonus rounds to
/// nothing.
pub fn pay_instant_bonus(
    conn: &Connection,
    investor: &User,
    investment: &Investment,
    rate: f64,
    now: DateTime<Utc>,
) -> LedgerResult<Option<LevelIncome>> {
    let Some(referrer) = investor.referred_by else {
        return Ok(None);
    };
    let amount = investment.amount * rate;
    if amount <= 0.0 {
        return Ok(None);
    }

    let description = format!(
        "Direct referral bonus from {}'s {} investment",
        investor.name,
        investment.plan.as_str()
    );
    let income = record_level_income(
        conn,
        referrer,
        investor.id,
        1,
        amount,
        IncomeSource::InstantBonus,
        Some(description),
        now,
    )?;
    credit_balance(conn, referrer, BalanceType::Referral, amount)?;
    Ok(Some(income))
}

#[allow(clippy::too_many_arguments)]
fn record_level_income(
    conn: &Connection,
    recipient: i64,
    from_user_id: i64,
    level: u8,
    amount: f64,
    source: IncomeSource,
    description: Option<String>,
    now: DateTime<Utc>,
) -> LedgerResult<LevelIncome> {
    conn.execute(
        "INSERT INTO level_income (user_id, from_user_id, level, amount, source, description, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![recipient, from_user_id, level, amount, source, description, now],
    )?;

    Ok(LevelIncome {
        id: conn.last_insert_rowid(),
        user_id: recipient,
        from_user_id,
        level,
        amount,
        source,
        description,
        created_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::ledger::test_support::{ledger, user};

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[tokio::test]
    async fn test_cascade_decays_and_caps_at_three_levels() {
        let (store, _clock) = ledger();
        let l4 = user(&store, "l4@example.com", None).await;
        let l3 = user(&store, "l3@example.com", Some(&l4)).await;
        let l2 = user(&store, "l2@example.com", Some(&l3)).await;
        let l1 = user(&store, "l1@example.com", Some(&l2)).await;
        let investor = user(&store, "investor@example.com", Some(&l1)).await;

        let table = store.config().commissions.clone();
        let now = store.clock().now();
        let paid = store
            .write(|tx| distribute_commission(tx, investor.id, 100.0, &table, now))
            .await
            .unwrap();

        assert_eq!(paid.len(), 3);
        assert_eq!(
            paid.iter().map(|p| p.user_id).collect::<Vec<_>>(),
            vec![l1.id, l2.id, l3.id]
        );
        assert!(paid.iter().all(|p| p.from_user_id == investor.id));
        assert!(approx(store.get_user(l1.id).await.unwrap().referral_balance, 5.0));
        assert!(approx(store.get_user(l2.id).await.unwrap().referral_balance, 3.0));
        assert!(approx(store.get_user(l3.id).await.unwrap().referral_balance, 1.0));
        assert_eq!(store.get_user(l4.id).await.unwrap().referral_balance, 0.0);
    }

    #[tokio::test]
    async fn test_short_chain_stops_without_error() {
        let (store, _clock) = ledger();
        let parent = user(&store, "parent@example.com", None).await;
        let child = user(&store, "child@example.com", Some(&parent)).await;
        let loner = user(&store, "loner@example.com", None).await;

        let table = store.config().commissions.clone();
        let now = store.clock().now();
        let paid = store
            .write(|tx| distribute_commission(tx, child.id, 10.0, &table, now))
            .await
            .unwrap();
        assert_eq!(paid.len(), 1);
        assert_eq!(paid[0].level, 1);
        assert_eq!(paid[0].source, IncomeSource::DailyRoi);

        let none = store
            .write(|tx| distribute_commission(tx, loner.id, 10.0, &table, now))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_zero_rate_level_is_skipped_but_walk_continues() {
        let (store, _clock) = ledger();
        let top = user(&store, "top@example.com", None).await;
        let mid = user(&store, "mid@example.com", Some(&top)).await;
        let investor = user(&store, "investor@example.com", Some(&mid)).await;

        let table = CommissionTable {
            level_rates: vec![0.0, 0.03],
            instant_bonus_rate: 0.05,
        };
        let now = store.clock().now();
        let paid = store
            .write(|tx| distribute_commission(tx, investor.id, 100.0, &table, now))
            .await
            .unwrap();

        assert_eq!(paid.len(), 1);
        assert_eq!(paid[0].user_id, top.id);
        assert_eq!(paid[0].level, 2);
    }

    #[tokio::test]
    async fn test_cycle_in_stored_chain_pays_each_referrer_once() {
        let (store, _clock) = ledger();
        let a = user(&store, "a@example.com", None).await;
        let b = user(&store, "b@example.com", Some(&a)).await;
        let investor = user(&store, "investor@example.com", Some(&a)).await;

        // a <-> b loop written directly; the investor hangs off a.
        store
            .write(|tx| {
                tx.execute(
                    "UPDATE users SET referred_by = ?1 WHERE id = ?2",
                    [b.id, a.id],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let table = store.config().commissions.clone();
        let now = store.clock().now();
        let paid = store
            .write(|tx| distribute_commission(tx, investor.id, 100.0, &table, now))
            .await
            .unwrap();

        assert_eq!(
            paid.iter().map(|p| (p.user_id, p.level)).collect::<Vec<_>>(),
            vec![(a.id, 1), (b.id, 2)]
        );
        assert!(approx(store.get_user(a.id).await.unwrap().referral_balance, 5.0));
        assert!(approx(store.get_user(b.id).await.unwrap().referral_balance, 3.0));
        assert_eq!(store.level_income(a.id, 10).await.unwrap().len(), 1);

        // Investor inside the loop: the walk stops when it returns to them.
        let paid = store
            .write(|tx| distribute_commission(tx, a.id, 100.0, &table, now))
            .await
            .unwrap();
        assert_eq!(paid.len(), 1);
        assert_eq!(paid[0].user_id, b.id);
        assert!(approx(store.get_user(a.id).await.unwrap().referral_balance, 5.0));
    }
}

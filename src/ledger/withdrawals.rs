//! Balance reservation: withdrawal requests, admin resolution, airdrops.
//!
//! Funds leave the spendable balance when a withdrawal is requested. An
//! approval only records the payout; a rejection refunds the exact amount
//! to the balance it came from.

use super::{
    credit_balance, user_from_row, withdrawal_from_row, LedgerStore, USER_COLUMNS,
    WITHDRAWAL_COLUMNS,
};
use crate::{
    error::{LedgerError, LedgerResult},
    models::{BalanceType, User, Withdrawal, WithdrawalStatus},
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

impl LedgerStore {
    /// Reserve `amount` from the named balance and open a PENDING withdrawal.
    ///
    /// The balance check and the debit happen in the same IMMEDIATE
    /// transaction, and the debit itself is guarded in SQL, so two
    /// concurrent requests can never both spend the same funds.
    pub async fn request_withdrawal(
        &self,
        user_id: i64,
        amount: f64,
        balance_type: BalanceType,
        wallet_address: &str,
    ) -> LedgerResult<Withdrawal> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(LedgerError::validation(format!(
                "withdrawal amount must be positive, got {}",
                amount
            )));
        }
        let min_amount = self.config.withdrawals.min_amount;
        if amount < min_amount {
            return Err(LedgerError::validation(format!(
                "minimum withdrawal is {:.2}",
                min_amount
            )));
        }
        let wallet_address = wallet_address.trim();
        if wallet_address.is_empty() {
            return Err(LedgerError::validation("wallet address is required"));
        }

        let currency = self.config.withdrawals.currency.clone();
        let now = self.clock.now();
        let column = balance_type.column();

        let result = self
            .write(|tx| {
                let available: Option<f64> = tx
                    .query_row(
                        &format!("SELECT {} FROM users WHERE id = ?1", column),
                        [user_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let available =
                    available.ok_or_else(|| LedgerError::not_found(format!("User {}", user_id)))?;
                if amount > available {
                    return Err(LedgerError::InsufficientFunds {
                        balance_type,
                        available,
                        requested: amount,
                    });
                }

                let debited = tx.execute(
                    &format!(
                        "UPDATE users SET {col} = {col} - ?1 WHERE id = ?2 AND {col} >= ?1",
                        col = column
                    ),
                    params![amount, user_id],
                )?;
                if debited == 0 {
                    return Err(LedgerError::InsufficientFunds {
                        balance_type,
                        available,
                        requested: amount,
                    });
                }

                tx.execute(
                    "INSERT INTO withdrawals
                        (user_id, amount, currency, wallet_address, balance_type, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        user_id,
                        amount,
                        currency,
                        wallet_address,
                        balance_type,
                        WithdrawalStatus::Pending,
                        now
                    ],
                )?;
                fetch_withdrawal(tx, tx.last_insert_rowid())
            })
            .await;

        match &result {
            Ok(w) => info!(
                user_id,
                withdrawal_id = w.id,
                amount,
                balance_type = balance_type.as_str(),
                "🏧 Withdrawal requested, funds reserved"
            ),
            Err(LedgerError::InsufficientFunds { available, .. }) => warn!(
                user_id,
                amount,
                available,
                balance_type = balance_type.as_str(),
                "Withdrawal rejected: insufficient funds"
            ),
            Err(_) => {}
        }
        result
    }

    /// Move a PENDING withdrawal to APPROVED or REJECTED.
    ///
    /// Rejection refunds the reserved amount to the originating balance in
    /// the same transaction as the status change.
    pub async fn resolve_withdrawal(
        &self,
        withdrawal_id: i64,
        new_status: WithdrawalStatus,
        transaction_hash: Option<String>,
        admin_notes: Option<String>,
    ) -> LedgerResult<Withdrawal> {
        if !new_status.is_terminal() {
            return Err(LedgerError::validation(format!(
                "withdrawals can only be moved to APPROVED or REJECTED, not {}",
                new_status.as_str()
            )));
        }
        let transaction_hash = transaction_hash
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());
        let now = self.clock.now();

        let resolved = self
            .write(|tx| {
                let current = fetch_withdrawal(tx, withdrawal_id)?;
                if current.status.is_terminal() {
                    return Err(LedgerError::AlreadyProcessed(format!(
                        "Withdrawal {} already {}",
                        withdrawal_id,
                        current.status.as_str()
                    )));
                }

                if new_status == WithdrawalStatus::Rejected {
                    credit_balance(tx, current.user_id, current.balance_type, current.amount)?;
                }

                let notes = admin_notes.unwrap_or(current.admin_notes);
                let changed = tx.execute(
                    "UPDATE withdrawals
                     SET status = ?1, transaction_hash = COALESCE(?2, transaction_hash),
                         admin_notes = ?3, updated_at = ?4
                     WHERE id = ?5 AND status = ?6",
                    params![
                        new_status,
                        transaction_hash,
                        notes,
                        now,
                        withdrawal_id,
                        WithdrawalStatus::Pending
                    ],
                )?;
                if changed == 0 {
                    return Err(LedgerError::AlreadyProcessed(format!(
                        "Withdrawal {} is no longer pending",
                        withdrawal_id
                    )));
                }
                fetch_withdrawal(tx, withdrawal_id)
            })
            .await?;

        info!(
            withdrawal_id,
            user_id = resolved.user_id,
            amount = resolved.amount,
            status = resolved.status.as_str(),
            refunded = resolved.status == WithdrawalStatus::Rejected,
            "Withdrawal resolved"
        );
        Ok(resolved)
    }

    /// Administrative direct credit to one named balance.
    pub async fn airdrop(
        &self,
        email: &str,
        amount: f64,
        balance_type: BalanceType,
    ) -> LedgerResult<User> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(LedgerError::validation(format!(
                "airdrop amount must be positive, got {}",
                amount
            )));
        }
        let email = email.trim().to_lowercase();
        let column = balance_type.column();

        let user = self
            .write(|tx| {
                let sql = format!(
                    "UPDATE users SET {col} = {col} + ?1 WHERE email = ?2 RETURNING {cols}",
                    col = column,
                    cols = USER_COLUMNS
                );
                tx.query_row(&sql, params![amount, email], user_from_row)
                    .optional()?
                    .ok_or_else(|| LedgerError::not_found(format!("User with email {}", email)))
            })
            .await?;

        info!(
            user_id = user.id,
            amount,
            balance_type = balance_type.as_str(),
            "🪂 Airdrop credited to {}",
            user.email
        );
        Ok(user)
    }

    /// Withdrawals of one user, newest first.
    pub async fn list_withdrawals(&self, user_id: i64) -> LedgerResult<Vec<Withdrawal>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {} FROM withdrawals WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
                WITHDRAWAL_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map([user_id], withdrawal_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Admin queue: every PENDING withdrawal, oldest first.
    pub async fn list_pending_withdrawals(&self) -> LedgerResult<Vec<Withdrawal>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {} FROM withdrawals WHERE status = ?1 ORDER BY created_at ASC, id ASC",
                WITHDRAWAL_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map([WithdrawalStatus::Pending], withdrawal_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn get_withdrawal(&self, withdrawal_id: i64) -> LedgerResult<Withdrawal> {
        self.read(|conn| fetch_withdrawal(conn, withdrawal_id)).await
    }
}

fn fetch_withdrawal(conn: &Connection, withdrawal_id: i64) -> LedgerResult<Withdrawal> {
    let sql = format!("SELECT {} FROM withdrawals WHERE id = ?1", WITHDRAWAL_COLUMNS);
    conn.query_row(&sql, [withdrawal_id], withdrawal_from_row)
        .optional()?
        .ok_or_else(|| LedgerError::not_found(format!("Withdrawal {}", withdrawal_id)))
}

//! Ledger Store
//!
//! SQLite-backed records for users, investments, ROI history, commission
//! income, withdrawals and the daily settlement log.
//!
//! Concurrency model:
//! - One connection behind an async mutex, so every writer is serialised
//! - Multi-step monetary operations run inside `BEGIN IMMEDIATE`
//!   transactions and roll back as a unit on any error
//! - Balances only move through SQL increments (`col = col + ?`)

mod investments;
mod referrals;
mod withdrawals;

pub(crate) use investments::{due_investments, save_schedule};
pub use referrals::DEFAULT_TREE_DEPTH;

use crate::{
    clock::Clock,
    config::PlatformConfig,
    error::{LedgerError, LedgerResult},
    models::{
        BalanceType, DailySettlementLog, DashboardSummary, Investment, LevelIncome, NewUser,
        RoiChartPoint, RoiHistoryEntry, User, Withdrawal,
    },
};
use chrono::NaiveDate;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT UNIQUE NOT NULL,
    referral_code TEXT UNIQUE NOT NULL,
    referred_by INTEGER REFERENCES users(id),
    role TEXT NOT NULL DEFAULT 'user',
    roi_balance REAL NOT NULL DEFAULT 0.0 CHECK (roi_balance >= 0),
    referral_balance REAL NOT NULL DEFAULT 0.0 CHECK (referral_balance >= 0),
    total_invested REAL NOT NULL DEFAULT 0.0 CHECK (total_invested >= 0),
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_referred_by ON users(referred_by);

CREATE TABLE IF NOT EXISTS investments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    amount REAL NOT NULL CHECK (amount > 0),
    plan TEXT NOT NULL,
    daily_roi REAL NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    next_payment_date TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_investments_user_status ON investments(user_id, status);
CREATE INDEX IF NOT EXISTS idx_investments_due ON investments(status, next_payment_date);

CREATE TABLE IF NOT EXISTS roi_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    investment_id INTEGER NOT NULL REFERENCES investments(id),
    amount_earned REAL NOT NULL CHECK (amount_earned >= 0),
    date TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (investment_id, date)
);

CREATE INDEX IF NOT EXISTS idx_roi_history_user_date ON roi_history(user_id, date DESC);

CREATE TABLE IF NOT EXISTS level_income (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    from_user_id INTEGER NOT NULL REFERENCES users(id),
    level INTEGER NOT NULL CHECK (level BETWEEN 1 AND 3),
    amount REAL NOT NULL CHECK (amount >= 0),
    source TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_level_income_user ON level_income(user_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_level_income_from ON level_income(from_user_id);

CREATE TABLE IF NOT EXISTS withdrawals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    amount REAL NOT NULL CHECK (amount > 0),
    currency TEXT NOT NULL,
    wallet_address TEXT NOT NULL,
    balance_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    transaction_hash TEXT,
    admin_notes TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_withdrawals_user_status ON withdrawals(user_id, status);

CREATE TABLE IF NOT EXISTS daily_settlement_log (
    date TEXT PRIMARY KEY,
    is_processed INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT,
    total_roi_distributed REAL NOT NULL DEFAULT 0.0,
    total_investments_processed INTEGER NOT NULL DEFAULT 0,
    run_id TEXT
);
"#;

pub(crate) const USER_COLUMNS: &str = "id, name, email, referral_code, referred_by, role, \
     roi_balance, referral_balance, total_invested, created_at";

pub(crate) const INVESTMENT_COLUMNS: &str =
    "id, user_id, amount, plan, daily_roi, start_date, end_date, status, next_payment_date";

pub(crate) const WITHDRAWAL_COLUMNS: &str = "id, user_id, amount, currency, wallet_address, \
     balance_type, status, transaction_hash, admin_notes, created_at, updated_at";

const REFERRAL_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const REFERRAL_CODE_LEN: usize = 6;

/// Ledger database manager
pub struct LedgerStore {
    conn: Arc<Mutex<Connection>>,
    config: Arc<PlatformConfig>,
    clock: Arc<dyn Clock>,
}

impl LedgerStore {
    /// Open (or create) the ledger at `db_path` and apply the schema.
    pub fn open(
        db_path: &str,
        config: Arc<PlatformConfig>,
        clock: Arc<dyn Clock>,
    ) -> LedgerResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn, config, clock)
    }

    /// Private in-memory ledger.
    pub fn open_in_memory(
        config: Arc<PlatformConfig>,
        clock: Arc<dyn Clock>,
    ) -> LedgerResult<Self> {
        Self::init(Connection::open_in_memory()?, config, clock)
    }

    fn init(
        conn: Connection,
        config: Arc<PlatformConfig>,
        clock: Arc<dyn Clock>,
    ) -> LedgerResult<Self> {
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !matches!(journal_mode.to_lowercase().as_str(), "wal" | "memory") {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;

        let users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        info!("📒 Ledger opened ({} users)", users);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
            clock,
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run `f` inside one IMMEDIATE transaction. Commits only when `f`
    /// returns Ok; any error rolls the whole unit back.
    pub(crate) async fn write<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> LedgerResult<T>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run a read-only query against the live connection.
    pub(crate) async fn read<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&Connection) -> LedgerResult<T>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Register a user, resolving the optional referrer by referral code.
    ///
    /// The referrer link is only ever written here, to a user that already
    /// exists, so the referral graph stays a forest.
    pub async fn create_user(&self, new_user: &NewUser) -> LedgerResult<User> {
        let name = new_user.name.trim().to_string();
        let email = new_user.email.trim().to_lowercase();
        if name.is_empty() {
            return Err(LedgerError::validation("name is required"));
        }
        if !is_plausible_email(&email) {
            return Err(LedgerError::validation(format!("invalid email '{}'", email)));
        }
        let referrer_code = new_user
            .referral_code
            .as_deref()
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty());
        let now = self.clock.now();

        let user = self
            .write(|tx| {
                let taken: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM users WHERE email = ?1)",
                    [&email],
                    |row| row.get(0),
                )?;
                if taken {
                    return Err(LedgerError::validation("email already registered"));
                }

                let referred_by = match referrer_code.as_deref() {
                    Some(code) => Some(
                        tx.query_row(
                            "SELECT id FROM users WHERE referral_code = ?1",
                            [code],
                            |row| row.get::<_, i64>(0),
                        )
                        .optional()?
                        .ok_or_else(|| {
                            LedgerError::validation(format!("unknown referral code '{}'", code))
                        })?,
                    ),
                    None => None,
                };

                let referral_code = unique_referral_code(tx)?;
                tx.execute(
                    "INSERT INTO users (name, email, referral_code, referred_by, role, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![name, email, referral_code, referred_by, new_user.role, now],
                )?;
                fetch_user(tx, tx.last_insert_rowid())
            })
            .await?;

        info!(
            user_id = user.id,
            referred_by = ?user.referred_by,
            "✅ Created user {} ({})",
            user.email,
            user.referral_code
        );
        Ok(user)
    }

    pub async fn get_user(&self, user_id: i64) -> LedgerResult<User> {
        self.read(|conn| fetch_user(conn, user_id)).await
    }

    pub async fn find_user_by_email(&self, email: &str) -> LedgerResult<Option<User>> {
        let email = email.trim().to_lowercase();
        self.read(|conn| {
            let sql = format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS);
            Ok(conn.query_row(&sql, [&email], user_from_row).optional()?)
        })
        .await
    }

    /// Display name of the user owning `code`, for the sign-up screen.
    pub async fn referrer_name_by_code(&self, code: &str) -> LedgerResult<Option<String>> {
        let code = code.trim().to_uppercase();
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT name FROM users WHERE referral_code = ?1",
                    [&code],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    /// All users, newest first.
    pub async fn list_users(&self) -> LedgerResult<Vec<User>> {
        self.read(|conn| {
            let sql = format!("SELECT {} FROM users ORDER BY id DESC", USER_COLUMNS);
            let mut stmt = conn.prepare_cached(&sql)?;
            let users = stmt
                .query_map([], user_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(users)
        })
        .await
    }

    pub async fn roi_history(&self, user_id: i64, limit: usize) -> LedgerResult<Vec<RoiHistoryEntry>> {
        let limit = limit.clamp(1, 1000) as i64;
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, user_id, investment_id, amount_earned, date, created_at
                 FROM roi_history WHERE user_id = ?1 ORDER BY date DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![user_id, limit], roi_entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn roi_history_for_investment(
        &self,
        investment_id: i64,
    ) -> LedgerResult<Vec<RoiHistoryEntry>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, user_id, investment_id, amount_earned, date, created_at
                 FROM roi_history WHERE investment_id = ?1 ORDER BY date ASC",
            )?;
            let rows = stmt
                .query_map([investment_id], roi_entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Per-day ROI totals for `user_id` from `since` onwards, oldest first.
    pub async fn roi_daily_totals(
        &self,
        user_id: i64,
        since: NaiveDate,
    ) -> LedgerResult<Vec<RoiChartPoint>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT date, SUM(amount_earned) FROM roi_history
                 WHERE user_id = ?1 AND date >= ?2
                 GROUP BY date ORDER BY date ASC",
            )?;
            let rows = stmt
                .query_map(params![user_id, since], |row| {
                    Ok(RoiChartPoint {
                        date: row.get(0)?,
                        amount: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Commission payments received by `user_id`, newest first.
    pub async fn level_income(&self, user_id: i64, limit: usize) -> LedgerResult<Vec<LevelIncome>> {
        let limit = limit.clamp(1, 1000) as i64;
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, user_id, from_user_id, level, amount, source, description, created_at
                 FROM level_income WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![user_id, limit], level_income_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn daily_log(&self, date: NaiveDate) -> LedgerResult<Option<DailySettlementLog>> {
        self.read(|conn| fetch_daily_log(conn, date)).await
    }

    /// Live balances plus lifetime ROI/referral earnings.
    pub async fn dashboard_summary(&self, user_id: i64) -> LedgerResult<DashboardSummary> {
        self.read(|conn| {
            let user = fetch_user(conn, user_id)?;
            let total_roi_earned: f64 = conn.query_row(
                "SELECT COALESCE(SUM(amount_earned), 0.0) FROM roi_history WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            let total_referral_earned: f64 = conn.query_row(
                "SELECT COALESCE(SUM(amount), 0.0) FROM level_income WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            let active_investments: i64 = conn.query_row(
                "SELECT COUNT(*) FROM investments WHERE user_id = ?1 AND status = 'ACTIVE'",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(DashboardSummary {
                roi_balance: user.roi_balance,
                referral_balance: user.referral_balance,
                total_invested: user.total_invested,
                total_roi_earned,
                total_referral_earned,
                active_investments,
            })
        })
        .await
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

fn generate_referral_code() -> String {
    let mut rng = rand::thread_rng();
    (0..REFERRAL_CODE_LEN)
        .map(|_| REFERRAL_CODE_CHARSET[rng.gen_range(0..REFERRAL_CODE_CHARSET.len())] as char)
        .collect()
}

fn unique_referral_code(conn: &Connection) -> LedgerResult<String> {
    loop {
        let code = generate_referral_code();
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE referral_code = ?1)",
            [&code],
            |row| row.get(0),
        )?;
        if !taken {
            return Ok(code);
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping and in-transaction helpers
// ---------------------------------------------------------------------------

pub(crate) fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        referral_code: row.get(3)?,
        referred_by: row.get(4)?,
        role: row.get(5)?,
        roi_balance: row.get(6)?,
        referral_balance: row.get(7)?,
        total_invested: row.get(8)?,
        created_at: row.get(9)?,
    })
}

pub(crate) fn investment_from_row(row: &Row<'_>) -> rusqlite::Result<Investment> {
    Ok(Investment {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        plan: row.get(3)?,
        daily_roi: row.get(4)?,
        start_date: row.get(5)?,
        end_date: row.get(6)?,
        status: row.get(7)?,
        next_payment_date: row.get(8)?,
    })
}

pub(crate) fn withdrawal_from_row(row: &Row<'_>) -> rusqlite::Result<Withdrawal> {
    Ok(Withdrawal {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        currency: row.get(3)?,
        wallet_address: row.get(4)?,
        balance_type: row.get(5)?,
        status: row.get(6)?,
        transaction_hash: row.get(7)?,
        admin_notes: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn roi_entry_from_row(row: &Row<'_>) -> rusqlite::Result<RoiHistoryEntry> {
    Ok(RoiHistoryEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        investment_id: row.get(2)?,
        amount_earned: row.get(3)?,
        date: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn level_income_from_row(row: &Row<'_>) -> rusqlite::Result<LevelIncome> {
    Ok(LevelIncome {
        id: row.get(0)?,
        user_id: row.get(1)?,
        from_user_id: row.get(2)?,
        level: row.get(3)?,
        amount: row.get(4)?,
        source: row.get(5)?,
        description: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub(crate) fn fetch_user(conn: &Connection, user_id: i64) -> LedgerResult<User> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    conn.query_row(&sql, [user_id], user_from_row)
        .optional()?
        .ok_or_else(|| LedgerError::not_found(format!("User {}", user_id)))
}

/// Upstream referrer of `user_id`, if any.
pub(crate) fn referrer_of(conn: &Connection, user_id: i64) -> LedgerResult<Option<i64>> {
    let referred_by: Option<Option<i64>> = conn
        .query_row(
            "SELECT referred_by FROM users WHERE id = ?1",
            [user_id],
            |row| row.get(0),
        )
        .optional()?;
    referred_by.ok_or_else(|| LedgerError::not_found(format!("User {}", user_id)))
}

/// Atomically add `amount` to one named balance.
pub(crate) fn credit_balance(
    conn: &Connection,
    user_id: i64,
    balance_type: BalanceType,
    amount: f64,
) -> LedgerResult<()> {
    let column = balance_type.column();
    let changed = conn.execute(
        &format!(
            "UPDATE users SET {} = {} + ?1 WHERE id = ?2",
            column, column
        ),
        params![amount, user_id],
    )?;
    if changed == 0 {
        return Err(LedgerError::not_found(format!("User {}", user_id)));
    }
    Ok(())
}

pub(crate) fn fetch_daily_log(
    conn: &Connection,
    date: NaiveDate,
) -> LedgerResult<Option<DailySettlementLog>> {
    let log = conn
        .query_row(
            "SELECT date, is_processed, processed_at, total_roi_distributed,
                    total_investments_processed, run_id
             FROM daily_settlement_log WHERE date = ?1",
            [date],
            |row| {
                Ok(DailySettlementLog {
                    date: row.get(0)?,
                    is_processed: row.get(1)?,
                    processed_at: row.get(2)?,
                    total_roi_distributed: row.get(3)?,
                    total_investments_processed: row.get(4)?,
                    run_id: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(log)
}

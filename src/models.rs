//! Ledger records
//!
//! Plain data types persisted by the ledger store. Enums are stored as their
//! `as_str()` text form.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Implements text round-tripping through SQLite for an enum with
/// `as_str()` / `from_str()`.
macro_rules! sql_text_enum {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let raw = value.as_str()?;
                <$ty>::from_str(raw).ok_or_else(|| {
                    FromSqlError::Other(
                        format!("unknown {} value: {}", stringify!($ty), raw).into(),
                    )
                })
            }
        }
    };
}

/// Account role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

sql_text_enum!(Role);

/// A platform user with its three named balances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub referral_code: String,
    pub referred_by: Option<i64>,
    pub role: Role,
    pub roi_balance: f64,
    pub referral_balance: f64,
    pub total_invested: f64,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn balance(&self, balance_type: BalanceType) -> f64 {
        match balance_type {
            BalanceType::Roi => self.roi_balance,
            BalanceType::Referral => self.referral_balance,
        }
    }
}

/// Input for [`crate::ledger::LedgerStore::create_user`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub name: String,
    pub email: String,
    /// Referral code of the upstream referrer, if any.
    #[serde(default)]
    pub referral_code: Option<String>,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::User
}

/// Investment plan (fixed enumeration)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Plan {
    Starter,
    Pro,
    Premium,
}

impl Plan {
    pub const ALL: [Plan; 3] = [Plan::Starter, Plan::Pro, Plan::Premium];

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Starter => "Starter",
            Plan::Pro => "Pro",
            Plan::Premium => "Premium",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "starter" => Some(Plan::Starter),
            "pro" => Some(Plan::Pro),
            "premium" => Some(Plan::Premium),
            _ => None,
        }
    }
}

sql_text_enum!(Plan);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum InvestmentStatus {
    Active,
    Completed,
    Cancelled,
}

impl InvestmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestmentStatus::Active => "ACTIVE",
            InvestmentStatus::Completed => "COMPLETED",
            InvestmentStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Some(InvestmentStatus::Active),
            "COMPLETED" => Some(InvestmentStatus::Completed),
            "CANCELLED" => Some(InvestmentStatus::Cancelled),
            _ => None,
        }
    }
}

sql_text_enum!(InvestmentStatus);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Investment {
    pub id: i64,
    pub user_id: i64,
    /// Principal; never changes after creation.
    pub amount: f64,
    pub plan: Plan,
    /// Rate snapshotted from the plan table at creation.
    #[serde(rename = "dailyROI")]
    pub daily_roi: f64,
    pub start_date: DateTime<Utc>,
    pub end_date: NaiveDate,
    pub status: InvestmentStatus,
    pub next_payment_date: NaiveDate,
}

impl Investment {
    /// ROI credited for one settled day.
    pub fn daily_payout(&self) -> f64 {
        self.amount * self.daily_roi
    }

    /// Move the schedule forward one calendar day after a payout.
    ///
    /// Once the next date would pass `end_date` the investment completes and
    /// `next_payment_date` is clamped to `end_date`. Returns true when this
    /// call completed the investment.
    pub fn advance_schedule(&mut self) -> bool {
        if self.status != InvestmentStatus::Active {
            return false;
        }
        match self.next_payment_date.succ_opt() {
            Some(next) if next <= self.end_date => {
                self.next_payment_date = next;
                false
            }
            _ => {
                self.status = InvestmentStatus::Completed;
                self.next_payment_date = self.end_date;
                true
            }
        }
    }
}

/// One ROI credit for one investment on one calendar day.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoiHistoryEntry {
    pub id: i64,
    pub user_id: i64,
    pub investment_id: i64,
    pub amount_earned: f64,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

/// What produced a commission payment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IncomeSource {
    /// One-time level-1 bonus paid when an investment is created.
    InstantBonus,
    /// Daily cascade paid out of a settled ROI credit.
    DailyRoi,
}

impl IncomeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncomeSource::InstantBonus => "instant_bonus",
            IncomeSource::DailyRoi => "daily_roi",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "instant_bonus" => Some(IncomeSource::InstantBonus),
            "daily_roi" => Some(IncomeSource::DailyRoi),
            _ => None,
        }
    }
}

sql_text_enum!(IncomeSource);

/// Commission payment audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelIncome {
    pub id: i64,
    /// Recipient (the referrer).
    pub user_id: i64,
    /// Investor whose activity generated the payment.
    pub from_user_id: i64,
    pub level: u8,
    pub amount: f64,
    pub source: IncomeSource,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Which named balance funds a withdrawal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum BalanceType {
    Roi,
    Referral,
}

impl BalanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceType::Roi => "ROI",
            BalanceType::Referral => "REFERRAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ROI" | "ROIBALANCE" | "ROI_BALANCE" => Some(BalanceType::Roi),
            "REFERRAL" | "REFERRALBALANCE" | "REFERRAL_BALANCE" => Some(BalanceType::Referral),
            _ => None,
        }
    }

    /// `users` column holding this balance.
    pub fn column(&self) -> &'static str {
        match self {
            BalanceType::Roi => "roi_balance",
            BalanceType::Referral => "referral_balance",
        }
    }
}

sql_text_enum!(BalanceType);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Rejected,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "PENDING",
            WithdrawalStatus::Approved => "APPROVED",
            WithdrawalStatus::Rejected => "REJECTED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(WithdrawalStatus::Pending),
            "APPROVED" => Some(WithdrawalStatus::Approved),
            "REJECTED" => Some(WithdrawalStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WithdrawalStatus::Pending)
    }
}

sql_text_enum!(WithdrawalStatus);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Withdrawal {
    pub id: i64,
    pub user_id: i64,
    pub amount: f64,
    pub currency: String,
    pub wallet_address: String,
    pub balance_type: BalanceType,
    pub status: WithdrawalStatus,
    pub transaction_hash: Option<String>,
    pub admin_notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-day idempotency record for the settlement run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySettlementLog {
    pub date: NaiveDate,
    pub is_processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(rename = "totalROIDistributed")]
    pub total_roi_distributed: f64,
    pub total_investments_processed: i64,
    pub run_id: Option<String>,
}

/// Node of the read-only referral tree view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralNode {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub referral_code: String,
    pub total_invested: f64,
    pub children: Vec<ReferralNode>,
}

/// ROI earned on one calendar day, summed over a user's investments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoiChartPoint {
    pub date: NaiveDate,
    pub amount: f64,
}

/// Balances plus lifetime earnings for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub roi_balance: f64,
    pub referral_balance: f64,
    pub total_invested: f64,
    #[serde(rename = "totalROI")]
    pub total_roi_earned: f64,
    #[serde(rename = "totalReferral")]
    pub total_referral_earned: f64,
    pub active_investments: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn investment(next: NaiveDate, end: NaiveDate) -> Investment {
        Investment {
            id: 1,
            user_id: 1,
            amount: 1000.0,
            plan: Plan::Starter,
            daily_roi: 0.01,
            start_date: Utc::now(),
            end_date: end,
            status: InvestmentStatus::Active,
            next_payment_date: next,
        }
    }

    #[test]
    fn test_advance_schedule_moves_one_day() {
        let d = |day| NaiveDate::from_ymd_opt(2025, 1, day).unwrap();
        let mut inv = investment(d(2), d(31));

        assert!(!inv.advance_schedule());
        assert_eq!(inv.next_payment_date, d(3));
        assert_eq!(inv.status, InvestmentStatus::Active);
    }

    #[test]
    fn test_advance_schedule_completes_and_clamps_at_end() {
        let d = |day| NaiveDate::from_ymd_opt(2025, 1, day).unwrap();
        let mut inv = investment(d(30), d(31));

        // Paying the end date itself is still allowed.
        assert!(!inv.advance_schedule());
        assert_eq!(inv.next_payment_date, d(31));

        assert!(inv.advance_schedule());
        assert_eq!(inv.status, InvestmentStatus::Completed);
        assert_eq!(inv.next_payment_date, d(31));

        // Completed investments never move again.
        assert!(!inv.advance_schedule());
        assert_eq!(inv.status, InvestmentStatus::Completed);
    }

    #[test]
    fn test_daily_payout() {
        let d = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let inv = investment(d, d);
        assert!((inv.daily_payout() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_enum_string_conversion() {
        assert_eq!(Plan::from_str("pro"), Some(Plan::Pro));
        assert_eq!(Plan::from_str("Gold"), None);
        assert_eq!(BalanceType::from_str("roi"), Some(BalanceType::Roi));
        assert_eq!(BalanceType::from_str("referralBalance"), Some(BalanceType::Referral));
        assert_eq!(WithdrawalStatus::Approved.as_str(), "APPROVED");
        assert!(WithdrawalStatus::Rejected.is_terminal());
        assert!(!WithdrawalStatus::Pending.is_terminal());
    }

    #[test]
    fn test_serde_wire_names() {
        let json = serde_json::to_string(&BalanceType::Referral).unwrap();
        assert_eq!(json, r#""REFERRAL""#);

        let status: InvestmentStatus = serde_json::from_str(r#""COMPLETED""#).unwrap();
        assert_eq!(status, InvestmentStatus::Completed);

        let plan: Plan = serde_json::from_str(r#""Premium""#).unwrap();
        assert_eq!(plan, Plan::Premium);
    }
}

//! Platform configuration
//!
//! Loaded from a TOML file (`NEXA_CONFIG_PATH`, default `nexa.toml`) and then
//! overridden from the environment. Every section has defaults, so a missing
//! file yields the standard plan and commission tables.

use crate::models::Plan;
use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::{env, path::Path};

/// Referral chain depth paid by the daily cascade.
pub const MAX_COMMISSION_LEVELS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// `development`, `staging` or `production`
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub plans: PlanTable,

    #[serde(default)]
    pub commissions: CommissionTable,

    #[serde(default)]
    pub withdrawals: WithdrawalPolicy,

    #[serde(default)]
    pub settlement: SettlementSchedule,
}

fn default_environment() -> String {
    "development".to_string()
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            plans: PlanTable::default(),
            commissions: CommissionTable::default(),
            withdrawals: WithdrawalPolicy::default(),
            settlement: SettlementSchedule::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    /// Authenticated requests allowed per user per minute
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_jwt_secret() -> String {
    "dev-secret-change-in-production-minimum-32-characters".to_string()
}

fn default_rate_limit() -> u32 {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            jwt_secret: default_jwt_secret(),
            rate_limit_per_minute: default_rate_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "nexa_ledger.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Daily rate and duration of one plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PlanTerms {
    pub daily_roi: f64,
    pub duration_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTable {
    #[serde(default = "starter_terms")]
    pub starter: PlanTerms,
    #[serde(default = "pro_terms")]
    pub pro: PlanTerms,
    #[serde(default = "premium_terms")]
    pub premium: PlanTerms,
}

fn starter_terms() -> PlanTerms {
    PlanTerms {
        daily_roi: 0.01,
        duration_days: 30,
    }
}

fn pro_terms() -> PlanTerms {
    PlanTerms {
        daily_roi: 0.015,
        duration_days: 60,
    }
}

fn premium_terms() -> PlanTerms {
    PlanTerms {
        daily_roi: 0.02,
        duration_days: 90,
    }
}

impl Default for PlanTable {
    fn default() -> Self {
        Self {
            starter: starter_terms(),
            pro: pro_terms(),
            premium: premium_terms(),
        }
    }
}

impl PlanTable {
    pub fn terms(&self, plan: Plan) -> PlanTerms {
        match plan {
            Plan::Starter => self.starter,
            Plan::Pro => self.pro,
            Plan::Premium => self.premium,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionTable {
    /// Rate per referral level, index 0 = direct referrer
    #[serde(default = "default_level_rates")]
    pub level_rates: Vec<f64>,
    /// One-time level-1 bonus on new principal
    #[serde(default = "default_instant_bonus_rate")]
    pub instant_bonus_rate: f64,
}

fn default_level_rates() -> Vec<f64> {
    vec![0.05, 0.03, 0.01]
}

fn default_instant_bonus_rate() -> f64 {
    0.05
}

impl Default for CommissionTable {
    fn default() -> Self {
        Self {
            level_rates: default_level_rates(),
            instant_bonus_rate: default_instant_bonus_rate(),
        }
    }
}

impl CommissionTable {
    /// Rate for a 1-based level, `None` past the configured depth.
    pub fn rate_for_level(&self, level: usize) -> Option<f64> {
        if level == 0 || level > MAX_COMMISSION_LEVELS {
            return None;
        }
        self.level_rates.get(level - 1).copied()
    }

    pub fn depth(&self) -> usize {
        self.level_rates.len().min(MAX_COMMISSION_LEVELS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalPolicy {
    #[serde(default = "default_min_withdrawal")]
    pub min_amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_min_withdrawal() -> f64 {
    1.0
}

fn default_currency() -> String {
    "USDT".to_string()
}

impl Default for WithdrawalPolicy {
    fn default() -> Self {
        Self {
            min_amount: default_min_withdrawal(),
            currency: default_currency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementSchedule {
    /// UTC wall time of the daily trigger, `HH:MM`
    #[serde(default = "default_run_at")]
    pub run_at: String,
    /// Run once at process start (ignored in production)
    #[serde(default)]
    pub run_on_startup: bool,
}

fn default_run_at() -> String {
    "00:00".to_string()
}

impl Default for SettlementSchedule {
    fn default() -> Self {
        Self {
            run_at: default_run_at(),
            run_on_startup: false,
        }
    }
}

impl SettlementSchedule {
    pub fn trigger_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(self.run_at.trim(), "%H:%M")
            .with_context(|| format!("invalid settlement.run_at '{}' (want HH:MM)", self.run_at))
    }
}

impl PlatformConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    /// Load from `NEXA_CONFIG_PATH` (or `nexa.toml`), apply environment
    /// overrides, and validate.
    pub fn from_env() -> Result<Self> {
        let path = env::var("NEXA_CONFIG_PATH").unwrap_or_else(|_| "nexa.toml".to_string());

        let mut config = if Path::new(&path).exists() {
            Self::load(&path)?
        } else {
            tracing::debug!("Config file {} not found, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("APP_ENV") {
            if !v.trim().is_empty() {
                self.environment = v.trim().to_lowercase();
            }
        }
        if let Ok(v) = env::var("DB_PATH") {
            if !v.trim().is_empty() {
                self.database.path = v;
            }
        }
        if let Ok(v) = env::var("BIND_ADDR") {
            if !v.trim().is_empty() {
                self.server.bind_addr = v;
            }
        }
        if let Ok(v) = env::var("JWT_SECRET") {
            if !v.trim().is_empty() {
                self.server.jwt_secret = v;
            }
        }
        if let Ok(v) = env::var("SETTLEMENT_RUN_AT") {
            if !v.trim().is_empty() {
                self.settlement.run_at = v;
            }
        }
        self.settlement.run_on_startup = env::var("SETTLEMENT_RUN_ON_STARTUP")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(self.settlement.run_on_startup);
        self.withdrawals.min_amount = env::var("MIN_WITHDRAWAL_AMOUNT")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(self.withdrawals.min_amount);
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment.as_str(), "production" | "prod")
    }

    /// Reject tables that would make the monetary rules meaningless.
    pub fn validate(&self) -> Result<()> {
        for plan in Plan::ALL {
            let terms = self.plans.terms(plan);
            if !(terms.daily_roi.is_finite() && terms.daily_roi > 0.0) {
                bail!("plan {} has invalid daily_roi {}", plan.as_str(), terms.daily_roi);
            }
            if terms.duration_days == 0 {
                bail!("plan {} has zero duration", plan.as_str());
            }
        }

        let rates = &self.commissions.level_rates;
        if rates.is_empty() || rates.len() > MAX_COMMISSION_LEVELS {
            bail!(
                "commissions.level_rates must have 1..={} entries, got {}",
                MAX_COMMISSION_LEVELS,
                rates.len()
            );
        }
        for rate in rates
            .iter()
            .chain(std::iter::once(&self.commissions.instant_bonus_rate))
        {
            if !(rate.is_finite() && *rate >= 0.0 && *rate < 1.0) {
                bail!("commission rate {} outside [0, 1)", rate);
            }
        }

        if !(self.withdrawals.min_amount.is_finite() && self.withdrawals.min_amount >= 0.0) {
            bail!("withdrawals.min_amount must be >= 0");
        }

        self.settlement.trigger_time()?;
        Ok(())
    }
}

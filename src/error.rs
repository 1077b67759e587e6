//! Ledger error taxonomy shared by the store, the settlement engine and the API.

use crate::models::BalanceType;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug)]
pub enum LedgerError {
    /// Missing user, investment or withdrawal.
    NotFound(String),
    /// Withdrawal exceeds the live balance of the named type.
    InsufficientFunds {
        balance_type: BalanceType,
        available: f64,
        requested: f64,
    },
    /// Terminal state already reached (withdrawal resolved, day settled).
    AlreadyProcessed(String),
    /// Malformed input: negative amount, unknown plan, bad status, ...
    Validation(String),
    /// The database refused the unit of work; nothing was committed.
    Persistence(rusqlite::Error),
}

impl LedgerError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(what) => write!(f, "{} not found", what),
            Self::InsufficientFunds {
                balance_type,
                available,
                requested,
            } => write!(
                f,
                "Insufficient {} balance: requested {:.2}, available {:.2}",
                balance_type.as_str(),
                requested,
                available
            ),
            Self::AlreadyProcessed(msg) => write!(f, "{}", msg),
            Self::Validation(msg) => write!(f, "Validation error: {}", msg),
            Self::Persistence(e) => write!(f, "Persistence failure: {}", e),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Persistence(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e)
    }
}

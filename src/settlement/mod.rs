//! Settlement: daily ROI engine, referral commissions, and the daily trigger.

pub mod commission;
pub mod engine;
pub mod scheduler;

pub use engine::{SettlementEngine, SettlementOutcome, SettlementReport};
pub use scheduler::SettlementScheduler;

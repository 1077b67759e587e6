//! Nexa Backend Library
//!
//! Referral investment ledger: daily ROI settlement with a three-level
//! commission cascade, withdrawal reservations, and the HTTP surface over
//! them. Exposed as a library so the binary and integration tests share
//! one implementation.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod ledger;
pub mod models;
pub mod settlement;

pub use error::{LedgerError, LedgerResult};

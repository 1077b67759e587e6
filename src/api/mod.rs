pub mod rate_limit;
pub mod routes;

pub use rate_limit::UserRateLimiter;
pub use routes::{create_router, AppState};

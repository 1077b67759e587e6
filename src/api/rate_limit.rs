//! Per-user rate limiting for authenticated API routes.
//!
//! Sliding window of request instants per user id. Must be layered inside
//! the auth middleware, which provides the caller's [`Claims`].

use crate::auth::Claims;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Clone)]
pub struct UserRateLimiter {
    max_requests: usize,
    window: Duration,
    hits: Arc<Mutex<HashMap<i64, VecDeque<Instant>>>>,
}

enum RateLimitResult {
    Allowed,
    Exceeded { retry_after: Duration },
}

impl UserRateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1) as usize,
            window,
            hits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    fn check_at(&self, user_id: i64, now: Instant) -> RateLimitResult {
        let mut hits = self.hits.lock();
        let window = hits.entry(user_id).or_default();

        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.max_requests {
            let retry_after = window
                .front()
                .map(|&oldest| self.window.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(self.window);
            return RateLimitResult::Exceeded { retry_after };
        }

        window.push_back(now);
        RateLimitResult::Allowed
    }

    /// Drop users with no requests inside the window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = self.window;
        self.hits.lock().retain(|_, hits| {
            hits.back()
                .map(|&last| now.duration_since(last) < window)
                .unwrap_or(false)
        });
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<UserRateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let Some(user_id) = request.extensions().get::<Claims>().and_then(Claims::user_id) else {
        return next.run(request).await;
    };

    match limiter.check_at(user_id, Instant::now()) {
        RateLimitResult::Allowed => next.run(request).await,
        RateLimitResult::Exceeded { retry_after } => {
            let secs = retry_after.as_secs().max(1);
            warn!(user_id, retry_after_secs = secs, "Rate limit exceeded");

            let body = serde_json::json!({
                "success": false,
                "message": "Too many requests. Please slow down.",
                "retryAfterSeconds": secs,
            });
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", secs.to_string())],
                Json(body),
            )
                .into_response()
        }
    }
}

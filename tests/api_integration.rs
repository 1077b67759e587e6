//! HTTP surface tests driven through the router with `oneshot`.

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use chrono::NaiveDate;
use nexa_backend::{
    api::{create_router, AppState, UserRateLimiter},
    auth::JwtHandler,
    clock::ManualClock,
    config::PlatformConfig,
    ledger::LedgerStore,
    models::{BalanceType, InvestmentStatus, NewUser, Plan, Role, User},
    settlement::SettlementEngine,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const SECRET: &str = "api-test-secret-with-at-least-32-chars";

struct TestApp {
    ledger: Arc<LedgerStore>,
    jwt: Arc<JwtHandler>,
    router: Router,
}

impl TestApp {
    fn new(rate_limit: u32) -> Self {
        let clock = Arc::new(ManualClock::at(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            9,
        ));
        let ledger = Arc::new(
            LedgerStore::open_in_memory(Arc::new(PlatformConfig::default()), clock).unwrap(),
        );
        let jwt = Arc::new(JwtHandler::new(SECRET.to_string()));
        let state = AppState {
            ledger: ledger.clone(),
            engine: Arc::new(SettlementEngine::new(ledger.clone())),
            jwt: jwt.clone(),
            limiter: UserRateLimiter::per_minute(rate_limit),
        };
        Self {
            ledger,
            jwt,
            router: create_router(state),
        }
    }

    async fn user(&self, email: &str, role: Role, referrer: Option<&User>) -> (User, String) {
        let user = self
            .ledger
            .create_user(&NewUser {
                name: email.split('@').next().unwrap().to_string(),
                email: email.to_string(),
                referral_code: referrer.map(|r| r.referral_code.clone()),
                role,
            })
            .await
            .unwrap();
        let (token, _) = self.jwt.generate_token(&user).unwrap();
        (user, token)
    }

    async fn call(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }
}

#[tokio::test]
async fn test_health_and_public_referrer_lookup() {
    let app = TestApp::new(100);
    let (alice, _) = app.user("alice@example.com", Role::User, None).await;

    let (status, body) = app.call("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let uri = format!("/api/auth/referrer/{}", alice.referral_code);
    let (status, body) = app.call("GET", &uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "alice");

    let (status, body) = app.call("GET", "/api/auth/referrer/NOPE00", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_protected_routes_require_token() {
    let app = TestApp::new(100);

    let (status, _) = app.call("GET", "/api/investments", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call("GET", "/api/investments", Some("garbage"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_investment_and_withdrawal_flow() {
    let app = TestApp::new(100);
    let (alice, alice_token) = app.user("alice@example.com", Role::User, None).await;
    let (_bob, bob_token) = app.user("bob@example.com", Role::User, Some(&alice)).await;

    let (status, body) = app
        .call(
            "POST",
            "/api/investments",
            Some(&bob_token),
            Some(json!({ "amount": 500.0, "plan": "Pro" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["investment"]["plan"], "Pro");
    assert_eq!(body["data"]["investment"]["status"], "ACTIVE");

    let (status, body) = app
        .call(
            "POST",
            "/api/investments",
            Some(&bob_token),
            Some(json!({ "amount": 500.0, "plan": "Gold" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    // Alice got the $25 instant bonus and can withdraw it.
    let (status, body) = app
        .call(
            "POST",
            "/api/withdrawals/request",
            Some(&alice_token),
            Some(json!({ "amount": 20.0, "walletAddress": "0xabc", "balanceType": "REFERRAL" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "PENDING");

    let (status, body) = app
        .call(
            "POST",
            "/api/withdrawals/request",
            Some(&alice_token),
            Some(json!({ "amount": 20.0, "walletAddress": "0xabc", "balanceType": "REFERRAL" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"]
        .as_str()
        .unwrap_or_default()
        .contains("Insufficient REFERRAL balance"));

    let (status, body) = app
        .call("GET", "/api/withdrawals/my", Some(&alice_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().map(Vec::len), Some(1));

    let (status, body) = app
        .call("GET", "/api/dashboard", Some(&alice_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["stats"]["referralBalance"], 5.0);
    assert_eq!(body["data"]["referralTree"]["children"][0]["email"], "bob@example.com");
}

#[tokio::test]
async fn test_admin_routes_are_guarded() {
    let app = TestApp::new(100);
    let (alice, alice_token) = app.user("alice@example.com", Role::User, None).await;
    let (_admin, admin_token) = app.user("admin@example.com", Role::Admin, None).await;

    let airdrop = json!({ "email": "alice@example.com", "amount": 100.0, "balanceType": "roiBalance" });
    let (status, _) = app
        .call("POST", "/api/admin/airdrop", Some(&alice_token), Some(airdrop.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .call("POST", "/api/admin/airdrop", Some(&admin_token), Some(airdrop))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["newBalance"], 100.0);

    let w = app
        .ledger
        .request_withdrawal(alice.id, 40.0, BalanceType::Roi, "0xabc")
        .await
        .unwrap();

    let (status, body) = app
        .call("GET", "/api/admin/withdrawals/pending", Some(&admin_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["id"], w.id);

    let update = json!({ "withdrawalId": w.id, "status": "REJECTED", "adminNotes": "mismatch" });
    let (status, _) = app
        .call("POST", "/api/admin/withdrawals/update", Some(&admin_token), Some(update.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.ledger.get_user(alice.id).await.unwrap().roi_balance, 100.0);

    let (status, _) = app
        .call("POST", "/api/admin/withdrawals/update", Some(&admin_token), Some(update))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_admin_settlement_run_is_idempotent() {
    let app = TestApp::new(100);
    let (_admin, admin_token) = app.user("admin@example.com", Role::Admin, None).await;

    let body = json!({ "date": "2025-01-01" });
    let (status, first) = app
        .call("POST", "/api/admin/settlement/run", Some(&admin_token), Some(body.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["data"]["status"], "settled");

    let (status, second) = app
        .call("POST", "/api/admin/settlement/run", Some(&admin_token), Some(body))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["data"]["status"], "already_processed");
}

#[tokio::test]
async fn test_admin_settlement_rejects_future_dates() {
    let app = TestApp::new(100);
    let (_admin, admin_token) = app.user("admin@example.com", Role::Admin, None).await;
    let (alice, _) = app.user("alice@example.com", Role::User, None).await;
    let inv = app
        .ledger
        .create_investment(alice.id, 1000.0, Plan::Starter)
        .await
        .unwrap();

    for date in ["2025-01-02", "2025-01-31"] {
        let (status, body) = app
            .call(
                "POST",
                "/api/admin/settlement/run",
                Some(&admin_token),
                Some(json!({ "date": date })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    assert_eq!(app.ledger.get_user(alice.id).await.unwrap().roi_balance, 0.0);
    assert!(app
        .ledger
        .roi_history_for_investment(inv.id)
        .await
        .unwrap()
        .is_empty());
    let due = app.ledger.get_investment(alice.id, inv.id).await.unwrap();
    assert_eq!(due.status, InvestmentStatus::Active);
}

#[tokio::test]
async fn test_rate_limit_applies_per_user() {
    let app = TestApp::new(2);
    let (_alice, alice_token) = app.user("alice@example.com", Role::User, None).await;
    let (_bob, bob_token) = app.user("bob@example.com", Role::User, None).await;

    for _ in 0..2 {
        let (status, _) = app
            .call("GET", "/api/investments", Some(&alice_token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = app
        .call("GET", "/api/investments", Some(&alice_token), None)
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let (status, _) = app
        .call("GET", "/api/investments", Some(&bob_token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
}

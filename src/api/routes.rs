use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use super::rate_limit::{rate_limit_middleware, UserRateLimiter};
use crate::{
    auth::{auth_middleware, require_admin, Claims, JwtHandler},
    error::LedgerError,
    ledger::{LedgerStore, DEFAULT_TREE_DEPTH},
    models::{BalanceType, Plan, WithdrawalStatus},
    settlement::{SettlementEngine, SettlementOutcome},
};

const RECENT_ROWS: usize = 10;
const CHART_DAYS: i64 = 30;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<LedgerStore>,
    pub engine: Arc<SettlementEngine>,
    pub jwt: Arc<JwtHandler>,
    pub limiter: UserRateLimiter,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let user_routes = Router::new()
        .route(
            "/api/investments",
            post(create_investment).get(list_investments),
        )
        .route("/api/investments/:id", get(get_investment))
        .route("/api/withdrawals/request", post(request_withdrawal))
        .route("/api/withdrawals/my", get(my_withdrawals))
        .route("/api/dashboard", get(dashboard))
        .route("/api/dashboard/referral-tree", get(referral_tree));

    let admin_routes = Router::new()
        .route("/api/admin/airdrop", post(airdrop))
        .route("/api/admin/withdrawals/update", post(update_withdrawal))
        .route("/api/admin/withdrawals/pending", get(pending_withdrawals))
        .route("/api/admin/users", get(list_users))
        .route("/api/admin/settlement/run", post(run_settlement))
        .route_layer(middleware::from_fn(require_admin));

    let protected = user_routes
        .merge(admin_routes)
        .route_layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            rate_limit_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.jwt.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/api/auth/referrer/:code", get(referrer_by_code))
        .merge(protected)
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn referrer_by_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let name = state
        .ledger
        .referrer_name_by_code(&code)
        .await?
        .ok_or_else(|| LedgerError::not_found("Referral code"))?;
    Ok(ok(json!({ "name": name })))
}

async fn create_investment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateInvestmentRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let user_id = caller_id(&claims)?;
    let plan = Plan::from_str(&req.plan)
        .ok_or_else(|| LedgerError::validation(format!("unknown plan '{}'", req.plan)))?;

    let investment = state
        .ledger
        .create_investment(user_id, req.amount, plan)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Investment created",
            "data": { "investment": investment },
        })),
    ))
}

async fn list_investments(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, ApiError> {
    let investments = state.ledger.list_investments(caller_id(&claims)?).await?;
    Ok(ok(json!({ "investments": investments })))
}

async fn get_investment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let investment = state.ledger.get_investment(caller_id(&claims)?, id).await?;
    Ok(ok(json!({ "investment": investment })))
}

async fn request_withdrawal(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<WithdrawalRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let user_id = caller_id(&claims)?;
    let balance_type = parse_balance_type(&req.balance_type)?;

    let withdrawal = state
        .ledger
        .request_withdrawal(user_id, req.amount, balance_type, &req.wallet_address)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Withdrawal request submitted successfully",
            "data": withdrawal,
        })),
    ))
}

async fn my_withdrawals(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, ApiError> {
    let withdrawals = state.ledger.list_withdrawals(caller_id(&claims)?).await?;
    Ok(ok(json!(withdrawals)))
}

async fn dashboard(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, ApiError> {
    let user_id = caller_id(&claims)?;
    let ledger = &state.ledger;
    let since = ledger.clock().today() - Duration::days(CHART_DAYS);

    let stats = ledger.dashboard_summary(user_id).await?;
    let recent_roi = ledger.roi_history(user_id, RECENT_ROWS).await?;
    let mut recent_withdrawals = ledger.list_withdrawals(user_id).await?;
    recent_withdrawals.truncate(RECENT_ROWS);
    let referral_tree = ledger.get_referral_tree(user_id, DEFAULT_TREE_DEPTH).await?;
    let roi_chart = ledger.roi_daily_totals(user_id, since).await?;

    Ok(ok(json!({
        "stats": stats,
        "recentROI": recent_roi,
        "recentWithdrawals": recent_withdrawals,
        "referralTree": referral_tree,
        "roiChartData": roi_chart,
    })))
}

async fn referral_tree(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, ApiError> {
    let tree = state
        .ledger
        .get_referral_tree(caller_id(&claims)?, DEFAULT_TREE_DEPTH)
        .await?;
    Ok(ok(json!({ "referralTree": tree })))
}

async fn airdrop(
    State(state): State<AppState>,
    Json(req): Json<AirdropRequest>,
) -> Result<Json<Value>, ApiError> {
    let balance_type = parse_balance_type(&req.balance_type)?;
    let user = state
        .ledger
        .airdrop(&req.email, req.amount, balance_type)
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Successfully added ${} to {}", req.amount, balance_type.as_str()),
        "newBalance": user.balance(balance_type),
    })))
}

async fn update_withdrawal(
    State(state): State<AppState>,
    Json(req): Json<UpdateWithdrawalRequest>,
) -> Result<Json<Value>, ApiError> {
    let status = WithdrawalStatus::from_str(&req.status)
        .ok_or_else(|| LedgerError::validation(format!("unknown status '{}'", req.status)))?;
    let withdrawal = state
        .ledger
        .resolve_withdrawal(req.withdrawal_id, status, req.transaction_hash, req.admin_notes)
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Withdrawal {} successfully", withdrawal.status.as_str()),
        "data": withdrawal,
    })))
}

async fn pending_withdrawals(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let withdrawals = state.ledger.list_pending_withdrawals().await?;
    Ok(ok(json!(withdrawals)))
}

async fn list_users(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let users = state.ledger.list_users().await?;
    Ok(ok(json!(users)))
}

async fn run_settlement(
    State(state): State<AppState>,
    body: Option<Json<RunSettlementRequest>>,
) -> Result<Json<Value>, ApiError> {
    let date = body.and_then(|Json(req)| req.date);
    let outcome = match date {
        Some(date) => state.engine.run_for_date(date).await?,
        None => state.engine.run_for_today().await?,
    };
    let message = match &outcome {
        SettlementOutcome::Settled(_) => "Settlement completed",
        SettlementOutcome::AlreadyProcessed { .. } => "Settlement already processed for this date",
    };
    Ok(Json(json!({
        "success": true,
        "message": message,
        "data": outcome,
    })))
}

fn ok(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

fn caller_id(claims: &Claims) -> Result<i64, ApiError> {
    claims.user_id().ok_or(ApiError::Unauthorized)
}

fn parse_balance_type(raw: &str) -> Result<BalanceType, ApiError> {
    BalanceType::from_str(raw)
        .ok_or_else(|| LedgerError::validation(format!("unknown balance type '{}'", raw)).into())
}

// ===== Request/Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Deserialize)]
struct CreateInvestmentRequest {
    amount: f64,
    plan: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WithdrawalRequest {
    amount: f64,
    wallet_address: String,
    balance_type: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AirdropRequest {
    email: String,
    amount: f64,
    balance_type: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateWithdrawalRequest {
    withdrawal_id: i64,
    status: String,
    #[serde(default)]
    transaction_hash: Option<String>,
    #[serde(default)]
    admin_notes: Option<String>,
}

#[derive(Deserialize)]
struct RunSettlementRequest {
    #[serde(default)]
    date: Option<NaiveDate>,
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Ledger(LedgerError),
    Unauthorized,
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Ledger(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Ledger(err @ LedgerError::Persistence(_)) => {
                tracing::error!("Database error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::Ledger(err @ LedgerError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, err.to_string())
            }
            ApiError::Ledger(err @ LedgerError::AlreadyProcessed(_)) => {
                (StatusCode::CONFLICT, err.to_string())
            }
            ApiError::Ledger(
                err @ (LedgerError::InsufficientFunds { .. } | LedgerError::Validation(_)),
            ) => (StatusCode::BAD_REQUEST, err.to_string()),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Token subject is not a ledger user".to_string(),
            ),
        };

        let body = Json(json!({
            "success": false,
            "message": message,
        }));

        (status, body).into_response()
    }
}

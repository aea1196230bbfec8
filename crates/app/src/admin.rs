use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use holdwatch_core::types::DisputeOutcome;
use holdwatch_storage::{DisputeError, HoldError, NewDispute, NewEscrowHold};

use crate::auth::bearer_authorized;
use crate::problem::ProblemResponse;
use crate::router::AppState;

const DEFAULT_NOTIFICATION_LIMIT: i64 = 50;
const MAX_NOTIFICATION_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateHoldRequest {
    order_id: String,
    buyer_id: String,
    seller_id: String,
    amount_cents: i64,
    currency: String,
    #[serde(default)]
    hold_duration_days: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDisputeRequest {
    order_id: String,
    reason: String,
    #[serde(default)]
    escalation_threshold_days: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveDisputeRequest {
    outcome: DisputeOutcome,
}

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    limit: Option<i64>,
}

pub async fn create_hold(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CreateHoldRequest>, JsonRejection>,
) -> Result<Response, ProblemResponse> {
    authorize(&state, &headers, "admin.holds.create")?;
    let Json(request) = payload.map_err(invalid_body)?;

    require_non_empty("orderId", &request.order_id)?;
    require_non_empty("buyerId", &request.buyer_id)?;
    require_non_empty("sellerId", &request.seller_id)?;
    if request.amount_cents < 0 {
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_amount",
            "amountCents must not be negative",
        ));
    }
    let currency = request.currency.trim().to_ascii_uppercase();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_currency",
            "currency must be a three-letter ISO 4217 code",
        ));
    }

    let hold = state
        .storage()
        .holds()
        .insert(&NewEscrowHold {
            order_id: request.order_id.trim(),
            buyer_id: request.buyer_id.trim(),
            seller_id: request.seller_id.trim(),
            amount_cents: request.amount_cents,
            currency: &currency,
            hold_duration_days: request
                .hold_duration_days
                .unwrap_or(state.policy().hold_duration_days),
            created_at: state.now(),
        })
        .await
        .map_err(|err| match err {
            HoldError::DuplicateOrder => ProblemResponse::new(
                StatusCode::CONFLICT,
                "hold_exists",
                "order already has an escrow hold",
            ),
            other => internal("hold_insert_failed", &other),
        })?;

    info!(stage = "admin", hold_id = %hold.id, order_id = %hold.order_id, "escrow hold created");
    Ok((StatusCode::CREATED, Json(hold)).into_response())
}

pub async fn get_hold(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(hold_id): Path<String>,
) -> Result<Response, ProblemResponse> {
    authorize(&state, &headers, "admin.holds.get")?;
    let hold = state
        .storage()
        .holds()
        .fetch(&hold_id)
        .await
        .map_err(|err| internal("hold_fetch_failed", &err))?
        .ok_or_else(|| not_found("hold_not_found", "escrow hold not found"))?;
    Ok(Json(hold).into_response())
}

pub async fn open_dispute(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<OpenDisputeRequest>, JsonRejection>,
) -> Result<Response, ProblemResponse> {
    authorize(&state, &headers, "admin.disputes.open")?;
    let Json(request) = payload.map_err(invalid_body)?;
    require_non_empty("orderId", &request.order_id)?;
    require_non_empty("reason", &request.reason)?;

    let dispute = state
        .storage()
        .disputes()
        .open(&NewDispute {
            order_id: request.order_id.trim(),
            reason: request.reason.trim(),
            escalation_threshold_days: request
                .escalation_threshold_days
                .unwrap_or(state.policy().escalation_threshold_days),
            opened_at: state.now(),
        })
        .await
        .map_err(|err| match err {
            DisputeError::HoldMissing => not_found("hold_not_found", "order has no escrow hold"),
            DisputeError::AlreadyOpen => ProblemResponse::new(
                StatusCode::CONFLICT,
                "dispute_open",
                "order already has an unresolved dispute",
            ),
            DisputeError::HoldNotDisputable => ProblemResponse::new(
                StatusCode::CONFLICT,
                "hold_not_disputable",
                "escrow hold is no longer awaiting release",
            ),
            other => internal("dispute_open_failed", &other),
        })?;

    info!(stage = "admin", dispute_id = %dispute.id, order_id = %dispute.order_id, "dispute opened");
    Ok((StatusCode::CREATED, Json(dispute)).into_response())
}

pub async fn get_dispute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(dispute_id): Path<String>,
) -> Result<Response, ProblemResponse> {
    authorize(&state, &headers, "admin.disputes.get")?;
    let dispute = state
        .storage()
        .disputes()
        .fetch(&dispute_id)
        .await
        .map_err(|err| internal("dispute_fetch_failed", &err))?
        .ok_or_else(|| not_found("dispute_not_found", "dispute not found"))?;
    Ok(Json(dispute).into_response())
}

pub async fn review_dispute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(dispute_id): Path<String>,
) -> Result<Response, ProblemResponse> {
    authorize(&state, &headers, "admin.disputes.review")?;
    let disputes = state.storage().disputes();
    let outcome = disputes
        .mark_under_review(&dispute_id)
        .await
        .map_err(|err| internal("dispute_update_failed", &err))?;

    if !outcome.is_applied() {
        return Err(transition_conflict(&state, &dispute_id, "only open disputes can be reviewed").await);
    }
    current_dispute(&state, &dispute_id).await
}

pub async fn resolve_dispute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(dispute_id): Path<String>,
    payload: Result<Json<ResolveDisputeRequest>, JsonRejection>,
) -> Result<Response, ProblemResponse> {
    authorize(&state, &headers, "admin.disputes.resolve")?;
    let Json(request) = payload.map_err(invalid_body)?;

    let outcome = state
        .storage()
        .disputes()
        .resolve(&dispute_id, request.outcome, state.now())
        .await
        .map_err(|err| internal("dispute_update_failed", &err))?;

    if !outcome.is_applied() {
        return Err(transition_conflict(&state, &dispute_id, "dispute is already closed").await);
    }
    info!(
        stage = "admin",
        dispute_id = %dispute_id,
        outcome = request.outcome.status().as_str(),
        "dispute closed"
    );
    current_dispute(&state, &dispute_id).await
}

pub async fn get_balance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(seller_id): Path<String>,
) -> Result<Response, ProblemResponse> {
    authorize(&state, &headers, "admin.balances.get")?;
    let balance = state
        .storage()
        .seller_balances()
        .fetch(&seller_id)
        .await
        .map_err(|err| internal("balance_fetch_failed", &err))?;
    Ok(Json(json!({ "sellerId": seller_id, "balanceCents": balance })).into_response())
}

pub async fn list_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<NotificationQuery>, QueryRejection>,
) -> Result<Response, ProblemResponse> {
    authorize(&state, &headers, "admin.notifications.list")?;
    let Query(query) = query.map_err(|rejection| {
        ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_query", rejection.body_text())
    })?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_NOTIFICATION_LIMIT)
        .clamp(1, MAX_NOTIFICATION_LIMIT);
    let notifications = state
        .storage()
        .notifications()
        .list_recent(limit)
        .await
        .map_err(|err| internal("notification_list_failed", &err))?;
    Ok(Json(notifications).into_response())
}

fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    route: &'static str,
) -> Result<(), ProblemResponse> {
    if bearer_authorized(headers, &state.cron_secret(), route) {
        Ok(())
    } else {
        Err(ProblemResponse::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid bearer token",
        ))
    }
}

async fn current_dispute(state: &AppState, dispute_id: &str) -> Result<Response, ProblemResponse> {
    let dispute = state
        .storage()
        .disputes()
        .fetch(dispute_id)
        .await
        .map_err(|err| internal("dispute_fetch_failed", &err))?
        .ok_or_else(|| not_found("dispute_not_found", "dispute not found"))?;
    Ok(Json(dispute).into_response())
}

async fn transition_conflict(state: &AppState, dispute_id: &str, detail: &str) -> ProblemResponse {
    match state.storage().disputes().fetch(dispute_id).await {
        Ok(Some(dispute)) => ProblemResponse::new(
            StatusCode::CONFLICT,
            "invalid_transition",
            format!("{detail} (current status: {})", dispute.status),
        ),
        Ok(None) => not_found("dispute_not_found", "dispute not found"),
        Err(err) => internal("dispute_fetch_failed", &err),
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ProblemResponse> {
    if value.trim().is_empty() {
        Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "missing_field",
            format!("{field} must not be empty"),
        ))
    } else {
        Ok(())
    }
}

fn invalid_body(rejection: JsonRejection) -> ProblemResponse {
    ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_json", rejection.body_text())
}

fn not_found(problem_type: &'static str, detail: &str) -> ProblemResponse {
    ProblemResponse::new(StatusCode::NOT_FOUND, problem_type, detail)
}

// Storage details stay in the logs; callers only see the problem type.
fn internal(problem_type: &'static str, err: &dyn std::fmt::Display) -> ProblemResponse {
    error!(stage = "admin", problem = problem_type, error = %err, "admin request failed");
    ProblemResponse::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        problem_type,
        "internal storage error",
    )
}

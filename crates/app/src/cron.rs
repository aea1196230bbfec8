use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::error;

use holdwatch_core::types::BatchResult;

use crate::auth::bearer_authorized;
use crate::engine::EngineError;
use crate::router::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdQuery {
    #[serde(default)]
    threshold_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderQuery {
    #[serde(default)]
    reminder_window_days: Option<u32>,
}

pub async fn release_holds(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ThresholdQuery>, QueryRejection>,
) -> Response {
    if !bearer_authorized(&headers, &state.cron_secret(), "cron.release") {
        return unauthorized();
    }
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_query(state.now(), rejection),
    };

    let result = state.engines().release.run(query.threshold_days).await;
    batch_response(state.now(), "release", "released", result, |count| {
        format!("Released {count} escrow hold(s)")
    })
}

pub async fn send_reminders(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ReminderQuery>, QueryRejection>,
) -> Response {
    if !bearer_authorized(&headers, &state.cron_secret(), "cron.reminders") {
        return unauthorized();
    }
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_query(state.now(), rejection),
    };

    let window_days = query
        .reminder_window_days
        .unwrap_or(state.policy().reminder_window_days);
    let result = state.engines().reminders.run(window_days).await;
    batch_response(state.now(), "reminder", "remindersSent", result, |count| {
        format!("Sent {count} auto-release reminder(s)")
    })
}

pub async fn escalate_disputes(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ThresholdQuery>, QueryRejection>,
) -> Response {
    if !bearer_authorized(&headers, &state.cron_secret(), "cron.escalation") {
        return unauthorized();
    }
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_query(state.now(), rejection),
    };

    let result = state.engines().escalation.run(query.threshold_days).await;
    batch_response(state.now(), "escalation", "escalated", result, |count| {
        format!("Escalated {count} dispute(s)")
    })
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized" })),
    )
        .into_response()
}

fn bad_query(now: DateTime<Utc>, rejection: QueryRejection) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": "Invalid query parameters",
            "details": rejection.body_text(),
            "timestamp": timestamp(now),
        })),
    )
        .into_response()
}

fn batch_response(
    now: DateTime<Utc>,
    engine: &'static str,
    count_key: &'static str,
    result: Result<BatchResult, EngineError>,
    message: impl FnOnce(u64) -> String,
) -> Response {
    match result {
        Ok(result) => {
            let mut body = Map::new();
            body.insert("success".to_string(), Value::Bool(true));
            body.insert("message".to_string(), Value::String(message(result.succeeded)));
            body.insert(count_key.to_string(), json!(result.succeeded));
            body.insert("failed".to_string(), json!(result.failed));
            body.insert("skipped".to_string(), json!(result.skipped));
            body.insert("timestamp".to_string(), Value::String(timestamp(now)));
            (StatusCode::OK, Json(Value::Object(body))).into_response()
        }
        Err(err) => {
            error!(stage = engine, error = %err, "batch engine run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": format!("{engine} run failed"),
                    "details": err.to_string(),
                    "timestamp": timestamp(now),
                })),
            )
                .into_response()
        }
    }
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Method, Request},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use holdwatch_core::types::{DisputeStatus, HoldStatus};

    use crate::router::{app_router, tests::setup_state};
    use crate::test_support::{insert_hold, open_dispute};

    use super::*;

    async fn call(
        state: AppState,
        method: Method,
        uri: &str,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = app_router(state)
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .expect("handler should respond");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body should read")
            .to_bytes();
        let body = serde_json::from_slice(&bytes).expect("json body");
        (status, body)
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected_without_mutation() {
        let (state, db, _dir) = setup_state().await;
        let hold = insert_hold(&db, "order-1", "seller-1", 40).await;

        for uri in [
            "/cron/release-holds",
            "/cron/send-reminders",
            "/cron/escalate-disputes",
        ] {
            let (status, body) = call(state.clone(), Method::POST, uri, Some("wrong")).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body, json!({ "error": "Unauthorized" }));

            let (status, _) = call(state.clone(), Method::GET, uri, None).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }

        let stored = db.holds().fetch(&hold.id).await.expect("fetch").expect("hold");
        assert_eq!(stored.status, HoldStatus::Active);
        assert!(stored.reminder_sent_at.is_none());
        assert_eq!(db.seller_balances().fetch("seller-1").await.expect("balance"), 0);
    }

    #[tokio::test]
    async fn release_endpoint_reports_counts() {
        let (state, db, _dir) = setup_state().await;
        insert_hold(&db, "order-1", "seller-1", 40).await;
        insert_hold(&db, "order-2", "seller-1", 3).await;

        let (status, body) = call(
            state,
            Method::POST,
            "/cron/release-holds",
            Some(crate::router::tests::CRON_SECRET),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["released"], json!(1));
        assert_eq!(body["failed"], json!(0));
        assert_eq!(body["message"], json!("Released 1 escrow hold(s)"));
        assert_eq!(body["timestamp"], json!("2024-03-01T12:00:00.000Z"));
    }

    #[tokio::test]
    async fn reminder_endpoint_accepts_window_override() {
        let (state, db, _dir) = setup_state().await;
        let hold = insert_hold(&db, "order-1", "seller-1", 15).await;

        let (status, body) = call(
            state.clone(),
            Method::GET,
            "/cron/send-reminders",
            Some(crate::router::tests::CRON_SECRET),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remindersSent"], json!(0));

        let (status, body) = call(
            state,
            Method::GET,
            "/cron/send-reminders?reminderWindowDays=15",
            Some(crate::router::tests::CRON_SECRET),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remindersSent"], json!(1));

        let stored = db.holds().fetch(&hold.id).await.expect("fetch").expect("hold");
        assert_eq!(stored.status, HoldStatus::ReminderSent);
    }

    #[tokio::test]
    async fn escalation_endpoint_escalates_old_disputes() {
        let (state, db, _dir) = setup_state().await;
        insert_hold(&db, "order-1", "seller-1", 10).await;
        let dispute = open_dispute(&db, "order-1", "never arrived", 6).await;

        let (status, body) = call(
            state,
            Method::POST,
            "/cron/escalate-disputes",
            Some(crate::router::tests::CRON_SECRET),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["escalated"], json!(1));

        let stored = db
            .disputes()
            .fetch(&dispute.id)
            .await
            .expect("fetch")
            .expect("dispute");
        assert_eq!(stored.status, DisputeStatus::Escalated);
    }

    #[tokio::test]
    async fn listing_failure_returns_server_error() {
        let (state, db, _dir) = setup_state().await;
        sqlx::query("DROP TABLE disputes")
            .execute(db.pool())
            .await
            .expect("drop table");

        let (status, body) = call(
            state,
            Method::POST,
            "/cron/escalate-disputes",
            Some(crate::router::tests::CRON_SECRET),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], json!("escalation run failed"));
        assert!(body["details"].as_str().is_some());
        assert!(body["timestamp"].as_str().is_some());
    }

    #[tokio::test]
    async fn invalid_override_is_a_bad_request() {
        let (state, _db, _dir) = setup_state().await;
        let (status, body) = call(
            state,
            Method::POST,
            "/cron/release-holds?thresholdDays=soon",
            Some(crate::router::tests::CRON_SECRET),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("Invalid query parameters"));
    }
}

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use holdwatch_core::EscrowPolicy;
use holdwatch_storage::Database;

use crate::engine::{Clock, Engines};
use crate::notify::NotificationQueue;
use crate::{admin, cron, telemetry};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    cron_secret: Arc<[u8]>,
    policy: EscrowPolicy,
    clock: Clock,
    engines: Engines,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        cron_secret: Arc<[u8]>,
        policy: EscrowPolicy,
        notifier: NotificationQueue,
        clock: Clock,
    ) -> Self {
        let engines = Engines::new(storage.clone(), notifier, clock.clone());
        Self {
            metrics,
            storage,
            cron_secret,
            policy,
            clock,
            engines,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn cron_secret(&self) -> Arc<[u8]> {
        self.cron_secret.clone()
    }

    pub fn policy(&self) -> EscrowPolicy {
        self.policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn engines(&self) -> &Engines {
        &self.engines
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route(
            "/cron/release-holds",
            get(cron::release_holds).post(cron::release_holds),
        )
        .route(
            "/cron/send-reminders",
            get(cron::send_reminders).post(cron::send_reminders),
        )
        .route(
            "/cron/escalate-disputes",
            get(cron::escalate_disputes).post(cron::escalate_disputes),
        )
        .route("/holds", axum::routing::post(admin::create_hold))
        .route("/holds/:id", get(admin::get_hold))
        .route("/disputes", axum::routing::post(admin::open_dispute))
        .route("/disputes/:id", get(admin::get_dispute))
        .route("/disputes/:id/review", axum::routing::post(admin::review_dispute))
        .route("/disputes/:id/resolve", axum::routing::post(admin::resolve_dispute))
        .route("/balances/:seller_id", get(admin::get_balance))
        .route("/notifications", get(admin::list_notifications))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(state.storage().pool()).await {
        Ok(_) => StatusCode::OK,
        Err(err) => {
            tracing::warn!(stage = "health", error = %err, "database ping failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

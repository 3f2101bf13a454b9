use crate::functions::scheduled_delivery::DeliveryWorker;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, HeaderName, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use forge::prelude::*;
use sqlx::PgPool;
use std::future::IntoFuture;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub const PROCESS_PATH: &str = "/process-scheduled-messages";
const DEFAULT_ADDR: &str = "127.0.0.1:8787";

#[derive(Clone)]
pub struct TriggerState {
    pub db: PgPool,
    pub worker: Arc<DeliveryWorker>,
    /// When set, `PROCESS_PATH` requires `Authorization: Bearer <secret>`.
    pub secret: Option<String>,
}

fn authorized(secret: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token.trim() == secret)
}

pub fn router(state: TriggerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
        ]);

    Router::new()
        .route(
            PROCESS_PATH,
            get(process_scheduled_messages).post(process_scheduled_messages),
        )
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

async fn process_scheduled_messages(
    State(state): State<TriggerState>,
    headers: HeaderMap,
) -> Response {
    if !authorized(state.secret.as_deref(), &headers) {
        tracing::warn!("delivery trigger: rejected request without a valid secret");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "unauthorized" })),
        )
            .into_response();
    }

    match state.worker.run_once(&state.db).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "scheduled delivery: invocation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[forge::daemon]
pub async fn delivery_trigger(ctx: &DaemonContext) -> Result<()> {
    let addr: String = ctx
        .env_parse("SCHEDULED_DELIVERY_HTTP_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let secret: Option<String> = ctx
        .env_parse::<String>("SCHEDULED_DELIVERY_TRIGGER_SECRET")
        .ok()
        .filter(|s| !s.trim().is_empty());
    if secret.is_none() {
        tracing::warn!(
            %addr,
            "delivery trigger: SCHEDULED_DELIVERY_TRIGGER_SECRET unset, calls are not authenticated"
        );
    }
    let state = TriggerState {
        db: ctx.db().clone(),
        worker: crate::get_delivery_worker()?,
        secret,
    };

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ForgeError::Internal(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(%addr, "delivery trigger listening");

    tokio::select! {
        _ = ctx.shutdown_signal() => {}
        served = axum::serve(listener, router(state)).into_future() => {
            served.map_err(|e| ForgeError::Internal(format!("delivery trigger stopped: {e}")))?;
        }
    }
    Ok(())
}

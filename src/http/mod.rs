pub mod admin;
pub mod auth;
mod proxy_routes;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::error::GatewayError;
use crate::proxy::ProxyEngine;

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub engine: ProxyEngine,
    pub principals: auth::PrincipalDirectory,
    pub admin: auth::AdminAuth,
}

/// Error body shared by every route: `{error_kind, message}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error_kind: String,
    pub message: String,
}

pub(crate) fn error_response(
    status: StatusCode,
    error_kind: &str,
    message: impl std::fmt::Display,
) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            error_kind: error_kind.to_string(),
            message: message.to_string(),
        }),
    )
}

pub(crate) fn gateway_error_response(error: &GatewayError) -> (StatusCode, Json<ErrorBody>) {
    error_response(error.status(), error.kind(), error)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Proxy surface.
        .route("/v1beta/models/*path", post(proxy_routes::handle_gemini))
        .route(
            "/v1/chat/completions",
            post(proxy_routes::handle_openai_chat),
        )
        // Administration.
        .route("/api/auth/login", post(auth::login))
        .route(
            "/api/auth_keys",
            get(admin::list_principals)
                .post(admin::create_principal)
                .put(admin::update_principal),
        )
        .route("/api/auth_keys/:api_key", delete(admin::delete_principal))
        .route("/api/keys/status", get(admin::keys_status))
        .route("/api/keys", post(admin::add_keys))
        .route("/api/keys/reset", post(admin::reset_all_keys))
        .route("/api/keys/:identifier", delete(admin::delete_key))
        .route("/api/keys/:identifier/reset", post(admin::reset_key))
        .route("/api/request_logs", get(admin::request_logs))
        .route("/api/stats/auth_keys", get(admin::stats_principals))
        .route("/api/stats/heatmap", get(admin::stats_heatmap))
        .route("/api/stats/trend", get(admin::stats_trend))
        .route("/api/stats/success_rate", get(admin::stats_success_rate))
        .route(
            "/api/stats/success_rate/hourly",
            get(admin::stats_success_rate_hourly),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

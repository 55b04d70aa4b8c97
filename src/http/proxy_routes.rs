use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use super::auth::extract_proxy_credential;
use super::{error_response, gateway_error_response, AppState};
use crate::dialect::Dialect;
use crate::error::GatewayError;
use crate::proxy::{generate_request_id, ProxyRequest};
use crate::store::now_epoch;

fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(generate_request_id)
}

/// Resolves the caller to an active principal alias; a rejection is still
/// a terminated request and gets its log row.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    request: &mut ProxyRequest,
    request_id: &str,
) -> Result<(), Response> {
    let credential = extract_proxy_credential(headers);
    let alias = match credential {
        Some(credential) => state.principals.resolve_active(&credential).await,
        None => None,
    };
    match alias {
        Some(alias) => {
            request.principal_alias = alias;
            Ok(())
        }
        None => {
            let error = GatewayError::PrincipalRejected;
            state
                .engine
                .log_failure(request, request_id, now_epoch(), &error)
                .await;
            Err(gateway_error_response(&error).into_response())
        }
    }
}

/// `POST /v1beta/models/{model}:generateContent` and
/// `:streamGenerateContent`. Gemini dialect, body forwarded verbatim.
pub async fn handle_gemini(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id_from(&headers);

    let Some((model_raw, action)) = path.rsplit_once(':') else {
        return error_response(
            StatusCode::NOT_FOUND,
            "invalid_request",
            "unsupported endpoint",
        )
        .into_response();
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => {
            return error_response(
                StatusCode::NOT_FOUND,
                "invalid_request",
                format!("unsupported action: {action}"),
            )
            .into_response();
        }
    };
    let model = model_raw.trim().trim_start_matches("models/").to_string();
    if model.is_empty() {
        return error_response(StatusCode::NOT_FOUND, "invalid_request", "missing model")
            .into_response();
    }

    let mut request = ProxyRequest {
        dialect: Dialect::Gemini,
        model,
        stream,
        body,
        principal_alias: "unknown".to_string(),
    };
    if let Err(rejection) = authenticate(&state, &headers, &mut request, &request_id).await {
        return rejection;
    }

    match state.engine.execute(request, &request_id).await {
        Ok(response) => response,
        Err(error) => gateway_error_response(&error).into_response(),
    }
}

/// `POST /v1/chat/completions`. OpenAI-Chat dialect; streaming is chosen
/// by `"stream": true` in the body.
pub async fn handle_openai_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id_from(&headers);

    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("invalid JSON body: {err}"),
            )
            .into_response();
        }
    };
    let Some(model) = parsed
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "missing field `model`",
        )
        .into_response();
    };
    let stream = parsed
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut request = ProxyRequest {
        dialect: Dialect::OpenAiChat,
        model,
        stream,
        body,
        principal_alias: "unknown".to_string(),
    };
    if let Err(rejection) = authenticate(&state, &headers, &mut request, &request_id).await {
        return rejection;
    }

    match state.engine.execute(request, &request_id).await {
        Ok(response) => response,
        Err(error) => gateway_error_response(&error).into_response(),
    }
}

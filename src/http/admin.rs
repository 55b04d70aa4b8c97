use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{error_response, AppState, ErrorBody};
use crate::pool::{KeyStatus, PoolError, PoolStatusReport};
use crate::store::{
    now_epoch, HeatmapCell, HourlySuccessRateReport, LogFilter, LogPage, PrincipalRecord,
    StoreError, SuccessRateReport, TrendReport, TrendUnit, UsageKind,
};

type ApiError = (StatusCode, Json<ErrorBody>);

fn pool_error_response(error: PoolError) -> ApiError {
    match error {
        PoolError::KeyBusy(identifier) => error_response(
            StatusCode::CONFLICT,
            "key_busy",
            format!("key {identifier} is currently leased"),
        ),
        PoolError::UnknownKey(identifier) => error_response(
            StatusCode::NOT_FOUND,
            "unknown_key",
            format!("key {identifier} does not exist"),
        ),
        PoolError::Store(err) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", err)
        }
    }
}

fn store_error_response(error: StoreError) -> ApiError {
    match error {
        StoreError::InvalidTimezone(name) => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            format!("invalid timezone: {name}"),
        ),
        other => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", other),
    }
}

/// Timezone selection: `tz` query parameter, then `x-timezone` header,
/// then UTC.
fn timezone_from(headers: &HeaderMap, tz: Option<String>) -> String {
    tz.filter(|value| !value.trim().is_empty())
        .or_else(|| {
            headers
                .get("x-timezone")
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
        .unwrap_or_else(|| "UTC".to_string())
}

// ---- upstream key management ----

pub async fn keys_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<PoolStatusReport>, ApiError> {
    state.admin.require(&headers)?;
    Ok(Json(state.engine.pool.status()))
}

#[derive(Debug, Deserialize)]
pub struct AddKeysRequest {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    keys: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct AddKeysResponse {
    added: Vec<KeyStatus>,
}

/// Accepts one secret or many; newline- and comma-separated blobs are
/// split so a pasted list just works. Duplicates collapse by identifier.
pub async fn add_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AddKeysRequest>,
) -> Result<Json<AddKeysResponse>, ApiError> {
    state.admin.require(&headers)?;

    let mut secrets = Vec::new();
    if let Some(key) = payload.key {
        secrets.push(key);
    }
    secrets.extend(payload.keys.unwrap_or_default());

    let mut cleaned = Vec::new();
    for blob in secrets {
        for part in blob.split(['\n', ',']) {
            let part = part.trim();
            if !part.is_empty() && !cleaned.iter().any(|existing| existing == part) {
                cleaned.push(part.to_string());
            }
        }
    }
    if cleaned.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "no keys supplied",
        ));
    }

    let mut added = Vec::new();
    for secret in cleaned {
        let status = state
            .engine
            .pool
            .add_key(&secret)
            .await
            .map_err(pool_error_response)?;
        added.push(status);
    }
    info!(count = added.len(), "registered upstream keys");
    Ok(Json(AddKeysResponse { added }))
}

pub async fn delete_key(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    state.admin.require(&headers)?;
    state
        .engine
        .pool
        .delete_key(&identifier)
        .await
        .map_err(pool_error_response)?;
    info!(identifier, "deleted upstream key");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reset_key(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    headers: HeaderMap,
) -> Result<Json<KeyStatus>, ApiError> {
    state.admin.require(&headers)?;
    let status = state
        .engine
        .pool
        .reset_key(&identifier)
        .await
        .map_err(pool_error_response)?;
    info!(identifier, "reset upstream key");
    Ok(Json(status))
}

#[derive(Debug, Serialize)]
pub struct ResetAllResponse {
    reset: usize,
}

pub async fn reset_all_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ResetAllResponse>, ApiError> {
    state.admin.require(&headers)?;
    let reset = state
        .engine
        .pool
        .reset_all()
        .await
        .map_err(pool_error_response)?;
    info!(count = reset, "reset all upstream keys");
    Ok(Json(ResetAllResponse { reset }))
}

// ---- auth principal management ----

#[derive(Debug, Serialize)]
pub struct PrincipalView {
    api_key: String,
    alias: String,
    active: bool,
    created_at: f64,
    /// Derived from the request log, never stored on the principal.
    call_count: u64,
}

pub async fn list_principals(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<PrincipalView>>, ApiError> {
    state.admin.require(&headers)?;
    let records = state
        .engine
        .store
        .list_principals()
        .await
        .map_err(store_error_response)?;
    let counts = state
        .engine
        .store
        .per_principal_call_counts()
        .await
        .map_err(store_error_response)?;
    let views = records
        .into_iter()
        .map(|record| PrincipalView {
            call_count: counts.get(&record.alias).copied().unwrap_or(0),
            api_key: record.api_key,
            alias: record.alias,
            active: record.active,
            created_at: record.created_at,
        })
        .collect();
    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
pub struct CreatePrincipalRequest {
    alias: String,
}

pub async fn create_principal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePrincipalRequest>,
) -> Result<(StatusCode, Json<PrincipalRecord>), ApiError> {
    state.admin.require(&headers)?;
    let alias = payload.alias.trim().to_string();
    if alias.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "alias must not be empty",
        ));
    }

    let existing = state
        .engine
        .store
        .list_principals()
        .await
        .map_err(store_error_response)?;
    if existing.iter().any(|record| record.alias == alias) {
        return Err(error_response(
            StatusCode::CONFLICT,
            "invalid_request",
            format!("alias {alias} already exists"),
        ));
    }

    let record = PrincipalRecord {
        api_key: generate_principal_token(),
        alias,
        active: true,
        created_at: now_epoch(),
    };
    state
        .engine
        .store
        .upsert_principal(record.clone())
        .await
        .map_err(store_error_response)?;
    state.principals.upsert(record.clone()).await;
    info!(alias = %record.alias, "created auth principal");
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePrincipalRequest {
    api_key: String,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    active: Option<bool>,
}

pub async fn update_principal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UpdatePrincipalRequest>,
) -> Result<Json<PrincipalRecord>, ApiError> {
    state.admin.require(&headers)?;
    let existing = state
        .engine
        .store
        .list_principals()
        .await
        .map_err(store_error_response)?;
    let Some(mut record) = existing
        .into_iter()
        .find(|record| record.api_key == payload.api_key)
    else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "invalid_request",
            "unknown principal",
        ));
    };

    if let Some(alias) = payload.alias {
        let alias = alias.trim().to_string();
        if !alias.is_empty() {
            record.alias = alias;
        }
    }
    if let Some(active) = payload.active {
        record.active = active;
    }

    state
        .engine
        .store
        .upsert_principal(record.clone())
        .await
        .map_err(store_error_response)?;
    state.principals.upsert(record.clone()).await;
    info!(alias = %record.alias, active = record.active, "updated auth principal");
    Ok(Json(record))
}

pub async fn delete_principal(
    State(state): State<AppState>,
    Path(api_key): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    state.admin.require(&headers)?;
    state
        .engine
        .store
        .delete_principal(&api_key)
        .await
        .map_err(store_error_response)?;
    state.principals.remove(&api_key).await;
    info!("deleted auth principal");
    Ok(StatusCode::NO_CONTENT)
}

fn generate_principal_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("rk-{hex}")
}

// ---- request logs and statistics ----

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    start_time: Option<f64>,
    #[serde(default)]
    end_time: Option<f64>,
    #[serde(default)]
    principal_alias: Option<String>,
    #[serde(default)]
    key_identifier: Option<String>,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    is_success: Option<bool>,
    #[serde(default = "default_log_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

fn default_log_limit() -> u32 {
    100
}

pub async fn request_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogPage>, ApiError> {
    state.admin.require(&headers)?;
    let page = state
        .engine
        .store
        .query_request_logs(LogFilter {
            start_time: query.start_time,
            end_time: query.end_time,
            principal_alias: query.principal_alias,
            key_identifier: query.key_identifier,
            model_name: query.model_name,
            is_success: query.is_success,
            limit: query.limit.min(1000),
            offset: query.offset,
        })
        .await
        .map_err(store_error_response)?;
    Ok(Json(page))
}

#[derive(Debug, Serialize)]
pub struct PrincipalCallCount {
    alias: String,
    call_count: u64,
}

pub async fn stats_principals(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<PrincipalCallCount>>, ApiError> {
    state.admin.require(&headers)?;
    let counts = state
        .engine
        .store
        .per_principal_call_counts()
        .await
        .map_err(store_error_response)?;
    Ok(Json(
        counts
            .into_iter()
            .map(|(alias, call_count)| PrincipalCallCount { alias, call_count })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct HeatmapQuery {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    tz: Option<String>,
}

pub async fn stats_heatmap(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HeatmapQuery>,
) -> Result<Json<Vec<HeatmapCell>>, ApiError> {
    state.admin.require(&headers)?;
    let kind = parse_kind(query.kind.as_deref())?;
    let timezone = timezone_from(&headers, query.tz);
    let cells = state
        .engine
        .store
        .daily_usage_heatmap(kind, &timezone)
        .await
        .map_err(store_error_response)?;
    Ok(Json(cells))
}

#[derive(Debug, Deserialize)]
pub struct TrendQuery {
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    offset: Option<i32>,
    #[serde(default)]
    num_periods: Option<u32>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    tz: Option<String>,
}

pub async fn stats_trend(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TrendQuery>,
) -> Result<Json<TrendReport>, ApiError> {
    state.admin.require(&headers)?;
    let unit = match query.unit.as_deref() {
        None => TrendUnit::Day,
        Some(raw) => TrendUnit::parse(raw).ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("invalid unit: {raw}"),
            )
        })?,
    };
    let kind = parse_kind(query.kind.as_deref())?;
    let timezone = timezone_from(&headers, query.tz);
    let report = state
        .engine
        .store
        .usage_trend(
            unit,
            query.offset.unwrap_or(0),
            query.num_periods.unwrap_or(7).clamp(1, 60),
            kind,
            &timezone,
        )
        .await
        .map_err(store_error_response)?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct SuccessRateQuery {
    #[serde(default)]
    days: Option<u32>,
    #[serde(default)]
    tz: Option<String>,
}

pub async fn stats_success_rate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SuccessRateQuery>,
) -> Result<Json<SuccessRateReport>, ApiError> {
    state.admin.require(&headers)?;
    let timezone = timezone_from(&headers, query.tz);
    let report = state
        .engine
        .store
        .success_rate(query.days.unwrap_or(7).clamp(1, 90), &timezone)
        .await
        .map_err(store_error_response)?;
    Ok(Json(report))
}

pub async fn stats_success_rate_hourly(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SuccessRateQuery>,
) -> Result<Json<HourlySuccessRateReport>, ApiError> {
    state.admin.require(&headers)?;
    let timezone = timezone_from(&headers, query.tz);
    let report = state
        .engine
        .store
        .success_rate_hourly(query.days.unwrap_or(1).clamp(1, 30), &timezone)
        .await
        .map_err(store_error_response)?;
    Ok(Json(report))
}

fn parse_kind(raw: Option<&str>) -> Result<UsageKind, ApiError> {
    match raw {
        None => Ok(UsageKind::Requests),
        Some(raw) => UsageKind::parse(raw).ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("invalid type: {raw}"),
            )
        }),
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use super::{error_response, AppState, ErrorBody};
use crate::config::GatewayConfig;
use crate::store::{PrincipalRecord, Store, StoreError};

/// Read view of the auth principals, kept in memory so the proxy path
/// never queries the store. Administrative CRUD updates it in place.
#[derive(Clone)]
pub struct PrincipalDirectory {
    inner: Arc<RwLock<HashMap<String, PrincipalRecord>>>,
}

impl PrincipalDirectory {
    pub async fn load(store: &Store) -> Result<Self, StoreError> {
        let records = store.list_principals().await?;
        let map = records
            .into_iter()
            .map(|record| (record.api_key.clone(), record))
            .collect();
        Ok(Self {
            inner: Arc::new(RwLock::new(map)),
        })
    }

    /// Resolves a presented token to an active principal's alias.
    pub async fn resolve_active(&self, api_key: &str) -> Option<String> {
        let guard = self.inner.read().await;
        guard
            .get(api_key)
            .filter(|record| record.active)
            .map(|record| record.alias.clone())
    }

    pub async fn upsert(&self, record: PrincipalRecord) {
        self.inner
            .write()
            .await
            .insert(record.api_key.clone(), record);
    }

    pub async fn remove(&self, api_key: &str) {
        self.inner.write().await.remove(api_key);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: u64,
}

/// Administrative bearer-token authentication (HS256).
#[derive(Clone)]
pub struct AdminAuth {
    secret: String,
    password: String,
    expire_seconds: u64,
}

impl AdminAuth {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            secret: config.secret_key.clone(),
            password: config.password.clone(),
            expire_seconds: config.access_token_expire_minutes * 60,
        }
    }

    fn issue_token(&self) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            sub: "admin".to_string(),
            exp: jsonwebtoken::get_current_timestamp() + self.expire_seconds,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
    }

    /// Guards an administrative route.
    pub fn require(&self, headers: &HeaderMap) -> Result<(), (StatusCode, Json<ErrorBody>)> {
        let Some(token) = extract_bearer(headers) else {
            return Err(error_response(
                StatusCode::UNAUTHORIZED,
                "principal_rejected",
                "missing bearer token",
            ));
        };
        decode::<Claims>(
            &token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map(|_| ())
        .map_err(|_| {
            error_response(
                StatusCode::UNAUTHORIZED,
                "principal_rejected",
                "invalid or expired token",
            )
        })
    }

    fn check_password(&self, candidate: &str) -> bool {
        // Constant-time comparison; the password is low-entropy enough
        // that timing must not leak prefix matches.
        let expected = self.password.as_bytes();
        let candidate = candidate.as_bytes();
        if expected.len() != candidate.len() {
            return false;
        }
        expected
            .iter()
            .zip(candidate)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Proxy-route credential: bearer token or `x-goog-api-key`.
pub fn extract_proxy_credential(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers
        .get("x-goog-api-key")
        .and_then(|value| value.to_str().ok())
    {
        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    extract_bearer(headers)
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    access_token: String,
    token_type: &'static str,
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ErrorBody>)> {
    if !state.admin.check_password(&payload.password) {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "principal_rejected",
            "invalid password",
        ));
    }
    let access_token = state.admin.issue_token().map_err(|err| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            format!("failed to sign token: {err}"),
        )
    })?;
    info!("administrative login");
    Ok(Json(LoginResponse {
        access_token,
        token_type: "bearer",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> AdminAuth {
        AdminAuth {
            secret: "unit-test-secret".to_string(),
            password: "hunter2".to_string(),
            expire_seconds: 60,
        }
    }

    #[test]
    fn issued_tokens_verify() {
        let auth = auth();
        let token = auth.issue_token().expect("token");
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {token}").parse().expect("header"),
        );
        assert!(auth.require(&headers).is_ok());
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        let auth = auth();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer nope".parse().expect("header"));
        assert!(auth.require(&headers).is_err());
        assert!(auth.require(&HeaderMap::new()).is_err());
    }

    #[test]
    fn password_check_is_exact() {
        let auth = auth();
        assert!(auth.check_password("hunter2"));
        assert!(!auth.check_password("hunter"));
        assert!(!auth.check_password("hunter22"));
        assert!(!auth.check_password(""));
    }

    #[test]
    fn proxy_credential_prefers_goog_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", "rk-goog".parse().expect("header"));
        headers.insert("authorization", "Bearer rk-bearer".parse().expect("header"));
        assert_eq!(
            extract_proxy_credential(&headers),
            Some("rk-goog".to_string())
        );

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer rk-bearer".parse().expect("header"));
        assert_eq!(
            extract_proxy_credential(&headers),
            Some("rk-bearer".to_string())
        );
        assert_eq!(extract_proxy_credential(&HeaderMap::new()), None);
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use rotor_llm::config::GatewayConfig;
use rotor_llm::gate::ConcurrencyGate;
use rotor_llm::http::auth::{AdminAuth, PrincipalDirectory};
use rotor_llm::http::AppState;
use rotor_llm::pool::{derive_identifier, KeyPool, PoolSettings};
use rotor_llm::proxy::ProxyEngine;
use rotor_llm::store::Store;
use rotor_llm::upstream::UpstreamClient;

fn test_config(upstream_base_url: &str, database_path: PathBuf) -> GatewayConfig {
    serde_json::from_value(json!({
        "acquire_timeout_seconds": 1,
        "request_timeout_seconds": 5,
        "upstream_base_url": upstream_base_url,
        "database_path": database_path,
        "secret_key": "test-secret",
        "password": "test-password"
    }))
    .expect("config")
}

async fn build_state(config: GatewayConfig) -> AppState {
    let store = Store::open(&config.database_path).expect("store");
    let pool = KeyPool::load(store.clone(), PoolSettings::from_config(&config))
        .await
        .expect("pool");
    let config = Arc::new(config);
    let engine = ProxyEngine {
        config: Arc::clone(&config),
        store: store.clone(),
        pool,
        gate: ConcurrencyGate::new(config.max_concurrent_upstream, config.acquire_timeout()),
        upstream: UpstreamClient::from_config(&config).expect("client"),
    };
    AppState {
        principals: PrincipalDirectory::load(&store).await.expect("directory"),
        admin: AdminAuth::from_config(&config),
        engine,
    }
}

async fn json_of(response: axum::response::Response) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    serde_json::from_slice(&body).expect("json")
}

async fn login(app: &axum::Router) -> String {
    let request = Request::builder()
        .method("POST")
        .uri("/api/auth/login")
        .header("content-type", "application/json")
        .body(Body::from(json!({"password": "test-password"}).to_string()))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_of(response).await;
    assert_eq!(body["token_type"], "bearer");
    body["access_token"].as_str().expect("token").to_string()
}

fn authed(method: &str, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json");
    match body {
        Some(body) => builder.body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request")
}

#[tokio::test]
async fn login_rejects_a_wrong_password() {
    let upstream = MockServer::start();
    let dir = tempfile::tempdir().expect("tempdir");
    let state = build_state(test_config(&upstream.base_url(), dir.path().join("rotor.sqlite"))).await;
    let app = rotor_llm::http::router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/api/auth/login")
        .header("content-type", "application/json")
        .body(Body::from(json!({"password": "wrong"}).to_string()))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_routes_require_a_token() {
    let upstream = MockServer::start();
    let dir = tempfile::tempdir().expect("tempdir");
    let state = build_state(test_config(&upstream.base_url(), dir.path().join("rotor.sqlite"))).await;
    let app = rotor_llm::http::router(state);

    for uri in [
        "/api/keys/status",
        "/api/request_logs",
        "/api/stats/trend",
        "/api/auth_keys",
    ] {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
    }
}

#[tokio::test]
async fn key_management_lifecycle() {
    let upstream = MockServer::start();
    let dir = tempfile::tempdir().expect("tempdir");
    let state = build_state(test_config(&upstream.base_url(), dir.path().join("rotor.sqlite"))).await;
    let app = rotor_llm::http::router(state.clone());
    let token = login(&app).await;

    // A pasted blob plus an explicit list, with one duplicate.
    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/api/keys",
            &token,
            Some(json!({
                "key": "sk-blob-one\nsk-blob-two, sk-blob-three",
                "keys": ["sk-blob-one"]
            })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_of(response).await;
    assert_eq!(body["added"].as_array().map(Vec::len), Some(3));

    let response = app
        .clone()
        .oneshot(authed("GET", "/api/keys/status", &token, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_of(response).await;
    assert_eq!(body["total"], 3);
    assert_eq!(body["active"], 3);

    // Reset endpoints answer even for healthy keys.
    let identifier = derive_identifier("sk-blob-two");
    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            &format!("/api/keys/{identifier}/reset"),
            &token,
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(authed("POST", "/api/keys/reset", &token, None))
        .await
        .expect("response");
    let body = json_of(response).await;
    assert_eq!(body["reset"], 3);

    let response = app
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/api/keys/{identifier}"),
            &token,
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/api/keys/{identifier}"),
            &token,
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // The status summary never leaks the secret itself.
    let response = app
        .clone()
        .oneshot(authed("GET", "/api/keys/status", &token, None))
        .await
        .expect("response");
    let raw = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let raw = String::from_utf8_lossy(&raw);
    assert!(!raw.contains("sk-blob-one"));
    assert!(raw.contains("sk-b...-one"));
}

#[tokio::test]
async fn deleting_a_leased_key_is_rejected_as_busy() {
    let upstream = MockServer::start();
    let dir = tempfile::tempdir().expect("tempdir");
    let state = build_state(test_config(&upstream.base_url(), dir.path().join("rotor.sqlite"))).await;
    state.engine.pool.add_key("sk-busy-key").await.expect("add");
    let lease = state.engine.pool.acquire().await.expect("lease");

    let app = rotor_llm::http::router(state.clone());
    let token = login(&app).await;
    let identifier = derive_identifier("sk-busy-key");

    let response = app
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/api/keys/{identifier}"),
            &token,
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = json_of(response).await;
    assert_eq!(body["error_kind"], "key_busy");

    lease
        .release(rotor_llm::pool::LeaseOutcome::Success)
        .await;
}

#[tokio::test]
async fn principal_lifecycle_feeds_the_proxy_auth() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "choices": [{"message": {"content": "ok"}}],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
            }));
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let state = build_state(test_config(&upstream.base_url(), dir.path().join("rotor.sqlite"))).await;
    state.engine.pool.add_key("sk-test-key-one").await.expect("add");
    let app = rotor_llm::http::router(state.clone());
    let token = login(&app).await;

    // Create.
    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/api/auth_keys",
            &token,
            Some(json!({"alias": "alice"})),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_of(response).await;
    let api_key = created["api_key"].as_str().expect("api_key").to_string();
    assert!(api_key.starts_with("rk-"));

    // Duplicate alias is a conflict.
    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/api/auth_keys",
            &token,
            Some(json!({"alias": "alice"})),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // The fresh token authenticates proxy calls.
    let proxied = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {api_key}"))
        .body(Body::from(json!({"model": "gpt-x"}).to_string()))
        .expect("request");
    let response = app.clone().oneshot(proxied).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    // Listing shows the derived call count.
    let response = app
        .clone()
        .oneshot(authed("GET", "/api/auth_keys", &token, None))
        .await
        .expect("response");
    let listed = json_of(response).await;
    let entry = listed
        .as_array()
        .and_then(|items| items.first())
        .expect("entry");
    assert_eq!(entry["alias"], "alice");
    assert_eq!(entry["call_count"], 1);

    // Deactivate, then the proxy rejects the same token.
    let response = app
        .clone()
        .oneshot(authed(
            "PUT",
            "/api/auth_keys",
            &token,
            Some(json!({"api_key": api_key, "active": false})),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let proxied = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {api_key}"))
        .body(Body::from(json!({"model": "gpt-x"}).to_string()))
        .expect("request");
    let response = app.clone().oneshot(proxied).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Delete removes it from the directory as well.
    let response = app
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/api/auth_keys/{api_key}"),
            &token,
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(authed("GET", "/api/auth_keys", &token, None))
        .await
        .expect("response");
    let listed = json_of(response).await;
    assert_eq!(listed.as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn request_log_endpoint_paginates_and_filters() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"choices": [], "usage": {"total_tokens": 2}}));
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let state = build_state(test_config(&upstream.base_url(), dir.path().join("rotor.sqlite"))).await;
    state.engine.pool.add_key("sk-test-key-one").await.expect("add");
    state
        .engine
        .store
        .upsert_principal(rotor_llm::store::PrincipalRecord {
            api_key: "rk-alice".to_string(),
            alias: "alice".to_string(),
            active: true,
            created_at: rotor_llm::store::now_epoch(),
        })
        .await
        .expect("principal");
    state
        .principals
        .upsert(rotor_llm::store::PrincipalRecord {
            api_key: "rk-alice".to_string(),
            alias: "alice".to_string(),
            active: true,
            created_at: rotor_llm::store::now_epoch(),
        })
        .await;

    let app = rotor_llm::http::router(state.clone());
    let token = login(&app).await;

    for _ in 0..3 {
        let proxied = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("authorization", "Bearer rk-alice")
            .body(Body::from(json!({"model": "gpt-x"}).to_string()))
            .expect("request");
        let response = app.clone().oneshot(proxied).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(authed(
            "GET",
            "/api/request_logs?limit=2&principal_alias=alice",
            &token,
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_of(response).await;
    assert_eq!(body["total"], 3);
    assert_eq!(body["logs"].as_array().map(Vec::len), Some(2));
    assert!(body["time_range"].is_array());

    let response = app
        .clone()
        .oneshot(authed(
            "GET",
            "/api/request_logs?principal_alias=nobody",
            &token,
            None,
        ))
        .await
        .expect("response");
    let body = json_of(response).await;
    assert_eq!(body["total"], 0);
}

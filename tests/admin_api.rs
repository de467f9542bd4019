//! Admin API over an in-process router.

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use crypto_relay::admin::{setup_admin_router, AdminState};
use crypto_relay::config::QuotaConfig;
use crypto_relay::gateway::RequestOptions;

mod common;
use common::{harness, price, service, test_config, Harness, Outcome, ScriptedUpstream};

const KEY: &str = "test-admin-key";

fn setup() -> Harness {
    let mut llm = service("llm");
    llm.token_resource = Some("llm_tokens".to_string());
    let config = test_config(
        vec![service("coingecko"), llm],
        vec![QuotaConfig {
            resource: "llm_tokens".to_string(),
            limit: 1_000,
            window_secs: 60,
        }],
    );
    harness(
        &config,
        ScriptedUpstream::always(Outcome::Ok(json!({"usage": {"total_tokens": 12}}))),
    )
}

async fn call(h: &Harness, method: Method, uri: &str, body: Option<Value>, key: Option<&str>) -> (StatusCode, Value) {
    let router = setup_admin_router(AdminState::new(h.gateway.clone(), KEY));

    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", key));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn rejects_missing_or_wrong_key() {
    let h = setup();
    let (status, _) = call(&h, Method::GET, "/admin/status", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&h, Method::GET, "/admin/status", None, Some("nope")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn status_lists_services() {
    let h = setup();
    let (status, body) = call(&h, Method::GET, "/admin/status", None, Some(KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "operational");
    assert_eq!(body["services"], json!(["coingecko", "llm"]));
}

#[tokio::test]
async fn health_for_all_and_one_service() {
    let h = setup();
    h.gateway
        .request("llm", "messages", json!({"p": 1}), RequestOptions::default())
        .await
        .unwrap();

    let (status, body) = call(&h, Method::GET, "/admin/health", None, Some(KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (status, body) = call(&h, Method::GET, "/admin/health/llm", None, Some(KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["circuit_state"], "closed");
    assert_eq!(body["quota_used"], 12);
    assert_eq!(body["quota_limit"], 1_000);

    let (status, body) = call(&h, Method::GET, "/admin/health/nope", None, Some(KEY)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn quota_status() {
    let h = setup();
    h.gateway
        .request("llm", "messages", json!({"p": 1}), RequestOptions::default())
        .await
        .unwrap();

    let (status, body) = call(&h, Method::GET, "/admin/quotas/llm_tokens", None, Some(KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["used"], 12);
    assert_eq!(body["remaining"], 988);

    let (status, _) = call(&h, Method::GET, "/admin/quotas/unknown", None, Some(KEY)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalidates_by_key_and_prefix() {
    let h = setup();
    for id in ["btc", "eth"] {
        h.gateway
            .request("coingecko", "price", price(id), RequestOptions::default())
            .await
            .unwrap();
    }
    let key = crypto_relay::cache::Fingerprint::new("coingecko", "price", &price("btc"));

    let (status, body) = call(
        &h,
        Method::POST,
        "/admin/cache/invalidate",
        Some(json!({ "key": key.as_str() })),
        Some(KEY),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 1);

    let (status, body) = call(
        &h,
        Method::POST,
        "/admin/cache/invalidate",
        Some(json!({ "prefix": "coingecko:" })),
        Some(KEY),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 1);

    h.gateway
        .request("coingecko", "price", price("eth"), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(h.upstream.calls(), 3);
}

#[tokio::test]
async fn invalidate_requires_exactly_one_target() {
    let h = setup();
    let (status, _) = call(
        &h,
        Method::POST,
        "/admin/cache/invalidate",
        Some(json!({ "key": "a", "prefix": "b" })),
        Some(KEY),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&h, Method::POST, "/admin/cache/invalidate", Some(json!({})), Some(KEY)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

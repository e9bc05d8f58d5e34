#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::*;
use sahabat::app;
use sahabat::guards::rate_limit::{MSG_API_EXCEEDED, MSG_ESCALATED, MSG_STILL_BLOCKED};
use serde_json::json;
use tower::ServiceExt;

#[tokio::test]
async fn general_limit_escalates_to_block() {
    let mut cfg = test_config();
    cfg.general_rate.max_requests = 3;
    let router = app(state_with(&cfg, MockProvider::new()));
    let ip = "192.0.2.10";

    for expected_remaining in ["2", "1", "0"] {
        let resp = router.clone().oneshot(get("/health", ip)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header(&resp, "x-ratelimit-limit"), Some("3"));
        assert_eq!(header(&resp, "x-ratelimit-remaining"), Some(expected_remaining));
        assert!(header(&resp, "x-ratelimit-reset").is_some());
    }

    let resp = router.clone().oneshot(get("/health", ip)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(resp).await;
    assert_eq!(body["error"], MSG_ESCALATED);
    assert_eq!(body["retryAfter"], 3600);

    let resp = router.clone().oneshot(get("/health", ip)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(resp).await;
    assert_eq!(body["error"], MSG_STILL_BLOCKED);
    let retry = body["retryAfter"].as_u64().unwrap();
    assert!(retry > 3500 && retry <= 3600, "retryAfter {}", retry);

    // A different identity has its own budget.
    let resp = router.oneshot(get("/health", "192.0.2.11")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_limit_rejects_without_blocking() {
    let mut cfg = test_config();
    cfg.api_rate.max_requests = 2;
    let provider = MockProvider::new();
    let router = app(state_with(&cfg, provider.clone()));
    let ip = "192.0.2.20";

    for _ in 0..2 {
        let resp = router
            .clone()
            .oneshot(post_json("/api/gemini", ip, json!({"message": "salam"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    let resp = router
        .clone()
        .oneshot(post_json("/api/gemini", ip, json!({"message": "salam"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(resp).await;
    assert_eq!(body["error"], MSG_API_EXCEEDED);
    let retry = body["retryAfter"].as_u64().unwrap();
    assert!((1..=60).contains(&retry), "retryAfter {}", retry);
    assert_eq!(provider.calls(), 2);

    // Non-API routes only see the general limiter.
    let resp = router.oneshot(get("/health", ip)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_counts_replace_general_counts_but_not_reset() {
    let mut cfg = test_config();
    cfg.api_rate.max_requests = 5;
    let router = app(state_with(&cfg, MockProvider::new()));
    let resp = router
        .oneshot(post_json("/api/gemini", "192.0.2.30", json!({"message": "salam"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, "x-ratelimit-limit"), Some("5"));
    assert_eq!(header(&resp, "x-ratelimit-remaining"), Some("4"));

    // Reset still comes from the 15 minute general window, not the 60s API one.
    let reset = header(&resp, "x-ratelimit-reset").unwrap();
    let reset = chrono::DateTime::parse_from_rfc3339(reset).unwrap();
    let until_reset = reset.with_timezone(&chrono::Utc) - chrono::Utc::now();
    assert!(until_reset > chrono::Duration::minutes(10), "reset in {}", until_reset);
}

#[tokio::test]
async fn block_persists_past_the_window() {
    let mut cfg = test_config();
    cfg.general_rate.max_requests = 1;
    cfg.general_rate.window = Duration::from_millis(50);
    cfg.general_rate.block = Some(Duration::from_secs(5));
    let router = app(state_with(&cfg, MockProvider::new()));
    let ip = "192.0.2.50";

    let resp = router.clone().oneshot(get("/health", ip)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = router.clone().oneshot(get("/health", ip)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(resp).await["retryAfter"], 5);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let resp = router.oneshot(get("/health", ip)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(resp).await;
    assert_eq!(body["error"], MSG_STILL_BLOCKED);
    let retry = body["retryAfter"].as_u64().unwrap();
    assert!((1..=5).contains(&retry), "retryAfter {}", retry);
}

#[tokio::test]
async fn window_expiry_restores_budget() {
    let mut cfg = test_config();
    cfg.general_rate.max_requests = 1;
    cfg.general_rate.block = None;
    cfg.general_rate.window = Duration::from_millis(50);
    let router = app(state_with(&cfg, MockProvider::new()));
    let ip = "192.0.2.40";

    let resp = router.clone().oneshot(get("/health", ip)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = router.clone().oneshot(get("/health", ip)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let resp = router.oneshot(get("/health", ip)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

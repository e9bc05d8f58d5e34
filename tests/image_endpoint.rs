#[path = "common/mod.rs"]
mod common;

use std::sync::atomic::Ordering;

use axum::http::StatusCode;
use common::*;
use sahabat::app;
use sahabat::gemini::{ImageOutcome, ProviderError};
use serde_json::json;
use tower::ServiceExt;

const IP: &str = "203.0.113.60";

#[tokio::test]
async fn image_is_returned_as_data_uri() {
    let provider = MockProvider::with_image(Ok(ImageOutcome::Image {
        base64: "aGVsbG8=".into(),
        mime_type: "image/png".into(),
    }));
    let router = app(state_with(&test_config(), provider.clone()));
    let resp = router
        .oneshot(post_json(
            "/api/gemini-image",
            IP,
            json!({"theme": "Ramadan night sky"}),
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        body_json(resp).await["image"],
        "data:image/png;base64,aGVsbG8="
    );
    assert_eq!(provider.image_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn filtered_image_reports_reason() {
    let provider = MockProvider::with_image(Ok(ImageOutcome::Filtered {
        reason: "SAFETY".into(),
    }));
    let router = app(state_with(&test_config(), provider));
    let resp = router
        .oneshot(post_json("/api/gemini-image", IP, json!({"theme": "storm"})))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "Image generation blocked by content filter");
    assert_eq!(body["reason"], "SAFETY");
}

#[tokio::test]
async fn empty_generation_is_a_server_error() {
    let provider = MockProvider::with_image(Ok(ImageOutcome::Empty));
    let router = app(state_with(&test_config(), provider));
    let resp = router
        .oneshot(post_json("/api/gemini-image", IP, json!({"theme": "garden"})))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_json(resp).await["error"],
        "Failed to generate image. No image data returned."
    );
}

#[tokio::test]
async fn upstream_failure_maps_to_gateway_error() {
    let provider = MockProvider::with_image(Err(ProviderError::Status {
        status: 500,
        message: "internal".into(),
    }));
    let router = app(state_with(&test_config(), provider));
    let resp = router
        .oneshot(post_json("/api/gemini-image", IP, json!({"theme": "garden"})))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "Image generation service error");
    assert_eq!(body["code"], "API");
}

#[tokio::test]
async fn theme_is_validated_first() {
    let provider = MockProvider::new();
    let router = app(state_with(&test_config(), provider.clone()));

    let resp = router
        .clone()
        .oneshot(post_json(
            "/api/gemini-image",
            IP,
            json!({"theme": "x".repeat(201)}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["error"], "Theme description too long");

    let resp = router
        .oneshot(post_json("/api/gemini-image", IP, json!({"theme": ""})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["error"], "Invalid theme");

    assert_eq!(provider.image_calls.load(Ordering::SeqCst), 0);
}

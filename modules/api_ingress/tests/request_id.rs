use std::sync::Arc;

use api_ingress::request_id::XRequestId;
use api_ingress::{ApiIngress, ApiIngressConfig};
use axum::{
    body::Body,
    extract::Extension,
    http::{Request, StatusCode},
    response::Json,
};
use extkit::{ApiRegistry, EndpointOptions, HttpMethod, UiRegistry};
use serde_json::json;
use tower::util::ServiceExt; // for `oneshot`

fn ingress() -> ApiIngress {
    let api = Arc::new(ApiRegistry::new());
    api.register(
        "echo",
        EndpointOptions::new(HttpMethod::Get, "/rid", |Extension(XRequestId(rid)): Extension<XRequestId>| async move {
            Json(json!({ "request_id": rid }))
        }),
    )
    .unwrap();
    ApiIngress::new(ApiIngressConfig::default(), api, Arc::new(UiRegistry::new()))
}

#[tokio::test]
async fn generates_request_id_when_missing() {
    let response = ingress()
        .build_router()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(!request_id.is_empty(), "x-request-id should be generated");
}

#[tokio::test]
async fn incoming_request_id_reaches_extension_handlers() {
    let response = ingress()
        .build_router()
        .oneshot(
            Request::builder()
                .uri("/extensions/echo/rid")
                .header("x-request-id", "abc-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("abc-123")
    );
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["request_id"], "abc-123");
}

#[tokio::test]
async fn error_bodies_carry_the_request_id() {
    // no runtime attached: management routes are unavailable
    let response = ingress()
        .build_router()
        .oneshot(
            Request::builder()
                .uri("/api/extensions/modules")
                .header("x-request-id", "error-test-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        response.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("error-test-123")
    );
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["code"], "unavailable");
    assert_eq!(json["request_id"], "error-test-123");
}

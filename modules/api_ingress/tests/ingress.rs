use std::sync::Arc;
use std::time::Duration;

use api_ingress::{ApiIngress, ApiIngressConfig};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use extkit::{
    Discovery, ExtensionRuntime, HostServices, ModuleCtx, ModuleHandler, RuntimeOptions,
    StaticRegistry, Widget,
};
use extkit_db::{ConnectOpts, DbHandle};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

struct Status;

#[async_trait]
impl ModuleHandler for Status {
    async fn on_load(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let name = ctx.name().to_string();
        ctx.api().get("/status", move || {
            let name = name.clone();
            async move { axum::Json(json!({ "module": name })) }
        })?;
        ctx.ui().widget(Widget {
            id: "status".into(),
            title: "Status".into(),
            component: "StatusCard".into(),
            ..Default::default()
        })?;
        Ok(())
    }
}

async fn runtime() -> Arc<ExtensionRuntime> {
    let db = DbHandle::connect("sqlite::memory:", ConnectOpts::default())
        .await
        .unwrap();
    extkit::migrate(db.pool()).await.unwrap();
    let registry = Arc::new(StaticRegistry::new());
    registry.register("status", || Status).unwrap();
    Arc::new(ExtensionRuntime::new(
        HostServices::new(db),
        Discovery::new(registry, vec![]),
        RuntimeOptions::default(),
    ))
}

async fn call(router: &Router, method: &str, uri: &str) -> Response<Body> {
    router
        .clone()
        .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn json_of(response: Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_is_served() {
    let rt = runtime().await;
    let router = ApiIngress::for_runtime(ApiIngressConfig::default(), rt).build_router();
    let response = call(&router, "GET", "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_of(response).await["status"], "healthy");
}

#[tokio::test]
async fn extension_router_follows_registrations() {
    let rt = runtime().await;
    let ingress = Arc::new(ApiIngress::for_runtime(ApiIngressConfig::default(), rt.clone()));
    let cancel = CancellationToken::new();
    let watcher = ingress.watch_registrations(cancel.clone());
    let router = ingress.build_router();

    assert_eq!(call(&router, "GET", "/extensions/status/status").await.status(), StatusCode::NOT_FOUND);

    rt.load_with_config("status", "1.0.0", json!({}), None).await.unwrap();
    let mut status = StatusCode::NOT_FOUND;
    for _ in 0..100 {
        status = call(&router, "GET", "/extensions/status/status").await.status();
        if status == StatusCode::OK {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, StatusCode::OK);

    let endpoints = json_of(call(&router, "GET", "/api/extensions/endpoints").await).await;
    assert_eq!(endpoints[0]["path"], "/extensions/status/status");
    assert_eq!(endpoints[0]["method"], "GET");
    let ui = json_of(call(&router, "GET", "/api/extensions/ui").await).await;
    assert_eq!(ui["widgets"][0]["module"], "status");
    assert_eq!(ui["widgets"][0]["component"], "StatusCard");

    rt.unload("status").await.unwrap();
    ingress.refresh_extensions();
    assert_eq!(call(&router, "GET", "/extensions/status/status").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_of(call(&router, "GET", "/api/extensions/ui").await).await["widgets"], json!([]));

    cancel.cancel();
    watcher.await.unwrap();
    rt.shutdown().await;
}

#[tokio::test]
async fn modules_can_be_listed_and_toggled() {
    let rt = runtime().await;
    rt.load_with_config("status", "1.0.0", json!({ "a": 1 }), None).await.unwrap();
    let router = ApiIngress::for_runtime(ApiIngressConfig::default(), rt.clone()).build_router();

    let listed = json_of(call(&router, "GET", "/api/extensions/modules").await).await;
    assert_eq!(listed[0]["name"], "status");
    assert_eq!(listed[0]["config"], json!({ "a": 1 }));

    let disabled = call(&router, "POST", "/api/extensions/modules/status/disable").await;
    assert_eq!(disabled.status(), StatusCode::OK);
    assert_eq!(json_of(disabled).await["enabled"], false);
    assert!(!rt.get("status").unwrap().enabled);

    let enabled = json_of(call(&router, "POST", "/api/extensions/modules/status/enable").await).await;
    assert_eq!(enabled["enabled"], true);

    let missing = call(&router, "GET", "/api/extensions/modules/ghost").await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_of(missing).await["code"], "not_found");
    let missing = call(&router, "POST", "/api/extensions/modules/ghost/enable").await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    rt.shutdown().await;
}

#[tokio::test]
async fn serves_over_tcp_until_cancelled() {
    let rt = runtime().await;
    let ingress = Arc::new(ApiIngress::for_runtime(ApiIngressConfig::default(), rt));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cancel = CancellationToken::new();
    let server = tokio::spawn(ingress.serve_on(listener, cancel.clone()));

    cancel.cancel();
    let served = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert!(served.is_ok());
}

//! HTTP surface of the extension host.
//!
//! Serves the health probe, the UI component manifest and the endpoint
//! catalogue, and forwards everything else to the router built from the
//! [`ApiRegistry`]. That router is swapped in place whenever modules register
//! or withdraw endpoints, so loading a module never restarts the server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::Request;
use axum::{
    body::Body,
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use extkit::{ApiRegistry, ExtensionRuntime, UiRegistry};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
};

mod config;
pub mod error;
pub mod request_id;
mod router_cache;
mod web;

pub use config::ApiIngressConfig;
use router_cache::RouterCache;
use web::AppState;

pub struct ApiIngress {
    config: ApiIngressConfig,
    state: AppState,
    extensions: Arc<RouterCache<Router>>,
}

impl ApiIngress {
    /// Ingress over bare registries; module management routes answer 503.
    pub fn new(config: ApiIngressConfig, api: Arc<ApiRegistry>, ui: Arc<UiRegistry>) -> Self {
        let extensions = Arc::new(RouterCache::new(api.router()));
        Self {
            config,
            state: AppState { api, ui, runtime: None },
            extensions,
        }
    }

    /// Ingress over a runtime's registries, with module management enabled.
    pub fn for_runtime(config: ApiIngressConfig, runtime: Arc<ExtensionRuntime>) -> Self {
        let mut ingress = Self::new(
            config,
            runtime.api_registry().clone(),
            runtime.ui_registry().clone(),
        );
        ingress.state.runtime = Some(runtime);
        ingress
    }

    pub fn config(&self) -> &ApiIngressConfig {
        &self.config
    }

    /// Rebuild the mounted extension router from the current registrations.
    pub fn refresh_extensions(&self) {
        self.extensions.store(self.state.api.router());
        tracing::debug!(
            endpoints = self.state.api.endpoints().len(),
            "extension router rebuilt"
        );
    }

    /// Keep the extension router in step with the registry until `cancel` fires.
    pub fn watch_registrations(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut changes = this.state.api.subscribe_changes();
        tokio::spawn(async move {
            changes.borrow_and_update();
            this.refresh_extensions();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        changes.borrow_and_update();
                        this.refresh_extensions();
                    }
                }
            }
        })
    }

    /// The full router with host routes, the extension fallback and middleware.
    pub fn build_router(&self) -> Router {
        let cache = Arc::clone(&self.extensions);
        let mut router = Router::new()
            .route("/health", get(web::health_check))
            .route("/api/extensions/ui", get(web::ui_manifest))
            .route("/api/extensions/endpoints", get(web::endpoints))
            .route("/api/extensions/modules", get(web::list_modules))
            .route("/api/extensions/modules/{name}", get(web::get_module))
            .route("/api/extensions/modules/{name}/enable", post(web::enable_module))
            .route("/api/extensions/modules/{name}/disable", post(web::disable_module))
            .fallback(move |req: Request<Body>| {
                let cache = Arc::clone(&cache);
                async move { web::dispatch_extension(cache, req).await }
            })
            .with_state(self.state.clone());

        // Outermost to innermost: SetRequestId -> PropagateRequestId -> extensions -> Trace -> Timeout -> CORS -> BodyLimit
        router = router.layer(RequestBodyLimitLayer::new(self.config.body_limit_bytes));
        if self.config.cors_enabled {
            router = router.layer(CorsLayer::permissive());
        }
        let x_request_id = request_id::header();
        router
            .layer(TimeoutLayer::new(self.config.request_timeout))
            .layer(request_id::create_trace_layer())
            .layer(from_fn(request_id::push_req_id_to_extensions))
            .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
            .layer(SetRequestIdLayer::new(x_request_id, request_id::MakeReqId))
    }

    /// Bind `bind_addr` and serve until `cancel` fires.
    pub async fn serve(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .with_context(|| format!("invalid bind address '{}'", self.config.bind_addr))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot bind {addr}"))?;
        self.serve_on(listener, cancel).await
    }

    pub async fn serve_on(
        self: Arc<Self>,
        listener: tokio::net::TcpListener,
        cancel: CancellationToken,
    ) -> Result<()> {
        let watcher = self.watch_registrations(cancel.child_token());
        let router = self.build_router();
        tracing::info!(addr = %listener.local_addr()?, "HTTP server bound");

        let shutdown = {
            let cancel = cancel.clone();
            async move {
                cancel.cancelled().await;
                tracing::info!("HTTP server shutting down gracefully");
            }
        };
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP server failed");

        cancel.cancel();
        let _ = watcher.await;
        served
    }
}

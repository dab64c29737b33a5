use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::Request,
    response::{Json, Response},
    Extension, Router,
};
use extkit::{ApiRegistry, EndpointDescriptor, ExtensionRuntime, ModuleInfo, UiManifest, UiRegistry};
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::error::{AppError, ErrorResponse};
use crate::request_id::XRequestId;
use crate::router_cache::RouterCache;

#[derive(Clone)]
pub(crate) struct AppState {
    pub api: Arc<ApiRegistry>,
    pub ui: Arc<UiRegistry>,
    pub runtime: Option<Arc<ExtensionRuntime>>,
}

impl AppState {
    fn runtime(&self) -> Result<&Arc<ExtensionRuntime>, AppError> {
        self.runtime
            .as_ref()
            .ok_or_else(|| AppError::Unavailable("module management is not enabled".into()))
    }
}

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub(crate) async fn ui_manifest(State(state): State<AppState>) -> Json<UiManifest> {
    Json(state.ui.manifest())
}

pub(crate) async fn endpoints(State(state): State<AppState>) -> Json<Vec<EndpointDescriptor>> {
    Json(state.api.endpoints())
}

pub(crate) async fn list_modules(
    State(state): State<AppState>,
    Extension(XRequestId(rid)): Extension<XRequestId>,
) -> Result<Json<Vec<ModuleInfo>>, ErrorResponse> {
    let runtime = state.runtime().map_err(|e| e.with_request_id(&rid))?;
    Ok(Json(runtime.list()))
}

pub(crate) async fn get_module(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Extension(XRequestId(rid)): Extension<XRequestId>,
) -> Result<Json<ModuleInfo>, ErrorResponse> {
    let runtime = state.runtime().map_err(|e| e.with_request_id(&rid))?;
    runtime
        .get(&name)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("module '{name}' is not loaded")).with_request_id(&rid))
}

pub(crate) async fn enable_module(
    state: State<AppState>,
    name: Path<String>,
    rid: Extension<XRequestId>,
) -> Result<Json<ModuleInfo>, ErrorResponse> {
    set_enabled(state, name, rid, true).await
}

pub(crate) async fn disable_module(
    state: State<AppState>,
    name: Path<String>,
    rid: Extension<XRequestId>,
) -> Result<Json<ModuleInfo>, ErrorResponse> {
    set_enabled(state, name, rid, false).await
}

async fn set_enabled(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Extension(XRequestId(rid)): Extension<XRequestId>,
    enabled: bool,
) -> Result<Json<ModuleInfo>, ErrorResponse> {
    let runtime = state.runtime().map_err(|e| e.with_request_id(&rid))?;
    let result = if enabled {
        runtime.enable(&name).await
    } else {
        runtime.disable(&name).await
    };
    result.map_err(|e| AppError::from(e).with_request_id(&rid))?;
    runtime
        .get(&name)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("module '{name}' is not loaded")).with_request_id(&rid))
}

/// Hand the request to whatever extension router is current.
pub(crate) async fn dispatch_extension(cache: Arc<RouterCache<Router>>, req: Request<Body>) -> Response {
    let router = (*cache.load()).clone();
    match router.oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

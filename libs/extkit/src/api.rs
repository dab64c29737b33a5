//! Registry of HTTP endpoints contributed by modules.
//!
//! Every path is rewritten under `/extensions/{module}` before it is stored, so
//! two modules may both expose `/status`. The host mounts [`ApiRegistry::router`]
//! and rebuilds it whenever [`ApiRegistry::subscribe_changes`] ticks.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use axum::handler::Handler;
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::Router;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{ExtError, Result};

/// Root under which all module endpoints are mounted.
pub const EXTENSIONS_PREFIX: &str = "/extensions";

/// Wraps an endpoint's method router, e.g. `|r| r.layer(some_layer)`.
pub type Middleware = Arc<dyn Fn(MethodRouter) -> MethodRouter + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    fn filter(self) -> MethodFilter {
        match self {
            HttpMethod::Get => MethodFilter::GET,
            HttpMethod::Post => MethodFilter::POST,
            HttpMethod::Put => MethodFilter::PUT,
            HttpMethod::Patch => MethodFilter::PATCH,
            HttpMethod::Delete => MethodFilter::DELETE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public description of a registered endpoint (no handler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointDescriptor {
    pub module: String,
    pub method: HttpMethod,
    /// Fully namespaced path, e.g. `/extensions/audit/status`.
    pub path: String,
    /// Path as the module registered it, e.g. `/status`.
    pub local_path: String,
    pub permissions: Vec<String>,
    pub description: String,
    pub middleware: usize,
}

/// Endpoint registration request built by a module.
pub struct EndpointOptions {
    method: HttpMethod,
    path: String,
    route: MethodRouter,
    middleware: Vec<Middleware>,
    permissions: Vec<String>,
    description: String,
}

impl EndpointOptions {
    pub fn new<H, T>(method: HttpMethod, path: impl Into<String>, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        Self {
            method,
            path: path.into(),
            route: on(method.filter(), handler),
            middleware: Vec::new(),
            permissions: Vec::new(),
            description: String::new(),
        }
    }

    /// Add a middleware. The first one added wraps the handler most tightly.
    pub fn middleware<F>(mut self, f: F) -> Self
    where
        F: Fn(MethodRouter) -> MethodRouter + Send + Sync + 'static,
    {
        self.middleware.push(Arc::new(f));
        self
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointKey {
    module: String,
    method: HttpMethod,
    local_path: String,
}

#[derive(Clone)]
struct Registered {
    descriptor: EndpointDescriptor,
    route: MethodRouter,
    middleware: Vec<Middleware>,
}

impl Registered {
    fn layered(&self) -> MethodRouter {
        self.middleware
            .iter()
            .fold(self.route.clone(), |route, mw| mw(route))
    }
}

pub struct ApiRegistry {
    endpoints: DashMap<EndpointKey, Registered>,
    changes: watch::Sender<u64>,
}

impl Default for ApiRegistry {
    fn default() -> Self {
        Self {
            endpoints: DashMap::new(),
            changes: watch::channel(0).0,
        }
    }
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint for `module`. A second registration of the same
    /// `(module, method, path)` is rejected.
    pub fn register(&self, module: &str, opts: EndpointOptions) -> Result<EndpointDescriptor> {
        let local_path = normalize_local_path(&opts.path)?;
        let path = namespaced_path(module, &local_path);
        // `/items/{id}` and `/items/{key}` cannot both be routed
        let shape = route_shape(&local_path);
        if let Some(clash) = self.endpoints.iter().find(|e| {
            e.key().module == module && e.key().local_path != local_path && route_shape(&e.key().local_path) == shape
        }) {
            return Err(ExtError::EndpointConflict {
                module: module.to_string(),
                method: opts.method.to_string(),
                path: format!("{path} (clashes with {})", clash.value().descriptor.path),
            });
        }
        let key = EndpointKey {
            module: module.to_string(),
            method: opts.method,
            local_path: local_path.clone(),
        };

        let descriptor = EndpointDescriptor {
            module: module.to_string(),
            method: opts.method,
            path,
            local_path,
            permissions: opts.permissions,
            description: opts.description,
            middleware: opts.middleware.len(),
        };

        match self.endpoints.entry(key) {
            Entry::Occupied(_) => {
                return Err(ExtError::EndpointConflict {
                    module: module.to_string(),
                    method: descriptor.method.to_string(),
                    path: descriptor.path,
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(Registered {
                    descriptor: descriptor.clone(),
                    route: opts.route,
                    middleware: opts.middleware,
                });
            }
        }

        tracing::debug!(module, method = %descriptor.method, path = %descriptor.path, "endpoint registered");
        self.bump();
        Ok(descriptor)
    }

    pub fn unregister(&self, module: &str, method: HttpMethod, path: &str) -> bool {
        let Ok(local_path) = normalize_local_path(path) else {
            return false;
        };
        let key = EndpointKey {
            module: module.to_string(),
            method,
            local_path,
        };
        let removed = self.endpoints.remove(&key).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    /// Remove every endpoint of `module`. Safe to call when it registered nothing.
    pub fn unregister_all(&self, module: &str) -> usize {
        let mut removed = 0;
        self.endpoints.retain(|k, _| {
            let keep = k.module != module;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            tracing::debug!(module, removed, "endpoints unregistered");
            self.bump();
        }
        removed
    }

    /// All endpoints, sorted by path then method.
    pub fn endpoints(&self) -> Vec<EndpointDescriptor> {
        let mut all: Vec<EndpointDescriptor> = self
            .endpoints
            .iter()
            .map(|e| e.value().descriptor.clone())
            .collect();
        all.sort_by(|a, b| (&a.path, a.method).cmp(&(&b.path, b.method)));
        all
    }

    pub fn module_endpoints(&self, module: &str) -> Vec<EndpointDescriptor> {
        self.endpoints()
            .into_iter()
            .filter(|d| d.module == module)
            .collect()
    }

    /// Build a router serving every registered endpoint. Methods sharing a
    /// path are merged into one route. A route the router refuses is logged
    /// and left out; the rest are still served.
    pub fn router(&self) -> Router {
        let mut by_path: BTreeMap<String, MethodRouter> = BTreeMap::new();
        for entry in self.endpoints.iter() {
            let reg = entry.value();
            let route = reg.layered();
            let merged = match by_path.remove(&reg.descriptor.path) {
                Some(existing) => existing.merge(route),
                None => route,
            };
            by_path.insert(reg.descriptor.path.clone(), merged);
        }

        by_path.into_iter().fold(Router::new(), |router, (path, route)| {
            let attempt = router.clone();
            match catch_unwind(AssertUnwindSafe(|| attempt.route(&path, route))) {
                Ok(extended) => extended,
                Err(_) => {
                    tracing::error!(path = %path, "route rejected by the router; endpoint not mounted");
                    router
                }
            }
        })
    }

    /// Receiver that ticks on every registration change.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }
}

fn namespaced_path(module: &str, local_path: &str) -> String {
    if local_path == "/" {
        format!("{EXTENSIONS_PREFIX}/{module}")
    } else {
        format!("{EXTENSIONS_PREFIX}/{module}{local_path}")
    }
}

/// Segments are literals or a whole `{name}` capture. `:name` captures and
/// wildcards are refused.
fn normalize_local_path(path: &str) -> Result<String> {
    let trimmed = path.trim();
    let invalid = || ExtError::InvalidIdentifier(path.to_string());
    if trimmed.contains(['?', '#', '*']) {
        return Err(invalid());
    }
    let body = trimmed.trim_matches('/');
    if body.is_empty() {
        return Ok("/".to_string());
    }
    for seg in body.split('/') {
        let valid = match capture_name(seg) {
            Some(name) => {
                !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => seg != ".." && !seg.starts_with(':') && !seg.contains(['{', '}']),
        };
        if !valid {
            return Err(invalid());
        }
    }
    Ok(format!("/{body}"))
}

fn capture_name(seg: &str) -> Option<&str> {
    seg.strip_prefix('{')?.strip_suffix('}')
}

/// Path with every capture name blanked, so routes that only differ in
/// capture names compare equal.
fn route_shape(local_path: &str) -> String {
    local_path
        .split('/')
        .map(|seg| if capture_name(seg).is_some() { "{}" } else { seg })
        .collect::<Vec<_>>()
        .join("/")
}

/// Per-module view of the API registry.
#[derive(Clone)]
pub struct ModuleApi {
    module: Arc<str>,
    registry: Arc<ApiRegistry>,
}

impl ModuleApi {
    pub(crate) fn new(module: Arc<str>, registry: Arc<ApiRegistry>) -> Self {
        Self { module, registry }
    }

    pub fn register(&self, opts: EndpointOptions) -> Result<EndpointDescriptor> {
        self.registry.register(&self.module, opts)
    }

    pub fn get<H, T>(&self, path: &str, handler: H) -> Result<EndpointDescriptor>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.register(EndpointOptions::new(HttpMethod::Get, path, handler))
    }

    pub fn post<H, T>(&self, path: &str, handler: H) -> Result<EndpointDescriptor>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.register(EndpointOptions::new(HttpMethod::Post, path, handler))
    }

    pub fn put<H, T>(&self, path: &str, handler: H) -> Result<EndpointDescriptor>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.register(EndpointOptions::new(HttpMethod::Put, path, handler))
    }

    pub fn patch<H, T>(&self, path: &str, handler: H) -> Result<EndpointDescriptor>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.register(EndpointOptions::new(HttpMethod::Patch, path, handler))
    }

    pub fn delete<H, T>(&self, path: &str, handler: H) -> Result<EndpointDescriptor>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.register(EndpointOptions::new(HttpMethod::Delete, path, handler))
    }

    pub fn unregister(&self, method: HttpMethod, path: &str) -> bool {
        self.registry.unregister(&self.module, method, path)
    }

    pub fn endpoints(&self) -> Vec<EndpointDescriptor> {
        self.registry.module_endpoints(&self.module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use tower::ServiceExt;

    async fn ok() -> &'static str {
        "ok"
    }

    #[test]
    fn duplicate_endpoint_is_rejected() {
        let reg = ApiRegistry::new();
        reg.register("a", EndpointOptions::new(HttpMethod::Get, "/status", ok))
            .unwrap();
        let err = reg
            .register("a", EndpointOptions::new(HttpMethod::Get, "status/", ok))
            .unwrap_err();
        assert!(matches!(err, ExtError::EndpointConflict { ref path, .. } if path == "/extensions/a/status"));

        // same path, other method: fine
        reg.register("a", EndpointOptions::new(HttpMethod::Post, "/status", ok))
            .unwrap();
        // same path, other module: fine
        reg.register("b", EndpointOptions::new(HttpMethod::Get, "/status", ok))
            .unwrap();
        assert_eq!(reg.endpoints().len(), 3);
    }

    #[test]
    fn paths_are_namespaced_and_validated() {
        assert_eq!(namespaced_path("m", "/"), "/extensions/m");
        assert_eq!(namespaced_path("m", "/x/{id}"), "/extensions/m/x/{id}");
        assert_eq!(normalize_local_path("x//").unwrap(), "/x");
        assert!(normalize_local_path("/../admin").is_err());
        assert!(normalize_local_path("/x?y=1").is_err());
        assert_eq!(normalize_local_path("/items/{item_id}").unwrap(), "/items/{item_id}");
        assert!(normalize_local_path("/items/:id").is_err());
        assert!(normalize_local_path("/items/{id").is_err());
        assert!(normalize_local_path("/items/id}").is_err());
        assert!(normalize_local_path("/items/{}").is_err());
        assert!(normalize_local_path("/items/pre{id}").is_err());
    }

    #[test]
    fn gin_style_capture_is_refused_at_registration() {
        let reg = ApiRegistry::new();
        let err = reg
            .register("a", EndpointOptions::new(HttpMethod::Get, "/items/:id", ok))
            .unwrap_err();
        assert!(matches!(err, ExtError::InvalidIdentifier(_)));
        assert!(reg.endpoints().is_empty());
        let _ = reg.router();
    }

    #[test]
    fn captures_renamed_under_another_method_conflict() {
        let reg = ApiRegistry::new();
        reg.register("a", EndpointOptions::new(HttpMethod::Get, "/items/{id}", ok))
            .unwrap();
        let err = reg
            .register("a", EndpointOptions::new(HttpMethod::Delete, "/items/{key}", ok))
            .unwrap_err();
        assert!(matches!(err, ExtError::EndpointConflict { .. }));

        // same capture name merges, and another module has its own namespace
        reg.register("a", EndpointOptions::new(HttpMethod::Delete, "/items/{id}", ok))
            .unwrap();
        reg.register("b", EndpointOptions::new(HttpMethod::Get, "/items/{key}", ok))
            .unwrap();
        assert_eq!(reg.endpoints().len(), 3);
        let _ = reg.router();
    }

    #[tokio::test]
    async fn one_bad_route_does_not_unmount_the_rest() {
        let reg = ApiRegistry::new();
        reg.register("a", EndpointOptions::new(HttpMethod::Get, "/status", ok))
            .unwrap();
        // slips past registration checks by going straight into the map
        let bad_path = "/extensions/b/items/:id".to_string();
        reg.endpoints.insert(
            EndpointKey {
                module: "b".into(),
                method: HttpMethod::Get,
                local_path: "/items/:id".into(),
            },
            Registered {
                descriptor: EndpointDescriptor {
                    module: "b".into(),
                    method: HttpMethod::Get,
                    path: bad_path,
                    local_path: "/items/:id".into(),
                    permissions: vec![],
                    description: String::new(),
                    middleware: 0,
                },
                route: on(MethodFilter::GET, ok),
                middleware: vec![],
            },
        );

        let res = reg
            .router()
            .oneshot(
                Request::builder()
                    .uri("/extensions/a/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[test]
    fn unregister_all_is_scoped_and_notifies() {
        let reg = ApiRegistry::new();
        let rx = reg.subscribe_changes();
        reg.register("a", EndpointOptions::new(HttpMethod::Get, "/one", ok))
            .unwrap();
        reg.register("a", EndpointOptions::new(HttpMethod::Get, "/two", ok))
            .unwrap();
        reg.register("b", EndpointOptions::new(HttpMethod::Get, "/one", ok))
            .unwrap();

        assert_eq!(reg.unregister_all("a"), 2);
        assert_eq!(reg.unregister_all("a"), 0);
        assert!(reg.module_endpoints("a").is_empty());
        assert_eq!(reg.module_endpoints("b").len(), 1);
        assert_eq!(*rx.borrow(), 4);
    }

    #[test]
    fn removal_count_ignores_concurrent_registrations() {
        let reg = Arc::new(ApiRegistry::new());
        for i in 0..100 {
            reg.register("a", EndpointOptions::new(HttpMethod::Get, format!("/a{i}"), ok))
                .unwrap();
        }

        let writer = {
            let reg = reg.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    reg.register("b", EndpointOptions::new(HttpMethod::Get, format!("/b{i}"), ok))
                        .unwrap();
                }
            })
        };
        let removed = reg.unregister_all("a");
        writer.join().unwrap();

        assert_eq!(removed, 100);
        assert_eq!(reg.module_endpoints("b").len(), 500);
    }

    #[tokio::test]
    async fn router_serves_namespaced_routes_with_middleware() {
        let reg = ApiRegistry::new();
        reg.register(
            "a",
            EndpointOptions::new(HttpMethod::Get, "/status", ok).middleware(|route| {
                route.layer(axum::middleware::map_response(|mut res: Response| async move {
                    res.headers_mut()
                        .insert("x-extension", "a".parse().unwrap());
                    res
                }))
            }),
        )
        .unwrap();
        reg.register("a", EndpointOptions::new(HttpMethod::Delete, "/status", ok))
            .unwrap();

        let router = reg.router();
        let res = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/extensions/a/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["x-extension"], "a");

        let res = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/extensions/a/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = router
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}

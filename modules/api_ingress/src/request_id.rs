use axum::http::{HeaderName, Request};
use axum::{body::Body, middleware::Next, response::Response};
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::request_id::{MakeRequestId, RequestId};
use tower_http::trace::TraceLayer;
use tracing::field::Empty;

/// Request id as seen by handlers (`Extension<XRequestId>`).
#[derive(Clone, Debug)]
pub struct XRequestId(pub String);

pub fn header() -> HeaderName {
    HeaderName::from_static("x-request-id")
}

#[derive(Clone, Default)]
pub struct MakeReqId;

impl MakeRequestId for MakeReqId {
    fn make_request_id<B>(&mut self, _req: &Request<B>) -> Option<RequestId> {
        let id = nanoid::nanoid!();
        Some(RequestId::new(id.parse().ok()?))
    }
}

fn request_id_of<B>(req: &Request<B>) -> &str {
    req.headers()
        .get(header())
        .and_then(|v| v.to_str().ok())
        .unwrap_or("n/a")
}

/// Copy the `x-request-id` header into the request extensions and the current span.
pub async fn push_req_id_to_extensions(mut req: Request<Body>, next: Next) -> Response {
    let rid = request_id_of(&req).to_owned();
    tracing::Span::current().record("request_id", tracing::field::display(&rid));
    req.extensions_mut().insert(XRequestId(rid));
    next.run(req).await
}

/// Trace layer whose span carries the request id and, for extension
/// routes, the owning module.
#[allow(clippy::type_complexity)]
pub fn create_trace_layer() -> TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    impl Fn(&Request<Body>) -> tracing::Span + Clone,
> {
    TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
        let path = req.uri().path();
        tracing::info_span!(
            "http_request",
            method = %req.method(),
            uri = %path,
            version = ?req.version(),
            module = owning_module(path).unwrap_or("api_ingress"),
            request_id = %request_id_of(req),
            status = Empty,
            latency_ms = Empty
        )
    })
}

/// `/extensions/{module}/...` → `module`.
pub fn owning_module(path: &str) -> Option<&str> {
    path.strip_prefix(extkit::api::EXTENSIONS_PREFIX)?
        .strip_prefix('/')?
        .split('/')
        .next()
        .filter(|m| !m.is_empty())
}

#[cfg(test)]
mod tests {
    use super::owning_module;

    #[test]
    fn module_is_taken_from_extension_paths() {
        assert_eq!(owning_module("/extensions/audit/status"), Some("audit"));
        assert_eq!(owning_module("/extensions/audit"), Some("audit"));
        assert_eq!(owning_module("/extensions/"), None);
        assert_eq!(owning_module("/api/extensions/ui"), None);
        assert_eq!(owning_module("/extensionsx/a"), None);
    }
}

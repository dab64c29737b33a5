use axum::http::StatusCode;
use axum::Json;
use extkit::{ModuleCtx, ModuleStorage};
use serde_json::{json, Value};

use crate::domain::{AuditRecord, Counters, Summary, COUNTERS_KEY, RECENT_KEY, SUMMARY_KEY};

pub(crate) fn register(ctx: &ModuleCtx) -> extkit::Result<()> {
    let storage = ctx.storage().clone();
    let options = extkit::EndpointOptions::new(extkit::HttpMethod::Get, "/status", move || {
        let storage = storage.clone();
        async move { status(storage).await }
    })
    .description("Session event counters and the most recent records")
    .permission("session_audit:read");
    ctx.api().register(options)?;
    Ok(())
}

async fn status(storage: ModuleStorage) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let read = async {
        let counters: Counters = storage.get_as(COUNTERS_KEY).await?.unwrap_or_default();
        let recent: Vec<AuditRecord> = storage.get_as(RECENT_KEY).await?.unwrap_or_default();
        let summary: Option<Summary> = storage.get_as(SUMMARY_KEY).await?;
        Ok::<_, extkit::ExtError>(json!({
            "total": counters.total(),
            "live": counters.live(),
            "counters": counters,
            "recent": recent,
            "lastSummary": summary,
        }))
    };
    read.await.map(Json).map_err(|e| {
        tracing::warn!(module = crate::MODULE_NAME, error = %e, "status read failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "storage unavailable" })),
        )
    })
}

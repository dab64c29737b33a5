//! Sample compiled-in extension: keeps an audit trail of session lifecycle
//! events.
//!
//! It counts every session event in module storage, keeps a short list of the
//! most recent ones, serves both at `GET /extensions/session_audit/status`,
//! contributes a dashboard widget and a menu entry, writes a periodic summary
//! and re-publishes each record as `extension.session_audit.audit.recorded`.

mod api;
mod config;
mod domain;
mod module;

pub use config::SessionAuditConfig;
pub use domain::{AuditRecord, Counters, SessionEventKind, Summary};
pub use module::SessionAudit;

pub const MODULE_NAME: &str = "session_audit";

/// Custom event published for every recorded session event.
pub const RECORDED_EVENT: &str = "audit.recorded";

/// Add the module to the host's static registry.
pub fn register(registry: &extkit::StaticRegistry) -> extkit::Result<()> {
    registry.register(MODULE_NAME, SessionAudit::default)
}

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = ExtError> = std::result::Result<T, E>;

/// Errors surfaced by the extension runtime.
#[derive(Debug, Error)]
pub enum ExtError {
    // ----- discovery -----
    #[error("module '{0}' not found in the static registry or any plugin directory")]
    NotFound(String),

    #[error("module '{module}' has a malformed entry point: {reason}")]
    MalformedEntryPoint { module: String, reason: String },

    #[error("module '{module}': cannot open artifact {}: {reason}", .path.display())]
    ArtifactOpen {
        module: String,
        path: PathBuf,
        reason: String,
    },

    #[error("module '{0}' is already registered")]
    DuplicateRegistration(String),

    // ----- lifecycle -----
    #[error("invalid module name '{0}'")]
    InvalidName(String),

    #[error("module '{0}' is already loaded")]
    AlreadyLoaded(String),

    #[error("module '{0}' is not loaded")]
    NotLoaded(String),

    #[error("module '{module}' failed in {hook}: {source}")]
    Hook {
        module: String,
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("module '{module}': {hook} did not finish within {timeout:?}")]
    HookTimeout {
        module: String,
        hook: &'static str,
        timeout: Duration,
    },

    #[error("module '{module}' is incompatible with host {host}: {reason}")]
    Incompatible {
        module: String,
        host: String,
        reason: String,
    },

    #[error("no installed module record named '{0}'")]
    RecordNotFound(String),

    // ----- registries -----
    #[error("endpoint {method} {path} is already registered by module '{module}'")]
    EndpointConflict {
        module: String,
        method: String,
        path: String,
    },

    #[error("{kind} '{id}' is already registered by module '{module}'")]
    UiConflict {
        module: String,
        kind: &'static str,
        id: String,
    },

    #[error("{} handler(s) failed for '{topic}': {}", .failures.len(), .failures.join("; "))]
    Handlers {
        topic: String,
        failures: Vec<String>,
    },

    // ----- scheduler -----
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("unsupported interval '{0}'")]
    UnsupportedInterval(String),

    #[error("scheduler is stopped")]
    SchedulerStopped,

    // ----- storage -----
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    DbHandle(#[from] extkit_db::DbError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    // ----- distribution -----
    #[error("catalog has no entry named '{0}'")]
    CatalogEntryNotFound(String),

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("archive error: {0}")]
    Archive(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExtError {
    pub(crate) fn http(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            url: url.into(),
            source,
        }
    }
}

use std::sync::Arc;

use extkit_db::DbHandle;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiRegistry, ModuleApi};
use crate::events::{EventBus, ModuleEvents};
use crate::logger::ModuleLogger;
use crate::manifest::ModuleManifest;
use crate::scheduler::{CronService, ModuleScheduler};
use crate::storage::{ModuleDatabase, ModuleStorage};
use crate::ui::{ModuleUi, UiRegistry};

/// Shared host services every module context is carved out of.
#[derive(Clone)]
pub struct HostServices {
    pub db: DbHandle,
    pub bus: Arc<EventBus>,
    pub api: Arc<ApiRegistry>,
    pub ui: Arc<UiRegistry>,
    pub cron: Arc<CronService>,
}

impl HostServices {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            bus: Arc::new(EventBus::new()),
            api: Arc::new(ApiRegistry::new()),
            ui: Arc::new(UiRegistry::new()),
            cron: Arc::new(CronService::new()),
        }
    }
}

/// Capability handles of one loaded module, all scoped by its name.
#[derive(Clone)]
pub struct ModuleCtx {
    pub(crate) name: Arc<str>,
    pub(crate) version: Arc<str>,
    pub(crate) config: Arc<serde_json::Value>,
    pub(crate) manifest: Arc<ModuleManifest>,
    pub(crate) storage: ModuleStorage,
    pub(crate) db: ModuleDatabase,
    pub(crate) events: ModuleEvents,
    pub(crate) api: ModuleApi,
    pub(crate) ui: ModuleUi,
    pub(crate) logger: ModuleLogger,
    pub(crate) scheduler: ModuleScheduler,
    pub(crate) cancellation_token: CancellationToken,
}

// ---- construction ----
pub struct ModuleCtxBuilder {
    name: Arc<str>,
    version: Arc<str>,
    config: serde_json::Value,
    manifest: Option<ModuleManifest>,
    token: CancellationToken,
}

impl ModuleCtxBuilder {
    pub fn new(name: &str, token: CancellationToken) -> Self {
        Self {
            name: Arc::from(name),
            version: Arc::from("0.0.0"),
            config: serde_json::Value::Object(Default::default()),
            manifest: None,
            token,
        }
    }
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Arc::from(version);
        self
    }
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
    pub fn with_manifest(mut self, manifest: ModuleManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }
    pub fn build(self, services: &HostServices) -> ModuleCtx {
        let name = self.name;
        let manifest = self
            .manifest
            .unwrap_or_else(|| ModuleManifest::named(&name, &self.version));
        ModuleCtx {
            storage: ModuleStorage::new(name.clone(), services.db.pool().clone()),
            db: ModuleDatabase::new(name.clone(), services.db.clone()),
            events: ModuleEvents::new(name.clone(), services.bus.clone()),
            api: ModuleApi::new(name.clone(), services.api.clone()),
            ui: ModuleUi::new(name.clone(), services.ui.clone()),
            logger: ModuleLogger::new(name.clone()),
            scheduler: ModuleScheduler::new(name.clone(), services.cron.clone()),
            name,
            version: self.version,
            config: Arc::new(self.config),
            manifest: Arc::new(manifest),
            cancellation_token: self.token,
        }
    }
}

impl ModuleCtx {
    // ---- public read-only API for modules ----
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    /// Best-effort: deserialize the module's config into `T`, fallback to `T::default()`
    /// if it does not fit.
    pub fn config_as<T: DeserializeOwned + Default>(&self) -> T {
        serde_json::from_value::<T>((*self.config).clone()).unwrap_or_default()
    }

    /// Strict: deserialize the module's config into `T`.
    pub fn config_required<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value((*self.config).clone())
            .map_err(|e| anyhow::anyhow!("invalid {} config: {}", self.name, e))
    }

    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    pub fn storage(&self) -> &ModuleStorage {
        &self.storage
    }

    pub fn db(&self) -> &ModuleDatabase {
        &self.db
    }

    pub fn events(&self) -> &ModuleEvents {
        &self.events
    }

    pub fn api(&self) -> &ModuleApi {
        &self.api
    }

    pub fn ui(&self) -> &ModuleUi {
        &self.ui
    }

    pub fn logger(&self) -> &ModuleLogger {
        &self.logger
    }

    pub fn scheduler(&self) -> &ModuleScheduler {
        &self.scheduler
    }

    /// Cancelled when the module is unloaded or the host shuts down.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }
}

//! Lifecycle manager: loads modules, wires their contexts, fans platform
//! events out to them and tears them down again.
//!
//! Each loaded module owns a bounded dispatch queue drained by one worker task.
//! [`ExtensionRuntime::emit_event`] only enqueues, so callers are never blocked
//! by module code, and a module sees its own hook invocations in emission
//! order. A full queue drops the event for that module with a warning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ApiRegistry;
use crate::context::{HostServices, ModuleCtx, ModuleCtxBuilder};
use crate::contracts::{EventPayload, ModuleHandler, PlatformEvent};
use crate::discovery::{Discovery, ModuleSource};
use crate::error::{ExtError, Result};
use crate::events::EventBus;
use crate::isolate::{run_isolated, Outcome};
use crate::manifest::{validate_module_name, ModuleManifest};
use crate::scheduler::CronService;
use crate::store::InstalledStore;
use crate::ui::UiRegistry;

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Load enabled install records on [`ExtensionRuntime::startup`].
    pub auto_start: bool,
    /// Deadline for load/unload/enable/disable hooks.
    pub lifecycle_timeout: Duration,
    /// Per-module event queue capacity.
    pub dispatch_queue: usize,
    /// Checked against each manifest's host requirements.
    pub host_version: semver::Version,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            auto_start: true,
            lifecycle_timeout: Duration::from_secs(30),
            dispatch_queue: 256,
            host_version: semver::Version::parse(env!("CARGO_PKG_VERSION"))
                .unwrap_or_else(|_| semver::Version::new(0, 0, 0)),
        }
    }
}

/// Read-only snapshot of a loaded module.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub source: ModuleSource,
    pub config: serde_json::Value,
    pub manifest: ModuleManifest,
    pub loaded_at: DateTime<Utc>,
}

/// Outcome of [`ExtensionRuntime::startup`]. Failed modules carry the error text.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy)]
enum LifecycleHook {
    Load,
    Unload,
    Enable,
    Disable,
}

impl LifecycleHook {
    fn as_str(self) -> &'static str {
        match self {
            Self::Load => "on_load",
            Self::Unload => "on_unload",
            Self::Enable => "on_enable",
            Self::Disable => "on_disable",
        }
    }

    async fn call(self, handler: &dyn ModuleHandler, ctx: &ModuleCtx) -> anyhow::Result<()> {
        match self {
            Self::Load => handler.on_load(ctx).await,
            Self::Unload => handler.on_unload(ctx).await,
            Self::Enable => handler.on_enable(ctx).await,
            Self::Disable => handler.on_disable(ctx).await,
        }
    }
}

// ----- per-module dispatch -----

struct Dispatch {
    event: PlatformEvent,
    payload: Arc<EventPayload>,
}

struct Dispatcher {
    tx: mpsc::Sender<Dispatch>,
    cancel: CancellationToken,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    fn spawn(
        handler: Arc<dyn ModuleHandler>,
        ctx: ModuleCtx,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Dispatch>(capacity.max(1));
        let stop = cancel.clone();
        let worker = tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };

                let event = job.event;
                let handler = handler.clone();
                let hook_ctx = ctx.clone();
                let outcome = run_isolated(
                    async move { event.dispatch(&*handler, &hook_ctx, &job.payload).await },
                    None,
                )
                .await;
                if !matches!(outcome, Outcome::Ok) {
                    tracing::warn!(
                        module = %ctx.name(),
                        event = %event,
                        outcome = %outcome.describe(),
                        "event hook failed"
                    );
                }
            }
            tracing::debug!(module = %ctx.name(), "dispatch worker stopped");
        });

        Self {
            tx,
            cancel,
            worker: parking_lot::Mutex::new(Some(worker)),
        }
    }

    fn offer(&self, module: &str, event: PlatformEvent, payload: Arc<EventPayload>) {
        match self.tx.try_send(Dispatch { event, payload }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(module, event = %event, "dispatch queue full; event dropped")
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(module, event = %event, "dispatcher stopped; event dropped")
            }
        }
    }

    /// Stop taking events and wait for the hook in flight, at most `grace`.
    async fn stop(&self, module: &str, grace: Duration) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            if tokio::time::timeout(grace, &mut worker).await.is_err() {
                worker.abort();
                tracing::warn!(module, ?grace, "event hook still running at unload; worker aborted");
            }
        }
    }
}

struct LoadedModule {
    handler: Arc<dyn ModuleHandler>,
    ctx: ModuleCtx,
    source: ModuleSource,
    enabled: AtomicBool,
    loaded_at: DateTime<Utc>,
    dispatcher: Dispatcher,
}

impl LoadedModule {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn info(&self) -> ModuleInfo {
        ModuleInfo {
            name: self.ctx.name().to_string(),
            version: self.ctx.version().to_string(),
            enabled: self.is_enabled(),
            source: self.source.clone(),
            config: self.ctx.config().clone(),
            manifest: self.ctx.manifest().clone(),
            loaded_at: self.loaded_at,
        }
    }
}

// ----- runtime -----

pub struct ExtensionRuntime {
    services: HostServices,
    discovery: Discovery,
    installed: InstalledStore,
    options: RuntimeOptions,
    active: RwLock<HashMap<String, Arc<LoadedModule>>>,
    /// Serializes load/unload/enable/disable.
    gate: tokio::sync::Mutex<()>,
    root: CancellationToken,
}

impl ExtensionRuntime {
    pub fn new(services: HostServices, discovery: Discovery, options: RuntimeOptions) -> Self {
        Self {
            installed: InstalledStore::new(services.db.pool().clone()),
            services,
            discovery,
            options,
            active: RwLock::new(HashMap::new()),
            gate: tokio::sync::Mutex::new(()),
            root: CancellationToken::new(),
        }
    }

    // ---- accessors for the host ----
    pub fn services(&self) -> &HostServices {
        &self.services
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.services.bus
    }

    pub fn api_registry(&self) -> &Arc<ApiRegistry> {
        &self.services.api
    }

    pub fn ui_registry(&self) -> &Arc<UiRegistry> {
        &self.services.ui
    }

    pub fn scheduler(&self) -> &Arc<CronService> {
        &self.services.cron
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn installed_store(&self) -> &InstalledStore {
        &self.installed
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    // ---- lifecycle ----

    /// Load every enabled install record. One module failing never stops the rest.
    pub async fn startup(&self) -> Result<StartupReport> {
        let mut report = StartupReport::default();
        if !self.options.auto_start {
            let available = self.discovery.discover_all();
            tracing::info!(available = available.len(), "auto start disabled; no modules loaded");
            return Ok(report);
        }

        let listing = self.installed.list_enabled().await?;
        for (name, e) in listing.unreadable {
            report.failed.push((name, e.to_string()));
        }
        for enabled in listing.modules {
            let name = enabled.record.name.clone();
            match self
                .load_with_config(
                    &name,
                    &enabled.record.version,
                    enabled.record.config,
                    enabled.manifest,
                )
                .await
            {
                Ok(_) => report.loaded.push(name),
                Err(e) => {
                    tracing::error!(module = %name, error = %e, "failed to load module at startup");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        tracing::info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "extension runtime started"
        );
        Ok(report)
    }

    /// Load `name` with an explicit version, config and manifest.
    ///
    /// If `on_load` fails every registration the module made is withdrawn
    /// before the error is returned.
    pub async fn load_with_config(
        &self,
        name: &str,
        version: &str,
        config: serde_json::Value,
        manifest: Option<ModuleManifest>,
    ) -> Result<ModuleInfo> {
        validate_module_name(name)?;
        let _gate = self.gate.lock().await;

        if self.active.read().contains_key(name) {
            return Err(ExtError::AlreadyLoaded(name.to_string()));
        }

        let (handler, source) = self.discovery.load_handler(name)?;
        let manifest = manifest.unwrap_or_else(|| ModuleManifest::named(name, version));
        manifest
            .check_host(&self.options.host_version)
            .map_err(|reason| ExtError::Incompatible {
                module: name.to_string(),
                host: self.options.host_version.to_string(),
                reason,
            })?;

        let token = self.root.child_token();
        let ctx = ModuleCtxBuilder::new(name, token.clone())
            .with_version(version)
            .with_config(config)
            .with_manifest(manifest)
            .build(&self.services);

        tracing::info!(module = name, version, source = ?source, "loading module");
        if let Err(e) = self
            .run_hook(name, LifecycleHook::Load, handler.clone(), ctx.clone())
            .await
        {
            let withdrawn = self.release_registrations(name);
            token.cancel();
            tracing::error!(module = name, error = %e, withdrawn, "module load failed");
            return Err(e);
        }

        let dispatcher = Dispatcher::spawn(
            handler.clone(),
            ctx.clone(),
            self.options.dispatch_queue,
            token.child_token(),
        );
        let module = Arc::new(LoadedModule {
            handler,
            ctx,
            source,
            enabled: AtomicBool::new(true),
            loaded_at: Utc::now(),
            dispatcher,
        });
        self.active.write().insert(name.to_string(), module.clone());

        tracing::info!(module = name, version, "module loaded");
        Ok(module.info())
    }

    /// Load `name` from its install record (and linked catalog manifest).
    pub async fn load_by_name(&self, name: &str) -> Result<ModuleInfo> {
        let record = self
            .installed
            .get(name)
            .await?
            .ok_or_else(|| ExtError::RecordNotFound(name.to_string()))?;
        let manifest = self.installed.manifest_of(name).await?;
        self.load_with_config(name, &record.version, record.config, manifest)
            .await
    }

    /// Unload then load again. The install record wins when there is one;
    /// otherwise the previous version and config are reused.
    pub async fn reload(&self, name: &str) -> Result<ModuleInfo> {
        let previous = self.get(name);
        match self.unload(name).await {
            Ok(()) | Err(ExtError::NotLoaded(_)) => {}
            Err(e) => return Err(e),
        }

        if self.installed.get(name).await?.is_some() {
            return self.load_by_name(name).await;
        }
        match previous {
            Some(info) => {
                self.load_with_config(name, &info.version, info.config, Some(info.manifest))
                    .await
            }
            None => Err(ExtError::RecordNotFound(name.to_string())),
        }
    }

    /// Best-effort unload: a failing `on_unload` is logged and every
    /// registration is withdrawn regardless.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.unload_locked(name).await
    }

    async fn unload_locked(&self, name: &str) -> Result<()> {
        let module = self
            .active
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ExtError::NotLoaded(name.to_string()))?;

        tracing::info!(module = name, "unloading module");
        module
            .dispatcher
            .stop(name, self.options.lifecycle_timeout)
            .await;

        if let Err(e) = self
            .run_hook(name, LifecycleHook::Unload, module.handler.clone(), module.ctx.clone())
            .await
        {
            tracing::warn!(module = name, error = %e, "unload hook failed; continuing");
        }

        let withdrawn = self.release_registrations(name);
        self.active.write().remove(name);
        module.ctx.cancellation_token().cancel();

        tracing::info!(module = name, withdrawn, "module unloaded");
        Ok(())
    }

    /// Unload every module, then stop the scheduler and wait for running jobs.
    pub async fn shutdown(&self) {
        let _gate = self.gate.lock().await;
        let mut names: Vec<String> = self.active.read().keys().cloned().collect();
        names.sort();
        for name in names.iter().rev() {
            if let Err(e) = self.unload_locked(name).await {
                tracing::warn!(module = %name, error = %e, "unload during shutdown failed");
            }
        }
        self.services.cron.shutdown().await;
        self.root.cancel();
        tracing::info!(unloaded = names.len(), "extension runtime stopped");
    }

    pub async fn enable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true).await
    }

    /// Stop dispatching to `name` while keeping its registrations.
    pub async fn disable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let _gate = self.gate.lock().await;
        let module = self
            .active
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ExtError::NotLoaded(name.to_string()))?;

        if module.enabled.swap(enabled, Ordering::AcqRel) == enabled {
            return Ok(());
        }
        self.services.bus.set_muted(name, !enabled);

        let hook = if enabled {
            LifecycleHook::Enable
        } else {
            LifecycleHook::Disable
        };
        if let Err(e) = self
            .run_hook(name, hook, module.handler.clone(), module.ctx.clone())
            .await
        {
            tracing::warn!(module = name, hook = hook.as_str(), error = %e, "lifecycle hook failed");
        }

        match self.installed.set_enabled(name, enabled).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(module = name, "no install record to update"),
            Err(e) => tracing::warn!(module = name, error = %e, "failed to persist enabled flag"),
        }

        tracing::info!(module = name, enabled, "module state changed");
        Ok(())
    }

    // ---- queries ----

    pub fn get(&self, name: &str) -> Option<ModuleInfo> {
        self.active.read().get(name).map(|m| m.info())
    }

    /// Loaded modules sorted by name.
    pub fn list(&self) -> Vec<ModuleInfo> {
        let mut out: Vec<ModuleInfo> = self.active.read().values().map(|m| m.info()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Everything discovery can load, loaded or not.
    pub fn list_available(&self) -> Vec<String> {
        self.discovery.discover_all()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.active.read().contains_key(name)
    }

    // ---- events ----

    /// Host entry point for domain events. Publishes on the bus and, for
    /// platform events, queues the matching hook on every enabled module.
    /// Never blocks on module code.
    pub fn emit_event(&self, event_type: &str, payload: EventPayload) {
        self.services.bus.emit(event_type, payload.clone());

        let Some(event) = PlatformEvent::parse(event_type) else {
            return;
        };
        let payload = Arc::new(payload);
        let targets: Vec<(String, Arc<LoadedModule>)> = self
            .active
            .read()
            .iter()
            .filter(|(_, m)| m.is_enabled())
            .map(|(n, m)| (n.clone(), m.clone()))
            .collect();

        tracing::trace!(event = %event, modules = targets.len(), "dispatching platform event");
        for (name, module) in targets {
            module.dispatcher.offer(&name, event, payload.clone());
        }
    }

    /// Publish on the bus and wait for every subscriber.
    pub async fn emit_sync(&self, topic: &str, payload: EventPayload) -> Result<()> {
        self.services.bus.emit_sync(topic, payload).await
    }

    // ---- internals ----

    async fn run_hook(
        &self,
        module: &str,
        hook: LifecycleHook,
        handler: Arc<dyn ModuleHandler>,
        ctx: ModuleCtx,
    ) -> Result<()> {
        let timeout = self.options.lifecycle_timeout;
        let outcome = run_isolated(async move { hook.call(&*handler, &ctx).await }, Some(timeout)).await;
        let failure = |source: anyhow::Error| ExtError::Hook {
            module: module.to_string(),
            hook: hook.as_str(),
            source,
        };
        match outcome {
            Outcome::Ok => Ok(()),
            Outcome::Failed(e) => Err(failure(e)),
            Outcome::Panicked(msg) => Err(failure(anyhow::anyhow!("panicked: {msg}"))),
            Outcome::Cancelled => Err(failure(anyhow::anyhow!("cancelled"))),
            Outcome::TimedOut(timeout) => Err(ExtError::HookTimeout {
                module: module.to_string(),
                hook: hook.as_str(),
                timeout,
            }),
        }
    }

    /// Withdraw every job, endpoint, UI component and subscription of `name`.
    fn release_registrations(&self, name: &str) -> usize {
        self.services.cron.remove_all(name)
            + self.services.api.unregister_all(name)
            + self.services.ui.unregister_all(name)
            + self.services.bus.unsubscribe_all(name)
    }
}

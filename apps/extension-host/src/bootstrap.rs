//! Wiring between the typed host config and the runtime crates.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use api_ingress::ApiIngressConfig;
use extkit::{InstalledStore, MarketplaceOptions, NewInstall, RuntimeOptions, StaticRegistry};
use runtime::config::ServerConfig;
use runtime::{AppConfig, ExtensionsConfig};

const INGRESS_SECTION: &str = "api_ingress";
const INSTALLED_BY_HOST: &str = "host";

/// Modules compiled into this binary.
pub fn register_static_modules(registry: &StaticRegistry) -> Result<()> {
    session_audit::register(registry).context("registering session_audit")?;
    Ok(())
}

/// Expand a sqlite DSN into an absolute-path DSN anchored at `base_dir`.
/// In-memory DSNs are returned unchanged.
pub fn absolutize_sqlite_dsn(dsn: &str, base_dir: &Path) -> Result<String> {
    let dsn = dsn.trim();
    if extkit_db::is_memory_dsn(dsn) {
        return Ok(dsn.to_string());
    }
    let rest = dsn
        .strip_prefix("sqlite://")
        .ok_or_else(|| anyhow!("DSN must start with sqlite:// (got: {dsn})"))?;

    let (path_str, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_str.is_empty() {
        bail!("empty SQLite path in DSN");
    }
    let mut path = PathBuf::from(path_str);
    if path.is_relative() {
        path = base_dir.join(path);
    }

    let mut out = String::from("sqlite://");
    out.push_str(&path.to_string_lossy().replace('\\', "/"));
    if let Some(q) = query {
        out.push('?');
        out.push_str(q);
    }
    Ok(out)
}

/// `modules.api_ingress` with the bind address and timeout filled in from `server`.
pub fn ingress_config(config: &AppConfig) -> Result<ApiIngressConfig> {
    let mut cfg = ApiIngressConfig::from_section(config.modules.get(INGRESS_SECTION))
        .context("invalid modules.api_ingress section")?;
    if cfg.bind_addr.trim().is_empty() {
        cfg.bind_addr = bind_addr(&config.server);
    }
    if config.server.timeout_sec > 0 {
        cfg.request_timeout = Duration::from_secs(config.server.timeout_sec);
    }
    cfg.bind_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address '{}'", cfg.bind_addr))?;
    Ok(cfg)
}

fn bind_addr(server: &ServerConfig) -> String {
    if server.host.contains(':') {
        format!("[{}]:{}", server.host, server.port)
    } else {
        format!("{}:{}", server.host, server.port)
    }
}

pub fn runtime_options(ext: &ExtensionsConfig) -> RuntimeOptions {
    RuntimeOptions {
        auto_start: ext.auto_start,
        lifecycle_timeout: ext.lifecycle_timeout,
        dispatch_queue: ext.dispatch_queue.max(1),
        ..Default::default()
    }
}

/// `None` when no repository is configured.
pub fn marketplace_options(ext: &ExtensionsConfig, home: &Path) -> Result<Option<MarketplaceOptions>> {
    let Some(url) = ext.repository_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
        return Ok(None);
    };
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("extensions.repository_url must be an http(s) URL (got: {url})");
    }
    Ok(Some(MarketplaceOptions {
        repository_url: url.to_string(),
        install_dir: ext.install_dir_in(home),
        catalog_ttl: ext.catalog_ttl,
        http_timeout: ext.http_timeout,
    }))
}

/// Give every compiled-in module an install record so startup loads it.
///
/// A missing record is created enabled. When the config file carries a
/// `modules.<name>` section it replaces the stored config; otherwise the
/// stored config is kept.
pub async fn sync_static_records(
    store: &InstalledStore,
    registry: &StaticRegistry,
    config: &AppConfig,
    version: &str,
) -> Result<()> {
    for name in registry.names() {
        if name == INGRESS_SECTION {
            continue;
        }
        let section = config.modules.get(&name).cloned();
        match store.get(&name).await? {
            None => {
                let mut new = NewInstall::new(&name, version)
                    .with_config(section.unwrap_or_else(|| serde_json::json!({})));
                new.installed_by = Some(INSTALLED_BY_HOST.to_string());
                store.upsert(&new).await?;
                tracing::info!(module = %name, "install record created for compiled-in module");
            }
            Some(record) => {
                if let Some(section) = section.filter(|s| *s != record.config) {
                    store.update_config(&name, &section).await?;
                    tracing::info!(module = %name, "module config updated from config file");
                }
            }
        }
    }
    Ok(())
}

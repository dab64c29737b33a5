//! Distribution: remote catalog sync, artifact download and install records.
//!
//! The repository serves `{repository}/catalog.json` (an array of
//! [`CatalogEntry`]) and, per module, either a single archive or loose files
//! under `{repository}/{name}/`. Installed modules are unpacked into
//! `{install_dir}/{name}/`, where discovery picks up their artifacts.

mod archive;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::discovery::artifact_candidates;
use crate::error::{ExtError, Result};
use crate::manifest::{validate_module_name, CatalogEntry, InstalledModuleRecord, NewInstall};
use crate::store::{CatalogStore, InstalledStore};

/// Value stored in `installed_by` for records created here.
pub const INSTALLED_BY: &str = "marketplace";

#[derive(Debug, Clone)]
pub struct MarketplaceOptions {
    /// Base URL of the module repository.
    pub repository_url: String,
    /// Directory modules are unpacked into, one subdirectory per module.
    pub install_dir: PathBuf,
    /// How long a fetched catalog is served from memory.
    pub catalog_ttl: Duration,
    /// Timeout applied to every catalog and artifact request.
    pub http_timeout: Duration,
}

/// Result of a catalog sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    /// `false` when the cached catalog was still fresh.
    pub fetched: bool,
    pub entries: usize,
}

#[derive(Default)]
struct CatalogState {
    last_sync: Option<Instant>,
    entries: Vec<CatalogEntry>,
}

pub struct Marketplace {
    http: reqwest::Client,
    options: MarketplaceOptions,
    installed: InstalledStore,
    catalog: CatalogStore,
    state: Mutex<CatalogState>,
}

impl Marketplace {
    pub fn new(pool: SqlitePool, options: MarketplaceOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(options.http_timeout)
            .user_agent(concat!("extkit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExtError::http(&options.repository_url, e))?;
        Ok(Self {
            http,
            installed: InstalledStore::new(pool.clone()),
            catalog: CatalogStore::new(pool),
            options,
            state: Mutex::new(CatalogState::default()),
        })
    }

    pub fn options(&self) -> &MarketplaceOptions {
        &self.options
    }

    /// Where `name` is (or would be) unpacked.
    pub fn module_dir(&self, name: &str) -> PathBuf {
        self.options.install_dir.join(name)
    }

    fn repository(&self) -> &str {
        self.options.repository_url.trim_end_matches('/')
    }

    // ---- catalog ----

    /// Fetch the remote catalog unless the cached copy is younger than the TTL.
    pub async fn sync_catalog(&self) -> Result<SyncOutcome> {
        self.sync(false).await
    }

    /// Fetch the remote catalog regardless of the TTL.
    pub async fn sync_catalog_forced(&self) -> Result<SyncOutcome> {
        self.sync(true).await
    }

    async fn sync(&self, force: bool) -> Result<SyncOutcome> {
        // held across the fetch so concurrent callers share one request
        let mut state = self.state.lock().await;
        if !force {
            if let Some(at) = state.last_sync {
                if at.elapsed() < self.options.catalog_ttl {
                    return Ok(SyncOutcome {
                        fetched: false,
                        entries: state.entries.len(),
                    });
                }
            }
        }

        let url = format!("{}/catalog.json", self.repository());
        tracing::debug!(url = %url, "fetching catalog");
        let mut entries: Vec<CatalogEntry> = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ExtError::http(&url, e))?
            .json()
            .await
            .map_err(|e| ExtError::http(&url, e))?;

        match self.installed.installed_state().await {
            Ok(installed) => {
                for entry in &mut entries {
                    if let Some(enabled) = installed.get(&entry.name) {
                        entry.installed = true;
                        entry.enabled = *enabled;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to mark installed catalog entries"),
        }

        for entry in &entries {
            if let Err(e) = self.catalog.upsert(entry).await {
                tracing::warn!(module = %entry.name, error = %e, "failed to mirror catalog entry");
            }
        }

        let count = entries.len();
        state.entries = entries;
        state.last_sync = Some(Instant::now());
        tracing::info!(entries = count, "catalog synced");
        Ok(SyncOutcome {
            fetched: true,
            entries: count,
        })
    }

    /// Catalog entries in repository order, syncing first if stale.
    pub async fn list_available(&self) -> Result<Vec<CatalogEntry>> {
        self.sync_catalog().await?;
        Ok(self.state.lock().await.entries.clone())
    }

    pub async fn get_entry(&self, name: &str) -> Result<CatalogEntry> {
        self.sync_catalog().await?;
        self.state
            .lock()
            .await
            .entries
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| ExtError::CatalogEntryNotFound(name.to_string()))
    }

    /// Search the local catalog mirror; works offline once synced.
    pub async fn search(&self, query: &str, category: Option<&str>) -> Result<Vec<CatalogEntry>> {
        let mut found = self.catalog.search(query, category).await?;
        let installed = self.installed.installed_state().await?;
        for entry in &mut found {
            if let Some(enabled) = installed.get(&entry.name) {
                entry.installed = true;
                entry.enabled = *enabled;
            }
        }
        Ok(found)
    }

    // ---- install / uninstall ----

    /// Download `name`, unpack it under [`module_dir`](Self::module_dir) and
    /// upsert an enabled install record. Without an explicit `config` the
    /// manifest's default config (or `{}`) is stored.
    ///
    /// Files may be left on disk if the record cannot be written.
    pub async fn install_module(
        &self,
        name: &str,
        config: Option<serde_json::Value>,
    ) -> Result<InstalledModuleRecord> {
        validate_module_name(name)?;
        let entry = self.get_entry(name).await?;
        let dest = self.module_dir(name);
        let url = entry
            .download_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| format!("{}/{}/extension.tar.gz", self.repository(), name));

        tracing::info!(module = name, version = %entry.version, url = %url, "installing module");
        if is_archive(&url) {
            let bytes = self.fetch(&url).await?;
            let written = archive::extract_tar_gz(bytes, dest.clone()).await?;
            tracing::debug!(module = name, entries = written, "archive extracted");
        } else {
            self.fetch_loose_files(name, &dest).await?;
        }

        let catalog_id = match self.catalog.id_of(name).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(module = name, error = %e, "catalog mirror lookup failed; install left unlinked");
                None
            }
        };
        let config = config
            .or_else(|| entry.manifest.default_config.clone())
            .unwrap_or_else(|| json!({}));
        let mut new = NewInstall::new(name, entry.version.clone()).with_config(config);
        new.catalog_id = catalog_id;
        new.installed_by = Some(INSTALLED_BY.to_string());
        let record = self.installed.upsert(&new).await?;

        self.mark_cached(name, Some(record.enabled)).await;
        tracing::info!(module = name, version = %record.version, dir = %dest.display(), "module installed");
        Ok(record)
    }

    /// Delete the install record, then the unpacked files. File removal is
    /// best-effort and only logged on failure.
    pub async fn uninstall_module(&self, name: &str) -> Result<()> {
        validate_module_name(name)?;
        let dir = self.module_dir(name);
        let had_record = self.installed.delete(name).await?;
        if !had_record && !dir.exists() {
            return Err(ExtError::RecordNotFound(name.to_string()));
        }

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(module = name, dir = %dir.display(), error = %e, "failed to remove module files")
            }
        }

        self.mark_cached(name, None).await;
        tracing::info!(module = name, "module uninstalled");
        Ok(())
    }

    async fn mark_cached(&self, name: &str, enabled: Option<bool>) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.iter_mut().find(|e| e.name == name) {
            entry.installed = enabled.is_some();
            entry.enabled = enabled.unwrap_or(false);
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ExtError::http(url, e))?
            .bytes()
            .await
            .map_err(|e| ExtError::http(url, e))?;
        Ok(bytes.to_vec())
    }

    /// Fallback for repositories without archives: `manifest.json` is
    /// required, `README.md` optional, and the first artifact name that
    /// downloads wins.
    async fn fetch_loose_files(&self, name: &str, dest: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest).await?;
        let base = format!("{}/{}", self.repository(), name);

        let manifest = self.fetch(&format!("{base}/manifest.json")).await?;
        tokio::fs::write(dest.join("manifest.json"), manifest).await?;

        match self.fetch(&format!("{base}/README.md")).await {
            Ok(readme) => tokio::fs::write(dest.join("README.md"), readme).await?,
            Err(e) => tracing::debug!(module = name, error = %e, "no README published"),
        }

        for file in artifact_candidates(name) {
            match self.fetch(&format!("{base}/{file}")).await {
                Ok(code) => {
                    tokio::fs::write(dest.join(&file), code).await?;
                    tracing::debug!(module = name, artifact = %file, "artifact downloaded");
                    return Ok(());
                }
                Err(e) => tracing::debug!(module = name, artifact = %file, error = %e, "artifact candidate unavailable"),
            }
        }
        tracing::warn!(module = name, "no artifact published; only metadata installed");
        Ok(())
    }
}

fn is_archive(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.ends_with(".tar.gz") || path.ends_with(".tgz")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_detection_ignores_query() {
        assert!(is_archive("https://repo/x/extension.tar.gz"));
        assert!(is_archive("https://repo/x/x.tgz?token=abc"));
        assert!(!is_archive("https://repo/x/"));
        assert!(!is_archive("https://repo/x/manifest.json"));
    }
}

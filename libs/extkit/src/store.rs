//! Persistent state owned by the runtime: install records, the local catalog
//! mirror and the shared key-value table used by [`ModuleStorage`](crate::storage::ModuleStorage).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{ExtError, Result};
use crate::manifest::{CatalogEntry, InstalledModuleRecord, ModuleManifest, NewInstall};
use crate::storage::escape_like;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS catalog_modules (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        version TEXT NOT NULL,
        display_name TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        author TEXT NOT NULL DEFAULT '',
        category TEXT NOT NULL DEFAULT '',
        tags TEXT NOT NULL DEFAULT '[]',
        icon_url TEXT,
        manifest TEXT NOT NULL DEFAULT '{}',
        download_url TEXT,
        synced_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS installed_modules (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        version TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        config TEXT NOT NULL DEFAULT '{}',
        catalog_id TEXT REFERENCES catalog_modules(id) ON DELETE SET NULL,
        installed_by TEXT,
        installed_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_installed_modules_enabled ON installed_modules(enabled)",
    "CREATE INDEX IF NOT EXISTS idx_catalog_modules_category ON catalog_modules(category)",
    "CREATE TABLE IF NOT EXISTS extension_storage (
        module_name TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (module_name, key)
    )",
];

/// Create the runtime's tables if they do not exist yet.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for stmt in SCHEMA {
        sqlx::query(stmt).execute(pool).await?;
    }
    tracing::debug!(statements = SCHEMA.len(), "extension schema ensured");
    Ok(())
}

// ----- installed modules -----

const INSTALLED_COLUMNS: &str =
    "id, name, version, enabled, config, catalog_id, installed_by, installed_at, updated_at";

#[derive(sqlx::FromRow)]
struct InstalledRow {
    id: String,
    name: String,
    version: String,
    enabled: bool,
    config: String,
    catalog_id: Option<String>,
    installed_by: Option<String>,
    installed_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl InstalledRow {
    fn into_record(self) -> Result<InstalledModuleRecord> {
        Ok(InstalledModuleRecord {
            config: serde_json::from_str(&self.config)?,
            id: self.id,
            name: self.name,
            version: self.version,
            enabled: self.enabled,
            catalog_id: self.catalog_id,
            installed_by: self.installed_by,
            installed_at: self.installed_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EnabledRow {
    #[sqlx(flatten)]
    installed: InstalledRow,
    manifest: Option<String>,
}

/// An enabled install record plus the manifest of its linked catalog entry.
#[derive(Debug, Clone)]
pub struct EnabledModule {
    pub record: InstalledModuleRecord,
    pub manifest: Option<ModuleManifest>,
}

/// Result of [`InstalledStore::list_enabled`].
#[derive(Debug, Default)]
pub struct EnabledListing {
    pub modules: Vec<EnabledModule>,
    /// Records that could not be decoded, with the reason.
    pub unreadable: Vec<(String, ExtError)>,
}

#[derive(Clone)]
pub struct InstalledStore {
    pool: SqlitePool,
}

impl InstalledStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enabled records ordered by name, joined with their catalog manifest.
    /// A manifest that fails to parse is dropped with a warning; a record
    /// whose own columns fail to parse is returned in `unreadable`.
    pub async fn list_enabled(&self) -> Result<EnabledListing> {
        let rows: Vec<EnabledRow> = sqlx::query_as(
            "SELECT i.id, i.name, i.version, i.enabled, i.config, i.catalog_id, i.installed_by, \
                    i.installed_at, i.updated_at, c.manifest \
             FROM installed_modules i LEFT JOIN catalog_modules c ON c.id = i.catalog_id \
             WHERE i.enabled = 1 ORDER BY i.name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut listing = EnabledListing::default();
        for row in rows {
            let name = row.installed.name.clone();
            let manifest = row.manifest.as_deref().and_then(|raw| {
                serde_json::from_str::<ModuleManifest>(raw)
                    .map_err(|e| tracing::warn!(module = %name, error = %e, "ignoring unparseable catalog manifest"))
                    .ok()
            });
            match row.installed.into_record() {
                Ok(record) => listing.modules.push(EnabledModule { record, manifest }),
                Err(e) => {
                    tracing::error!(module = %name, error = %e, "unreadable install record");
                    listing.unreadable.push((name, e));
                }
            }
        }
        Ok(listing)
    }

    pub async fn list_all(&self) -> Result<Vec<InstalledModuleRecord>> {
        let sql = format!("SELECT {INSTALLED_COLUMNS} FROM installed_modules ORDER BY name");
        let rows: Vec<InstalledRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(InstalledRow::into_record).collect()
    }

    pub async fn get(&self, name: &str) -> Result<Option<InstalledModuleRecord>> {
        let sql = format!("SELECT {INSTALLED_COLUMNS} FROM installed_modules WHERE name = ?");
        let row: Option<InstalledRow> = sqlx::query_as(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(InstalledRow::into_record).transpose()
    }

    /// Catalog manifest linked to `name`'s install record, if any.
    pub async fn manifest_of(&self, name: &str) -> Result<Option<ModuleManifest>> {
        let raw: Option<(String,)> = sqlx::query_as(
            "SELECT c.manifest FROM installed_modules i JOIN catalog_modules c ON c.id = i.catalog_id \
             WHERE i.name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(raw.map(|(m,)| serde_json::from_str(&m)).transpose()?)
    }

    /// Insert or update by name. Existing catalog link and installer are kept
    /// when the new record does not carry one.
    pub async fn upsert(&self, new: &NewInstall) -> Result<InstalledModuleRecord> {
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO installed_modules ({INSTALLED_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET \
                version = excluded.version, \
                enabled = excluded.enabled, \
                config = excluded.config, \
                catalog_id = COALESCE(excluded.catalog_id, installed_modules.catalog_id), \
                installed_by = COALESCE(excluded.installed_by, installed_modules.installed_by), \
                updated_at = excluded.updated_at \
             RETURNING {INSTALLED_COLUMNS}"
        );
        let row: InstalledRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(&new.name)
            .bind(&new.version)
            .bind(new.enabled)
            .bind(serde_json::to_string(&new.config)?)
            .bind(&new.catalog_id)
            .bind(&new.installed_by)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        row.into_record()
    }

    /// Returns `false` when no record named `name` exists.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let res = sqlx::query("UPDATE installed_modules SET enabled = ?, updated_at = ? WHERE name = ?")
            .bind(enabled)
            .bind(Utc::now())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn update_config(&self, name: &str, config: &serde_json::Value) -> Result<bool> {
        let res = sqlx::query("UPDATE installed_modules SET config = ?, updated_at = ? WHERE name = ?")
            .bind(serde_json::to_string(config)?)
            .bind(Utc::now())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn delete(&self, name: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM installed_modules WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// `name -> enabled` for every install record.
    pub async fn installed_state(&self) -> Result<HashMap<String, bool>> {
        let rows: Vec<(String, bool)> = sqlx::query_as("SELECT name, enabled FROM installed_modules")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }
}

// ----- catalog mirror -----

#[derive(sqlx::FromRow)]
struct CatalogRow {
    name: String,
    version: String,
    display_name: String,
    description: String,
    author: String,
    category: String,
    tags: String,
    icon_url: Option<String>,
    manifest: String,
    download_url: Option<String>,
}

impl CatalogRow {
    fn into_entry(self) -> Result<CatalogEntry> {
        Ok(CatalogEntry {
            tags: serde_json::from_str(&self.tags)?,
            manifest: serde_json::from_str(&self.manifest)?,
            name: self.name,
            version: self.version,
            display_name: self.display_name,
            description: self.description,
            author: self.author,
            category: self.category,
            icon_url: self.icon_url,
            download_url: self.download_url,
            installed: false,
            enabled: false,
        })
    }
}

const CATALOG_COLUMNS: &str =
    "name, version, display_name, description, author, category, tags, icon_url, manifest, download_url";

#[derive(Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
}

impl CatalogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or refresh the mirror row for `entry`; returns the row id.
    pub async fn upsert(&self, entry: &CatalogEntry) -> Result<String> {
        let (id,): (String,) = sqlx::query_as(
            "INSERT INTO catalog_modules (id, name, version, display_name, description, author, category, \
                                          tags, icon_url, manifest, download_url, synced_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET \
                version = excluded.version, \
                display_name = excluded.display_name, \
                description = excluded.description, \
                author = excluded.author, \
                category = excluded.category, \
                tags = excluded.tags, \
                icon_url = excluded.icon_url, \
                manifest = excluded.manifest, \
                download_url = excluded.download_url, \
                synced_at = excluded.synced_at \
             RETURNING id",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&entry.name)
        .bind(&entry.version)
        .bind(&entry.display_name)
        .bind(&entry.description)
        .bind(&entry.author)
        .bind(&entry.category)
        .bind(serde_json::to_string(&entry.tags)?)
        .bind(&entry.icon_url)
        .bind(serde_json::to_string(&entry.manifest)?)
        .bind(&entry.download_url)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn id_of(&self, name: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM catalog_modules WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id,)| id))
    }

    pub async fn get(&self, name: &str) -> Result<Option<CatalogEntry>> {
        let sql = format!("SELECT {CATALOG_COLUMNS} FROM catalog_modules WHERE name = ?");
        let row: Option<CatalogRow> = sqlx::query_as(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CatalogRow::into_entry).transpose()
    }

    /// Case-insensitive substring search over name, display name and
    /// description, optionally restricted to one category. An empty query
    /// matches everything.
    pub async fn search(&self, query: &str, category: Option<&str>) -> Result<Vec<CatalogEntry>> {
        let pattern = format!("%{}%", escape_like(query.trim()));
        let sql = format!(
            "SELECT {CATALOG_COLUMNS} FROM catalog_modules \
             WHERE (name LIKE ?1 ESCAPE '\\' OR display_name LIKE ?1 ESCAPE '\\' OR description LIKE ?1 ESCAPE '\\') \
               AND (?2 IS NULL OR category = ?2) \
             ORDER BY name"
        );
        let rows: Vec<CatalogRow> = sqlx::query_as(&sql)
            .bind(pattern)
            .bind(category)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(CatalogRow::into_entry).collect()
    }
}

//! Namespaced persistence handed to modules.
//!
//! [`ModuleStorage`] is a key-value store over the shared `extension_storage`
//! table, row-scoped by module name. [`ModuleDatabase`] gives full relational
//! access for modules that need their own tables, named by [`table_prefix`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use extkit_db::DbHandle;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::{ExtError, Result};

/// One stored value with its timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct StorageRow {
    key: String,
    value: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ModuleStorage {
    module: Arc<str>,
    pool: SqlitePool,
}

impl ModuleStorage {
    pub(crate) fn new(module: Arc<str>, pool: SqlitePool) -> Self {
        Self { module, pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<(String,)> =
            sqlx::query_as("SELECT value FROM extension_storage WHERE module_name = ? AND key = ?")
                .bind(&*self.module)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        raw.map(|(v,)| serde_json::from_str(&v).map_err(ExtError::from))
            .transpose()
    }

    /// Typed read; `None` when the key is absent.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO extension_storage (module_name, key, value, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(module_name, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(&*self.module)
        .bind(key)
        .bind(json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM extension_storage WHERE module_name = ? AND key = ?")
            .bind(&*self.module)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Keys starting with `prefix`, sorted. An empty prefix lists everything.
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}%", escape_like(prefix));
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM extension_storage \
             WHERE module_name = ? AND key LIKE ? ESCAPE '\\' ORDER BY key",
        )
        .bind(&*self.module)
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        // LIKE is case-insensitive for ASCII in SQLite
        Ok(rows
            .into_iter()
            .map(|(k,)| k)
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    /// Remove every key of this module.
    pub async fn clear(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM extension_storage WHERE module_name = ?")
            .bind(&*self.module)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn entry(&self, key: &str) -> Result<Option<StorageEntry>> {
        let row: Option<StorageRow> = sqlx::query_as(
            "SELECT key, value, created_at, updated_at FROM extension_storage \
             WHERE module_name = ? AND key = ?",
        )
        .bind(&*self.module)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<StorageEntry> {
            Ok(StorageEntry {
                value: serde_json::from_str(&r.value)?,
                key: r.key,
                created_at: r.created_at,
                updated_at: r.updated_at,
            })
        })
        .transpose()
    }
}

pub(crate) fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `ext_{escaped module}__`. The escaping maps `_` to `_0`, `-` to `_1` and
/// an uppercase letter to `_` plus its lowercase form, so the escaped name is
/// lowercase, never contains `__` and never ends in `_`. The first `__` after
/// `ext_` therefore marks where the module ends, and SQLite's case-insensitive
/// names cannot merge two modules.
pub fn table_prefix(module: &str) -> String {
    let mut out = String::with_capacity(module.len() + 6);
    out.push_str("ext_");
    for c in module.chars() {
        match c {
            '_' => out.push_str("_0"),
            '-' => out.push_str("_1"),
            c if c.is_ascii_uppercase() => {
                out.push('_');
                out.push(c.to_ascii_lowercase());
            }
            c => out.push(c),
        }
    }
    out.push_str("__");
    out
}

/// Relational access scoped by table-name prefix.
#[derive(Clone)]
pub struct ModuleDatabase {
    module: Arc<str>,
    db: DbHandle,
}

impl ModuleDatabase {
    pub(crate) fn new(module: Arc<str>, db: DbHandle) -> Self {
        Self { module, db }
    }

    /// Physical name of a module-local table: `ext_{module}__{local}`, with
    /// the module name escaped (see [`table_prefix`]).
    pub fn table_name(&self, local: &str) -> Result<String> {
        if local.is_empty() || !local.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ExtError::InvalidIdentifier(local.to_string()));
        }
        Ok(format!("{}{local}", table_prefix(&self.module)))
    }

    /// `CREATE TABLE IF NOT EXISTS` with the given column definitions.
    /// Returns the physical table name.
    pub async fn create_table(&self, local: &str, columns: &str) -> Result<String> {
        let table = self.table_name(local)?;
        let sql = format!("CREATE TABLE IF NOT EXISTS \"{table}\" ({columns})");
        sqlx::query(&sql).execute(self.db.pool()).await?;
        tracing::debug!(module = %self.module, table = %table, "module table ensured");
        Ok(table)
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        Ok(sqlx::query(sql).execute(self.db.pool()).await?.rows_affected())
    }

    /// The underlying pool, for queries that need binds or typed rows.
    pub fn pool(&self) -> &SqlitePool {
        self.db.pool()
    }

    /// Run `f` in a transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// On an in-memory database the pool holds a single connection, so `f`
    /// must only use the transaction it is given.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(
            &'c mut Transaction<'static, Sqlite>,
        ) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'c>>,
    {
        self.db.with_tx(f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_prefixes_never_collide() {
        assert_eq!(table_prefix("audit"), "ext_audit__");
        assert_eq!(table_prefix("foo-bar"), "ext_foo_1bar__");
        assert_eq!(table_prefix("foo_bar"), "ext_foo_0bar__");
        assert_eq!(table_prefix("Foo"), "ext__foo__");

        let modules = ["foo", "foo-bar", "foo_bar", "Foo", "foo_", "foo0", "FOO"];
        let locals = ["bar_t", "t", "bar", "_t", "0bar_t"];
        let mut seen = std::collections::HashMap::new();
        for m in modules {
            for l in locals {
                let name = format!("{}{l}", table_prefix(m)).to_ascii_lowercase();
                if let Some(prev) = seen.insert(name.clone(), m) {
                    assert_eq!(prev, m, "{name} shared by {prev} and {m}");
                }
            }
        }
    }

    #[test]
    fn like_metacharacters_are_escaped() {
        assert_eq!(escape_like("a_b%c\\d"), "a\\_b\\%c\\\\d");
        assert_eq!(escape_like("plain"), "plain");
    }
}

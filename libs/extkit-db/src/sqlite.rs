//! SQLite DSN parsing: pragma whitelist, memory detection, path preparation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};

use crate::{DbError, Result};

const PRAGMA_PARAMS: &[&str] = &["wal", "synchronous", "busy_timeout", "journal_mode"];

/// A parsed SQLite DSN.
#[derive(Debug)]
pub(crate) struct SqliteTarget {
    /// DSN with pragma parameters removed, ready for sqlx.
    pub clean_dsn: String,
    pub memory: bool,
    pub file_path: Option<PathBuf>,
    pub pragmas: Pragmas,
}

impl SqliteTarget {
    pub(crate) fn parse(dsn: &str) -> Result<Self> {
        let dsn = dsn.trim_start();
        if !dsn.starts_with("sqlite:") {
            return Err(DbError::UnknownDsn(dsn.to_string()));
        }

        let (clean_dsn, pairs) = extract_pragmas(dsn);
        let memory = is_memory_dsn(&clean_dsn);
        let file_path = if memory {
            None
        } else {
            file_path_of(&clean_dsn)
        };

        Ok(Self {
            clean_dsn,
            memory,
            file_path,
            pragmas: Pragmas::from_pairs(&pairs),
        })
    }

    /// One-time blocking call during startup.
    pub(crate) fn ensure_parent_dir(&self) -> std::io::Result<()> {
        if let Some(parent) = self.file_path.as_ref().and_then(|p| p.parent()) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// Check if the DSN represents an in-memory SQLite database.
pub fn is_memory_dsn(dsn: &str) -> bool {
    if dsn.contains(":memory:") {
        return true;
    }
    url::Url::parse(dsn)
        .map(|url| {
            url.query_pairs()
                .any(|(k, v)| k.eq_ignore_ascii_case("mode") && v.eq_ignore_ascii_case("memory"))
        })
        .unwrap_or(false)
}

fn extract_pragmas(dsn: &str) -> (String, HashMap<String, String>) {
    let Ok(mut url) = url::Url::parse(dsn) else {
        return (dsn.to_string(), HashMap::new());
    };

    let mut extracted = HashMap::new();
    let mut remaining = Vec::new();
    for (key, value) in url.query_pairs() {
        let key_lower = key.to_lowercase();
        if PRAGMA_PARAMS.contains(&key_lower.as_str()) {
            extracted.insert(key_lower, value.into_owned());
        } else {
            remaining.push(format!("{key}={value}"));
        }
    }

    if extracted.is_empty() {
        return (dsn.to_string(), extracted);
    }

    url.set_query(None);
    if !remaining.is_empty() {
        url.set_query(Some(&remaining.join("&")));
    }
    (url.to_string(), extracted)
}

/// `sqlite:///abs/db.sqlite`, `sqlite://rel/db.sqlite`, `sqlite:rel/db.sqlite`.
fn file_path_of(dsn: &str) -> Option<PathBuf> {
    let rest = dsn
        .strip_prefix("sqlite://")
        .or_else(|| dsn.strip_prefix("sqlite:"))?;
    let rest = rest.split('?').next().unwrap_or(rest);
    if rest.is_empty() || rest.starts_with("file:") {
        return None;
    }
    Some(PathBuf::from(rest))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum JournalMode {
    Delete,
    Wal,
    Memory,
    Truncate,
    Persist,
    Off,
}

impl JournalMode {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DELETE" => Some(Self::Delete),
            "WAL" => Some(Self::Wal),
            "MEMORY" => Some(Self::Memory),
            "TRUNCATE" => Some(Self::Truncate),
            "PERSIST" => Some(Self::Persist),
            "OFF" => Some(Self::Off),
            _ => None,
        }
    }

    fn to_sqlx(self) -> SqliteJournalMode {
        match self {
            Self::Delete => SqliteJournalMode::Delete,
            Self::Wal => SqliteJournalMode::Wal,
            Self::Memory => SqliteJournalMode::Memory,
            Self::Truncate => SqliteJournalMode::Truncate,
            Self::Persist => SqliteJournalMode::Persist,
            Self::Off => SqliteJournalMode::Off,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncMode {
    Off,
    Normal,
    Full,
    Extra,
}

impl SyncMode {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "OFF" => Some(Self::Off),
            "NORMAL" => Some(Self::Normal),
            "FULL" => Some(Self::Full),
            "EXTRA" => Some(Self::Extra),
            _ => None,
        }
    }

    fn to_sqlx(self) -> SqliteSynchronous {
        match self {
            Self::Off => SqliteSynchronous::Off,
            Self::Normal => SqliteSynchronous::Normal,
            Self::Full => SqliteSynchronous::Full,
            Self::Extra => SqliteSynchronous::Extra,
        }
    }
}

/// Whitelisted PRAGMA values parsed from the DSN. Invalid values are logged and ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Pragmas {
    pub journal_mode: Option<JournalMode>,
    pub synchronous: Option<SyncMode>,
    pub busy_timeout_ms: Option<u64>,
    /// Legacy `wal=true|false|1|0`
    pub wal_toggle: Option<bool>,
}

impl Pragmas {
    pub(crate) fn from_pairs(pairs: &HashMap<String, String>) -> Self {
        let mut p = Pragmas::default();
        for (key, value) in pairs {
            match key.as_str() {
                "journal_mode" => match JournalMode::parse(value) {
                    Some(m) => p.journal_mode = Some(m),
                    None => tracing::warn!(value = %value, "invalid journal_mode pragma, ignoring"),
                },
                "synchronous" => match SyncMode::parse(value) {
                    Some(m) => p.synchronous = Some(m),
                    None => tracing::warn!(value = %value, "invalid synchronous pragma, ignoring"),
                },
                "busy_timeout" => match value.parse::<u64>() {
                    Ok(ms) => p.busy_timeout_ms = Some(ms),
                    Err(_) => tracing::warn!(value = %value, "invalid busy_timeout pragma, ignoring"),
                },
                "wal" => match value.to_ascii_lowercase().as_str() {
                    "true" | "1" => p.wal_toggle = Some(true),
                    "false" | "0" => p.wal_toggle = Some(false),
                    _ => tracing::warn!(value = %value, "invalid wal pragma, ignoring"),
                },
                other => tracing::debug!(param = other, "unknown SQLite pragma parameter"),
            }
        }
        p
    }

    /// Resolve the effective journal mode. In-memory databases cannot use WAL.
    pub(crate) fn effective_journal_mode(&self, memory: bool) -> JournalMode {
        if memory {
            return JournalMode::Delete;
        }
        match (self.journal_mode, self.wal_toggle) {
            (Some(m), _) => m,
            (None, Some(false)) => JournalMode::Delete,
            _ => JournalMode::Wal,
        }
    }

    pub(crate) fn apply(
        &self,
        opts: SqliteConnectOptions,
        memory: bool,
        default_busy: Duration,
    ) -> SqliteConnectOptions {
        let busy = self
            .busy_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default_busy);
        opts.journal_mode(self.effective_journal_mode(memory).to_sqlx())
            .synchronous(self.synchronous.unwrap_or(SyncMode::Normal).to_sqlx())
            .busy_timeout(busy)
    }
}

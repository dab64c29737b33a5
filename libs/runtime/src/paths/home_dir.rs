//! Resolution of the host's home directory.
//!
//! Explicit paths may start with `~`; relative paths are anchored at the
//! current directory. Without an explicit path the platform default is used:
//! `%APPDATA%/<subdir>` on Windows, `$HOME/<subdir>` elsewhere.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HomeDirError {
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("cannot determine current directory: {0}")]
    CurrentDir(#[source] std::io::Error),

    #[error("cannot create {}: {source}", .path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(target_os = "windows")]
const BASE_ENV: &str = "APPDATA";
#[cfg(not(target_os = "windows"))]
const BASE_ENV: &str = "HOME";

fn user_home() -> Result<PathBuf, HomeDirError> {
    #[cfg(target_os = "windows")]
    let var = "USERPROFILE";
    #[cfg(not(target_os = "windows"))]
    let var = "HOME";
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .ok_or(HomeDirError::MissingEnv(var))
}

fn expand_tilde(raw: &str) -> Result<PathBuf, HomeDirError> {
    if raw == "~" {
        return user_home();
    }
    if let Some(rest) = raw.strip_prefix("~/").or_else(|| raw.strip_prefix("~\\")) {
        return Ok(user_home()?.join(rest));
    }
    Ok(PathBuf::from(raw))
}

/// Resolve `explicit` (or the platform default `<base>/<default_subdir>`) to
/// an absolute path, creating it when `create` is set.
pub fn resolve_home_dir(
    explicit: Option<String>,
    default_subdir: &str,
    create: bool,
) -> Result<PathBuf, HomeDirError> {
    let path = match explicit.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => expand_tilde(raw)?,
        None => std::env::var_os(BASE_ENV)
            .filter(|v| !v.is_empty())
            .map(|base| PathBuf::from(base).join(default_subdir))
            .ok_or(HomeDirError::MissingEnv(BASE_ENV))?,
    };

    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map_err(HomeDirError::CurrentDir)?
            .join(path)
    };

    if create {
        ensure_dir(&path)?;
    }
    Ok(path)
}

fn ensure_dir(path: &Path) -> Result<(), HomeDirError> {
    std::fs::create_dir_all(path).map_err(|source| HomeDirError::Create {
        path: path.to_path_buf(),
        source,
    })
}

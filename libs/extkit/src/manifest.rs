//! Declarative module metadata, install records and catalog entries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declarative metadata for a module. Immutable once the module is loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModuleManifest {
    pub name: String,
    pub version: String,
    pub display_name: String,
    pub description: String,
    pub author: String,
    pub homepage: Option<String>,
    pub repository: Option<String>,
    pub license: Option<String>,
    /// Module kind, e.g. `extension`, `webhook`, `integration`, `theme`.
    #[serde(rename = "type")]
    pub module_type: String,
    pub category: String,
    pub tags: Vec<String>,
    pub icon: Option<String>,
    pub requirements: Requirements,
    pub entrypoints: Entrypoints,
    pub config_schema: Option<serde_json::Value>,
    pub default_config: Option<serde_json::Value>,
    pub permissions: Vec<String>,
    pub dependencies: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Requirements {
    /// Semver requirement on the host, e.g. `>=1.2, <2`.
    pub host_version: Option<String>,
    pub minimum_version: Option<String>,
    pub maximum_version: Option<String>,
    pub modules: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entrypoints {
    pub main: Option<String>,
    pub ui: Option<String>,
    pub api: Option<String>,
    pub webhook: Option<String>,
    pub cli: Option<String>,
}

impl ModuleManifest {
    /// Minimal manifest for a module known only by name.
    pub fn named(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            ..Default::default()
        }
    }

    /// Check the declared host requirements against `host`.
    /// Unparseable bounds are ignored with a warning.
    pub fn check_host(&self, host: &semver::Version) -> Result<(), String> {
        let req = &self.requirements;

        if let Some(spec) = req.host_version.as_deref().filter(|s| !s.is_empty()) {
            match semver::VersionReq::parse(spec) {
                Ok(vr) if !vr.matches(host) => return Err(format!("requires host {spec}")),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(module = %self.name, requirement = spec, error = %e, "ignoring unparseable host requirement")
                }
            }
        }
        if let Some(min) = parse_bound(&self.name, req.minimum_version.as_deref()) {
            if host < &min {
                return Err(format!("requires host >= {min}"));
            }
        }
        if let Some(max) = parse_bound(&self.name, req.maximum_version.as_deref()) {
            if host > &max {
                return Err(format!("requires host <= {max}"));
            }
        }
        Ok(())
    }
}

fn parse_bound(module: &str, raw: Option<&str>) -> Option<semver::Version> {
    let raw = raw.filter(|s| !s.is_empty())?;
    match semver::Version::parse(raw.trim_start_matches('v')) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(module, bound = raw, error = %e, "ignoring unparseable version bound");
            None
        }
    }
}

/// Module names double as path segments, table prefixes and directory names:
/// ASCII alphanumerics, `_` and `-`, starting with an alphanumeric, at most 64 chars.
pub fn validate_module_name(name: &str) -> crate::error::Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(crate::error::ExtError::InvalidName(name.to_string()))
    }
}

/// Persistent row marking a module as installed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledModuleRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub config: serde_json::Value,
    pub catalog_id: Option<String>,
    pub installed_by: Option<String>,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating or updating an install record.
#[derive(Debug, Clone)]
pub struct NewInstall {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub config: serde_json::Value,
    pub catalog_id: Option<String>,
    pub installed_by: Option<String>,
}

impl NewInstall {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            enabled: true,
            config: serde_json::Value::Object(Default::default()),
            catalog_id: None,
            installed_by: None,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// One entry of the remote catalog (`catalog.json` is an array of these).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogEntry {
    pub name: String,
    pub version: String,
    pub display_name: String,
    pub description: String,
    pub author: String,
    pub category: String,
    pub tags: Vec<String>,
    pub icon_url: Option<String>,
    pub manifest: ModuleManifest,
    pub download_url: Option<String>,
    /// Local state, filled in after sync.
    pub installed: bool,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(s: &str) -> semver::Version {
        semver::Version::parse(s).unwrap()
    }

    #[test]
    fn catalog_entry_parses_camel_case_and_defaults() {
        let raw = serde_json::json!({
            "name": "sample",
            "version": "1.0.0",
            "displayName": "Sample",
            "iconUrl": "https://cdn/icon.png",
            "downloadUrl": "https://repo/sample.tar.gz",
            "manifest": { "name": "sample", "type": "extension", "permissions": ["sessions:read"] }
        });
        let e: CatalogEntry = serde_json::from_value(raw).unwrap();
        assert_eq!(e.display_name, "Sample");
        assert_eq!(e.manifest.module_type, "extension");
        assert_eq!(e.manifest.permissions, vec!["sessions:read"]);
        assert!(e.tags.is_empty());
        assert!(!e.installed);
    }

    #[test]
    fn module_names_are_path_safe() {
        for ok in ["audit", "session_audit", "billing-sync", "v2"] {
            assert!(validate_module_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", "../etc", "a/b", "_hidden", "with space", "x".repeat(65).as_str()] {
            assert!(validate_module_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn host_requirements_are_enforced() {
        let mut m = ModuleManifest::named("m", "1.0.0");
        assert!(m.check_host(&version("0.1.0")).is_ok());

        m.requirements.minimum_version = Some("1.2.0".into());
        assert!(m.check_host(&version("1.1.9")).is_err());
        assert!(m.check_host(&version("1.2.0")).is_ok());

        m.requirements.host_version = Some("<2".into());
        assert!(m.check_host(&version("2.0.0")).is_err());

        m.requirements = Requirements {
            maximum_version: Some("not-a-version".into()),
            ..Default::default()
        };
        assert!(m.check_host(&version("9.9.9")).is_ok());
    }
}

//! Module discovery: compiled-in modules from the [`StaticRegistry`] plus
//! dynamic-library artifacts found in the configured plugin directories.
//!
//! An artifact for module `audit` is any of `audit`, `libaudit` or
//! `audit_extension` with the platform's dynamic-library suffix, placed either
//! directly in a plugin directory or in an `audit/` subdirectory of it.
//! Artifacts must export the symbol declared by [`export_module!`](crate::export_module)
//! and be built with the same toolchain and `extkit` version as the host.

#[cfg(feature = "dynamic")]
mod dynamic;

use std::collections::BTreeSet;
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(feature = "dynamic")]
use std::collections::HashMap;

#[cfg(feature = "dynamic")]
use parking_lot::Mutex;
use serde::Serialize;

use crate::contracts::ModuleHandler;
use crate::error::{ExtError, Result};
use crate::manifest::validate_module_name;
use crate::registry::StaticRegistry;

/// Version of the host/artifact contract. Bumped whenever [`ModuleHandler`]
/// or [`ModuleDescriptor`] change shape.
pub const ABI_VERSION: u32 = 1;

/// Name of the static every dynamic artifact exports.
pub const DESCRIPTOR_SYMBOL: &[u8] = b"EXTKIT_MODULE_DESCRIPTOR\0";

/// Entry point exported by a dynamic artifact.
#[repr(C)]
pub struct ModuleDescriptor {
    pub abi_version: u32,
    pub create: fn() -> Box<dyn ModuleHandler>,
}

/// Where a loaded handler came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleSource {
    Static,
    Dynamic(PathBuf),
}

pub struct Discovery {
    registry: Arc<StaticRegistry>,
    plugin_dirs: Vec<PathBuf>,
    #[cfg(feature = "dynamic")]
    opened: Mutex<HashMap<String, dynamic::OpenedArtifact>>,
}

impl Discovery {
    pub fn new(registry: Arc<StaticRegistry>, plugin_dirs: Vec<PathBuf>) -> Self {
        Self {
            registry,
            plugin_dirs,
            #[cfg(feature = "dynamic")]
            opened: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<StaticRegistry> {
        &self.registry
    }

    pub fn plugin_dirs(&self) -> &[PathBuf] {
        &self.plugin_dirs
    }

    pub fn is_static(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn list_static(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Names of dynamic artifacts opened so far, sorted.
    pub fn list_dynamic(&self) -> Vec<String> {
        #[cfg(feature = "dynamic")]
        {
            let mut names: Vec<String> = self.opened.lock().keys().cloned().collect();
            names.sort();
            names
        }
        #[cfg(not(feature = "dynamic"))]
        {
            Vec::new()
        }
    }

    /// Every module name that could be loaded: static registrations merged
    /// with artifacts found on disk. Unreadable directories are logged and skipped.
    pub fn discover_all(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.registry.names().into_iter().collect();
        for dir in &self.plugin_dirs {
            match scan_dir(dir) {
                Ok(found) => names.extend(found),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(dir = %dir.display(), "plugin directory does not exist")
                }
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "failed to scan plugin directory")
                }
            }
        }
        names.into_iter().collect()
    }

    /// First artifact on disk matching `name`, in plugin-dir order.
    pub fn find_artifact(&self, name: &str) -> Option<PathBuf> {
        let candidates = artifact_candidates(name);
        self.plugin_dirs
            .iter()
            .flat_map(|dir| [dir.clone(), dir.join(name)])
            .flat_map(|base| candidates.iter().map(move |c| base.join(c)))
            .find(|path| path.is_file())
    }

    /// Resolve a handler: static registry first, then a previously opened
    /// artifact, then the plugin directories.
    pub fn load_handler(&self, name: &str) -> Result<(Arc<dyn ModuleHandler>, ModuleSource)> {
        validate_module_name(name)?;

        if let Some(handler) = self.registry.create(name) {
            return Ok((handler, ModuleSource::Static));
        }

        #[cfg(feature = "dynamic")]
        if let Some(opened) = self.opened.lock().get(name) {
            return Ok((opened.handler.clone(), ModuleSource::Dynamic(opened.path.clone())));
        }

        let Some(path) = self.find_artifact(name) else {
            return Err(ExtError::NotFound(name.to_string()));
        };
        self.open_artifact(name, &path)
    }

    #[cfg(feature = "dynamic")]
    fn open_artifact(&self, name: &str, path: &Path) -> Result<(Arc<dyn ModuleHandler>, ModuleSource)> {
        let opened = dynamic::open(name, path)?;
        // a concurrent load may have won; keep the first artifact
        let mut cache = self.opened.lock();
        let entry = cache.entry(name.to_string()).or_insert(opened);
        Ok((entry.handler.clone(), ModuleSource::Dynamic(entry.path.clone())))
    }

    #[cfg(not(feature = "dynamic"))]
    fn open_artifact(&self, name: &str, path: &Path) -> Result<(Arc<dyn ModuleHandler>, ModuleSource)> {
        Err(ExtError::ArtifactOpen {
            module: name.to_string(),
            path: path.to_path_buf(),
            reason: "dynamic loading is disabled in this build".to_string(),
        })
    }
}

pub(crate) fn artifact_candidates(name: &str) -> Vec<String> {
    let mut out = Vec::with_capacity(3);
    for stem in [
        name.to_string(),
        format!("{DLL_PREFIX}{name}"),
        format!("{name}_extension"),
    ] {
        let file = format!("{stem}{DLL_SUFFIX}");
        if !out.contains(&file) {
            out.push(file);
        }
    }
    out
}

/// Module name an artifact file stands for, if it looks like one.
fn module_name_of(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(DLL_SUFFIX)?;
    let stem = stem.strip_prefix(DLL_PREFIX).unwrap_or(stem);
    let stem = stem.strip_suffix("_extension").unwrap_or(stem);
    validate_module_name(stem).ok()?;
    Some(stem.to_string())
}

fn scan_dir(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().into_owned();

        if path.is_dir() {
            if validate_module_name(&file_name).is_ok()
                && artifact_candidates(&file_name)
                    .iter()
                    .any(|c| path.join(c).is_file())
            {
                found.push(file_name);
            }
        } else if let Some(name) = module_name_of(&file_name) {
            found.push(name);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl ModuleHandler for Noop {}

    fn artifact(stem: &str) -> String {
        format!("{stem}{DLL_SUFFIX}")
    }

    #[test]
    fn artifact_names_map_back_to_modules() {
        assert_eq!(module_name_of(&artifact("audit")).as_deref(), Some("audit"));
        assert_eq!(
            module_name_of(&artifact(&format!("{DLL_PREFIX}billing"))).as_deref(),
            Some("billing")
        );
        assert_eq!(module_name_of(&artifact("quota_extension")).as_deref(), Some("quota"));
        assert_eq!(module_name_of("README.md"), None);
    }

    #[test]
    fn discover_all_merges_static_and_disk() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(artifact("flat")), b"").unwrap();
        std::fs::create_dir(tmp.path().join("nested")).unwrap();
        std::fs::write(tmp.path().join("nested").join(artifact("nested_extension")), b"").unwrap();
        std::fs::create_dir(tmp.path().join("empty")).unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"").unwrap();

        let registry = Arc::new(StaticRegistry::new());
        registry.register("builtin", || Noop).unwrap();
        registry.register("flat", || Noop).unwrap();

        let discovery = Discovery::new(
            registry,
            vec![tmp.path().to_path_buf(), tmp.path().join("does-not-exist")],
        );
        assert_eq!(discovery.discover_all(), ["builtin", "flat", "nested"]);
        assert_eq!(
            discovery.find_artifact("nested"),
            Some(tmp.path().join("nested").join(artifact("nested_extension")))
        );
    }

    #[test]
    fn static_wins_and_unknown_is_not_found() {
        let registry = Arc::new(StaticRegistry::new());
        registry.register("builtin", || Noop).unwrap();
        let discovery = Discovery::new(registry, vec![]);

        let (_, source) = discovery.load_handler("builtin").unwrap();
        assert_eq!(source, ModuleSource::Static);
        assert!(matches!(discovery.load_handler("ghost"), Err(ExtError::NotFound(n)) if n == "ghost"));
        assert!(matches!(discovery.load_handler("../ghost"), Err(ExtError::InvalidName(_))));
    }

    /// A real shared library with no descriptor export.
    #[cfg(all(target_os = "linux", feature = "dynamic"))]
    fn system_library() -> Option<PathBuf> {
        [
            "/lib/x86_64-linux-gnu/libm.so.6",
            "/usr/lib/x86_64-linux-gnu/libm.so.6",
            "/lib/aarch64-linux-gnu/libm.so.6",
            "/usr/lib/aarch64-linux-gnu/libm.so.6",
            "/lib64/libm.so.6",
            "/usr/lib64/libm.so.6",
            "/usr/lib/libm.so.6",
            "/lib/libm.so.6",
        ]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
    }

    #[cfg(all(target_os = "linux", feature = "dynamic"))]
    #[test]
    fn library_without_descriptor_is_a_malformed_entry_point() {
        let Some(libm) = system_library() else {
            eprintln!("no system libm found; skipping");
            return;
        };
        let tmp = tempfile::tempdir().unwrap();
        std::fs::copy(&libm, tmp.path().join(artifact("plain"))).unwrap();

        let discovery = Discovery::new(Arc::new(StaticRegistry::new()), vec![tmp.path().to_path_buf()]);
        assert_eq!(discovery.discover_all(), ["plain"]);
        match discovery.load_handler("plain") {
            Err(ExtError::MalformedEntryPoint { module, reason }) => {
                assert_eq!(module, "plain");
                assert!(reason.contains("missing descriptor symbol"), "{reason}");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("library without a descriptor must not load"),
        }
        assert!(discovery.list_dynamic().is_empty());
        // distinct from a name nothing provides
        assert!(matches!(discovery.load_handler("absent"), Err(ExtError::NotFound(_))));
    }

    #[test]
    fn garbage_artifact_is_an_open_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(artifact("broken"));
        std::fs::write(&path, b"definitely not a shared object").unwrap();

        let discovery = Discovery::new(Arc::new(StaticRegistry::new()), vec![tmp.path().to_path_buf()]);
        match discovery.load_handler("broken") {
            Err(ExtError::ArtifactOpen { module, path: p, .. }) => {
                assert_eq!(module, "broken");
                assert_eq!(p, path);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("garbage artifact must not load"),
        }
        assert!(discovery.list_dynamic().is_empty());
    }
}

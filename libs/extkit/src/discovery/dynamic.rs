#![allow(unsafe_code)]

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};

use super::{ModuleDescriptor, ABI_VERSION, DESCRIPTOR_SYMBOL};
use crate::contracts::ModuleHandler;
use crate::error::{ExtError, Result};

/// A handler produced by an opened artifact. Field order matters: the handler
/// must be dropped before the library that holds its code.
pub(crate) struct OpenedArtifact {
    pub(crate) handler: Arc<dyn ModuleHandler>,
    pub(crate) path: PathBuf,
    _lib: Library,
}

pub(crate) fn open(name: &str, path: &Path) -> Result<OpenedArtifact> {
    // SAFETY: opening runs the library's initialisers. Artifacts are only taken
    // from operator-configured plugin directories.
    let lib = unsafe { Library::new(path) }.map_err(|e| ExtError::ArtifactOpen {
        module: name.to_string(),
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let bad = |reason: String| malformed(name, reason);

    // SAFETY: `export_module!` declares the symbol as a `ModuleDescriptor`
    // static, so its address is a valid `*const ModuleDescriptor` for as long
    // as `lib` stays loaded.
    let descriptor: &ModuleDescriptor = unsafe {
        let sym: Symbol<*const ModuleDescriptor> = lib
            .get(DESCRIPTOR_SYMBOL)
            .map_err(|e| bad(format!("missing descriptor symbol: {e}")))?;
        let ptr = *sym;
        if ptr.is_null() {
            return Err(bad("descriptor symbol is null".to_string()));
        }
        &*ptr
    };

    let handler = instantiate(name, descriptor)?;

    tracing::info!(module = name, path = %path.display(), "dynamic module opened");
    Ok(OpenedArtifact {
        handler,
        path: path.to_path_buf(),
        _lib: lib,
    })
}

fn malformed(name: &str, reason: String) -> ExtError {
    ExtError::MalformedEntryPoint {
        module: name.to_string(),
        reason,
    }
}

/// Check the descriptor's ABI version and run its factory.
fn instantiate(name: &str, descriptor: &ModuleDescriptor) -> Result<Arc<dyn ModuleHandler>> {
    if descriptor.abi_version != ABI_VERSION {
        return Err(malformed(
            name,
            format!(
                "abi version {} does not match host abi version {ABI_VERSION}",
                descriptor.abi_version
            ),
        ));
    }
    let create = descriptor.create;
    catch_unwind(AssertUnwindSafe(create))
        .map(Arc::from)
        .map_err(|_| malformed(name, "factory panicked".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl ModuleHandler for Noop {}

    fn noop() -> Box<dyn ModuleHandler> {
        Box::new(Noop)
    }

    fn exploding() -> Box<dyn ModuleHandler> {
        panic!("factory failed")
    }

    #[test]
    fn matching_descriptor_produces_a_handler() {
        let descriptor = ModuleDescriptor {
            abi_version: ABI_VERSION,
            create: noop,
        };
        assert!(instantiate("ok", &descriptor).is_ok());
    }

    #[test]
    fn foreign_abi_version_is_malformed() {
        let descriptor = ModuleDescriptor {
            abi_version: ABI_VERSION + 1,
            create: noop,
        };
        match instantiate("future", &descriptor) {
            Err(ExtError::MalformedEntryPoint { module, reason }) => {
                assert_eq!(module, "future");
                assert!(reason.contains("abi version"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("foreign abi must not load"),
        }
    }

    #[test]
    fn panicking_factory_is_malformed() {
        let descriptor = ModuleDescriptor {
            abi_version: ABI_VERSION,
            create: exploding,
        };
        assert!(matches!(
            instantiate("boom", &descriptor),
            Err(ExtError::MalformedEntryPoint { .. })
        ));
    }
}

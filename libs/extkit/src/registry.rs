//! Compiled-in modules, registered explicitly by the host at bootstrap.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::contracts::ModuleHandler;
use crate::error::{ExtError, Result};
use crate::manifest::validate_module_name;

/// Produces a fresh handler instance each time a module is loaded.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn ModuleHandler> + Send + Sync>;

/// Name-to-factory map for modules linked into the host binary.
///
/// ```
/// use extkit::{ModuleHandler, StaticRegistry};
///
/// struct Hello;
/// impl ModuleHandler for Hello {}
///
/// let registry = StaticRegistry::new();
/// registry.register("hello", || Hello).unwrap();
/// assert!(registry.contains("hello"));
/// ```
#[derive(Default)]
pub struct StaticRegistry {
    factories: RwLock<BTreeMap<String, HandlerFactory>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`. A second registration under the same name is rejected.
    pub fn register<H, F>(&self, name: &str, factory: F) -> Result<()>
    where
        H: ModuleHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        validate_module_name(name)?;
        let mut factories = self.factories.write();
        if factories.contains_key(name) {
            return Err(ExtError::DuplicateRegistration(name.to_string()));
        }
        factories.insert(
            name.to_string(),
            Arc::new(move || Arc::new(factory()) as Arc<dyn ModuleHandler>),
        );
        tracing::debug!(module = name, "static module registered");
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }

    pub fn create(&self, name: &str) -> Option<Arc<dyn ModuleHandler>> {
        let factory = self.factories.read().get(name).cloned()?;
        Some(factory())
    }
}

use std::sync::Arc;

/// Tracing facade stamped with the owning module's name.
///
/// Every event goes to target `extension`, so hosts can route module output
/// to its own sink.
#[derive(Clone, Debug)]
pub struct ModuleLogger {
    module: Arc<str>,
}

impl ModuleLogger {
    pub(crate) fn new(module: Arc<str>) -> Self {
        Self { module }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn debug(&self, msg: &str) {
        tracing::debug!(target: "extension", module = %self.module, "{msg}");
    }

    pub fn info(&self, msg: &str) {
        tracing::info!(target: "extension", module = %self.module, "{msg}");
    }

    pub fn warn(&self, msg: &str) {
        tracing::warn!(target: "extension", module = %self.module, "{msg}");
    }

    pub fn error(&self, msg: &str) {
        tracing::error!(target: "extension", module = %self.module, "{msg}");
    }

    pub fn debug_with(&self, msg: &str, data: &serde_json::Value) {
        tracing::debug!(target: "extension", module = %self.module, data = %data, "{msg}");
    }

    pub fn info_with(&self, msg: &str, data: &serde_json::Value) {
        tracing::info!(target: "extension", module = %self.module, data = %data, "{msg}");
    }

    pub fn warn_with(&self, msg: &str, data: &serde_json::Value) {
        tracing::warn!(target: "extension", module = %self.module, data = %data, "{msg}");
    }

    pub fn error_with(&self, msg: &str, data: &serde_json::Value) {
        tracing::error!(target: "extension", module = %self.module, data = %data, "{msg}");
    }
}

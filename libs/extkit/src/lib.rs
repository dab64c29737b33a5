//! # extkit - extension runtime
//!
//! Loads extension modules into the host, hands each one a scoped
//! [`ModuleCtx`] (storage, database, events, HTTP endpoints, UI components,
//! scheduled jobs, logging) and fans platform events out to them in isolation.
//!
//! ## Example
//!
//! ```rust,ignore
//! use extkit::{async_trait, ModuleCtx, ModuleHandler, StaticRegistry};
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl ModuleHandler for Hello {
//!     async fn on_load(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
//!         ctx.api().get("/hello", || async { "hi" })?;
//!         Ok(())
//!     }
//! }
//!
//! let registry = StaticRegistry::new();
//! registry.register("hello", || Hello)?;
//! ```
//!
//! Modules built as separate dynamic libraries expose their handler with
//! [`export_module!`].

pub use async_trait::async_trait;

pub mod error;
pub use error::{ExtError, Result};

// Module contract and context
pub mod contracts;
pub use contracts::{EventPayload, ModuleHandler, PlatformEvent};
pub mod context;
pub use context::{HostServices, ModuleCtx, ModuleCtxBuilder};

// Metadata and persistence
pub mod manifest;
pub use manifest::{CatalogEntry, InstalledModuleRecord, ModuleManifest, NewInstall};
pub mod store;
pub use store::{migrate, CatalogStore, EnabledListing, InstalledStore};

// Host services scoped per module
pub mod api;
pub use api::{ApiRegistry, EndpointDescriptor, EndpointOptions, HttpMethod, ModuleApi};
pub mod events;
pub use events::{EventBus, ModuleEvents};
pub mod logger;
pub use logger::ModuleLogger;
pub mod scheduler;
pub use scheduler::{CronService, JobInfo, ModuleScheduler};
pub mod storage;
pub use storage::{ModuleDatabase, ModuleStorage, StorageEntry};
pub mod ui;
pub use ui::{MenuItem, ModuleUi, Page, UiKind, UiManifest, UiRegistry, Widget};

// Loading and lifecycle
pub mod discovery;
pub use discovery::{Discovery, ModuleSource};
pub mod registry;
pub use registry::StaticRegistry;
pub mod runtime;
pub use runtime::{ExtensionRuntime, ModuleInfo, RuntimeOptions, StartupReport};

// Distribution
pub mod marketplace;
pub use marketplace::{Marketplace, MarketplaceOptions, SyncOutcome};

mod isolate;

/// Export a module handler from a dynamic-library artifact.
///
/// Expands to the descriptor static the host looks up when it opens the
/// artifact. `$factory` is evaluated on every load.
///
/// ```rust,ignore
/// extkit::export_module!(MyModule::default());
/// ```
#[macro_export]
macro_rules! export_module {
    ($factory:expr) => {
        #[allow(unsafe_code)]
        #[no_mangle]
        pub static EXTKIT_MODULE_DESCRIPTOR: $crate::discovery::ModuleDescriptor =
            $crate::discovery::ModuleDescriptor {
                abi_version: $crate::discovery::ABI_VERSION,
                create: {
                    fn __extkit_create() -> ::std::boxed::Box<dyn $crate::ModuleHandler> {
                        ::std::boxed::Box::new($factory)
                    }
                    __extkit_create
                },
            };
    };
}

//! Host plumbing shared by the binaries: layered configuration, logging
//! setup and home directory resolution.

pub mod config;
pub mod logging;
pub mod paths;

pub use config::{AppConfig, CliArgs, ExtensionsConfig};
pub use logging::init_logging_from_config;

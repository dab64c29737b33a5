use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::home_dir::resolve_home_dir;

/// Default home subdirectory under `$HOME` (or `%APPDATA%`).
pub const DEFAULT_HOME_SUBDIR: &str = ".extension-host";

/// Host configuration: typed global sections plus a per-module config bag.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    /// Uses [`default_logging_config`] when absent.
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub extensions: ExtensionsConfig,
    /// Directory of `<module>.yaml` files merged into `modules`.
    #[serde(default)]
    pub modules_dir: Option<String>,
    /// module name → raw config, used when a module has no install record.
    #[serde(default)]
    pub modules: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Normalized to an absolute path on load.
    pub home_dir: String,
    pub host: String,
    pub port: u16,
    /// Request timeout for the HTTP surface; 0 disables it.
    #[serde(default)]
    pub timeout_sec: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite DSN, e.g. `sqlite://database/extensions.db` (relative to home_dir)
    /// or `sqlite::memory:`.
    pub url: String,
    pub max_conns: Option<u32>,
    pub busy_timeout_ms: Option<u32>,
}

/// Settings of the extension runtime and marketplace.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtensionsConfig {
    /// Directories scanned for dynamic module artifacts (relative to home_dir).
    pub plugin_dirs: Vec<String>,
    /// Where the marketplace unpacks modules (relative to home_dir).
    pub install_dir: String,
    /// Catalog base URL. The marketplace is disabled when unset.
    pub repository_url: Option<String>,
    #[serde(with = "humantime_serde")]
    pub catalog_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
    /// Load enabled modules at startup.
    pub auto_start: bool,
    #[serde(with = "humantime_serde")]
    pub lifecycle_timeout: Duration,
    /// Per-module event queue capacity.
    pub dispatch_queue: usize,
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            plugin_dirs: vec!["plugins".to_string()],
            install_dir: "extensions".to_string(),
            repository_url: None,
            catalog_ttl: Duration::from_secs(15 * 60),
            http_timeout: Duration::from_secs(30),
            auto_start: true,
            lifecycle_timeout: Duration::from_secs(30),
            dispatch_queue: 256,
        }
    }
}

impl ExtensionsConfig {
    pub fn install_dir_in(&self, home_dir: &Path) -> PathBuf {
        anchor(&self.install_dir, home_dir)
    }

    /// Plugin directories followed by the install directory, deduplicated.
    pub fn scan_dirs_in(&self, home_dir: &Path) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        let all = self
            .plugin_dirs
            .iter()
            .map(|d| anchor(d, home_dir))
            .chain(std::iter::once(self.install_dir_in(home_dir)));
        for dir in all {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        dirs
    }
}

fn anchor(raw: &str, home_dir: &Path) -> PathBuf {
    let p = Path::new(raw);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        home_dir.join(p)
    }
}

/// Logging configuration: subsystem (target prefix) → settings.
/// Key "default" catches everything no other section claims.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    /// "trace" | "debug" | "info" | "warn" | "error" | "off"
    pub console_level: String,
    /// Empty disables file output for this section.
    pub file: String,
    #[serde(default)]
    pub file_level: String,
    /// Rotate daily and keep this many days, unless `max_backups` is set.
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // empty => platform default, see resolve_home_dir()
            home_dir: String::new(),
            host: "127.0.0.1".to_string(),
            port: 8087,
            timeout_sec: 0,
        }
    }
}

pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/extension-host.log".to_string(),
            file_level: "debug".to_string(),
            max_age_days: Some(7),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

/// Used when the config file has no `database` section.
pub fn default_database_config() -> DatabaseConfig {
    DatabaseConfig {
        url: "sqlite://database/extensions.db".to_string(),
        max_conns: Some(10),
        busy_timeout_ms: Some(5000),
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: Some(default_database_config()),
            logging: Some(default_logging_config()),
            extensions: ExtensionsConfig::default(),
            modules_dir: None,
            modules: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Layered load: defaults → YAML file → `APP__` environment variables.
    /// Normalizes `server.home_dir` to an absolute path and creates it.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let config_path = config_path.as_ref();
        if !config_path.is_file() {
            anyhow::bail!("config file {} not found", config_path.display());
        }

        // optional sections stay None unless YAML/ENV provide them
        let base = AppConfig {
            server: ServerConfig::default(),
            database: None,
            logging: None,
            extensions: ExtensionsConfig::default(),
            modules_dir: None,
            modules: HashMap::new(),
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(config_path))
            // APP__EXTENSIONS__AUTO_START=false maps to extensions.auto_start
            .merge(Env::prefixed("APP__").split("__"));

        let mut config: AppConfig = figment
            .extract()
            .with_context(|| format!("invalid config {}", config_path.display()))?;

        normalize_home_dir_inplace(&mut config.server)
            .context("failed to resolve server.home_dir")?;

        if let Some(dir) = config.modules_dir.clone() {
            merge_module_files(&mut config.modules, dir)?;
        }

        Ok(config)
    }

    /// Load from `config_path` when given, otherwise use defaults.
    /// `server.home_dir` is normalized either way.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let mut c = Self::default();
                normalize_home_dir_inplace(&mut c.server)
                    .context("failed to resolve server.home_dir (defaults)")?;
                Ok(c)
            }
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to serialize config to YAML")
    }

    pub fn home_dir(&self) -> &Path {
        Path::new(&self.server.home_dir)
    }

    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.server.port = port;
        }

        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut("default") {
            match args.verbose {
                0 => {}
                1 => default_section.console_level = "debug".to_string(),
                _ => default_section.console_level = "trace".to_string(),
            }
        }
    }
}

/// Command line arguments relevant to configuration.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub port: Option<u16>,
    pub print_config: bool,
    pub verbose: u8,
}

fn normalize_home_dir_inplace(server: &mut ServerConfig) -> Result<()> {
    let explicit = Some(server.home_dir.clone()).filter(|s| !s.trim().is_empty());
    let resolved = resolve_home_dir(explicit, DEFAULT_HOME_SUBDIR, true)?;
    server.home_dir = resolved.to_string_lossy().into_owned();
    Ok(())
}

fn merge_module_files(
    bag: &mut HashMap<String, serde_json::Value>,
    dir: impl AsRef<Path>,
) -> Result<()> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let is_yaml = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yml") || e.eq_ignore_ascii_case("yaml"));
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !is_yaml {
            continue;
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let val: serde_yaml::Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid YAML in {}", path.display()))?;
        bag.insert(name.to_string(), serde_json::to_value(val)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn is_normalized_path(p: &str) -> bool {
        PathBuf::from(p).is_absolute() && !p.starts_with('~')
    }

    fn write_config(dir: &Path, yaml: &str) -> PathBuf {
        let path = dir.join("cfg.yaml");
        fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8087);
        assert_eq!(config.server.home_dir, "");

        let db = config.database.as_ref().unwrap();
        assert_eq!(db.url, "sqlite://database/extensions.db");

        let ext = &config.extensions;
        assert_eq!(ext.catalog_ttl, Duration::from_secs(900));
        assert_eq!(ext.http_timeout, Duration::from_secs(30));
        assert_eq!(ext.lifecycle_timeout, Duration::from_secs(30));
        assert_eq!(ext.dispatch_queue, 256);
        assert!(ext.auto_start);
        assert!(ext.repository_url.is_none());

        let logging = config.logging.as_ref().unwrap();
        assert_eq!(logging["default"].file, "logs/extension-host.log");
    }

    #[test]
    fn layered_load_reads_extensions_section() {
        let tmp = tempdir().unwrap();
        let home = tmp.path().join("home");
        let yaml = format!(
            r#"
server:
  home_dir: "{}"
  host: "0.0.0.0"
  port: 9090

database:
  url: "sqlite::memory:"

extensions:
  plugin_dirs: ["plugins", "/opt/ext"]
  repository_url: "http://127.0.0.1:1/repo"
  catalog_ttl: 1h
  lifecycle_timeout: 500ms
  auto_start: false

modules:
  session_audit:
    retention_days: 7
"#,
            home.to_string_lossy().replace('\\', "/")
        );
        let config = AppConfig::load_layered(write_config(tmp.path(), &yaml)).unwrap();

        assert!(is_normalized_path(&config.server.home_dir));
        assert!(home.is_dir());
        assert_eq!(config.server.port, 9090);

        let ext = &config.extensions;
        assert_eq!(ext.catalog_ttl, Duration::from_secs(3600));
        assert_eq!(ext.lifecycle_timeout, Duration::from_millis(500));
        assert!(!ext.auto_start);
        // untouched fields keep their defaults
        assert_eq!(ext.dispatch_queue, 256);
        assert_eq!(ext.install_dir, "extensions");

        let dirs = ext.scan_dirs_in(config.home_dir());
        assert_eq!(
            dirs,
            [
                config.home_dir().join("plugins"),
                PathBuf::from("/opt/ext"),
                config.home_dir().join("extensions"),
            ]
        );
        assert_eq!(config.modules["session_audit"]["retention_days"], 7);
        assert!(config.logging.is_none());
    }

    #[test]
    fn tilde_home_dir_is_expanded() {
        let tmp = tempdir().unwrap();
        let yaml = r#"
server:
  home_dir: "~/.extension_host_test"
  host: "localhost"
  port: 8080
"#;
        let config = AppConfig::load_layered(write_config(tmp.path(), yaml)).unwrap();
        assert!(is_normalized_path(&config.server.home_dir));
        assert!(config.server.home_dir.ends_with(".extension_host_test"));
        assert!(config.database.is_none());
    }

    #[test]
    fn unknown_extension_keys_are_rejected() {
        let tmp = tempdir().unwrap();
        let yaml = r#"
server:
  home_dir: "~/.extension_host_test"
  host: "localhost"
  port: 8080
extensions:
  plugin_dir: "typo"
"#;
        assert!(AppConfig::load_layered(write_config(tmp.path(), yaml)).is_err());
    }

    #[test]
    fn cli_verbosity_matrix() {
        for (verbose, expected) in [(0, "info"), (1, "debug"), (2, "trace"), (3, "trace")] {
            let mut config = AppConfig::default();
            config.apply_cli_overrides(&CliArgs {
                port: Some(3000),
                verbose,
                ..Default::default()
            });
            assert_eq!(config.server.port, 3000);
            assert_eq!(config.logging.as_ref().unwrap()["default"].console_level, expected);
        }
    }

    #[test]
    fn modules_dir_is_merged() {
        let tmp = tempdir().unwrap();
        let modules_dir = tmp.path().join("modules");
        fs::create_dir_all(&modules_dir).unwrap();
        fs::write(modules_dir.join("session_audit.yaml"), "retention_days: 30\n").unwrap();
        fs::write(modules_dir.join("notes.txt"), "ignored").unwrap();

        let yaml = format!(
            r#"
server:
  home_dir: "~/.extension_host_test"
  host: "127.0.0.1"
  port: 8087
modules_dir: "{}"
modules:
  other:
    key: "value"
"#,
            modules_dir.to_string_lossy().replace('\\', "/")
        );
        let config = AppConfig::load_layered(write_config(tmp.path(), &yaml)).unwrap();
        assert_eq!(config.modules.len(), 2);
        assert_eq!(config.modules["session_audit"]["retention_days"], 30);
    }

    #[test]
    fn yaml_roundtrip() {
        let config = AppConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("extensions:"));
        assert!(yaml.contains("catalog_ttl: 15m"));

        let back: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.extensions.catalog_ttl, config.extensions.catalog_ttl);
    }
}

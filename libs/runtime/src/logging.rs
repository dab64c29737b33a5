//! `tracing` setup driven by the `logging` config section.
//!
//! Every non-default section names a target prefix (a crate such as
//! `api_ingress`, or `extension` for module loggers). Records under a prefix
//! go to that section's console level and rotating JSON file; everything
//! else falls through to the `default` section.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use parking_lot::Mutex;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::filter::{FilterFn, Targets};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, Registry};

use crate::config::{LoggingConfig, Section};

const DEFAULT_SECTION: &str = "default";
const DEFAULT_MAX_SIZE_MB: u64 = 100;

// ---- levels ----

/// `None` means the output is switched off. Unknown names fall back to INFO.
fn parse_level(s: &str) -> Option<Level> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        "off" | "none" => None,
        _ => Some(Level::INFO),
    }
}

/// `target` is `prefix` itself or nested below it (`prefix::...`).
fn under_prefix(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

type FallbackFilter = FilterFn<Box<dyn Fn(&tracing::Metadata<'_>) -> bool + Send + Sync>>;

/// Accepts records no explicit subsystem claims, up to `max`.
fn fallback_filter(claimed: Vec<String>, max: Level) -> FallbackFilter {
    FilterFn::new(Box::new(move |meta: &tracing::Metadata<'_>| {
        !claimed.iter().any(|p| under_prefix(meta.target(), p)) && *meta.level() <= max
    }))
}

// ---- rotating files ----

type SharedRotate = Arc<Mutex<FileRotate<AppendTimestamp>>>;

#[derive(Clone)]
struct FileSink(SharedRotate);

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().flush()
    }
}

/// Writer that discards everything when no file is routed.
struct MaybeSink(Option<FileSink>);

impl Write for MaybeSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.0 {
            Some(sink) => sink.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.0 {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }
}

/// Picks the file of the longest matching subsystem prefix, else the default file.
#[derive(Clone, Default)]
struct FileRouter {
    fallback: Option<SharedRotate>,
    by_prefix: Vec<(String, SharedRotate)>,
}

impl FileRouter {
    fn route(&self, target: &str) -> Option<FileSink> {
        self.by_prefix
            .iter()
            .filter(|(prefix, _)| under_prefix(target, prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, file)| file)
            .or(self.fallback.as_ref())
            .map(|file| FileSink(file.clone()))
    }

    fn is_empty(&self) -> bool {
        self.fallback.is_none() && self.by_prefix.is_empty()
    }
}

impl<'a> MakeWriter<'a> for FileRouter {
    type Writer = MaybeSink;

    fn make_writer(&'a self) -> Self::Writer {
        MaybeSink(self.fallback.clone().map(FileSink))
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        MaybeSink(self.route(meta.target()))
    }
}

/// Relative paths are anchored at `base_dir` (the host home directory).
fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

fn open_rotating(section: &Section, base_dir: &Path) -> std::io::Result<Option<SharedRotate>> {
    if section.file.trim().is_empty() {
        return Ok(None);
    }
    let path = resolve_log_path(&section.file, base_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let limit = match (section.max_backups, section.max_age_days) {
        (Some(n), _) => FileLimit::MaxFiles(n.max(1)),
        (None, Some(days)) => FileLimit::Age(chrono::Duration::days(i64::from(days.max(1)))),
        (None, None) => FileLimit::MaxFiles(3),
    };
    let max_bytes = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB).max(1) * 1024 * 1024;

    let rotate = FileRotate::new(
        &path,
        AppendTimestamp::default(limit),
        ContentLimit::BytesSurpassed(max_bytes as usize),
        Compression::None,
        #[cfg(unix)]
        None,
    );
    Ok(Some(Arc::new(Mutex::new(rotate))))
}

// ---- plan ----

/// Everything derived from the config before any subscriber is installed.
struct Plan {
    console: Targets,
    files: Targets,
    router: FileRouter,
    claimed: Vec<String>,
    fallback_console: Option<Level>,
    fallback_file: Option<Level>,
}

fn plan(cfg: &LoggingConfig, base_dir: &Path) -> Plan {
    let mut console = Targets::new().with_default(LevelFilter::OFF);
    let mut files = Targets::new().with_default(LevelFilter::OFF);
    let mut router = FileRouter::default();
    let mut claimed = Vec::new();

    let mut subsystems: Vec<(&String, &Section)> =
        cfg.iter().filter(|(k, _)| k.as_str() != DEFAULT_SECTION).collect();
    subsystems.sort_by(|a, b| a.0.cmp(b.0));

    for (prefix, section) in subsystems {
        claimed.push(prefix.clone());
        if let Some(level) = parse_level(&section.console_level) {
            console = console.with_target(prefix.clone(), LevelFilter::from_level(level));
        }
        match open_rotating(section, base_dir) {
            Ok(Some(file)) => {
                if let Some(level) = parse_level(&section.file_level) {
                    files = files.with_target(prefix.clone(), LevelFilter::from_level(level));
                }
                router.by_prefix.push((prefix.clone(), file));
            }
            Ok(None) => {}
            Err(e) => eprintln!("cannot open log file '{}' for '{prefix}': {e}", section.file),
        }
    }

    let default = cfg.get(DEFAULT_SECTION);
    if let Some(section) = default {
        match open_rotating(section, base_dir) {
            Ok(file) => router.fallback = file,
            Err(e) => eprintln!("cannot open default log file '{}': {e}", section.file),
        }
    }

    Plan {
        console,
        files,
        claimed,
        fallback_console: default.and_then(|s| parse_level(&s.console_level)),
        fallback_file: default
            .filter(|_| router.fallback.is_some())
            .and_then(|s| parse_level(&s.file_level)),
        router,
    }
}

// ---- init ----

/// Install the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init_logging_from_config(cfg: &LoggingConfig, base_dir: &Path) {
    // bridge `log` records before the subscriber goes in
    let _ = tracing_log::LogTracer::init();

    if cfg.is_empty() {
        let _ = tracing_subscriber::fmt()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .try_init();
        return;
    }

    let plan = plan(cfg, base_dir);
    let ansi = atty::is(atty::Stream::Stdout);

    let console_layer = || {
        fmt::layer()
            .with_ansi(ansi)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
    };
    let file_layer = |router: FileRouter| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(router)
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(console_layer().with_filter(plan.console).boxed());
    if !plan.router.is_empty() {
        layers.push(file_layer(plan.router.clone()).with_filter(plan.files).boxed());
    }
    if let Some(level) = plan.fallback_console {
        layers.push(
            console_layer()
                .with_filter(fallback_filter(plan.claimed.clone(), level))
                .boxed(),
        );
    }
    if let Some(level) = plan.fallback_file {
        layers.push(
            file_layer(plan.router.clone())
                .with_filter(fallback_filter(plan.claimed.clone(), level))
                .boxed(),
        );
    }

    let _ = Registry::default().with(layers).try_init();
}

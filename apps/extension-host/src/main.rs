use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use api_ingress::ApiIngress;
use clap::{Parser, Subcommand};
use extkit::{Discovery, ExtensionRuntime, HostServices, Marketplace, StaticRegistry};
use extkit_db::{ConnectOpts, DbHandle};
use mimalloc::MiMalloc;
use runtime::config::default_database_config;
use runtime::{AppConfig, CliArgs};
use tokio_util::sync::CancellationToken;

mod bootstrap;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Extension host - loads extension modules and serves their endpoints
#[derive(Parser)]
#[command(name = "extension-host")]
#[command(about = "Extension host - loads extension modules and serves their endpoints")]
#[command(version, arg_required_else_help = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port for HTTP server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print current configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the host: load enabled modules and serve HTTP
    Run,
    /// Validate the configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        port: cli.port,
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    // home_dir is normalized (absolute, created) inside
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.clone().unwrap_or_default();
    runtime::init_logging_from_config(&logging_config, config.home_dir());

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command {
        Some(Commands::Check) => check_config(&config),
        Some(Commands::Run) | None => run_host(config).await,
    }
}

async fn run_host(config: AppConfig) -> Result<()> {
    tracing::info!(home = %config.home_dir().display(), "extension host starting");
    let home = config.home_dir().to_path_buf();
    let ingress_config = bootstrap::ingress_config(&config)?;
    let marketplace_options = bootstrap::marketplace_options(&config.extensions, &home)?;

    // database
    let db_config = config.database.clone().unwrap_or_else(default_database_config);
    let dsn = bootstrap::absolutize_sqlite_dsn(&db_config.url, &home)?;
    let connect_opts = ConnectOpts {
        max_conns: db_config.max_conns,
        acquire_timeout: Some(Duration::from_secs(5)),
        busy_timeout: db_config
            .busy_timeout_ms
            .map(|ms| Duration::from_millis(u64::from(ms)))
            .unwrap_or(Duration::from_millis(5000)),
        create_dirs: true,
    };
    tracing::info!(dsn = %dsn, "connecting to database");
    let db = DbHandle::connect(&dsn, connect_opts)
        .await
        .with_context(|| format!("cannot open database {dsn}"))?;
    extkit::migrate(db.pool())
        .await
        .context("database migration failed")?;

    // modules
    let registry = Arc::new(StaticRegistry::new());
    bootstrap::register_static_modules(&registry)?;
    let services = HostServices::new(db.clone());
    let discovery = Discovery::new(registry.clone(), config.extensions.scan_dirs_in(&home));
    let runtime = Arc::new(ExtensionRuntime::new(
        services,
        discovery,
        bootstrap::runtime_options(&config.extensions),
    ));
    bootstrap::sync_static_records(
        runtime.installed_store(),
        &registry,
        &config,
        env!("CARGO_PKG_VERSION"),
    )
    .await?;

    let report = runtime.startup().await.context("extension runtime startup failed")?;
    for (name, error) in &report.failed {
        tracing::warn!(module = %name, error = %error, "module not loaded");
    }

    let cancel = CancellationToken::new();

    if let Some(options) = marketplace_options {
        let marketplace = Marketplace::new(db.pool().clone(), options)?;
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                synced = marketplace.sync_catalog() => match synced {
                    Ok(outcome) => tracing::info!(entries = outcome.entries, "catalog synchronized"),
                    Err(e) => tracing::warn!(error = %e, "initial catalog sync failed"),
                },
            }
        });
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutdown signal received"),
                Err(e) => tracing::error!(error = %e, "cannot listen for shutdown signal"),
            }
            cancel.cancel();
        });
    }

    let ingress = Arc::new(ApiIngress::for_runtime(ingress_config, runtime.clone()));
    let served = ingress.serve(cancel.clone()).await;

    cancel.cancel();
    runtime.shutdown().await;
    db.close().await;
    tracing::info!("extension host stopped");
    served
}

fn check_config(config: &AppConfig) -> Result<()> {
    tracing::info!("checking configuration");
    let home = config.home_dir();
    bootstrap::ingress_config(config)?;
    bootstrap::marketplace_options(&config.extensions, home)?;
    let db_config = config.database.clone().unwrap_or_else(default_database_config);
    bootstrap::absolutize_sqlite_dsn(&db_config.url, home)?;

    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);
    Ok(())
}

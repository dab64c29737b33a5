#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use extkit::{Discovery, ExtensionRuntime, HostServices, RuntimeOptions, StaticRegistry};
use extkit_db::{ConnectOpts, DbHandle};
use parking_lot::Mutex;

/// Fresh in-memory database with the runtime schema applied.
pub async fn services() -> HostServices {
    let db = DbHandle::connect("sqlite::memory:", ConnectOpts::default())
        .await
        .expect("in-memory database");
    extkit::migrate(db.pool()).await.expect("migrate");
    HostServices::new(db)
}

pub fn runtime(
    services: HostServices,
    registry: Arc<StaticRegistry>,
    options: RuntimeOptions,
) -> ExtensionRuntime {
    ExtensionRuntime::new(services, Discovery::new(registry, vec![]), options)
}

pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        lifecycle_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn wait_until<F: Fn() -> bool>(within: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Shared append-only log handed to test modules.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().iter().any(|e| e == entry)
    }
}

pub async fn timeout<F: Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("timed out")
}

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use extkit::{ExtError, HostServices, ModuleCtx, ModuleCtxBuilder, Page};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{services, wait_until};

fn ctx(services: &HostServices, name: &str) -> ModuleCtx {
    ModuleCtxBuilder::new(name, CancellationToken::new())
        .with_version("1.0.0")
        .with_config(json!({ "retention": 30, "label": "main" }))
        .build(services)
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct Counters {
    created: u64,
    deleted: u64,
}

#[tokio::test]
async fn storage_is_namespaced_per_module() {
    let services = services().await;
    let audit = ctx(&services, "audit");
    let billing = ctx(&services, "billing");

    audit.storage().set("counters", &Counters { created: 2, deleted: 1 }).await.unwrap();
    billing.storage().set("counters", &json!("other")).await.unwrap();

    let counters: Counters = audit.storage().get_as("counters").await.unwrap().unwrap();
    assert_eq!(counters, Counters { created: 2, deleted: 1 });
    assert_eq!(billing.storage().get("counters").await.unwrap(), Some(json!("other")));
    assert_eq!(audit.storage().get("missing").await.unwrap(), None);

    // overwrite keeps the creation time
    let before = audit.storage().entry("counters").await.unwrap().unwrap();
    audit.storage().set("counters", &Counters::default()).await.unwrap();
    let after = audit.storage().entry("counters").await.unwrap().unwrap();
    assert_eq!(before.created_at, after.created_at);
    assert_eq!(after.value, json!({ "created": 0, "deleted": 0 }));

    assert_eq!(audit.storage().clear().await.unwrap(), 1);
    assert!(billing.storage().get("counters").await.unwrap().is_some());
}

#[tokio::test]
async fn storage_keys_match_prefix_literally() {
    let services = services().await;
    let m = ctx(&services, "m");
    for key in ["session:1", "session:2", "Session:3", "session_x", "sessionAx", "user:1"] {
        m.storage().set(key, &1).await.unwrap();
    }

    assert_eq!(m.storage().keys("session:").await.unwrap(), ["session:1", "session:2"]);
    assert_eq!(m.storage().keys("session_").await.unwrap(), ["session_x"]);
    assert_eq!(m.storage().keys("").await.unwrap().len(), 6);

    assert!(m.storage().delete("user:1").await.unwrap());
    assert!(!m.storage().delete("user:1").await.unwrap());
}

#[tokio::test]
async fn look_alike_modules_get_separate_tables() {
    let services = services().await;
    let dashed = ctx(&services, "foo-bar").db().clone();
    let underscored = ctx(&services, "foo_bar").db().clone();
    let short = ctx(&services, "foo").db().clone();

    let a = dashed.create_table("t", "v TEXT").await.unwrap();
    let b = underscored.create_table("t", "v TEXT").await.unwrap();
    let c = short.create_table("bar_t", "v TEXT").await.unwrap();
    assert_ne!(a, b);
    assert_ne!(a, c);
    assert_ne!(b, c);

    dashed.execute(&format!("INSERT INTO {a} (v) VALUES ('dashed')")).await.unwrap();
    let rows: Vec<(String,)> = sqlx::query_as(&format!("SELECT v FROM {b}"))
        .fetch_all(underscored.pool())
        .await
        .unwrap();
    assert!(rows.is_empty());
    let rows: Vec<(String,)> = sqlx::query_as(&format!("SELECT v FROM {c}"))
        .fetch_all(short.pool())
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn module_tables_are_prefixed() {
    let services = services().await;
    let m = ctx(&services, "session-audit");
    let db = m.db();

    assert_eq!(db.table_name("events").unwrap(), "ext_session_1audit__events");
    assert!(matches!(db.table_name("x; DROP TABLE y"), Err(ExtError::InvalidIdentifier(_))));
    assert!(matches!(db.table_name(""), Err(ExtError::InvalidIdentifier(_))));

    let table = db
        .create_table("events", "id INTEGER PRIMARY KEY, kind TEXT NOT NULL")
        .await
        .unwrap();
    assert_eq!(
        db.execute(&format!("INSERT INTO {table} (kind) VALUES ('a'), ('b')"))
            .await
            .unwrap(),
        2
    );

    let insert = format!("INSERT INTO {table} (kind) VALUES ('c')");
    let committed: u64 = db
        .transaction(|tx| {
            Box::pin(async move {
                let done = sqlx::query(&insert).execute(&mut **tx).await?;
                Ok(done.rows_affected())
            })
        })
        .await
        .unwrap();
    assert_eq!(committed, 1);

    let insert = format!("INSERT INTO {table} (kind) VALUES ('d')");
    let rolled_back: extkit::Result<()> = db
        .transaction(|tx| {
            Box::pin(async move {
                sqlx::query(&insert).execute(&mut **tx).await?;
                Err(ExtError::InvalidIdentifier("abort".into()))
            })
        })
        .await;
    assert!(rolled_back.is_err());

    let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(count, 3);
}

#[tokio::test]
async fn config_accessors() {
    #[derive(Debug, Default, Deserialize)]
    struct Cfg {
        retention: u32,
        #[serde(default)]
        label: String,
    }
    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct Strict {
        endpoint: String,
    }

    let services = services().await;
    let m = ctx(&services, "cfg");
    let cfg: Cfg = m.config_as();
    assert_eq!(cfg.retention, 30);
    assert_eq!(cfg.label, "main");
    assert!(m.config_required::<Strict>().is_err());
    assert_eq!(m.manifest().name, "cfg");
    assert_eq!(m.version(), "1.0.0");
}

#[tokio::test]
async fn rescheduling_replaces_the_job() {
    let services = services().await;
    let m = ctx(&services, "jobs");
    let old_runs = Arc::new(AtomicUsize::new(0));
    let new_runs = Arc::new(AtomicUsize::new(0));

    let o = old_runs.clone();
    m.scheduler()
        .schedule("tick", "* * * * * *", move || {
            let o = o.clone();
            async move {
                o.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
        .unwrap();
    // the first schedule has to be live before it is replaced
    assert!(wait_until(Duration::from_secs(3), || old_runs.load(Ordering::SeqCst) >= 1).await);

    let n = new_runs.clone();
    m.scheduler()
        .schedule("tick", "* * * * * *", move || {
            let n = n.clone();
            async move {
                n.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let frozen = old_runs.load(Ordering::SeqCst);

    assert_eq!(m.scheduler().list_jobs().len(), 1);
    assert!(wait_until(Duration::from_secs(4), || new_runs.load(Ordering::SeqCst) >= 2).await);
    assert_eq!(old_runs.load(Ordering::SeqCst), frozen);

    assert!(m.scheduler().remove("tick"));
    services.cron.shutdown().await;
}

#[tokio::test]
async fn ui_components_are_owned_and_conflicts_rejected() {
    let services = services().await;
    let a = ctx(&services, "a");
    let b = ctx(&services, "b");

    let page = Page {
        id: "settings".into(),
        title: "Settings".into(),
        path: "/settings".into(),
        order: 2,
        ..Default::default()
    };
    a.ui().admin_page(page.clone()).unwrap();
    // a different owner may reuse the id
    b.ui().admin_page(Page { order: 1, ..page.clone() }).unwrap();
    assert!(matches!(a.ui().admin_page(page), Err(ExtError::UiConflict { .. })));

    let manifest = services.ui.manifest();
    let owners: Vec<&str> = manifest.admin_pages.iter().map(|p| p.module.as_str()).collect();
    assert_eq!(owners, ["b", "a"]);

    assert!(a.ui().unregister(extkit::UiKind::AdminPage, "settings"));
    assert_eq!(services.ui.count_for("a"), 0);
    assert_eq!(services.ui.count_for("b"), 1);
}

#[tokio::test]
async fn endpoints_are_namespaced_and_served() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    let services = services().await;
    let m = ctx(&services, "audit");
    let desc = m.api().get("/status", || async { "up" }).unwrap();
    assert_eq!(desc.path, "/extensions/audit/status");
    assert!(matches!(m.api().get("/status", || async { "dup" }), Err(ExtError::EndpointConflict { .. })));

    let response = services
        .api
        .router()
        .oneshot(Request::get("/extensions/audit/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"up");
}

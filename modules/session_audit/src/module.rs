use async_trait::async_trait;
use chrono::Utc;
use extkit::{EventPayload, MenuItem, ModuleCtx, ModuleHandler, ModuleLogger, ModuleStorage, PlatformEvent, Widget};
use serde_json::json;

use crate::config::SessionAuditConfig;
use crate::domain::{
    push_recent, AuditRecord, Counters, SessionEventKind, Summary, COUNTERS_KEY, RECENT_KEY,
    SUMMARY_KEY,
};
use crate::RECORDED_EVENT;

const SUMMARY_JOB: &str = "summary";

#[derive(Debug, Default)]
pub struct SessionAudit;

impl SessionAudit {
    async fn record(&self, ctx: &ModuleCtx, event: PlatformEvent, payload: &EventPayload) -> anyhow::Result<()> {
        let Some(kind) = SessionEventKind::from_platform(event) else {
            return Ok(());
        };
        let cfg: SessionAuditConfig = ctx.config_as();
        let now = Utc::now();
        let storage = ctx.storage();

        let mut counters: Counters = storage.get_as(COUNTERS_KEY).await?.unwrap_or_default();
        counters.bump(kind, now);
        storage.set(COUNTERS_KEY, &counters).await?;

        let record = AuditRecord::from_payload(kind, payload, now);
        let mut recent: Vec<AuditRecord> = storage.get_as(RECENT_KEY).await?.unwrap_or_default();
        push_recent(&mut recent, record.clone(), cfg.keep_recent);
        storage.set(RECENT_KEY, &recent).await?;

        if cfg.announce {
            ctx.events().emit(RECORDED_EVENT, serde_json::to_value(&record)?);
        }
        ctx.logger().debug_with(
            "session event recorded",
            &json!({ "event": event.as_str(), "total": counters.total() }),
        );
        Ok(())
    }
}

async fn write_summary(storage: ModuleStorage, logger: ModuleLogger) -> anyhow::Result<()> {
    let counters: Counters = storage.get_as(COUNTERS_KEY).await?.unwrap_or_default();
    let summary = Summary {
        total: counters.total(),
        live: counters.live(),
        generated_at: Utc::now(),
    };
    storage.set(SUMMARY_KEY, &summary).await?;
    logger.info_with("session summary", &serde_json::to_value(&summary)?);
    Ok(())
}

#[async_trait]
impl ModuleHandler for SessionAudit {
    async fn on_load(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg: SessionAuditConfig = ctx.config_as();

        crate::api::register(ctx)?;
        ctx.ui().widget(Widget {
            id: "session-activity".into(),
            title: "Session activity".into(),
            component: "SessionActivityWidget".into(),
            position: "top".into(),
            width: "half".into(),
            icon: Some("activity".into()),
            permissions: vec!["session_audit:read".into()],
        })?;
        ctx.ui().menu_item(MenuItem {
            id: "session-audit".into(),
            label: "Session audit".into(),
            path: "/admin/session-audit".into(),
            icon: Some("list".into()),
            component: Some("SessionAuditPage".into()),
            order: 50,
            permissions: vec!["session_audit:read".into()],
        })?;

        let storage = ctx.storage().clone();
        let logger = ctx.logger().clone();
        ctx.scheduler()
            .schedule_interval(SUMMARY_JOB, &cfg.summary_interval, move || {
                write_summary(storage.clone(), logger.clone())
            })?;

        ctx.logger().info_with(
            "session audit loaded",
            &json!({ "summaryInterval": cfg.summary_interval, "keepRecent": cfg.keep_recent }),
        );
        Ok(())
    }

    async fn on_unload(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        ctx.logger().info("session audit unloaded");
        Ok(())
    }

    async fn on_enable(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        ctx.logger().info("auditing resumed");
        Ok(())
    }

    async fn on_disable(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        ctx.logger().info("auditing paused");
        Ok(())
    }

    async fn on_session_created(&self, ctx: &ModuleCtx, payload: &EventPayload) -> anyhow::Result<()> {
        self.record(ctx, PlatformEvent::SessionCreated, payload).await
    }

    async fn on_session_started(&self, ctx: &ModuleCtx, payload: &EventPayload) -> anyhow::Result<()> {
        self.record(ctx, PlatformEvent::SessionStarted, payload).await
    }

    async fn on_session_stopped(&self, ctx: &ModuleCtx, payload: &EventPayload) -> anyhow::Result<()> {
        self.record(ctx, PlatformEvent::SessionStopped, payload).await
    }

    async fn on_session_hibernated(&self, ctx: &ModuleCtx, payload: &EventPayload) -> anyhow::Result<()> {
        self.record(ctx, PlatformEvent::SessionHibernated, payload).await
    }

    async fn on_session_woken(&self, ctx: &ModuleCtx, payload: &EventPayload) -> anyhow::Result<()> {
        self.record(ctx, PlatformEvent::SessionWoken, payload).await
    }

    async fn on_session_deleted(&self, ctx: &ModuleCtx, payload: &EventPayload) -> anyhow::Result<()> {
        self.record(ctx, PlatformEvent::SessionDeleted, payload).await
    }
}

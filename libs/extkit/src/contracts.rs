use async_trait::async_trait;

use crate::context::ModuleCtx;

/// Opaque event payload handed to hooks and bus subscribers.
pub type EventPayload = serde_json::Value;

/// The contract every extension module implements, compiled-in or dynamic.
///
/// All hooks default to no-ops so a module only overrides what it needs.
/// Only an `on_load` failure blocks activation; every other failure is logged
/// against the module and never reaches another module or the caller.
#[async_trait]
pub trait ModuleHandler: Send + Sync + 'static {
    /// Register endpoints, UI, jobs and subscriptions. Failure aborts the load.
    async fn on_load(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }

    /// Best-effort teardown; registrations are removed by the runtime regardless.
    async fn on_unload(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_enable(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_disable(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }

    // ---- session lifecycle ----

    async fn on_session_created(&self, _ctx: &ModuleCtx, _payload: &EventPayload) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_session_started(&self, _ctx: &ModuleCtx, _payload: &EventPayload) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_session_stopped(&self, _ctx: &ModuleCtx, _payload: &EventPayload) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_session_hibernated(
        &self,
        _ctx: &ModuleCtx,
        _payload: &EventPayload,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_session_woken(&self, _ctx: &ModuleCtx, _payload: &EventPayload) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_session_deleted(&self, _ctx: &ModuleCtx, _payload: &EventPayload) -> anyhow::Result<()> {
        Ok(())
    }

    // ---- account lifecycle ----

    async fn on_user_created(&self, _ctx: &ModuleCtx, _payload: &EventPayload) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_user_updated(&self, _ctx: &ModuleCtx, _payload: &EventPayload) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_user_deleted(&self, _ctx: &ModuleCtx, _payload: &EventPayload) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_user_login(&self, _ctx: &ModuleCtx, _payload: &EventPayload) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_user_logout(&self, _ctx: &ModuleCtx, _payload: &EventPayload) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Platform events that are dispatched to module hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformEvent {
    SessionCreated,
    SessionStarted,
    SessionStopped,
    SessionHibernated,
    SessionWoken,
    SessionDeleted,
    UserCreated,
    UserUpdated,
    UserDeleted,
    UserLogin,
    UserLogout,
}

impl PlatformEvent {
    pub const ALL: [PlatformEvent; 11] = [
        Self::SessionCreated,
        Self::SessionStarted,
        Self::SessionStopped,
        Self::SessionHibernated,
        Self::SessionWoken,
        Self::SessionDeleted,
        Self::UserCreated,
        Self::UserUpdated,
        Self::UserDeleted,
        Self::UserLogin,
        Self::UserLogout,
    ];

    /// Wire name, e.g. `session.created`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionCreated => "session.created",
            Self::SessionStarted => "session.started",
            Self::SessionStopped => "session.stopped",
            Self::SessionHibernated => "session.hibernated",
            Self::SessionWoken => "session.woken",
            Self::SessionDeleted => "session.deleted",
            Self::UserCreated => "user.created",
            Self::UserUpdated => "user.updated",
            Self::UserDeleted => "user.deleted",
            Self::UserLogin => "user.login",
            Self::UserLogout => "user.logout",
        }
    }

    pub fn parse(event_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == event_type)
    }

    /// Invoke the hook matching this event.
    pub async fn dispatch(
        self,
        handler: &dyn ModuleHandler,
        ctx: &ModuleCtx,
        payload: &EventPayload,
    ) -> anyhow::Result<()> {
        match self {
            Self::SessionCreated => handler.on_session_created(ctx, payload).await,
            Self::SessionStarted => handler.on_session_started(ctx, payload).await,
            Self::SessionStopped => handler.on_session_stopped(ctx, payload).await,
            Self::SessionHibernated => handler.on_session_hibernated(ctx, payload).await,
            Self::SessionWoken => handler.on_session_woken(ctx, payload).await,
            Self::SessionDeleted => handler.on_session_deleted(ctx, payload).await,
            Self::UserCreated => handler.on_user_created(ctx, payload).await,
            Self::UserUpdated => handler.on_user_updated(ctx, payload).await,
            Self::UserDeleted => handler.on_user_deleted(ctx, payload).await,
            Self::UserLogin => handler.on_user_login(ctx, payload).await,
            Self::UserLogout => handler.on_user_logout(ctx, payload).await,
        }
    }
}

impl std::fmt::Display for PlatformEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

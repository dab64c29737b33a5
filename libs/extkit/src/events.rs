//! Topic-based publish/subscribe shared by the runtime and modules.
//!
//! Subscriptions are keyed by `(topic, module)` so a module can only remove its
//! own handlers. Modules publish custom events under `extension.{module}.{event}`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;

use crate::contracts::EventPayload;
use crate::error::{ExtError, Result};
use crate::isolate::{run_isolated, Outcome};

/// A bus subscriber callback.
pub type EventHandler = Arc<dyn Fn(EventPayload) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Topic under which `module` publishes its custom `event`.
pub fn module_topic(module: &str, event: &str) -> String {
    format!("extension.{module}.{event}")
}

#[derive(Default)]
pub struct EventBus {
    subs: RwLock<HashMap<String, HashMap<String, Vec<EventHandler>>>>,
    /// Modules whose subscriptions are temporarily not delivered (disabled modules).
    muted: RwLock<HashSet<String>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str, module: &str, handler: EventHandler) {
        self.subs
            .write()
            .entry(topic.to_string())
            .or_default()
            .entry(module.to_string())
            .or_default()
            .push(handler);
        tracing::debug!(topic, module, "event subscription added");
    }

    /// Remove every handler `module` registered for `topic`.
    pub fn unsubscribe(&self, topic: &str, module: &str) -> bool {
        let mut subs = self.subs.write();
        let Some(by_module) = subs.get_mut(topic) else {
            return false;
        };
        let removed = by_module.remove(module).is_some();
        if by_module.is_empty() {
            subs.remove(topic);
        }
        removed
    }

    /// Remove every subscription held by `module`. Returns how many topics were affected.
    pub fn unsubscribe_all(&self, module: &str) -> usize {
        let mut removed = 0;
        self.subs.write().retain(|_, by_module| {
            if by_module.remove(module).is_some() {
                removed += 1;
            }
            !by_module.is_empty()
        });
        self.muted.write().remove(module);
        removed
    }

    pub fn set_muted(&self, module: &str, muted: bool) {
        let mut set = self.muted.write();
        if muted {
            set.insert(module.to_string());
        } else {
            set.remove(module);
        }
    }

    /// Topics `module` currently listens to, sorted.
    pub fn subscriptions_of(&self, module: &str) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subs
            .read()
            .iter()
            .filter(|(_, by_module)| by_module.contains_key(module))
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subs
            .read()
            .get(topic)
            .map(|m| m.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn handlers_for(&self, topic: &str) -> Vec<(String, EventHandler)> {
        let muted = self.muted.read().clone();
        self.subs
            .read()
            .get(topic)
            .map(|by_module| {
                by_module
                    .iter()
                    .filter(|(module, _)| !muted.contains(module.as_str()))
                    .flat_map(|(module, hs)| hs.iter().map(move |h| (module.clone(), h.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fire-and-forget publish. Each handler runs on its own task; failures and
    /// panics are logged with topic and module.
    pub fn emit(&self, topic: &str, payload: EventPayload) {
        let handlers = self.handlers_for(topic);
        if handlers.is_empty() {
            return;
        }
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            tracing::error!(topic, "event emitted outside of a tokio runtime; dropped");
            return;
        };
        for (module, handler) in handlers {
            let topic = topic.to_string();
            let payload = payload.clone();
            rt.spawn(async move {
                // the handler itself is called inside the isolated task
                let outcome = run_isolated(async move { handler(payload).await }, None).await;
                if !matches!(outcome, Outcome::Ok) {
                    tracing::warn!(topic = %topic, module = %module, outcome = %outcome.describe(), "event handler failed");
                }
            });
        }
    }

    /// Publish and wait for every handler. All failures (including panics) are
    /// collected into one [`ExtError::Handlers`].
    pub async fn emit_sync(&self, topic: &str, payload: EventPayload) -> Result<()> {
        let handlers = self.handlers_for(topic);
        let runs = handlers.into_iter().map(|(module, handler)| {
            let payload = payload.clone();
            async move {
                let outcome = run_isolated(async move { handler(payload).await }, None).await;
                (module, outcome)
            }
        });

        let failures: Vec<String> = join_all(runs)
            .await
            .into_iter()
            .filter(|(_, outcome)| !matches!(outcome, Outcome::Ok))
            .map(|(module, outcome)| format!("{module}: {}", outcome.describe()))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ExtError::Handlers {
                topic: topic.to_string(),
                failures,
            })
        }
    }
}

/// Per-module view of the bus handed to modules through their context.
#[derive(Clone)]
pub struct ModuleEvents {
    module: Arc<str>,
    bus: Arc<EventBus>,
}

impl ModuleEvents {
    pub(crate) fn new(module: Arc<str>, bus: Arc<EventBus>) -> Self {
        Self { module, bus }
    }

    /// Subscribe to `topic`: a platform event (`session.created`) or another
    /// module's custom event (`extension.billing.invoice_paid`).
    pub fn on<F, Fut>(&self, topic: &str, f: F)
    where
        F: Fn(EventPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |payload: EventPayload| f(payload).boxed());
        self.bus.subscribe(topic, &self.module, handler);
    }

    pub fn off(&self, topic: &str) -> bool {
        self.bus.unsubscribe(topic, &self.module)
    }

    /// Publish `extension.{module}.{event}` without waiting.
    pub fn emit(&self, event: &str, payload: EventPayload) {
        self.bus.emit(&module_topic(&self.module, event), payload);
    }

    /// Publish `extension.{module}.{event}` and wait for every subscriber.
    pub async fn emit_sync(&self, event: &str, payload: EventPayload) -> Result<()> {
        self.bus
            .emit_sync(&module_topic(&self.module, event), payload)
            .await
    }
}

use chrono::{DateTime, Utc};
use extkit::{EventPayload, PlatformEvent};
use serde::{Deserialize, Serialize};

pub(crate) const COUNTERS_KEY: &str = "counters";
pub(crate) const RECENT_KEY: &str = "recent";
pub(crate) const SUMMARY_KEY: &str = "summary:last";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Created,
    Started,
    Stopped,
    Hibernated,
    Woken,
    Deleted,
}

impl SessionEventKind {
    pub fn from_platform(event: PlatformEvent) -> Option<Self> {
        Some(match event {
            PlatformEvent::SessionCreated => Self::Created,
            PlatformEvent::SessionStarted => Self::Started,
            PlatformEvent::SessionStopped => Self::Stopped,
            PlatformEvent::SessionHibernated => Self::Hibernated,
            PlatformEvent::SessionWoken => Self::Woken,
            PlatformEvent::SessionDeleted => Self::Deleted,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Counters {
    pub created: u64,
    pub started: u64,
    pub stopped: u64,
    pub hibernated: u64,
    pub woken: u64,
    pub deleted: u64,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl Counters {
    pub fn bump(&mut self, kind: SessionEventKind, at: DateTime<Utc>) {
        let slot = match kind {
            SessionEventKind::Created => &mut self.created,
            SessionEventKind::Started => &mut self.started,
            SessionEventKind::Stopped => &mut self.stopped,
            SessionEventKind::Hibernated => &mut self.hibernated,
            SessionEventKind::Woken => &mut self.woken,
            SessionEventKind::Deleted => &mut self.deleted,
        };
        *slot += 1;
        self.last_event_at = Some(at);
    }

    pub fn total(&self) -> u64 {
        self.created + self.started + self.stopped + self.hibernated + self.woken + self.deleted
    }

    /// Created but not yet deleted.
    pub fn live(&self) -> u64 {
        self.created.saturating_sub(self.deleted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub kind: SessionEventKind,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn from_payload(kind: SessionEventKind, payload: &EventPayload, at: DateTime<Utc>) -> Self {
        let field = |names: &[&str]| {
            names
                .iter()
                .find_map(|n| payload.get(*n))
                .and_then(|v| match v {
                    serde_json::Value::String(s) => Some(s.clone()),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
        };
        Self {
            kind,
            session_id: field(&["sessionId", "session_id", "id"]),
            user_id: field(&["userId", "user_id"]),
            at,
        }
    }
}

/// Written by the periodic summary job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total: u64,
    pub live: u64,
    pub generated_at: DateTime<Utc>,
}

/// Newest first, at most `keep` entries.
pub(crate) fn push_recent(recent: &mut Vec<AuditRecord>, record: AuditRecord, keep: usize) {
    recent.insert(0, record);
    recent.truncate(keep);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_session_events_are_audited() {
        assert_eq!(
            SessionEventKind::from_platform(PlatformEvent::SessionWoken),
            Some(SessionEventKind::Woken)
        );
        assert_eq!(SessionEventKind::from_platform(PlatformEvent::UserLogin), None);
    }

    #[test]
    fn counters_track_live_sessions() {
        let now = Utc::now();
        let mut c = Counters::default();
        c.bump(SessionEventKind::Created, now);
        c.bump(SessionEventKind::Created, now);
        c.bump(SessionEventKind::Deleted, now);
        c.bump(SessionEventKind::Deleted, now);
        c.bump(SessionEventKind::Deleted, now);
        assert_eq!(c.total(), 5);
        assert_eq!(c.live(), 0);
        assert_eq!(c.last_event_at, Some(now));
    }

    #[test]
    fn record_accepts_either_id_spelling() {
        let now = Utc::now();
        let a = AuditRecord::from_payload(SessionEventKind::Started, &json!({ "sessionId": "s1", "userId": 7 }), now);
        assert_eq!(a.session_id.as_deref(), Some("s1"));
        assert_eq!(a.user_id.as_deref(), Some("7"));
        let b = AuditRecord::from_payload(SessionEventKind::Started, &json!({ "session_id": "s2" }), now);
        assert_eq!(b.session_id.as_deref(), Some("s2"));
        assert_eq!(b.user_id, None);
    }

    #[test]
    fn recent_list_is_bounded() {
        let now = Utc::now();
        let mut recent = Vec::new();
        for i in 0..5 {
            let r = AuditRecord::from_payload(SessionEventKind::Created, &json!({ "sessionId": i.to_string() }), now);
            push_recent(&mut recent, r, 3);
        }
        let ids: Vec<_> = recent.iter().filter_map(|r| r.session_id.as_deref()).collect();
        assert_eq!(ids, ["4", "3", "2"]);
    }
}

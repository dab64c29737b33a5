use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionAuditConfig {
    /// Scheduler interval shorthand for the summary job.
    pub summary_interval: String,
    /// How many recent records `/status` returns.
    pub keep_recent: usize,
    /// Re-publish each record on the event bus.
    pub announce: bool,
}

impl Default for SessionAuditConfig {
    fn default() -> Self {
        Self {
            summary_interval: "hourly".to_string(),
            keep_recent: 20,
            announce: true,
        }
    }
}

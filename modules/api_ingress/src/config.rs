use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Host HTTP surface settings, read from `modules.api_ingress`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiIngressConfig {
    /// `host:port`. Left empty, the host fills it from the `server` section.
    pub bind_addr: String,
    pub cors_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub body_limit_bytes: usize,
}

impl Default for ApiIngressConfig {
    fn default() -> Self {
        Self {
            bind_addr: String::new(),
            cors_enabled: false,
            request_timeout: Duration::from_secs(30),
            body_limit_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ApiIngressConfig {
    /// Parse the raw module section; a missing section gives the defaults.
    pub fn from_section(section: Option<&serde_json::Value>) -> anyhow::Result<Self> {
        match section {
            Some(v) if !v.is_null() => Ok(serde_json::from_value(v.clone())?),
            _ => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn section_overrides_defaults() {
        let cfg = ApiIngressConfig::from_section(Some(&json!({
            "cors_enabled": true,
            "request_timeout": "5s"
        })))
        .unwrap();
        assert!(cfg.cors_enabled);
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
        assert_eq!(cfg.body_limit_bytes, 16 * 1024 * 1024);
        assert!(cfg.bind_addr.is_empty());

        assert!(ApiIngressConfig::from_section(None).is_ok());
        assert!(ApiIngressConfig::from_section(Some(&json!({ "bogus": 1 }))).is_err());
    }
}

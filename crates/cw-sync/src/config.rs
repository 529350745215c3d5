//! Sync client configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Result, SyncError};

/// Longest undo window accepted, ten years
pub const MAX_UNDO_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// What a second mutation on a key with one still in flight does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Fail immediately with `MutationConflict`
    #[default]
    Reject,
    /// Wait for the earlier mutation to settle
    Queue,
}

impl FromStr for ConflictPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "queue" => Ok(Self::Queue),
            other => Err(SyncError::config(format!(
                "unknown conflict policy '{}', expected 'reject' or 'queue'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Poll while the realtime channel is down
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Delivery attempts before an outbox entry is left for manual inspection
    pub max_attempts: u32,
    /// SQLite outbox location; in-memory when unset
    pub outbox_path: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            outbox_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Company scope of channels and queries. Channels stay inert until set.
    pub company_id: Option<String>,
    /// Signed-in user, recorded on audit entries and speculative claims
    pub actor_id: Option<String>,
    pub polling: PollingConfig,
    pub undo_ttl_secs: u64,
    pub conflict_policy: ConflictPolicy,
    pub audit: AuditConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            company_id: None,
            actor_id: None,
            polling: PollingConfig::default(),
            undo_ttl_secs: 24 * 60 * 60,
            conflict_policy: ConflictPolicy::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SyncError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `CW_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `CW_*`
    /// variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(company_id) = lookup("CW_COMPANY_ID") {
            config.company_id = Some(company_id);
        }
        if let Some(actor_id) = lookup("CW_ACTOR_ID") {
            config.actor_id = Some(actor_id);
        }
        if let Some(value) = lookup("CW_POLL_INTERVAL_MS") {
            config.polling.interval_ms = parse_number("CW_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("CW_POLLING_FALLBACK") {
            config.polling.enabled = parse_flag("CW_POLLING_FALLBACK", &value)?;
        }
        if let Some(value) = lookup("CW_UNDO_TTL_SECS") {
            config.undo_ttl_secs = parse_number("CW_UNDO_TTL_SECS", &value)?;
        }
        if let Some(value) = lookup("CW_CONFLICT_POLICY") {
            config.conflict_policy = value.parse()?;
        }
        if let Some(path) = lookup("CW_AUDIT_OUTBOX") {
            config.audit.outbox_path = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.polling.interval_ms == 0 {
            return Err(SyncError::config("polling interval must be greater than zero"));
        }
        if self.undo_ttl_secs == 0 {
            return Err(SyncError::config("undo token lifetime must be greater than zero"));
        }
        if self.undo_ttl_secs > MAX_UNDO_TTL_SECS {
            return Err(SyncError::config(format!(
                "undo token lifetime cannot exceed {} seconds",
                MAX_UNDO_TTL_SECS
            )));
        }
        if self.audit.max_attempts == 0 {
            return Err(SyncError::config("audit max_attempts must be at least 1"));
        }
        if matches!(self.company_id.as_deref(), Some("")) {
            return Err(SyncError::config("company id cannot be empty"));
        }
        Ok(())
    }

    pub fn undo_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.undo_ttl_secs.min(MAX_UNDO_TTL_SECS) as i64)
    }

    pub fn with_company(mut self, company_id: impl Into<String>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::config(format!("{} must be a number, got '{}'", name, value)))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SyncError::config(format!(
            "{} must be a boolean, got '{}'",
            name, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert!(config.polling.enabled);
        assert_eq!(config.polling.interval(), Duration::from_secs(30));
        assert_eq!(config.undo_ttl(), chrono::Duration::hours(24));
        assert_eq!(config.conflict_policy, ConflictPolicy::Reject);
        assert_eq!(config.audit.max_attempts, 5);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SyncConfig::from_json_str(
            r#"{"company_id": "c1", "polling": {"interval_ms": 5000}, "conflict_policy": "queue"}"#,
        )
        .unwrap();

        assert_eq!(config.company_id.as_deref(), Some("c1"));
        assert_eq!(config.polling.interval_ms, 5000);
        assert!(config.polling.enabled);
        assert_eq!(config.conflict_policy, ConflictPolicy::Queue);
    }

    #[test]
    fn test_env_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("CW_COMPANY_ID", "c1"),
            ("CW_POLL_INTERVAL_MS", "1000"),
            ("CW_POLLING_FALLBACK", "off"),
            ("CW_CONFLICT_POLICY", "Queue"),
        ]))
        .unwrap();

        assert_eq!(config.company_id.as_deref(), Some("c1"));
        assert_eq!(config.polling.interval_ms, 1000);
        assert!(!config.polling.enabled);
        assert_eq!(config.conflict_policy, ConflictPolicy::Queue);
    }

    #[test]
    fn test_rejects_zero_interval_and_ttl() {
        assert!(SyncConfig::from_lookup(lookup(&[("CW_POLL_INTERVAL_MS", "0")])).is_err());
        assert!(SyncConfig::from_lookup(lookup(&[("CW_UNDO_TTL_SECS", "0")])).is_err());
        assert!(SyncConfig::from_json_str(r#"{"undo_ttl_secs": 0}"#).is_err());
    }

    #[test]
    fn test_rejects_unbounded_ttl() {
        let huge = (i64::MAX as u64 / 1_000).to_string();
        assert!(SyncConfig::from_json_str(&format!(r#"{{"undo_ttl_secs": {}}}"#, huge)).is_err());
        assert!(SyncConfig::from_lookup(lookup(&[("CW_UNDO_TTL_SECS", huge.as_str())])).is_err());

        let longest = SyncConfig {
            undo_ttl_secs: MAX_UNDO_TTL_SECS,
            ..SyncConfig::default()
        };
        assert!(longest.validate().is_ok());
        assert_eq!(longest.undo_ttl(), chrono::Duration::days(3650));
    }

    #[test]
    fn test_rejects_garbage_values() {
        assert!(SyncConfig::from_lookup(lookup(&[("CW_POLL_INTERVAL_MS", "soon")])).is_err());
        assert!(SyncConfig::from_lookup(lookup(&[("CW_CONFLICT_POLICY", "merge")])).is_err());
    }
}

//! Scenario model and loader for realtime channel tests
//!
//! A scenario drives one channel through a sequence of transport statuses,
//! change events and virtual-clock advances, asserting the observed
//! connection state and the number of cache refreshes along the way.

use cw_sync_contract::validation::channel_name;
use cw_sync_contract::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("reading scenario {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid scenario: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type ScenarioResult<T> = Result<T, ScenarioError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Step {
    /// Deliver a transport status
    Status {
        status: ChannelStatus,
    },
    /// Deliver a change event
    Change {
        event: ChangeEvent,
    },
    /// Advance the virtual clock
    AdvanceMs {
        ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    AssertConnection {
        is_connected: bool,
        attempts: u32,
        #[serde(default)]
        is_polling: Option<bool>,
    },
    /// Refreshes the channel has triggered, polling fires plus change events
    AssertRefreshes {
        count: usize,
    },
    /// Tear the channel down; later steps must have no effect
    Teardown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub name: String,
    pub company_id: String,
    /// Resource suffix of the channel name, e.g. `tasks`
    pub resource: String,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default = "default_polling")]
    pub polling: bool,
    pub steps: Vec<Step>,
}

fn default_polling() -> bool {
    true
}

impl Scenario {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(json: &str) -> ScenarioResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> ScenarioResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&json)
    }

    /// Load every `*.json` scenario in `dir`, sorted by file name
    pub fn load_dir(dir: impl AsRef<Path>) -> ScenarioResult<Vec<Self>> {
        let dir = dir.as_ref();
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(|source| ScenarioError::Io {
                path: dir.to_path_buf(),
                source,
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        paths.into_iter().map(Self::load).collect()
    }

    pub fn channel_name(&self) -> String {
        channel_name(&self.company_id, &self.resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::from_str(
            r#"{
                "name": "drop and recover",
                "companyId": "c1",
                "resource": "tasks",
                "pollIntervalMs": 1000,
                "steps": [
                    {"type": "status", "status": "SUBSCRIBED"},
                    {"type": "assertConnection", "isConnected": true, "attempts": 0},
                    {"type": "change", "event": {"event": "UPDATE", "schema": "public", "table": "tasks"}},
                    {"type": "advanceMs", "ms": 1000},
                    {"type": "assertRefreshes", "count": 1},
                    {"type": "teardown"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(scenario.channel_name(), "company:c1:tasks");
        assert!(scenario.polling);
        assert_eq!(scenario.steps.len(), 6);
        assert!(matches!(
            scenario.steps[1],
            Step::AssertConnection {
                is_connected: true,
                attempts: 0,
                is_polling: None
            }
        ));
    }

    #[test]
    fn test_missing_dir_reports_path() {
        let err = Scenario::load_dir("/nonexistent/scenarios").unwrap_err();
        assert!(matches!(err, ScenarioError::Io { ref path, .. } if path.ends_with("scenarios")));
    }

    #[test]
    fn test_unknown_step_is_parse_error() {
        let err = Scenario::from_str(
            r#"{"name": "x", "companyId": "c1", "resource": "tasks", "steps": [{"type": "jump"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ScenarioError::Parse(_)));
    }
}

//! Fire-and-forget telemetry capability.

use serde_json::Value;
use std::sync::{Mutex, PoisonError};
use tracing::info;

pub const CHANNEL_SUBSCRIBED: &str = "realtime_channel_subscribed";
pub const CONNECTION_STATUS: &str = "realtime_connection_status";
pub const SUGGESTION_REVIEWED: &str = "combination_suggestion_reviewed";

/// Receives structured product events. Implementations must not block.
pub trait TelemetrySink: Send + Sync {
    fn track(&self, event: &str, properties: Value);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn track(&self, _event: &str, _properties: Value) {}
}

/// Forwards events to `tracing` under the `telemetry` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn track(&self, event: &str, properties: Value) {
        info!(target: "telemetry", event, %properties);
    }
}

/// Records events in memory
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    events: Mutex<Vec<(String, Value)>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Properties of every recorded `event`, oldest first
    pub fn named(&self, event: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|(name, _)| name == event)
            .map(|(_, properties)| properties)
            .collect()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn track(&self, event: &str, properties: Value) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((event.to_string(), properties));
    }
}

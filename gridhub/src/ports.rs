/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! External collaborator ports: image validation and event fan-out.
//!
//! Both are injected capabilities. The image validator decides the fate of a
//! freshly submitted task (`validating → pending | invalid`) and is never
//! retried by the core; the event bus is best-effort — a publish failure is
//! logged and swallowed, never propagated.

use std::sync::Mutex;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::ContainerSpec;

// ── Topics ────────────────────────────────────────────────────────────────────

/// Event-bus topics published by the core.
pub mod topics {
    /// Aggregate fleet/queue snapshot, published after state-changing
    /// operations and orchestration ticks.
    pub const NETWORK_ACTIVITY: &str = "network_activity";

    /// Per-submitter notifications that one of their tasks changed status.
    pub const TASK_UPDATES: &str = "task_updates";
}

// ── ImageValidator ────────────────────────────────────────────────────────────

/// Verdict of the external container-image check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageVerdict {
    Valid,
    Invalid { reason: String },
}

/// External image validation worker.
///
/// Receives the opaque container spec untouched. A rejection is terminal for
/// the task; the core never retries it.
pub trait ImageValidator: Send + Sync {
    fn validate(&self, spec: &ContainerSpec) -> ImageVerdict;
}

/// Stock validator that accepts everything.
///
/// Used by the single-process daemon, where image pulling belongs to the
/// worker side; deployments with a registry gate inject their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllImages;

impl ImageValidator for AcceptAllImages {
    fn validate(&self, _spec: &ContainerSpec) -> ImageVerdict {
        ImageVerdict::Valid
    }
}

// ── EventBus ──────────────────────────────────────────────────────────────────

/// Publish failure. Never fatal to the caller.
#[derive(Debug, Error)]
#[error("event bus publish failed: {0}")]
pub struct EventBusError(pub String);

/// Best-effort fan-out of hub events to observers.
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, payload: Value) -> Result<(), EventBusError>;
}

/// Publish and swallow: failures are logged at `warn`, nothing propagates.
pub fn publish_best_effort(bus: &dyn EventBus, topic: &str, payload: Value) {
    if let Err(err) = bus.publish(topic, payload) {
        warn!(topic, error = %err, "event publish failed, dropping event");
    }
}

/// Stock bus that logs every event at `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventBus;

impl EventBus for LogEventBus {
    fn publish(&self, topic: &str, payload: Value) -> Result<(), EventBusError> {
        debug!(topic, %payload, "event");
        Ok(())
    }
}

/// Bus that records every published event. For tests and local inspection.
#[derive(Debug, Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Events published on one topic.
    pub fn on_topic(&self, topic: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload)
            .collect()
    }
}

impl EventBus for RecordingEventBus {
    fn publish(&self, topic: &str, payload: Value) -> Result<(), EventBusError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((topic.to_string(), payload));
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingBus;

    impl EventBus for FailingBus {
        fn publish(&self, _topic: &str, _payload: Value) -> Result<(), EventBusError> {
            Err(EventBusError("broker unreachable".into()))
        }
    }

    #[test]
    fn accept_all_images_accepts() {
        let spec = ContainerSpec(json!({"image": "python:3.11", "command": "run"}));
        assert_eq!(AcceptAllImages.validate(&spec), ImageVerdict::Valid);
    }

    #[test]
    fn best_effort_publish_swallows_failures() {
        // Must not panic or return anything — the failure is logged only.
        publish_best_effort(&FailingBus, topics::NETWORK_ACTIVITY, json!({"n": 1}));
    }

    #[test]
    fn recording_bus_captures_topic_and_payload() {
        let bus = RecordingEventBus::new();
        publish_best_effort(&bus, topics::TASK_UPDATES, json!({"task": "t1"}));
        publish_best_effort(&bus, topics::NETWORK_ACTIVITY, json!({"nodes": 2}));

        assert_eq!(bus.events().len(), 2);
        assert_eq!(bus.on_topic(topics::TASK_UPDATES), vec![json!({"task": "t1"})]);
    }
}

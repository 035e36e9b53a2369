/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Core data model of the hub.
//!
//! Three record types form a bounded triangle with no cycles:
//!
//! ```text
//! Node  ◄──(node_id)──  Assignment  ──(task_id)──►  Task
//! ```
//!
//! Relations are id references only; no record embeds another. Statuses are
//! typed enums rather than strings so an invalid state cannot be constructed
//! inside the core, and absent timestamps are `Option` rather than sentinels.
//!
//! # Opaque payloads
//! `container_spec`, heartbeat resource reports and execution results arrive
//! as JSON the core does not own. Each gets a thin wrapper with a *narrow*
//! typed projection ([`ContainerSpec::image`], [`ResultEnvelope::output`],
//! [`ResourceVector::cpu`], …); everything beyond the named keys passes
//! through untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Identifiers ───────────────────────────────────────────────────────────────

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Mint a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(
    /// Opaque 128-bit identifier of a worker node.
    NodeId
);
id_type!(
    /// Opaque 128-bit identifier of a task.
    TaskId
);
id_type!(
    /// Opaque 128-bit identifier of a (task, node) assignment.
    AssignmentId
);

// ── Resource vectors ──────────────────────────────────────────────────────────

/// A `{dimension → quantity}` resource mapping (`cpu`, `ram`, optionally
/// `gpu` and anything else a deployment reports).
///
/// `BTreeMap` (not `HashMap`) so iteration and serialisation order are stable
/// — snapshots and event payloads must be deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVector(BTreeMap<String, f64>);

impl ResourceVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion, used heavily in tests.
    pub fn with(mut self, dimension: &str, quantity: f64) -> Self {
        self.0.insert(dimension.to_string(), quantity);
        self
    }

    pub fn get(&self, dimension: &str) -> Option<f64> {
        self.0.get(dimension).copied()
    }

    /// Value for `dimension`, or `default` when the dimension is absent.
    pub fn get_or(&self, dimension: &str, default: f64) -> f64 {
        self.get(dimension).unwrap_or(default)
    }

    pub fn cpu(&self) -> Option<f64> {
        self.get("cpu")
    }

    pub fn ram(&self) -> Option<f64> {
        self.get("ram")
    }

    pub fn gpu(&self) -> Option<f64> {
        self.get("gpu")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Project a resource vector out of an untyped heartbeat payload.
    ///
    /// Returns `None` unless the payload is a JSON object; numeric members are
    /// kept, anything else in the object is ignored. A malformed payload never
    /// fails the surrounding operation — the caller simply keeps the previous
    /// vector.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let object = value.as_object()?;
        let mut map = BTreeMap::new();
        for (key, member) in object {
            if let Some(quantity) = member.as_f64() {
                map.insert(key.clone(), quantity);
            }
        }
        Some(Self(map))
    }

    /// Clamp every dimension to the corresponding `capacity` dimension.
    ///
    /// Maintains the `free ≤ capacity` invariant on heartbeat ingestion.
    /// Dimensions the capacity does not declare are left as reported.
    pub fn clamp_to(&mut self, capacity: &ResourceVector) {
        for (dimension, quantity) in self.0.iter_mut() {
            if let Some(cap) = capacity.get(dimension) {
                if *quantity > cap {
                    *quantity = cap;
                }
            }
        }
    }
}

// ── Opaque payload wrappers ───────────────────────────────────────────────────

/// Container specification submitted with a task.
///
/// Opaque to the core: only `image` and `command` presence is checked at
/// submission, and the whole value is handed to the external image validator
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerSpec(pub serde_json::Value);

impl ContainerSpec {
    pub fn image(&self) -> Option<&str> {
        self.0.get("image").and_then(|v| v.as_str())
    }

    pub fn command(&self) -> Option<&str> {
        self.0.get("command").and_then(|v| v.as_str())
    }
}

/// Result blob reported by a node for one assignment.
///
/// The only key the core reads is `output` — the value that participates in
/// trust-weighted voting. Everything else rides along for the submitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultEnvelope(pub serde_json::Value);

impl ResultEnvelope {
    pub fn output(&self) -> Option<&str> {
        self.0.get("output").and_then(|v| v.as_str())
    }
}

// ── Node ──────────────────────────────────────────────────────────────────────

/// Worker node life-cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Heartbeating and eligible for placement.
    Active,
    /// Registered but silent; never receives assignments.
    Inactive,
    /// Heartbeating but opted out of new work; heartbeats do not promote it.
    Busy,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Inactive => "inactive",
            NodeStatus::Busy => "busy",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A worker peer.
///
/// `trust_index` is mutated only by the validator; `free` and
/// `last_heartbeat` only by heartbeat ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub address: String,
    pub status: NodeStatus,
    pub trust_index: f64,
    pub capacity: ResourceVector,
    pub free: ResourceVector,
    pub last_heartbeat: SystemTime,
}

// ── Task ──────────────────────────────────────────────────────────────────────

/// Task life-cycle state.
///
/// ```text
/// validating ─► pending ─► in_queue ─► in_progress ─► completed ─► validated
///      │           ▲          │  ▲          │                         │
///      ▼           └──────────┘  └──────────┘ (node-death cascade)    ▼
///   invalid        (preemption / retry)                            failed ─► GC
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Awaiting the external image check.
    Validating,
    /// In the backlog, eligible for admission.
    Pending,
    /// Admitted to the active queue, not yet assigned.
    InQueue,
    /// At least one live assignment exists.
    InProgress,
    /// Every assignment reported a result; awaiting the verdict.
    Completed,
    /// Accepted by trust-weighted vote; `result` names the winning output.
    Validated,
    /// Rejected by vote, or staleness exceeded the cap.
    Failed,
    /// The image check rejected the container spec. Terminal.
    Invalid,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Validating => "validating",
            TaskStatus::Pending => "pending",
            TaskStatus::InQueue => "in_queue",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Validated => "validated",
            TaskStatus::Failed => "failed",
            TaskStatus::Invalid => "invalid",
        }
    }

    /// Statuses that occupy a slot in the bounded active queue.
    pub const ACTIVE: [TaskStatus; 2] = [TaskStatus::InQueue, TaskStatus::InProgress];

    /// All statuses, in life-cycle order. Used by snapshot aggregation.
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Validating,
        TaskStatus::Pending,
        TaskStatus::InQueue,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Validated,
        TaskStatus::Failed,
        TaskStatus::Invalid,
    ];
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Post-validation record attached to a validated task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// The winning output of the trust-weighted vote.
    pub validated_output: String,
    /// `10 × winning_weight / total_weight` — a 0–10 confidence figure.
    pub trust_score: f64,
}

/// A unit of redundantly executable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub container_spec: ContainerSpec,
    pub resource_requirements: ResourceVector,
    pub trust_index_required: f64,
    /// Desired redundancy: how many nodes should execute this task.
    pub overlap_count: u32,
    pub status: TaskStatus,
    /// Number of scheduling passes that found no eligible node.
    pub stale_count: u32,
    pub created_at: SystemTime,
    pub last_attempted: Option<SystemTime>,
    pub result: Option<TaskResult>,
    pub submitted_by: Option<NodeId>,
}

impl Task {
    /// Whether the task currently occupies an active-queue slot.
    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::InQueue | TaskStatus::InProgress)
    }
}

// ── Assignment ────────────────────────────────────────────────────────────────

/// A (task, node) execution record. The `(task_id, node_id)` pair is unique
/// for the lifetime of the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub assigned_at: SystemTime,
    /// Stamped on the node's first fetch.
    pub started_at: Option<SystemTime>,
    /// Stamped when the node submits its result. At-most-once.
    pub completed_at: Option<SystemTime>,
    pub result: Option<ResultEnvelope>,
    /// Set by the validator when this assignment's output won the vote.
    pub validated: bool,
}

impl Assignment {
    /// Create a fresh assignment of `task` to `node` at `now`.
    pub fn new(task_id: TaskId, node_id: NodeId, now: SystemTime) -> Self {
        Self {
            id: AssignmentId::generate(),
            task_id,
            node_id,
            assigned_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            validated: false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── ResourceVector ────────────────────────────────────────────────────────

    #[test]
    fn resource_vector_accessors_and_defaults() {
        let rv = ResourceVector::new().with("cpu", 2.0).with("ram", 4.0);
        assert_eq!(rv.cpu(), Some(2.0));
        assert_eq!(rv.ram(), Some(4.0));
        assert_eq!(rv.gpu(), None);
        assert_eq!(rv.get_or("gpu", 0.5), 0.5);
    }

    #[test]
    fn resource_vector_from_json_requires_object() {
        assert!(ResourceVector::from_json(&json!([1, 2])).is_none());
        assert!(ResourceVector::from_json(&json!("cpu")).is_none());
        assert!(ResourceVector::from_json(&json!(null)).is_none());
    }

    #[test]
    fn resource_vector_from_json_keeps_numeric_members_only() {
        let rv = ResourceVector::from_json(&json!({
            "cpu": 2,
            "ram": 7.5,
            "label": "fast",
            "gpu": false
        }))
        .unwrap();
        assert_eq!(rv.cpu(), Some(2.0));
        assert_eq!(rv.ram(), Some(7.5));
        assert_eq!(rv.get("label"), None);
        assert_eq!(rv.gpu(), None);
    }

    #[test]
    fn clamp_to_enforces_componentwise_capacity() {
        let capacity = ResourceVector::new().with("cpu", 4.0).with("ram", 8.0);
        let mut free = ResourceVector::new()
            .with("cpu", 6.0)
            .with("ram", 3.0)
            .with("gpu", 1.0);
        free.clamp_to(&capacity);

        assert_eq!(free.cpu(), Some(4.0), "cpu clamped to capacity");
        assert_eq!(free.ram(), Some(3.0), "ram under capacity untouched");
        assert_eq!(free.gpu(), Some(1.0), "undeclared dimension passes through");
    }

    // ── Payload projections ───────────────────────────────────────────────────

    #[test]
    fn container_spec_projects_image_and_command() {
        let spec = ContainerSpec(json!({
            "image": "python:3.11",
            "command": "python main.py",
            "env": {"MODE": "batch"}
        }));
        assert_eq!(spec.image(), Some("python:3.11"));
        assert_eq!(spec.command(), Some("python main.py"));
    }

    #[test]
    fn container_spec_missing_keys_project_to_none() {
        let spec = ContainerSpec(json!({"command": "run"}));
        assert_eq!(spec.image(), None);
    }

    #[test]
    fn result_envelope_output_projection() {
        assert_eq!(
            ResultEnvelope(json!({"output": "42", "runtime_ms": 17})).output(),
            Some("42")
        );
        assert_eq!(ResultEnvelope(json!({"exit_code": 0})).output(), None);
        assert_eq!(ResultEnvelope(json!({"output": 42})).output(), None);
    }

    // ── Statuses ──────────────────────────────────────────────────────────────

    #[test]
    fn task_status_serialises_snake_case() {
        assert_eq!(
            serde_json::to_value(TaskStatus::InProgress).unwrap(),
            json!("in_progress")
        );
        assert_eq!(
            serde_json::from_value::<TaskStatus>(json!("in_queue")).unwrap(),
            TaskStatus::InQueue
        );
    }

    #[test]
    fn is_active_covers_queue_and_progress_only() {
        let mut task = Task {
            id: TaskId::generate(),
            description: "t".into(),
            container_spec: ContainerSpec(json!({})),
            resource_requirements: ResourceVector::new(),
            trust_index_required: 5.0,
            overlap_count: 1,
            status: TaskStatus::Pending,
            stale_count: 0,
            created_at: SystemTime::UNIX_EPOCH,
            last_attempted: None,
            result: None,
            submitted_by: None,
        };
        assert!(!task.is_active());
        task.status = TaskStatus::InQueue;
        assert!(task.is_active());
        task.status = TaskStatus::InProgress;
        assert!(task.is_active());
        task.status = TaskStatus::Completed;
        assert!(!task.is_active());
    }

    #[test]
    fn ids_are_distinct_and_ordered() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert_ne!(a, b);
        // Ord is required for deterministic BTreeMap iteration
        assert_eq!(a.cmp(&b).reverse(), b.cmp(&a));
    }
}

/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The transport-agnostic operation surface of the hub.
//!
//! [`Hub`] is what a REST/gRPC layer wraps: node registration, task
//! submission, heartbeats, assignment fetching, result submission and the
//! read-only queries. Each operation is one transaction against the store;
//! request-scoped cancellation is the transport's concern, while the periodic
//! ticks carry interval-derived deadlines.
//!
//! `submit_result` is the completion trigger: it stamps the assignment, and
//! under the task-row lock decides — exactly once — whether the task is
//! complete, invoking the trust-weighted validator in the same transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::clock::{Clock, Deadline};
use crate::config::Config;
use crate::error::HubError;
use crate::liveness::LivenessDetector;
use crate::model::{
    Assignment, ContainerSpec, Node, NodeId, NodeStatus, ResourceVector, ResultEnvelope, Task,
    TaskId, TaskStatus,
};
use crate::ports::{publish_best_effort, topics, EventBus, ImageValidator, ImageVerdict};
use crate::store::{with_tx, Store, StoreTx};
use crate::validator::Validator;

// ── Requests & views ──────────────────────────────────────────────────────────

/// A task submission. Only registered nodes may submit.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub description: String,
    pub container_spec: ContainerSpec,
    pub resource_requirements: ResourceVector,
    pub trust_index_required: f64,
    pub overlap_count: u32,
    pub submitted_by: NodeId,
}

impl TaskSubmission {
    /// Submission with the stock trust floor (5.0) and no redundancy.
    pub fn new(description: impl Into<String>, spec: ContainerSpec, submitted_by: NodeId) -> Self {
        Self {
            description: description.into(),
            container_spec: spec,
            resource_requirements: ResourceVector::new(),
            trust_index_required: 5.0,
            overlap_count: 1,
            submitted_by,
        }
    }
}

/// What a worker receives from `fetch_next_assignment`: the assignment plus
/// the task snapshot it needs to run the container.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentLease {
    pub assignment: Assignment,
    pub task: Task,
}

/// Task detail with one node's assignment context.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskWithAssignment {
    pub task: Task,
    pub assignment: Option<Assignment>,
}

/// Aggregate fleet/queue snapshot, also published on the activity topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkActivity {
    pub active_nodes: usize,
    pub total_free_cpu: f64,
    pub total_free_ram: f64,
    pub average_trust_index: f64,
    /// Task counts by status name.
    pub tasks: BTreeMap<String, usize>,
}

/// Build the aggregate snapshot inside an open transaction.
pub fn activity_snapshot(tx: &mut dyn StoreTx) -> Result<NetworkActivity, HubError> {
    let active = tx.nodes_by_status(NodeStatus::Active)?;
    let active_nodes = active.len();
    let total_free_cpu = active.iter().map(|n| n.free.get_or("cpu", 0.0)).sum();
    let total_free_ram = active.iter().map(|n| n.free.get_or("ram", 0.0)).sum();
    let average_trust_index = if active_nodes == 0 {
        0.0
    } else {
        active.iter().map(|n| n.trust_index).sum::<f64>() / active_nodes as f64
    };

    let mut tasks = BTreeMap::new();
    for status in TaskStatus::ALL {
        let count = tx.count_tasks_by_statuses(&[status])?;
        tasks.insert(status.as_str().to_string(), count);
    }

    Ok(NetworkActivity {
        active_nodes,
        total_free_cpu,
        total_free_ram,
        average_trust_index,
        tasks,
    })
}

// ── Hub ───────────────────────────────────────────────────────────────────────

/// The orchestration hub's operation surface.
pub struct Hub {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    bus: Arc<dyn EventBus>,
    images: Arc<dyn ImageValidator>,
    config: Config,
}

impl Hub {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        bus: Arc<dyn EventBus>,
        images: Arc<dyn ImageValidator>,
        config: Config,
    ) -> Self {
        Self {
            store,
            clock,
            bus,
            images,
            config,
        }
    }

    // ── Node surface ──────────────────────────────────────────────────────────

    /// Register a worker peer. Created `inactive` — the first heartbeat
    /// activates it — with the configured initial trust.
    pub fn register_node(
        &self,
        name: &str,
        address: &str,
        capacity: ResourceVector,
        free: ResourceVector,
    ) -> Result<Node, HubError> {
        if name.trim().is_empty() {
            return Err(HubError::validation("name", "must not be empty"));
        }
        if address.trim().is_empty() {
            return Err(HubError::validation("address", "must not be empty"));
        }

        let now = self.clock.now();
        let mut free = free;
        free.clamp_to(&capacity);

        let node = with_tx(self.store.as_ref(), Deadline::NONE, |tx| {
            let taken = tx
                .nodes()?
                .into_iter()
                .any(|n| n.name == name && n.address == address);
            if taken {
                return Err(HubError::Conflict(format!(
                    "node '{name}' at {address} is already registered"
                )));
            }

            let node = Node {
                id: NodeId::generate(),
                name: name.to_string(),
                address: address.to_string(),
                status: NodeStatus::Inactive,
                trust_index: self.config.initial_trust(),
                capacity: capacity.clone(),
                free: free.clone(),
                last_heartbeat: now,
            };
            tx.insert_node(node.clone())?;
            Ok(node)
        })?;

        info!(node = %node.id, name = %node.name, address = %node.address, "node registered");
        self.publish_activity();
        Ok(node)
    }

    /// Ingest a heartbeat with a free-resource payload.
    pub fn heartbeat(&self, node_id: NodeId, free_resources: &Value) -> Result<(), HubError> {
        let detector = LivenessDetector::new(&self.config, self.clock.as_ref());
        let outcome = with_tx(self.store.as_ref(), Deadline::NONE, |tx| {
            detector.record_heartbeat(tx, node_id, free_resources)
        })?;

        if outcome.revived {
            self.publish_activity();
        }
        Ok(())
    }

    // ── Task surface ──────────────────────────────────────────────────────────

    /// Admit a task in `validating` status. The host schedules
    /// [`Hub::run_image_validation`] asynchronously to decide
    /// `pending`/`invalid`.
    pub fn submit_task(&self, submission: TaskSubmission) -> Result<TaskId, HubError> {
        if submission.description.trim().is_empty() {
            return Err(HubError::validation("description", "must not be empty"));
        }
        if submission.container_spec.image().unwrap_or("").is_empty() {
            return Err(HubError::validation(
                "container_spec",
                "an image is required",
            ));
        }
        if submission.container_spec.command().unwrap_or("").is_empty() {
            return Err(HubError::validation(
                "container_spec",
                "a command is required",
            ));
        }
        if submission.overlap_count == 0 {
            return Err(HubError::validation(
                "overlap_count",
                "must be at least 1",
            ));
        }
        let trust_range = self.config.trust_min..=self.config.trust_max;
        if !trust_range.contains(&submission.trust_index_required) {
            return Err(HubError::validation(
                "trust_index_required",
                format!(
                    "must be within [{}, {}]",
                    self.config.trust_min, self.config.trust_max
                ),
            ));
        }

        let now = self.clock.now();
        let task = with_tx(self.store.as_ref(), Deadline::NONE, |tx| {
            if tx.node(submission.submitted_by)?.is_none() {
                return Err(HubError::not_found("node", submission.submitted_by));
            }

            let task = Task {
                id: TaskId::generate(),
                description: submission.description.clone(),
                container_spec: submission.container_spec.clone(),
                resource_requirements: submission.resource_requirements.clone(),
                trust_index_required: submission.trust_index_required,
                overlap_count: submission.overlap_count,
                status: TaskStatus::Validating,
                stale_count: 0,
                created_at: now,
                last_attempted: None,
                result: None,
                submitted_by: Some(submission.submitted_by),
            };
            tx.insert_task(task.clone())?;
            Ok(task)
        })?;

        info!(task = %task.id, submitter = %submission.submitted_by, "task submitted, queued for image validation");
        self.publish_task_update(submission.submitted_by, task.id, TaskStatus::Validating);
        Ok(task.id)
    }

    /// Run the external image check for a `validating` task and settle it to
    /// `pending` or `invalid`. Idempotent: a task already past validation is
    /// returned unchanged.
    ///
    /// The external call runs outside any transaction — image pulls are slow
    /// and must not hold the store.
    pub fn run_image_validation(&self, task_id: TaskId) -> Result<TaskStatus, HubError> {
        let spec = with_tx(self.store.as_ref(), Deadline::NONE, |tx| {
            let Some(task) = tx.task(task_id)? else {
                return Err(HubError::not_found("task", task_id));
            };
            Ok((task.status, task.container_spec.clone()))
        })?;

        let (status, spec) = spec;
        if status != TaskStatus::Validating {
            return Ok(status);
        }

        let verdict = self.images.validate(&spec);

        let (new_status, submitter) = with_tx(self.store.as_ref(), Deadline::NONE, |tx| {
            let Some(mut task) = tx.lock_task(task_id)? else {
                return Err(HubError::not_found("task", task_id));
            };
            if task.status != TaskStatus::Validating {
                return Ok((task.status, task.submitted_by));
            }

            task.status = match &verdict {
                ImageVerdict::Valid => TaskStatus::Pending,
                ImageVerdict::Invalid { reason } => {
                    info!(task = %task_id, %reason, "container spec rejected, task invalid");
                    TaskStatus::Invalid
                }
            };
            tx.update_task(&task)?;
            Ok((task.status, task.submitted_by))
        })?;

        if let Some(submitter) = submitter {
            self.publish_task_update(submitter, task_id, new_status);
        }
        self.publish_activity();
        Ok(new_status)
    }

    // ── Worker surface ────────────────────────────────────────────────────────

    /// The oldest uncompleted assignment for a node, with its task snapshot.
    /// Stamps `started_at` on the first fetch only.
    pub fn fetch_next_assignment(
        &self,
        node_id: NodeId,
    ) -> Result<Option<AssignmentLease>, HubError> {
        let now = self.clock.now();

        with_tx(self.store.as_ref(), Deadline::NONE, |tx| {
            if tx.node(node_id)?.is_none() {
                return Err(HubError::not_found("node", node_id));
            }

            let next = tx
                .assignments_by_node(node_id)?
                .into_iter()
                .find(|a| !a.is_completed());
            let Some(mut assignment) = next else {
                return Ok(None);
            };

            if assignment.started_at.is_none() {
                assignment.started_at = Some(now);
                tx.update_assignment(&assignment)?;
            }

            let Some(task) = tx.task(assignment.task_id)? else {
                return Ok(None);
            };
            Ok(Some(AssignmentLease { assignment, task }))
        })
    }

    /// Accept a node's result for one assignment — at most once.
    ///
    /// When this was the last outstanding assignment, the task flips to
    /// `completed` and the trust-weighted validator decides it in the same
    /// transaction, under the task-row lock.
    pub fn submit_result(
        &self,
        task_id: TaskId,
        node_id: NodeId,
        result: &Value,
    ) -> Result<(), HubError> {
        if result.is_null() {
            return Err(HubError::validation("result", "must not be null"));
        }

        let now = self.clock.now();
        let validator = Validator::new(&self.config);

        let settled = with_tx(self.store.as_ref(), Deadline::NONE, |tx| {
            // Task row first — the fixed Task → Assignment lock order.
            let Some(mut task) = tx.lock_task(task_id)? else {
                return Err(HubError::not_found("task", task_id));
            };
            let Some(mut assignment) = tx.assignment_for(task_id, node_id)? else {
                return Err(HubError::not_found("assignment", format!("{task_id}/{node_id}")));
            };
            if assignment.is_completed() {
                return Err(HubError::AlreadySubmitted {
                    task: task_id,
                    node: node_id,
                });
            }

            assignment.result = Some(ResultEnvelope(result.clone()));
            assignment.completed_at = Some(now);
            tx.update_assignment(&assignment)?;

            let all_done = tx
                .assignments_by_task(task_id)?
                .iter()
                .all(|a| a.is_completed());
            if !all_done || task.status == TaskStatus::Completed {
                return Ok(None);
            }

            task.status = TaskStatus::Completed;
            tx.update_task(&task)?;
            validator.validate_task(tx, &mut task)?;
            Ok(Some((task.status, task.submitted_by)))
        })?;

        info!(task = %task_id, node = %node_id, "task result accepted");
        if let Some((status, submitter)) = settled {
            if let Some(submitter) = submitter {
                self.publish_task_update(submitter, task_id, status);
            }
            self.publish_activity();
        }
        Ok(())
    }

    // ── Read-only surface ─────────────────────────────────────────────────────

    pub fn list_nodes(&self) -> Result<Vec<Node>, HubError> {
        with_tx(self.store.as_ref(), Deadline::NONE, |tx| Ok(tx.nodes()?))
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>, HubError> {
        with_tx(self.store.as_ref(), Deadline::NONE, |tx| Ok(tx.tasks()?))
    }

    pub fn get_task(&self, task_id: TaskId) -> Result<Task, HubError> {
        with_tx(self.store.as_ref(), Deadline::NONE, |tx| {
            tx.task(task_id)?
                .ok_or_else(|| HubError::not_found("task", task_id))
        })
    }

    /// Task detail plus one node's assignment context, if any.
    pub fn get_task_for_node(
        &self,
        task_id: TaskId,
        node_id: NodeId,
    ) -> Result<TaskWithAssignment, HubError> {
        with_tx(self.store.as_ref(), Deadline::NONE, |tx| {
            let Some(task) = tx.task(task_id)? else {
                return Err(HubError::not_found("task", task_id));
            };
            let assignment = tx.assignment_for(task_id, node_id)?;
            Ok(TaskWithAssignment { task, assignment })
        })
    }

    /// All tasks submitted by `node_id`.
    pub fn get_submitted_tasks(&self, node_id: NodeId) -> Result<Vec<Task>, HubError> {
        with_tx(self.store.as_ref(), Deadline::NONE, |tx| {
            if tx.node(node_id)?.is_none() {
                return Err(HubError::not_found("node", node_id));
            }
            Ok(tx.tasks_by_submitter(node_id)?)
        })
    }

    /// Aggregate fleet/queue snapshot.
    pub fn network_activity(&self) -> Result<NetworkActivity, HubError> {
        with_tx(self.store.as_ref(), Deadline::NONE, |tx| activity_snapshot(tx))
    }

    // ── Event emission ────────────────────────────────────────────────────────

    fn publish_task_update(&self, submitter: NodeId, task_id: TaskId, status: TaskStatus) {
        publish_best_effort(
            self.bus.as_ref(),
            topics::TASK_UPDATES,
            json!({
                "type": "task_update",
                "node_id": submitter.to_string(),
                "task_id": task_id.to_string(),
                "status": status.as_str(),
                "action": "refetch",
            }),
        );
    }

    fn publish_activity(&self) {
        let snapshot = with_tx(self.store.as_ref(), Deadline::NONE, |tx| {
            activity_snapshot(tx)
        });
        if let Ok(snapshot) = snapshot {
            if let Ok(payload) = serde_json::to_value(snapshot) {
                publish_best_effort(self.bus.as_ref(), topics::NETWORK_ACTIVITY, payload);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Assignment engine: drives tasks through the overlap state machine.
//!
//! For every task in the active queue the engine tops its assignment set up
//! to `overlap_count`, one candidate per transaction, skipping candidates
//! lost to the already-assigned race. Tasks that find no candidate at all
//! accrue staleness; staleness past the cap fails the task, failed tasks
//! below the cap are retried, and failed tasks at the cap are collected.
//!
//! The engine is also the sole owner of the node-death cascade — the only
//! path that may move a task *backwards* from `in_progress` to `in_queue`.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::clock::{Clock, Deadline};
use crate::config::Config;
use crate::error::HubError;
use crate::model::{Assignment, NodeId, NodeStatus, TaskId, TaskStatus};
use crate::scheduler::{placer, SchedulingPolicy};
use crate::store::{with_tx, Store, StoreError};

/// Result of one [`AssignmentEngine::assign_to_nodes`] sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AssignmentSweep {
    /// Assignments created across all tasks.
    pub created: usize,
    /// Tasks that found no eligible candidate and went stale.
    pub stale_marked: usize,
}

/// Result of one node-death cascade.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CascadeOutcome {
    /// Tasks that lost at least one assignment.
    pub affected: Vec<TaskId>,
    /// Tasks returned to `in_queue` (lost their last assignment).
    pub requeued: usize,
    /// Tasks promoted to `in_progress` (kept at least one assignment).
    pub promoted: usize,
}

/// Creates and retracts assignments; owns staleness, retry, GC and the
/// node-death cascade.
pub struct AssignmentEngine<'a> {
    config: &'a Config,
    policy: &'a dyn SchedulingPolicy,
    clock: &'a dyn Clock,
}

impl<'a> AssignmentEngine<'a> {
    pub fn new(config: &'a Config, policy: &'a dyn SchedulingPolicy, clock: &'a dyn Clock) -> Self {
        Self {
            config,
            policy,
            clock,
        }
    }

    // ── Assignment sweep ──────────────────────────────────────────────────────

    /// Top up assignments for every `{in_queue, in_progress}` task.
    pub fn assign_to_nodes(
        &self,
        store: &dyn Store,
        deadline: Deadline,
    ) -> Result<AssignmentSweep, HubError> {
        // Snapshot the active set; each task is then processed against live
        // state in its own transactions.
        let active_ids: Vec<TaskId> = with_tx(store, deadline, |tx| {
            let mut ids: Vec<TaskId> = tx
                .tasks_by_status(TaskStatus::InProgress)?
                .into_iter()
                .map(|t| t.id)
                .collect();
            ids.extend(tx.tasks_by_status(TaskStatus::InQueue)?.into_iter().map(|t| t.id));
            Ok(ids)
        })?;

        let mut sweep = AssignmentSweep::default();
        for task_id in active_ids {
            self.assign_one(store, deadline, task_id, &mut sweep)?;
        }
        Ok(sweep)
    }

    /// Drive a single task: promote if already covered, go stale if no
    /// candidate exists, otherwise create the missing assignments in rank
    /// order.
    fn assign_one(
        &self,
        store: &dyn Store,
        deadline: Deadline,
        task_id: TaskId,
        sweep: &mut AssignmentSweep,
    ) -> Result<(), HubError> {
        enum Plan {
            Skip,
            WentStale,
            Candidates { already: usize, nodes: Vec<NodeId> },
        }

        // Phase 1: read the task, its coverage, and the ranked candidates.
        let plan = with_tx(store, deadline, |tx| {
            let Some(mut task) = tx.lock_task(task_id)? else {
                return Ok(Plan::Skip);
            };
            if !task.is_active() {
                return Ok(Plan::Skip);
            }

            let assigned: BTreeSet<NodeId> = tx
                .assignments_by_task(task.id)?
                .into_iter()
                .map(|a| a.node_id)
                .collect();

            if assigned.len() >= task.overlap_count as usize {
                info!(
                    task = %task.id,
                    assigned = assigned.len(),
                    overlap = task.overlap_count,
                    "task already fully assigned"
                );
                if task.status == TaskStatus::InQueue {
                    task.status = TaskStatus::InProgress;
                    tx.update_task(&task)?;
                }
                return Ok(Plan::Skip);
            }

            let active_nodes = tx.nodes_by_status(NodeStatus::Active)?;
            let mut candidates = placer::eligible(active_nodes, &task, &assigned);

            if candidates.is_empty() {
                // Scheduling pressure is not an error: record staleness and
                // let the next tick retry.
                task.stale_count += 1;
                tx.update_task(&task)?;
                warn!(
                    task = %task.id,
                    stale_count = task.stale_count,
                    "no candidate nodes, task marked stale"
                );
                return Ok(Plan::WentStale);
            }

            self.policy.rank(&mut candidates, &task);
            let remaining = task.overlap_count as usize - assigned.len();
            candidates.truncate(remaining);
            Ok(Plan::Candidates {
                already: assigned.len(),
                nodes: candidates.into_iter().map(|n| n.id).collect(),
            })
        })?;

        let (already, candidate_ids) = match plan {
            Plan::Skip => return Ok(()),
            Plan::WentStale => {
                sweep.stale_marked += 1;
                return Ok(());
            }
            Plan::Candidates { already, nodes } => (already, nodes),
        };

        // Phase 2: one transaction per assignment, so a crash or conflict
        // mid-way leaves a consistent prefix.
        let mut created_here = 0;
        for node_id in candidate_ids {
            let created = self.try_assign(store, deadline, task_id, node_id)?;
            if created {
                created_here += 1;
                sweep.created += 1;
                info!(
                    task = %task_id,
                    node = %node_id,
                    coverage = already + created_here,
                    "assigned task to node"
                );
            }
        }
        Ok(())
    }

    /// Create one assignment. Returns `false` when the candidate was lost to
    /// a race (pair already exists, node no longer active, task no longer
    /// active).
    fn try_assign(
        &self,
        store: &dyn Store,
        deadline: Deadline,
        task_id: TaskId,
        node_id: NodeId,
    ) -> Result<bool, HubError> {
        let now = self.clock.now();

        with_tx(store, deadline, |tx| {
            let Some(mut task) = tx.lock_task(task_id)? else {
                return Ok(false);
            };
            if !task.is_active() {
                return Ok(false);
            }
            // The candidate snapshot is stale by one transaction; never
            // assign onto a node that went inactive in between.
            let still_active = tx
                .node(node_id)?
                .map(|n| n.status == NodeStatus::Active)
                .unwrap_or(false);
            if !still_active {
                return Ok(false);
            }

            match tx.insert_assignment(Assignment::new(task_id, node_id, now)) {
                Ok(()) => {}
                Err(StoreError::DuplicateAssignment { .. }) => {
                    // Already-assigned race: another handler won. Skip.
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
            }

            if task.status == TaskStatus::InQueue {
                task.status = TaskStatus::InProgress;
                tx.update_task(&task)?;
            }
            Ok(true)
        })
    }

    // ── Staleness, retry, GC ──────────────────────────────────────────────────

    /// Fail every `in_queue` task whose staleness reached the cap.
    pub fn handle_stale_tasks(
        &self,
        store: &dyn Store,
        deadline: Deadline,
    ) -> Result<usize, HubError> {
        let cap = self.config.max_stale;
        with_tx(store, deadline, |tx| {
            let mut failed = 0;
            for mut task in tx.tasks_by_status(TaskStatus::InQueue)? {
                if task.stale_count < cap {
                    continue;
                }
                task.status = TaskStatus::Failed;
                tx.update_task(&task)?;
                failed += 1;
                info!(task = %task.id, stale_count = task.stale_count, "task failed: stale cap reached");
            }
            Ok(failed)
        })
    }

    /// Reset failed tasks below the stale cap back to `pending`, clearing
    /// their assignments. The stale counter is preserved so persistently
    /// failing tasks still hit the cap.
    pub fn retry_failed_tasks(
        &self,
        store: &dyn Store,
        deadline: Deadline,
    ) -> Result<usize, HubError> {
        let cap = self.config.max_stale;
        let now = self.clock.now();

        with_tx(store, deadline, |tx| {
            let mut retried = 0;
            for mut task in tx.tasks_by_status(TaskStatus::Failed)? {
                if task.stale_count >= cap {
                    continue;
                }
                tx.delete_assignments_by_task(task.id)?;
                task.status = TaskStatus::Pending;
                task.last_attempted = Some(now);
                tx.update_task(&task)?;
                retried += 1;
                info!(task = %task.id, "failed task reset to pending, assignments cleared");
            }
            Ok(retried)
        })
    }

    /// Delete failed tasks that exhausted the stale cap.
    pub fn collect_exhausted_tasks(
        &self,
        store: &dyn Store,
        deadline: Deadline,
    ) -> Result<usize, HubError> {
        let cap = self.config.max_stale;
        with_tx(store, deadline, |tx| {
            let doomed: Vec<TaskId> = tx
                .tasks_by_status(TaskStatus::Failed)?
                .into_iter()
                .filter(|t| t.stale_count >= cap)
                .map(|t| t.id)
                .collect();

            for task_id in &doomed {
                tx.delete_assignments_by_task(*task_id)?;
                tx.delete_task(*task_id)?;
            }
            if !doomed.is_empty() {
                warn!(
                    collected = doomed.len(),
                    "deleted persistently failing tasks"
                );
            }
            Ok(doomed.len())
        })
    }

    // ── Node-death cascade ────────────────────────────────────────────────────

    /// Retract every assignment held by `dead_nodes` and repair the affected
    /// tasks:
    ///
    /// * zero assignments left → back to `in_queue` (reschedulable);
    /// * assignments remain and the task sits in `{pending, in_queue}` →
    ///   `in_progress`.
    ///
    /// Completed, validated, failed and invalid tasks are never touched.
    pub fn handle_tasks_for_inactive_nodes(
        &self,
        store: &dyn Store,
        deadline: Deadline,
        dead_nodes: &[NodeId],
    ) -> Result<CascadeOutcome, HubError> {
        if dead_nodes.is_empty() {
            return Ok(CascadeOutcome::default());
        }

        with_tx(store, deadline, |tx| {
            let affected = tx.delete_assignments_by_nodes(dead_nodes)?;
            info!(
                nodes = dead_nodes.len(),
                affected_tasks = affected.len(),
                "removed assignments for inactive nodes"
            );

            let mut outcome = CascadeOutcome {
                affected: affected.clone(),
                ..CascadeOutcome::default()
            };

            for task_id in affected {
                let Some(mut task) = tx.lock_task(task_id)? else {
                    continue;
                };
                if !matches!(
                    task.status,
                    TaskStatus::Pending | TaskStatus::InQueue | TaskStatus::InProgress
                ) {
                    continue;
                }

                let remaining = tx.assignments_by_task(task_id)?.len();
                if remaining == 0 {
                    if task.status != TaskStatus::InQueue {
                        task.status = TaskStatus::InQueue;
                        tx.update_task(&task)?;
                    }
                    outcome.requeued += 1;
                    info!(task = %task_id, "task lost all assignments, requeued");
                } else if matches!(task.status, TaskStatus::Pending | TaskStatus::InQueue) {
                    task.status = TaskStatus::InProgress;
                    tx.update_task(&task)?;
                    outcome.promoted += 1;
                }
            }
            Ok(outcome)
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Transactional store port.
//!
//! The store is the **only** shared mutable resource in the core. Every
//! component blocks solely at this boundary: a [`Store`] hands out one
//! [`StoreTx`] at a time per call site, all reads and writes go through the
//! transaction, and partial work disappears on [`StoreTx::rollback`] (or on
//! drop without commit).
//!
//! # Indexes
//! Implementations must answer the scan methods from indexes, not full-table
//! walks: `Task(status)`, `Task(status, stale_count)`, `Assignment(task_id)`,
//! `Assignment(node_id)`, `Node(status, last_heartbeat)`.
//!
//! # Locking discipline
//! Row locks are acquired in the fixed order **Task → Assignment → Node** to
//! prevent cycles. `lock_task` / `lock_node` are the `SELECT … FOR UPDATE`
//! equivalents: the returned row may not be observed or modified by any other
//! transaction until this one finishes. The in-memory reference store
//! ([`memory::MemoryStore`]) satisfies both rules trivially by serialising
//! whole transactions.
//!
//! # Deadlines
//! Every transaction carries the [`Deadline`] of the tick or request that
//! opened it; operations fail with [`StoreError::DeadlineExceeded`] once it
//! passes, and the transaction rolls back at the boundary.

pub mod memory;

use thiserror::Error;
use tracing::warn;

use crate::clock::Deadline;
use crate::error::HubError;
use crate::model::{
    Assignment, AssignmentId, Node, NodeId, NodeStatus, Task, TaskId, TaskStatus,
};

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failures surfaced by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-pair violation on `(task_id, node_id)`.
    ///
    /// During assignment this is the already-assigned race, handled by
    /// skipping the candidate; everywhere else it is a logic error surfaced
    /// as a conflict.
    #[error("assignment ({task}, {node}) violates the unique pair constraint")]
    DuplicateAssignment { task: TaskId, node: NodeId },

    /// Lock or lease contention that may clear on retry.
    #[error("store busy: {0}")]
    Busy(String),

    /// The transaction deadline passed before the operation completed.
    #[error("transaction deadline exceeded")]
    DeadlineExceeded,

    /// The backend is gone. Fatal for the host to handle.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether a local bounded retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

// ── Ports ─────────────────────────────────────────────────────────────────────

/// Transaction factory.
pub trait Store: Send + Sync {
    /// Open a transaction bounded by `deadline`.
    fn begin<'a>(&'a self, deadline: Deadline) -> Result<Box<dyn StoreTx + 'a>, StoreError>;
}

/// One open transaction: CRUD, indexed scans and row locks over the three
/// tables. Dropping the transaction without [`StoreTx::commit`] rolls it
/// back.
pub trait StoreTx {
    // ── Nodes ─────────────────────────────────────────────────────────────────

    fn insert_node(&mut self, node: Node) -> Result<(), StoreError>;
    fn node(&mut self, id: NodeId) -> Result<Option<Node>, StoreError>;
    /// `SELECT … FOR UPDATE` on a node row.
    fn lock_node(&mut self, id: NodeId) -> Result<Option<Node>, StoreError>;
    fn update_node(&mut self, node: &Node) -> Result<(), StoreError>;
    fn nodes(&mut self) -> Result<Vec<Node>, StoreError>;
    /// Index scan `Node(status, last_heartbeat)`.
    fn nodes_by_status(&mut self, status: NodeStatus) -> Result<Vec<Node>, StoreError>;

    // ── Tasks ─────────────────────────────────────────────────────────────────

    fn insert_task(&mut self, task: Task) -> Result<(), StoreError>;
    fn task(&mut self, id: TaskId) -> Result<Option<Task>, StoreError>;
    /// `SELECT … FOR UPDATE` on a task row.
    fn lock_task(&mut self, id: TaskId) -> Result<Option<Task>, StoreError>;
    fn update_task(&mut self, task: &Task) -> Result<(), StoreError>;
    fn delete_task(&mut self, id: TaskId) -> Result<bool, StoreError>;
    fn tasks(&mut self) -> Result<Vec<Task>, StoreError>;
    /// Index scan `Task(status)`.
    fn tasks_by_status(&mut self, status: TaskStatus) -> Result<Vec<Task>, StoreError>;
    fn tasks_by_submitter(&mut self, node: NodeId) -> Result<Vec<Task>, StoreError>;
    /// `COUNT(*)` over `Task(status)` for each listed status.
    fn count_tasks_by_statuses(&mut self, statuses: &[TaskStatus]) -> Result<usize, StoreError>;

    // ── Assignments ───────────────────────────────────────────────────────────

    /// Insert a new assignment. Fails with
    /// [`StoreError::DuplicateAssignment`] when the `(task_id, node_id)` pair
    /// already exists.
    fn insert_assignment(&mut self, assignment: Assignment) -> Result<(), StoreError>;
    fn assignment(&mut self, id: AssignmentId) -> Result<Option<Assignment>, StoreError>;
    /// Point lookup on the unique `(task_id, node_id)` pair.
    fn assignment_for(
        &mut self,
        task: TaskId,
        node: NodeId,
    ) -> Result<Option<Assignment>, StoreError>;
    fn update_assignment(&mut self, assignment: &Assignment) -> Result<(), StoreError>;
    /// Index scan `Assignment(task_id)`, ordered by `assigned_at`.
    fn assignments_by_task(&mut self, task: TaskId) -> Result<Vec<Assignment>, StoreError>;
    /// Index scan `Assignment(node_id)`, ordered by `assigned_at`.
    fn assignments_by_node(&mut self, node: NodeId) -> Result<Vec<Assignment>, StoreError>;
    fn delete_assignments_by_task(&mut self, task: TaskId) -> Result<usize, StoreError>;
    /// Range delete by `node_id ∈ nodes`; returns the distinct affected task
    /// ids so the caller can run the cascade fixups.
    fn delete_assignments_by_nodes(
        &mut self,
        nodes: &[NodeId],
    ) -> Result<Vec<TaskId>, StoreError>;

    // ── Transaction control ───────────────────────────────────────────────────

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
    fn rollback(self: Box<Self>);
}

// ── Transaction helper ────────────────────────────────────────────────────────

/// Bound on local retries for transient store failures.
pub const TRANSIENT_RETRIES: u32 = 3;

/// Run `body` inside a transaction, committing on `Ok` and rolling back on
/// `Err`.
///
/// Transient store failures ([`StoreError::is_transient`]) restart the whole
/// transaction up to [`TRANSIENT_RETRIES`] times before being surfaced;
/// everything else propagates immediately. The body must therefore be safe to
/// re-run from scratch — which every hub transaction is, since all state
/// lives behind the transaction it reopens.
pub fn with_tx<T>(
    store: &dyn Store,
    deadline: Deadline,
    mut body: impl FnMut(&mut dyn StoreTx) -> Result<T, HubError>,
) -> Result<T, HubError> {
    let mut attempt = 0;
    loop {
        attempt += 1;

        let mut tx = match store.begin(deadline) {
            Ok(tx) => tx,
            Err(err) if err.is_transient() && attempt <= TRANSIENT_RETRIES => {
                warn!(attempt, error = %err, "store busy opening transaction, retrying");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        match body(tx.as_mut()) {
            Ok(value) => match tx.commit() {
                Ok(()) => return Ok(value),
                Err(err) if err.is_transient() && attempt <= TRANSIENT_RETRIES => {
                    warn!(attempt, error = %err, "transient commit failure, retrying");
                    continue;
                }
                Err(err) => return Err(err.into()),
            },
            Err(HubError::Transient(err)) if err.is_transient() && attempt <= TRANSIENT_RETRIES => {
                warn!(attempt, error = %err, "transient store failure, retrying transaction");
                tx.rollback();
                continue;
            }
            Err(err) => {
                tx.rollback();
                return Err(err);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

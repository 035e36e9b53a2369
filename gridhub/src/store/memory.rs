/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! In-memory reference implementation of the store port.
//!
//! Three `BTreeMap` tables keyed by id — `BTreeMap` (not `HashMap`) so every
//! scan iterates in a stable order and scheduling stays deterministic across
//! runs. Transactions are serialised by one coarse mutex, which makes the
//! row-lock methods and the Task → Assignment → Node lock order trivially
//! correct; rollback restores a snapshot taken at `begin`.
//!
//! This backend exists for the daemon's single-process mode and for tests.
//! A durable backend plugs in behind [`Store`] without touching the core.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use crate::clock::Deadline;
use crate::model::{
    Assignment, AssignmentId, Node, NodeId, NodeStatus, Task, TaskId, TaskStatus,
};
use crate::store::{Store, StoreError, StoreTx};

// ── Tables ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct Tables {
    nodes: BTreeMap<NodeId, Node>,
    tasks: BTreeMap<TaskId, Task>,
    assignments: BTreeMap<AssignmentId, Assignment>,
}

// ── MemoryStore ───────────────────────────────────────────────────────────────

/// Process-local transactional store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn begin<'a>(&'a self, deadline: Deadline) -> Result<Box<dyn StoreTx + 'a>, StoreError> {
        if deadline.expired() {
            return Err(StoreError::DeadlineExceeded);
        }
        let guard = self
            .tables
            .lock()
            .map_err(|_| StoreError::Unavailable("store mutex poisoned".into()))?;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTx {
            tables: guard,
            snapshot: Some(snapshot),
            deadline,
            committed: false,
        }))
    }
}

// ── MemoryTx ──────────────────────────────────────────────────────────────────

struct MemoryTx<'a> {
    tables: MutexGuard<'a, Tables>,
    /// Pre-transaction image, restored on rollback. `None` once committed.
    snapshot: Option<Tables>,
    deadline: Deadline,
    committed: bool,
}

impl MemoryTx<'_> {
    fn guard(&self) -> Result<(), StoreError> {
        if self.deadline.expired() {
            return Err(StoreError::DeadlineExceeded);
        }
        Ok(())
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        // Drop without commit = rollback.
        if !self.committed {
            if let Some(snapshot) = self.snapshot.take() {
                *self.tables = snapshot;
            }
        }
    }
}

/// Stable ordering for assignment scans: `(assigned_at, id)`.
fn sort_assignments(rows: &mut [Assignment]) {
    rows.sort_by(|a, b| {
        a.assigned_at
            .cmp(&b.assigned_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

impl StoreTx for MemoryTx<'_> {
    // ── Nodes ─────────────────────────────────────────────────────────────────

    fn insert_node(&mut self, node: Node) -> Result<(), StoreError> {
        self.guard()?;
        self.tables.nodes.insert(node.id, node);
        Ok(())
    }

    fn node(&mut self, id: NodeId) -> Result<Option<Node>, StoreError> {
        self.guard()?;
        Ok(self.tables.nodes.get(&id).cloned())
    }

    fn lock_node(&mut self, id: NodeId) -> Result<Option<Node>, StoreError> {
        // Transactions are fully serialised; the read is the lock.
        self.node(id)
    }

    fn update_node(&mut self, node: &Node) -> Result<(), StoreError> {
        self.guard()?;
        self.tables.nodes.insert(node.id, node.clone());
        Ok(())
    }

    fn nodes(&mut self) -> Result<Vec<Node>, StoreError> {
        self.guard()?;
        Ok(self.tables.nodes.values().cloned().collect())
    }

    fn nodes_by_status(&mut self, status: NodeStatus) -> Result<Vec<Node>, StoreError> {
        self.guard()?;
        let mut rows: Vec<Node> = self
            .tables
            .nodes
            .values()
            .filter(|n| n.status == status)
            .cloned()
            .collect();
        // Matches the Node(status, last_heartbeat) index order.
        rows.sort_by(|a, b| {
            a.last_heartbeat
                .cmp(&b.last_heartbeat)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(rows)
    }

    // ── Tasks ─────────────────────────────────────────────────────────────────

    fn insert_task(&mut self, task: Task) -> Result<(), StoreError> {
        self.guard()?;
        self.tables.tasks.insert(task.id, task);
        Ok(())
    }

    fn task(&mut self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.guard()?;
        Ok(self.tables.tasks.get(&id).cloned())
    }

    fn lock_task(&mut self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.task(id)
    }

    fn update_task(&mut self, task: &Task) -> Result<(), StoreError> {
        self.guard()?;
        self.tables.tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn delete_task(&mut self, id: TaskId) -> Result<bool, StoreError> {
        self.guard()?;
        Ok(self.tables.tasks.remove(&id).is_some())
    }

    fn tasks(&mut self) -> Result<Vec<Task>, StoreError> {
        self.guard()?;
        Ok(self.tables.tasks.values().cloned().collect())
    }

    fn tasks_by_status(&mut self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        self.guard()?;
        Ok(self
            .tables
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    fn tasks_by_submitter(&mut self, node: NodeId) -> Result<Vec<Task>, StoreError> {
        self.guard()?;
        Ok(self
            .tables
            .tasks
            .values()
            .filter(|t| t.submitted_by == Some(node))
            .cloned()
            .collect())
    }

    fn count_tasks_by_statuses(&mut self, statuses: &[TaskStatus]) -> Result<usize, StoreError> {
        self.guard()?;
        Ok(self
            .tables
            .tasks
            .values()
            .filter(|t| statuses.contains(&t.status))
            .count())
    }

    // ── Assignments ───────────────────────────────────────────────────────────

    fn insert_assignment(&mut self, assignment: Assignment) -> Result<(), StoreError> {
        self.guard()?;
        let duplicate = self
            .tables
            .assignments
            .values()
            .any(|a| a.task_id == assignment.task_id && a.node_id == assignment.node_id);
        if duplicate {
            return Err(StoreError::DuplicateAssignment {
                task: assignment.task_id,
                node: assignment.node_id,
            });
        }
        self.tables.assignments.insert(assignment.id, assignment);
        Ok(())
    }

    fn assignment(&mut self, id: AssignmentId) -> Result<Option<Assignment>, StoreError> {
        self.guard()?;
        Ok(self.tables.assignments.get(&id).cloned())
    }

    fn assignment_for(
        &mut self,
        task: TaskId,
        node: NodeId,
    ) -> Result<Option<Assignment>, StoreError> {
        self.guard()?;
        Ok(self
            .tables
            .assignments
            .values()
            .find(|a| a.task_id == task && a.node_id == node)
            .cloned())
    }

    fn update_assignment(&mut self, assignment: &Assignment) -> Result<(), StoreError> {
        self.guard()?;
        self.tables
            .assignments
            .insert(assignment.id, assignment.clone());
        Ok(())
    }

    fn assignments_by_task(&mut self, task: TaskId) -> Result<Vec<Assignment>, StoreError> {
        self.guard()?;
        let mut rows: Vec<Assignment> = self
            .tables
            .assignments
            .values()
            .filter(|a| a.task_id == task)
            .cloned()
            .collect();
        sort_assignments(&mut rows);
        Ok(rows)
    }

    fn assignments_by_node(&mut self, node: NodeId) -> Result<Vec<Assignment>, StoreError> {
        self.guard()?;
        let mut rows: Vec<Assignment> = self
            .tables
            .assignments
            .values()
            .filter(|a| a.node_id == node)
            .cloned()
            .collect();
        sort_assignments(&mut rows);
        Ok(rows)
    }

    fn delete_assignments_by_task(&mut self, task: TaskId) -> Result<usize, StoreError> {
        self.guard()?;
        let doomed: Vec<AssignmentId> = self
            .tables
            .assignments
            .values()
            .filter(|a| a.task_id == task)
            .map(|a| a.id)
            .collect();
        for id in &doomed {
            self.tables.assignments.remove(id);
        }
        Ok(doomed.len())
    }

    fn delete_assignments_by_nodes(
        &mut self,
        nodes: &[NodeId],
    ) -> Result<Vec<TaskId>, StoreError> {
        self.guard()?;
        let mut affected = BTreeSet::new();
        let doomed: Vec<AssignmentId> = self
            .tables
            .assignments
            .values()
            .filter(|a| nodes.contains(&a.node_id))
            .map(|a| {
                affected.insert(a.task_id);
                a.id
            })
            .collect();
        for id in &doomed {
            self.tables.assignments.remove(id);
        }
        Ok(affected.into_iter().collect())
    }

    // ── Transaction control ───────────────────────────────────────────────────

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.guard()?;
        self.committed = true;
        self.snapshot = None;
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        // Drop restores the snapshot.
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

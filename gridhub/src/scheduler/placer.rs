/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Candidate selection for task placement.
//!
//! The placer is pure over a snapshot of the fleet: it filters the eligible
//! candidate set and scores resource fit. Ordering of the survivors belongs
//! to the active [`SchedulingPolicy`](super::SchedulingPolicy); mutation
//! belongs to the assignment engine.

use std::collections::BTreeSet;

use tracing::debug;

use crate::model::{Node, NodeId, NodeStatus, Task};

/// Filter the candidate set for `task`:
/// active nodes, trusted at least as much as the task demands, minus the
/// nodes that already hold an assignment for it.
pub fn eligible(nodes: Vec<Node>, task: &Task, already_assigned: &BTreeSet<NodeId>) -> Vec<Node> {
    let candidates: Vec<Node> = nodes
        .into_iter()
        .filter(|n| {
            n.status == NodeStatus::Active
                && n.trust_index >= task.trust_index_required
                && !already_assigned.contains(&n.id)
        })
        .collect();

    debug!(
        task = %task.id,
        candidates = candidates.len(),
        excluded = already_assigned.len(),
        "placement candidates filtered"
    );
    candidates
}

/// Resource-fit score of `node` for `task`. **Lower is better.**
///
/// ```text
/// suitability = |free.cpu − req.cpu| / max(1, req.cpu)
///             + |free.ram − req.ram| / max(1, req.ram)
/// ```
///
/// The distance form deliberately prefers nodes whose free capacity is close
/// to the requirement: packing tight reduces fragmentation instead of
/// greedily draining the largest node. Unreported node dimensions count as
/// `0`; unspecified task requirements count as `1`.
pub fn suitability(node: &Node, task: &Task) -> f64 {
    let free_cpu = node.free.get_or("cpu", 0.0);
    let free_ram = node.free.get_or("ram", 0.0);

    let req_cpu = task.resource_requirements.get_or("cpu", 1.0);
    let req_ram = task.resource_requirements.get_or("ram", 1.0);

    let cpu_score = (free_cpu - req_cpu).abs() / req_cpu.max(1.0);
    let ram_score = (free_ram - req_ram).abs() / req_ram.max(1.0);

    cpu_score + ram_score
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Node liveness: heartbeat ingestion and the periodic health scan.
//!
//! Heartbeats are write-only on the node row and never contend with task
//! processing. The health scan demotes silent nodes and hands the batch to
//! the assignment engine's cascade; it also sweeps already-inactive nodes
//! that still hold assignments, so orphaned work self-heals even if an
//! earlier cascade was lost. Trust is never changed here.

use serde_json::Value;
use tracing::{debug, info};

use crate::clock::{Clock, Deadline};
use crate::config::Config;
use crate::error::HubError;
use crate::model::{Node, NodeId, NodeStatus, ResourceVector};
use crate::store::{with_tx, Store, StoreTx};

/// Result of ingesting one heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatOutcome {
    pub node: Node,
    /// The heartbeat revived an inactive node.
    pub revived: bool,
}

/// Result of one health scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessScan {
    /// Nodes demoted `active → inactive` by this scan.
    pub demoted: Vec<NodeId>,
    /// Nodes whose assignments must be cascaded (the demoted set plus any
    /// older inactive nodes still holding assignments).
    pub cascade: Vec<NodeId>,
}

/// Heartbeat-driven node state transitions.
pub struct LivenessDetector<'a> {
    config: &'a Config,
    clock: &'a dyn Clock,
}

impl<'a> LivenessDetector<'a> {
    pub fn new(config: &'a Config, clock: &'a dyn Clock) -> Self {
        Self { config, clock }
    }

    /// Apply one heartbeat inside the caller's transaction.
    ///
    /// * `last_heartbeat` is always refreshed;
    /// * the free-resource payload is applied only when it projects to a
    ///   resource map, clamped componentwise to capacity so `free ≤ capacity`
    ///   holds; a malformed payload is ignored, the heartbeat still counts;
    /// * any status except `busy` becomes `active`.
    pub fn record_heartbeat(
        &self,
        tx: &mut dyn StoreTx,
        node_id: NodeId,
        free_resources: &Value,
    ) -> Result<HeartbeatOutcome, HubError> {
        let Some(mut node) = tx.lock_node(node_id)? else {
            return Err(HubError::not_found("node", node_id));
        };

        node.last_heartbeat = self.clock.now();

        match ResourceVector::from_json(free_resources) {
            Some(mut free) => {
                free.clamp_to(&node.capacity);
                node.free = free;
            }
            None => {
                if !free_resources.is_null() {
                    debug!(node = %node_id, "malformed free_resources payload ignored");
                }
            }
        }

        let revived = node.status == NodeStatus::Inactive;
        if node.status != NodeStatus::Busy {
            node.status = NodeStatus::Active;
        }
        tx.update_node(&node)?;

        if revived {
            info!(node = %node_id, name = %node.name, "node revived by heartbeat");
        }
        Ok(HeartbeatOutcome { node, revived })
    }

    /// Demote every active node silent for longer than the heartbeat timeout
    /// and compute the cascade batch.
    pub fn scan(&self, store: &dyn Store, deadline: Deadline) -> Result<LivenessScan, HubError> {
        let now = self.clock.now();
        let timeout = self.config.heartbeat_timeout();

        with_tx(store, deadline, |tx| {
            let mut scan = LivenessScan::default();

            for mut node in tx.nodes_by_status(NodeStatus::Active)? {
                let silence = now.duration_since(node.last_heartbeat).unwrap_or_default();
                if silence <= timeout {
                    continue;
                }
                node.status = NodeStatus::Inactive;
                tx.update_node(&node)?;
                scan.demoted.push(node.id);
                info!(
                    node = %node.id,
                    name = %node.name,
                    silence_secs = silence.as_secs(),
                    "node marked inactive: heartbeat timeout"
                );
            }

            // The cascade covers everything now inactive that still holds
            // work: the freshly demoted nodes and any stragglers.
            for node in tx.nodes_by_status(NodeStatus::Inactive)? {
                if scan.demoted.contains(&node.id) {
                    scan.cascade.push(node.id);
                } else if !tx.assignments_by_node(node.id)?.is_empty() {
                    scan.cascade.push(node.id);
                }
            }

            if !scan.demoted.is_empty() {
                info!(demoted = scan.demoted.len(), "node health scan complete");
            }
            Ok(scan)
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

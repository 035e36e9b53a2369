/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Trust-weighted result validation.
//!
//! When the last assignment of a task completes, the caller flips the task to
//! `completed` and invokes the validator **in the same transaction**, under
//! the task-row lock. Each distinct output is weighted by the sum of its
//! reporters' trust; the heaviest output wins if it clears the configured
//! share of the total. Ties at the top are broken by lexicographic order on
//! the output, so verdicts are deterministic.
//!
//! Trust moves only here: winners gain `trust_inc`, everyone else on a
//! validated task loses `trust_dec`, both clamped to
//! `[trust_min, trust_max]`. A failed vote changes no trust.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::HubError;
use crate::model::{Task, TaskResult, TaskStatus};
use crate::store::StoreTx;

/// Verdict of one validation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// The winning output cleared the threshold.
    Validated { output: String, trust_score: f64 },
    /// No output cleared the threshold (or no output existed at all).
    Failed,
    /// Fewer completed assignments than `overlap_count` — nothing decided.
    Incomplete,
}

/// Trust-weighted majority voting over a completed task.
pub struct Validator<'a> {
    config: &'a Config,
}

impl<'a> Validator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Decide a completed task inside the caller's transaction.
    ///
    /// `task` must be locked by the caller and in `completed` status; the
    /// final status (`validated` or `failed`) is written back through `tx`
    /// and mirrored into `task`.
    pub fn validate_task(
        &self,
        tx: &mut dyn StoreTx,
        task: &mut Task,
    ) -> Result<ValidationOutcome, HubError> {
        if task.status != TaskStatus::Completed {
            warn!(task = %task.id, status = %task.status, "validation requested for a non-completed task");
            return Ok(ValidationOutcome::Incomplete);
        }

        let completed: Vec<_> = tx
            .assignments_by_task(task.id)?
            .into_iter()
            .filter(|a| a.is_completed())
            .collect();

        if completed.len() != task.overlap_count as usize {
            warn!(
                task = %task.id,
                completed = completed.len(),
                overlap = task.overlap_count,
                "not all assignments are completed yet"
            );
            return Ok(ValidationOutcome::Incomplete);
        }

        // Sum-of-trust vote per distinct output. BTreeMap keeps outputs in
        // lexicographic order, which is exactly the tie-break rule.
        let mut weights: BTreeMap<String, f64> = BTreeMap::new();
        for assignment in &completed {
            let Some(output) = assignment.result.as_ref().and_then(|r| r.output()) else {
                continue;
            };
            let Some(node) = tx.node(assignment.node_id)? else {
                continue;
            };
            *weights.entry(output.to_string()).or_insert(0.0) += node.trust_index;
        }

        if weights.is_empty() {
            task.status = TaskStatus::Failed;
            tx.update_task(task)?;
            warn!(task = %task.id, "no valid results found, task failed");
            return Ok(ValidationOutcome::Failed);
        }

        // argmax by weight; the strict `>` keeps the lexicographically
        // smallest output on ties.
        let mut winner = "";
        let mut winning_weight = f64::NEG_INFINITY;
        let mut total = 0.0;
        for (output, weight) in &weights {
            total += weight;
            if *weight > winning_weight {
                winning_weight = *weight;
                winner = output.as_str();
            }
        }
        let winner = winner.to_string();
        let share = winning_weight / total;

        if share < self.config.validation_threshold {
            task.status = TaskStatus::Failed;
            tx.update_task(task)?;
            warn!(
                task = %task.id,
                share,
                threshold = self.config.validation_threshold,
                "task failed validation: insufficient trust weight"
            );
            return Ok(ValidationOutcome::Failed);
        }

        let trust_score = share * 10.0;
        task.status = TaskStatus::Validated;
        task.result = Some(TaskResult {
            validated_output: winner.clone(),
            trust_score,
        });
        tx.update_task(task)?;
        info!(task = %task.id, output = %winner, trust_score, "task validated");

        // Bounded trust adjustment for every participant.
        for mut assignment in completed {
            let Some(mut node) = tx.lock_node(assignment.node_id)? else {
                continue;
            };
            let matched = assignment.result.as_ref().and_then(|r| r.output()) == Some(&winner[..]);
            if matched {
                node.trust_index =
                    (node.trust_index + self.config.trust_inc).min(self.config.trust_max);
                assignment.validated = true;
                tx.update_assignment(&assignment)?;
            } else {
                node.trust_index =
                    (node.trust_index - self.config.trust_dec).max(self.config.trust_min);
            }
            tx.update_node(&node)?;
            info!(
                node = %node.id,
                name = %node.name,
                trust_index = node.trust_index,
                matched,
                "trust index adjusted"
            );
        }

        Ok(ValidationOutcome::Validated {
            output: winner,
            trust_score,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Deadline;
    use crate::model::{
        Assignment, ContainerSpec, Node, NodeId, NodeStatus, ResourceVector, ResultEnvelope,
        TaskId,
    };
    use crate::store::memory::MemoryStore;
    use crate::store::Store;
    use serde_json::json;
    use std::time::UNIX_EPOCH;

    fn make_node(trust: f64) -> Node {
        Node {
            id: NodeId::generate(),
            name: format!("worker-{trust}"),
            address: "10.0.0.1:7000".into(),
            status: NodeStatus::Active,
            trust_index: trust,
            capacity: ResourceVector::new().with("cpu", 4.0),
            free: ResourceVector::new().with("cpu", 4.0),
            last_heartbeat: UNIX_EPOCH,
        }
    }

    fn make_task(overlap: u32) -> Task {
        Task {
            id: TaskId::generate(),
            description: "t".into(),
            container_spec: ContainerSpec(json!({"image": "i", "command": "c"})),
            resource_requirements: ResourceVector::new(),
            trust_index_required: 1.0,
            overlap_count: overlap,
            status: TaskStatus::Completed,
            stale_count: 0,
            created_at: UNIX_EPOCH,
            last_attempted: None,
            result: None,
            submitted_by: None,
        }
    }

    /// Seed a completed task with one completed assignment per `(trust,
    /// output)` pair. Returns the node ids in input order.
    fn seed(
        store: &MemoryStore,
        task: &Task,
        votes: &[(f64, Option<&str>)],
    ) -> Vec<NodeId> {
        let mut tx = store.begin(Deadline::NONE).unwrap();
        tx.insert_task(task.clone()).unwrap();

        let mut ids = Vec::new();
        for (trust, output) in votes {
            let node = make_node(*trust);
            ids.push(node.id);
            tx.insert_node(node.clone()).unwrap();

            let mut assignment = Assignment::new(task.id, node.id, UNIX_EPOCH);
            assignment.completed_at = Some(UNIX_EPOCH);
            assignment.result = output.map(|o| ResultEnvelope(json!({ "output": o })));
            tx.insert_assignment(assignment).unwrap();
        }
        tx.commit().unwrap();
        ids
    }

    fn run(store: &MemoryStore, config: &Config, task_id: TaskId) -> (ValidationOutcome, Task) {
        let mut tx = store.begin(Deadline::NONE).unwrap();
        let mut task = tx.lock_task(task_id).unwrap().unwrap();
        let outcome = Validator::new(config)
            .validate_task(tx.as_mut(), &mut task)
            .unwrap();
        tx.commit().unwrap();
        (outcome, task)
    }

    fn trust_of(store: &MemoryStore, id: NodeId) -> f64 {
        let mut tx = store.begin(Deadline::NONE).unwrap();
        tx.node(id).unwrap().unwrap().trust_index
    }

    /// Trust 9 votes "A", two trust-1 nodes vote "B": A wins with weight 9 of
    /// 11, trust_score ≈ 8.18.
    #[test]
    fn trust_weighted_majority_beats_headcount() {
        let store = MemoryStore::new();
        let config = Config::default();
        let task = make_task(3);
        let ids = seed(
            &store,
            &task,
            &[(9.0, Some("A")), (1.0, Some("B")), (1.0, Some("B"))],
        );

        let (outcome, task_after) = run(&store, &config, task.id);

        let ValidationOutcome::Validated { output, trust_score } = outcome else {
            panic!("expected validation, got {outcome:?}");
        };
        assert_eq!(output, "A");
        assert!((trust_score - 10.0 * 9.0 / 11.0).abs() < 1e-9);

        assert_eq!(task_after.status, TaskStatus::Validated);
        let result = task_after.result.unwrap();
        assert_eq!(result.validated_output, "A");

        assert_eq!(trust_of(&store, ids[0]), 9.5, "winner gains trust");
        assert_eq!(trust_of(&store, ids[1]), 1.0, "already at the floor");
        assert_eq!(trust_of(&store, ids[2]), 1.0);
    }

    /// Equal weights split X/Y: share is exactly 0.5 ≥ threshold, and the
    /// lexicographic tie-break picks "X". With threshold 0.6 the same vote
    /// fails.
    #[test]
    fn even_split_resolves_by_lex_order_or_fails_on_higher_threshold() {
        let store = MemoryStore::new();
        let config = Config::default();
        let task = make_task(2);
        seed(&store, &task, &[(5.0, Some("Y")), (5.0, Some("X"))]);

        let (outcome, _) = run(&store, &config, task.id);
        assert_eq!(
            outcome,
            ValidationOutcome::Validated {
                output: "X".into(),
                trust_score: 5.0
            }
        );

        let store = MemoryStore::new();
        let strict = Config {
            validation_threshold: 0.6,
            ..Config::default()
        };
        let task = make_task(2);
        seed(&store, &task, &[(5.0, Some("Y")), (5.0, Some("X"))]);

        let (outcome, task_after) = run(&store, &strict, task.id);
        assert_eq!(outcome, ValidationOutcome::Failed);
        assert_eq!(task_after.status, TaskStatus::Failed);
    }

    /// Unanimity: trust_score is exactly 10 and nobody loses trust.
    #[test]
    fn unanimous_vote_scores_ten_and_rewards_everyone() {
        let store = MemoryStore::new();
        let config = Config::default();
        let task = make_task(3);
        let ids = seed(
            &store,
            &task,
            &[(2.0, Some("42")), (5.0, Some("42")), (9.9, Some("42"))],
        );

        let before: Vec<f64> = ids.iter().map(|id| trust_of(&store, *id)).collect();
        let (outcome, _) = run(&store, &config, task.id);

        let ValidationOutcome::Validated { trust_score, .. } = outcome else {
            panic!("unanimous vote must validate");
        };
        assert!((trust_score - 10.0).abs() < 1e-9);

        for (id, before) in ids.iter().zip(before) {
            let after = trust_of(&store, *id);
            assert!(after >= before, "no participant may lose trust");
        }
        assert_eq!(trust_of(&store, ids[2]), 10.0, "clamped at trust_max");
    }

    #[test]
    fn all_missing_outputs_fail_the_task_without_trust_changes() {
        let store = MemoryStore::new();
        let config = Config::default();
        let task = make_task(2);
        let ids = seed(&store, &task, &[(5.0, None), (7.0, None)]);

        let (outcome, task_after) = run(&store, &config, task.id);
        assert_eq!(outcome, ValidationOutcome::Failed);
        assert_eq!(task_after.status, TaskStatus::Failed);
        assert_eq!(trust_of(&store, ids[0]), 5.0, "failed vote moves no trust");
        assert_eq!(trust_of(&store, ids[1]), 7.0);
    }

    #[test]
    fn silent_node_loses_trust_when_others_validate() {
        let store = MemoryStore::new();
        let config = Config::default();
        let task = make_task(3);
        let ids = seed(
            &store,
            &task,
            &[(8.0, Some("ok")), (8.0, Some("ok")), (5.0, None)],
        );

        let (outcome, _) = run(&store, &config, task.id);
        assert!(matches!(outcome, ValidationOutcome::Validated { .. }));
        assert_eq!(trust_of(&store, ids[2]), 4.5, "no output counts as dissent");
    }

    #[test]
    fn incomplete_assignment_set_decides_nothing() {
        let store = MemoryStore::new();
        let config = Config::default();
        // overlap 3 but only 2 completed assignments seeded
        let task = make_task(3);
        seed(&store, &task, &[(5.0, Some("A")), (5.0, Some("A"))]);

        let (outcome, task_after) = run(&store, &config, task.id);
        assert_eq!(outcome, ValidationOutcome::Incomplete);
        assert_eq!(task_after.status, TaskStatus::Completed, "left untouched");
    }

    #[test]
    fn winning_assignments_are_flagged_validated() {
        let store = MemoryStore::new();
        let config = Config::default();
        let task = make_task(2);
        let ids = seed(&store, &task, &[(9.0, Some("A")), (1.0, Some("B"))]);

        run(&store, &config, task.id);

        let mut tx = store.begin(Deadline::NONE).unwrap();
        let a0 = tx.assignment_for(task.id, ids[0]).unwrap().unwrap();
        let a1 = tx.assignment_for(task.id, ids[1]).unwrap().unwrap();
        assert!(a0.validated);
        assert!(!a1.validated);
    }
}

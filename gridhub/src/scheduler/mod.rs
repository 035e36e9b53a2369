//! Scheduling policy for the hub.
//!
//! [`SchedulingPolicy`] is the capability the queue manager and assignment
//! engine consume: a priority score for queue ordering and a ranking rule for
//! placement candidates. Two implementations are selected at runtime by
//! [`Mechanism`]:
//!
//! * [`CustomPolicy`] — age-over-weight priority with staleness penalty and
//!   an in-progress boost; candidates ranked by closeness of resource fit.
//! * [`FifoPolicy`] — oldest task first; candidates ordered by heartbeat age.
//!
//! Both are pure over snapshots and deterministic: every ordering carries an
//! explicit `(created_at, id)` or `(last_heartbeat, id)` tie-break so that
//! repeated runs over identical state produce identical schedules.

pub mod assign;
pub mod placer;
pub mod queue;

use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{Config, Mechanism};
use crate::model::{Node, Task, TaskStatus};

use placer::suitability;

/// Scheduling capability: queue priority + candidate ranking.
pub trait SchedulingPolicy: Send + Sync {
    /// Priority of `task` at `now`. Higher is more urgent.
    fn priority(&self, task: &Task, now: SystemTime) -> f64;

    /// Order placement `candidates` for `task`, best first.
    fn rank(&self, candidates: &mut [Node], task: &Task);
}

/// Build the configured policy.
pub fn policy_for(config: &Config) -> Box<dyn SchedulingPolicy> {
    match config.mechanism {
        Mechanism::Custom => Box::new(CustomPolicy {
            stale_penalty_mult: config.stale_penalty_mult,
            in_progress_boost: config.in_progress_boost,
        }),
        Mechanism::Fifo => Box::new(FifoPolicy),
    }
}

/// Sort tasks by descending priority with the deterministic
/// `(created_at ASC, id ASC)` tie-break.
pub fn sort_by_priority_desc(tasks: &mut [Task], policy: &dyn SchedulingPolicy, now: SystemTime) {
    tasks.sort_by(|a, b| {
        policy
            .priority(b, now)
            .total_cmp(&policy.priority(a, now))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

// ── CustomPolicy ──────────────────────────────────────────────────────────────

/// Resource/trust-aware heuristic policy.
#[derive(Debug, Clone, Copy)]
pub struct CustomPolicy {
    pub stale_penalty_mult: f64,
    pub in_progress_boost: f64,
}

impl SchedulingPolicy for CustomPolicy {
    /// `(age / weight − stale_count × penalty) × boost`
    ///
    /// * `age` — seconds since creation; the longer a task waits, the more
    ///   urgent it becomes.
    /// * `weight = max(1, cpu + ram/2)` — heavier tasks climb slower.
    ///   Missing resource fields default to `0.5`.
    /// * repeated staleness pushes a task down so it cannot starve the queue;
    /// * in-progress tasks get a slight boost so they keep their slots.
    fn priority(&self, task: &Task, now: SystemTime) -> f64 {
        let age = now
            .duration_since(task.created_at)
            .unwrap_or_default()
            .as_secs_f64();

        let req = &task.resource_requirements;
        let weight = (req.get_or("cpu", 0.5) + req.get_or("ram", 0.5) / 2.0).max(1.0);

        let penalty = task.stale_count as f64 * self.stale_penalty_mult;

        let boost = if task.status == TaskStatus::InProgress {
            self.in_progress_boost
        } else {
            1.0
        };

        (age / weight - penalty) * boost
    }

    /// Ascending suitability (lower = closer resource fit), ties broken by
    /// higher trust, then id.
    fn rank(&self, candidates: &mut [Node], task: &Task) {
        candidates.sort_by(|a, b| {
            suitability(a, task)
                .total_cmp(&suitability(b, task))
                .then_with(|| b.trust_index.total_cmp(&a.trust_index))
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}

// ── FifoPolicy ────────────────────────────────────────────────────────────────

/// Strict arrival-order policy: no resource or staleness weighting.
#[derive(Debug, Clone, Copy)]
pub struct FifoPolicy;

impl SchedulingPolicy for FifoPolicy {
    /// Oldest first: the priority is the negated creation timestamp.
    fn priority(&self, task: &Task, _now: SystemTime) -> f64 {
        let epoch_secs = task
            .created_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        -epoch_secs
    }

    /// Candidates ordered by heartbeat age (stalest heartbeat first), ties by
    /// id.
    fn rank(&self, candidates: &mut [Node], _task: &Task) {
        candidates.sort_by(|a, b| {
            a.last_heartbeat
                .cmp(&b.last_heartbeat)
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

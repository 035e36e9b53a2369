//! Active-queue admission and preemptive reordering.
//!
//! The active queue is the bounded set of tasks in `{in_queue, in_progress}`;
//! everything `pending` is the backlog. The queue manager fills free slots
//! from the backlog by priority and, once per tick, may swap the weakest
//! unstarted queue entry against a markedly stronger backlog task.
//!
//! Repeatedly calling `admit` then `reorder` without other mutations is
//! idempotent once the preemption-band condition fails.

use tracing::{debug, info};

use crate::clock::{Clock, Deadline};
use crate::config::Config;
use crate::error::HubError;
use crate::model::{TaskId, TaskStatus};
use crate::scheduler::{sort_by_priority_desc, SchedulingPolicy};
use crate::store::{with_tx, Store};

/// Backlog ↔ active-queue discipline.
pub struct QueueManager<'a> {
    config: &'a Config,
    policy: &'a dyn SchedulingPolicy,
    clock: &'a dyn Clock,
}

impl<'a> QueueManager<'a> {
    pub fn new(config: &'a Config, policy: &'a dyn SchedulingPolicy, clock: &'a dyn Clock) -> Self {
        Self {
            config,
            policy,
            clock,
        }
    }

    /// Fill free active-queue slots with the top-priority backlog tasks.
    ///
    /// Each admitted task moves `pending → in_queue` and gets
    /// `last_attempted` stamped. Returns the number of admitted tasks.
    pub fn admit_from_backlog(
        &self,
        store: &dyn Store,
        deadline: Deadline,
    ) -> Result<usize, HubError> {
        let now = self.clock.now();

        with_tx(store, deadline, |tx| {
            let active = tx.count_tasks_by_statuses(&TaskStatus::ACTIVE)?;
            let slots = self.config.active_queue_size.saturating_sub(active);
            if slots == 0 {
                debug!(active, "no available slots in the active queue");
                return Ok(0);
            }

            let mut backlog = tx.tasks_by_status(TaskStatus::Pending)?;
            sort_by_priority_desc(&mut backlog, self.policy, now);

            let mut admitted = 0;
            for mut task in backlog.into_iter().take(slots) {
                task.status = TaskStatus::InQueue;
                task.last_attempted = Some(now);
                tx.update_task(&task)?;
                admitted += 1;
                info!(task = %task.id, "moved task to the active queue");
            }
            Ok(admitted)
        })
    }

    /// Swap the weakest unstarted queue entry for a markedly stronger backlog
    /// task — at most one swap per call.
    ///
    /// Only `in_queue` tasks are preemptable; `in_progress` work is never
    /// pulled back. The swap requires
    /// `priority(backlog best) > preemption_band × priority(queue weakest)`,
    /// the hysteresis that keeps near-equal tasks from ping-ponging.
    ///
    /// Returns the `(demoted, promoted)` pair when a swap happened.
    pub fn reorder_active_queue(
        &self,
        store: &dyn Store,
        deadline: Deadline,
    ) -> Result<Option<(TaskId, TaskId)>, HubError> {
        let now = self.clock.now();
        let band = self.config.preemption_band;

        with_tx(store, deadline, |tx| {
            let mut queued = tx.tasks_by_status(TaskStatus::InQueue)?;
            let mut backlog = tx.tasks_by_status(TaskStatus::Pending)?;
            if queued.is_empty() || backlog.is_empty() {
                return Ok(None);
            }

            sort_by_priority_desc(&mut queued, self.policy, now);
            sort_by_priority_desc(&mut backlog, self.policy, now);

            // Lowest-priority queue entry vs highest-priority backlog entry.
            let Some(mut low) = queued.pop() else {
                return Ok(None);
            };
            let mut high = backlog.swap_remove(0);

            let low_priority = self.policy.priority(&low, now);
            let high_priority = self.policy.priority(&high, now);
            if high_priority <= band * low_priority {
                return Ok(None);
            }

            low.status = TaskStatus::Pending;
            tx.update_task(&low)?;

            high.status = TaskStatus::InQueue;
            high.last_attempted = Some(now);
            tx.update_task(&high)?;

            info!(
                demoted = %low.id,
                promoted = %high.id,
                low_priority,
                high_priority,
                "swapped queue entry for stronger backlog task"
            );
            Ok(Some((low.id, high.id)))
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{ContainerSpec, ResourceVector, Task, TaskId};
    use crate::scheduler::policy_for;
    use crate::store::memory::MemoryStore;
    use crate::store::StoreTx;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    const T0: SystemTime = UNIX_EPOCH;

    fn make_task(status: TaskStatus, age_secs: u64, stale: u32, now: SystemTime) -> Task {
        Task {
            id: TaskId::generate(),
            description: "t".into(),
            container_spec: ContainerSpec(serde_json::json!({})),
            resource_requirements: ResourceVector::new().with("cpu", 1.0).with("ram", 1.0),
            trust_index_required: 5.0,
            overlap_count: 1,
            status,
            stale_count: stale,
            created_at: now - Duration::from_secs(age_secs),
            last_attempted: None,
            result: None,
            submitted_by: None,
        }
    }

    fn seed(store: &MemoryStore, tasks: &[Task]) {
        let mut tx = store.begin(Deadline::NONE).unwrap();
        for task in tasks {
            tx.insert_task(task.clone()).unwrap();
        }
        tx.commit().unwrap();
    }

    fn statuses(store: &MemoryStore) -> Vec<(TaskId, TaskStatus)> {
        let mut tx = store.begin(Deadline::NONE).unwrap();
        tx.tasks()
            .unwrap()
            .into_iter()
            .map(|t| (t.id, t.status))
            .collect()
    }

    fn status_of(store: &MemoryStore, id: TaskId) -> TaskStatus {
        statuses(store)
            .into_iter()
            .find(|(tid, _)| *tid == id)
            .map(|(_, s)| s)
            .unwrap()
    }

    // ── Admission ─────────────────────────────────────────────────────────────

    #[test]
    fn admit_promotes_pending_up_to_the_cap() {
        let config = Config {
            active_queue_size: 3,
            ..Config::default()
        };
        let policy = policy_for(&config);
        let clock = ManualClock::new(T0 + Duration::from_secs(10_000));
        let now = clock.now();
        let store = MemoryStore::new();

        let tasks: Vec<Task> = (0..5)
            .map(|i| make_task(TaskStatus::Pending, 100 + i, 0, now))
            .collect();
        seed(&store, &tasks);

        let manager = QueueManager::new(&config, policy.as_ref(), &clock);
        let admitted = manager.admit_from_backlog(&store, Deadline::NONE).unwrap();
        assert_eq!(admitted, 3);

        let in_queue = statuses(&store)
            .iter()
            .filter(|(_, s)| *s == TaskStatus::InQueue)
            .count();
        assert_eq!(in_queue, 3);
    }

    #[test]
    fn admit_counts_in_progress_against_the_cap() {
        let config = Config {
            active_queue_size: 2,
            ..Config::default()
        };
        let policy = policy_for(&config);
        let clock = ManualClock::new(T0 + Duration::from_secs(10_000));
        let now = clock.now();
        let store = MemoryStore::new();

        seed(
            &store,
            &[
                make_task(TaskStatus::InProgress, 500, 0, now),
                make_task(TaskStatus::InQueue, 400, 0, now),
                make_task(TaskStatus::Pending, 300, 0, now),
            ],
        );

        let manager = QueueManager::new(&config, policy.as_ref(), &clock);
        let admitted = manager.admit_from_backlog(&store, Deadline::NONE).unwrap();
        assert_eq!(admitted, 0, "queue already full");
    }

    #[test]
    fn admit_selects_by_priority_and_stamps_last_attempted() {
        let config = Config {
            active_queue_size: 1,
            ..Config::default()
        };
        let policy = policy_for(&config);
        let clock = ManualClock::new(T0 + Duration::from_secs(10_000));
        let now = clock.now();
        let store = MemoryStore::new();

        let young = make_task(TaskStatus::Pending, 10, 0, now);
        let old = make_task(TaskStatus::Pending, 5_000, 0, now);
        seed(&store, &[young.clone(), old.clone()]);

        let manager = QueueManager::new(&config, policy.as_ref(), &clock);
        manager.admit_from_backlog(&store, Deadline::NONE).unwrap();

        assert_eq!(status_of(&store, old.id), TaskStatus::InQueue);
        assert_eq!(status_of(&store, young.id), TaskStatus::Pending);

        let mut tx = store.begin(Deadline::NONE).unwrap();
        let promoted = tx.task(old.id).unwrap().unwrap();
        assert_eq!(promoted.last_attempted, Some(now));
    }

    // ── Reorder ───────────────────────────────────────────────────────────────

    /// Backlog task at ~priority 120 vs queue entry at ~100: inside the 1.3
    /// band, no swap. At ~140 the swap happens.
    #[test]
    fn reorder_respects_the_preemption_band() {
        let config = Config::default();
        let policy = policy_for(&config);
        let clock = ManualClock::new(T0 + Duration::from_secs(100_000));
        let now = clock.now();
        let store = MemoryStore::new();

        // weight = max(1, 1 + 1/2) = 1.5 → age = priority × 1.5
        let queued = make_task(TaskStatus::InQueue, 150, 0, now); // priority 100
        let backlog_inside = make_task(TaskStatus::Pending, 180, 0, now); // priority 120
        seed(&store, &[queued.clone(), backlog_inside.clone()]);

        let manager = QueueManager::new(&config, policy.as_ref(), &clock);
        let swap = manager.reorder_active_queue(&store, Deadline::NONE).unwrap();
        assert!(swap.is_none(), "120 ≯ 1.3 × 100");
        assert_eq!(status_of(&store, queued.id), TaskStatus::InQueue);

        // Replace the backlog task with one beyond the band.
        let backlog_beyond = make_task(TaskStatus::Pending, 210, 0, now); // priority 140
        seed(&store, &[backlog_beyond.clone()]);

        let swap = manager.reorder_active_queue(&store, Deadline::NONE).unwrap();
        let (demoted, promoted) = swap.expect("140 > 130 must swap");
        assert_eq!(demoted, queued.id);
        assert_eq!(promoted, backlog_beyond.id);
        assert_eq!(status_of(&store, queued.id), TaskStatus::Pending);
        assert_eq!(status_of(&store, backlog_beyond.id), TaskStatus::InQueue);
    }

    #[test]
    fn reorder_never_touches_in_progress_tasks() {
        let config = Config::default();
        let policy = policy_for(&config);
        let clock = ManualClock::new(T0 + Duration::from_secs(100_000));
        let now = clock.now();
        let store = MemoryStore::new();

        let running = make_task(TaskStatus::InProgress, 10, 0, now);
        let strong = make_task(TaskStatus::Pending, 90_000, 0, now);
        seed(&store, &[running.clone(), strong.clone()]);

        let manager = QueueManager::new(&config, policy.as_ref(), &clock);
        let swap = manager.reorder_active_queue(&store, Deadline::NONE).unwrap();
        assert!(swap.is_none(), "no in_queue tasks → nothing preemptable");
        assert_eq!(status_of(&store, running.id), TaskStatus::InProgress);
    }

    #[test]
    fn reorder_swaps_at_most_once_per_call() {
        let config = Config::default();
        let policy = policy_for(&config);
        let clock = ManualClock::new(T0 + Duration::from_secs(100_000));
        let now = clock.now();
        let store = MemoryStore::new();

        seed(
            &store,
            &[
                make_task(TaskStatus::InQueue, 10, 0, now),
                make_task(TaskStatus::InQueue, 20, 0, now),
                make_task(TaskStatus::Pending, 50_000, 0, now),
                make_task(TaskStatus::Pending, 60_000, 0, now),
            ],
        );

        let manager = QueueManager::new(&config, policy.as_ref(), &clock);
        manager.reorder_active_queue(&store, Deadline::NONE).unwrap();

        let queued = statuses(&store)
            .iter()
            .filter(|(_, s)| *s == TaskStatus::InQueue)
            .count();
        assert_eq!(queued, 2, "one out, one in — sizes unchanged");
    }

    #[test]
    fn reorder_is_idempotent_once_the_band_fails() {
        let config = Config::default();
        let policy = policy_for(&config);
        let clock = ManualClock::new(T0 + Duration::from_secs(100_000));
        let now = clock.now();
        let store = MemoryStore::new();

        seed(
            &store,
            &[
                make_task(TaskStatus::InQueue, 150, 0, now),
                make_task(TaskStatus::Pending, 5_000, 0, now),
            ],
        );

        let manager = QueueManager::new(&config, policy.as_ref(), &clock);
        assert!(manager
            .reorder_active_queue(&store, Deadline::NONE)
            .unwrap()
            .is_some());

        // After the swap the strongest task is already queued; repeated calls
        // must settle.
        let before = statuses(&store);
        for _ in 0..5 {
            assert!(manager
                .reorder_active_queue(&store, Deadline::NONE)
                .unwrap()
                .is_none());
        }
        assert_eq!(statuses(&store), before);
    }
}

/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Tick composition and periodic drivers.
//!
//! One scheduling tick executes, in order: preemptive reorder, backlog
//! admission, assignment sweep, stale handling, retry of failed tasks,
//! garbage collection of exhausted tasks. The liveness tick demotes silent
//! nodes and cascades their orphaned work. Each tick class runs at most one
//! instance at a time (a try-lock gate; the drivers are single tasks anyway)
//! and is safe to run concurrently with heartbeat ingestion, result
//! submission and task submission — everything serialises through the store.
//!
//! Every step receives a deadline derived from the tick interval; a tick that
//! overruns commits nothing further, and the next one picks up the slack.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::api::activity_snapshot;
use crate::clock::{Clock, Deadline};
use crate::config::Config;
use crate::error::HubError;
use crate::liveness::LivenessDetector;
use crate::model::{NodeId, TaskId};
use crate::ports::{publish_best_effort, topics, EventBus};
use crate::scheduler::assign::{AssignmentEngine, CascadeOutcome};
use crate::scheduler::queue::QueueManager;
use crate::scheduler::{policy_for, SchedulingPolicy};
use crate::store::{with_tx, Store};

// ── Reports ───────────────────────────────────────────────────────────────────

/// Per-step counters of one scheduling tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// `(demoted, promoted)` pair when the reorder swapped.
    pub swapped: Option<(TaskId, TaskId)>,
    pub admitted: usize,
    pub assignments_created: usize,
    pub marked_stale: usize,
    pub failed_stale: usize,
    pub retried: usize,
    pub collected: usize,
}

impl TickReport {
    /// A tick that changed nothing.
    pub fn is_quiet(&self) -> bool {
        self.swapped.is_none()
            && self.admitted == 0
            && self.assignments_created == 0
            && self.marked_stale == 0
            && self.failed_stale == 0
            && self.retried == 0
            && self.collected == 0
    }
}

/// Outcome of one liveness tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    pub demoted: Vec<NodeId>,
    pub cascade: CascadeOutcome,
}

// ── Log throttle ──────────────────────────────────────────────────────────────

/// Process-local rate limit for repetitive tick log lines.
#[derive(Debug)]
struct LogThrottle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogThrottle {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// `true` at most once per `min_interval`.
    fn allow(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

/// Composes the queue manager, assignment engine, liveness detector and
/// validator-adjacent machinery into the two periodic ticks.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    config: Config,
    policy: Box<dyn SchedulingPolicy>,
    scheduling_gate: Mutex<()>,
    liveness_gate: Mutex<()>,
    quiet_throttle: LogThrottle,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        let policy = policy_for(&config);
        // Quiet-tick chatter is capped to roughly once a minute.
        let quiet_throttle = LogThrottle::new(Duration::from_secs(60));
        Self {
            store,
            bus,
            clock,
            config,
            policy,
            scheduling_gate: Mutex::new(()),
            liveness_gate: Mutex::new(()),
            quiet_throttle,
        }
    }

    // ── Scheduling tick ───────────────────────────────────────────────────────

    /// Run one scheduling tick. Returns `None` when another instance already
    /// holds the gate.
    pub fn tick(&self) -> Result<Option<TickReport>, HubError> {
        let Ok(_gate) = self.scheduling_gate.try_lock() else {
            debug!("scheduling tick skipped: previous tick still running");
            return Ok(None);
        };
        let deadline = Deadline::within(self.config.orchestration_interval());

        let queue = QueueManager::new(&self.config, self.policy.as_ref(), self.clock.as_ref());
        let engine = AssignmentEngine::new(&self.config, self.policy.as_ref(), self.clock.as_ref());

        let mut report = TickReport::default();
        report.swapped = queue.reorder_active_queue(self.store.as_ref(), deadline)?;
        report.admitted = queue.admit_from_backlog(self.store.as_ref(), deadline)?;

        let sweep = engine.assign_to_nodes(self.store.as_ref(), deadline)?;
        report.assignments_created = sweep.created;
        report.marked_stale = sweep.stale_marked;

        report.failed_stale = engine.handle_stale_tasks(self.store.as_ref(), deadline)?;
        report.retried = engine.retry_failed_tasks(self.store.as_ref(), deadline)?;
        report.collected = engine.collect_exhausted_tasks(self.store.as_ref(), deadline)?;

        if report.is_quiet() {
            if self.quiet_throttle.allow() {
                debug!("scheduling tick complete: no work");
            }
        } else {
            info!(
                admitted = report.admitted,
                assigned = report.assignments_created,
                stale = report.marked_stale,
                failed = report.failed_stale,
                retried = report.retried,
                collected = report.collected,
                swapped = report.swapped.is_some(),
                "scheduling tick complete"
            );
            self.publish_activity(deadline);
        }

        Ok(Some(report))
    }

    // ── Liveness tick ─────────────────────────────────────────────────────────

    /// Run one liveness tick: demote silent nodes, cascade orphaned work.
    pub fn liveness_tick(&self) -> Result<Option<LivenessReport>, HubError> {
        let Ok(_gate) = self.liveness_gate.try_lock() else {
            debug!("liveness tick skipped: previous tick still running");
            return Ok(None);
        };
        let deadline = Deadline::within(self.config.health_check_interval());

        let detector = LivenessDetector::new(&self.config, self.clock.as_ref());
        let scan = detector.scan(self.store.as_ref(), deadline)?;

        let engine = AssignmentEngine::new(&self.config, self.policy.as_ref(), self.clock.as_ref());
        let cascade = engine.handle_tasks_for_inactive_nodes(
            self.store.as_ref(),
            deadline,
            &scan.cascade,
        )?;

        if !scan.demoted.is_empty() || !cascade.affected.is_empty() {
            self.publish_activity(deadline);
        }

        Ok(Some(LivenessReport {
            demoted: scan.demoted,
            cascade,
        }))
    }

    /// Best-effort aggregate snapshot onto the activity topic.
    fn publish_activity(&self, deadline: Deadline) {
        let snapshot = with_tx(self.store.as_ref(), deadline, |tx| activity_snapshot(tx));
        match snapshot.and_then(|s| {
            serde_json::to_value(s).map_err(|e| HubError::Fatal(e.to_string()))
        }) {
            Ok(payload) => {
                publish_best_effort(self.bus.as_ref(), topics::NETWORK_ACTIVITY, payload)
            }
            Err(err) => warn!(error = %err, "activity snapshot failed, event skipped"),
        }
    }

    // ── Periodic drivers ──────────────────────────────────────────────────────

    /// Drive scheduling ticks forever. A fatal error stops the loop; the host
    /// decides what to do with the process.
    pub async fn run_scheduling_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.orchestration_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            period_secs = self.config.orchestration_interval_secs,
            "scheduling loop started"
        );

        loop {
            ticker.tick().await;
            match self.tick() {
                Ok(_) => {}
                Err(HubError::Fatal(reason)) => {
                    error!(%reason, "scheduling loop stopped: fatal store failure");
                    return;
                }
                Err(err) => warn!(error = %err, "scheduling tick failed, will retry next period"),
            }
        }
    }

    /// Drive liveness ticks forever.
    pub async fn run_liveness_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            period_secs = self.config.health_check_interval_secs,
            "liveness loop started"
        );

        loop {
            ticker.tick().await;
            match self.liveness_tick() {
                Ok(_) => {}
                Err(HubError::Fatal(reason)) => {
                    error!(%reason, "liveness loop stopped: fatal store failure");
                    return;
                }
                Err(err) => warn!(error = %err, "liveness tick failed, will retry next period"),
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{
        ContainerSpec, Node, NodeStatus, ResourceVector, Task, TaskStatus,
    };
    use crate::ports::RecordingEventBus;
    use crate::store::memory::MemoryStore;
    use crate::store::StoreTx as _;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn fixture(config: Config) -> (Arc<MemoryStore>, Arc<RecordingEventBus>, Arc<ManualClock>, Orchestrator) {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(RecordingEventBus::new());
        let clock = Arc::new(ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_000_000)));
        let orchestrator = Orchestrator::new(
            store.clone(),
            bus.clone(),
            clock.clone(),
            config,
        );
        (store, bus, clock, orchestrator)
    }

    fn make_node(trust: f64, now: SystemTime) -> Node {
        Node {
            id: NodeId::generate(),
            name: "worker".into(),
            address: "10.0.0.1:7000".into(),
            status: NodeStatus::Active,
            trust_index: trust,
            capacity: ResourceVector::new().with("cpu", 2.0).with("ram", 2.0),
            free: ResourceVector::new().with("cpu", 2.0).with("ram", 2.0),
            last_heartbeat: now,
        }
    }

    fn make_task(status: TaskStatus, age_secs: u64, now: SystemTime) -> Task {
        Task {
            id: TaskId::generate(),
            description: "t".into(),
            container_spec: ContainerSpec(serde_json::json!({"image": "i", "command": "c"})),
            resource_requirements: ResourceVector::new().with("cpu", 1.0).with("ram", 1.0),
            trust_index_required: 5.0,
            overlap_count: 1,
            status,
            stale_count: 0,
            created_at: now - Duration::from_secs(age_secs),
            last_attempted: None,
            result: None,
            submitted_by: None,
        }
    }

    fn seed(store: &MemoryStore, nodes: &[Node], tasks: &[Task]) {
        let mut tx = store.begin(Deadline::NONE).unwrap();
        for node in nodes {
            tx.insert_node(node.clone()).unwrap();
        }
        for task in tasks {
            tx.insert_task(task.clone()).unwrap();
        }
        tx.commit().unwrap();
    }

    fn task_status(store: &MemoryStore, id: TaskId) -> Option<TaskStatus> {
        let mut tx = store.begin(Deadline::NONE).unwrap();
        tx.task(id).unwrap().map(|t| t.status)
    }

    /// Pending task + one trusted node: a single tick carries the task all
    /// the way to in_progress with exactly one assignment.
    #[test]
    fn one_tick_places_a_pending_task() {
        let (store, _bus, clock, orchestrator) = fixture(Config::default());
        let now = clock.now();
        let node = make_node(9.0, now);
        let task = make_task(TaskStatus::Pending, 60, now);
        seed(&store, &[node.clone()], &[task.clone()]);

        let report = orchestrator.tick().unwrap().unwrap();
        assert_eq!(report.admitted, 1);
        assert_eq!(report.assignments_created, 1);

        assert_eq!(task_status(&store, task.id), Some(TaskStatus::InProgress));
        let mut tx = store.begin(Deadline::NONE).unwrap();
        let assignments = tx.assignments_by_task(task.id).unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].node_id, node.id);
    }

    /// The active-queue bound holds across ticks even with a deep backlog.
    #[test]
    fn active_queue_cap_is_respected_across_ticks() {
        let config = Config {
            active_queue_size: 4,
            ..Config::default()
        };
        let (store, _bus, clock, orchestrator) = fixture(config);
        let now = clock.now();

        let tasks: Vec<Task> = (0..10)
            .map(|i| make_task(TaskStatus::Pending, 60 + i, now))
            .collect();
        seed(&store, &[], &tasks);

        for _ in 0..3 {
            orchestrator.tick().unwrap();
            let mut tx = store.begin(Deadline::NONE).unwrap();
            let active = tx.count_tasks_by_statuses(&TaskStatus::ACTIVE).unwrap();
            assert!(active <= 4, "invariant: active set within the cap");
        }
    }

    /// A task at the stale cap fails in step 4 and is collected in step 6 of
    /// the same tick — retry never touches it because the counter is at the
    /// cap.
    #[test]
    fn stale_capped_task_fails_and_is_collected() {
        let (store, _bus, clock, orchestrator) = fixture(Config::default());
        let now = clock.now();

        let mut task = make_task(TaskStatus::InQueue, 60, now);
        task.stale_count = Config::default().max_stale;
        seed(&store, &[], &[task.clone()]);

        let report = orchestrator.tick().unwrap().unwrap();
        assert_eq!(report.failed_stale, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(report.collected, 1);
        assert_eq!(task_status(&store, task.id), None, "task deleted");
    }

    /// A validator-failed task below the cap goes back to pending and is
    /// re-admitted by the same tick's earlier steps on the next round.
    #[test]
    fn failed_task_below_cap_is_retried() {
        let (store, _bus, clock, orchestrator) = fixture(Config::default());
        let now = clock.now();

        let mut task = make_task(TaskStatus::Failed, 60, now);
        task.stale_count = 2;
        seed(&store, &[make_node(9.0, now)], &[task.clone()]);

        let report = orchestrator.tick().unwrap().unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(task_status(&store, task.id), Some(TaskStatus::Pending));

        // Next tick re-admits and places it.
        let report = orchestrator.tick().unwrap().unwrap();
        assert_eq!(report.admitted, 1);
        assert_eq!(task_status(&store, task.id), Some(TaskStatus::InProgress));
    }

    /// Preemption inside a tick honours the band (S6 numbers).
    #[test]
    fn tick_reorder_honours_the_band() {
        let config = Config {
            // Active queue full so admission cannot empty the backlog before
            // the band comparison matters.
            active_queue_size: 1,
            ..Config::default()
        };
        let (store, _bus, clock, orchestrator) = fixture(config);
        let now = clock.now();

        // weight 1.5 → priority = age / 1.5
        let queued = make_task(TaskStatus::InQueue, 150, now); // 100
        let backlog = make_task(TaskStatus::Pending, 180, now); // 120
        seed(&store, &[], &[queued.clone(), backlog.clone()]);

        let report = orchestrator.tick().unwrap().unwrap();
        assert!(report.swapped.is_none(), "120 within the 1.3 band of 100");

        let stronger = make_task(TaskStatus::Pending, 210, now); // 140
        seed(&store, &[], &[stronger.clone()]);
        let report = orchestrator.tick().unwrap().unwrap();
        assert_eq!(report.swapped.map(|(low, _)| low), Some(queued.id));
    }

    /// Liveness tick: silent node demoted, its work cascaded back to the
    /// queue, activity event published.
    #[test]
    fn liveness_tick_demotes_and_cascades() {
        let (store, bus, clock, orchestrator) = fixture(Config::default());
        let now = clock.now();

        let node = make_node(9.0, now);
        let task = make_task(TaskStatus::Pending, 60, now);
        seed(&store, &[node.clone()], &[task.clone()]);

        orchestrator.tick().unwrap();
        assert_eq!(task_status(&store, task.id), Some(TaskStatus::InProgress));

        // Node goes silent past the heartbeat timeout.
        clock.advance(Duration::from_secs(120));
        let report = orchestrator.liveness_tick().unwrap().unwrap();
        assert_eq!(report.demoted, vec![node.id]);
        assert_eq!(report.cascade.requeued, 1);
        assert_eq!(task_status(&store, task.id), Some(TaskStatus::InQueue));

        assert!(
            !bus.on_topic(topics::NETWORK_ACTIVITY).is_empty(),
            "activity snapshot published"
        );
    }

    #[test]
    fn quiet_tick_publishes_nothing() {
        let (_store, bus, _clock, orchestrator) = fixture(Config::default());
        let report = orchestrator.tick().unwrap().unwrap();
        assert!(report.is_quiet());
        assert!(bus.events().is_empty());
    }

    #[test]
    fn log_throttle_allows_once_per_interval() {
        let throttle = LogThrottle::new(Duration::from_secs(3600));
        assert!(throttle.allow());
        assert!(!throttle.allow());
        assert!(!throttle.allow());
    }
}

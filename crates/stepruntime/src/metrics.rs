//! Execution counters and the bounded history of terminal executions.
//!
//! Counters and history share one lock so a terminal execution is counted
//! and appended in a single step, and eviction of the oldest record never
//! interleaves with a reader.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use stepcore::{Execution, ExecutionId, ExecutionStatus, ExecutionSummary, StepStatus};

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_executions: u64,
    pub in_flight: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
    pub max_duration_ms: u64,
    pub steps: BTreeMap<String, StepTypeMetrics>,
    pub history_len: usize,
    pub last_execution_at: Option<DateTime<Utc>>,
}

impl MetricsSnapshot {
    /// Terminal executions counted so far.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.timed_out + self.cancelled
    }

    pub fn success_rate(&self) -> f64 {
        match self.finished() {
            0 => 0.0,
            n => self.completed as f64 / n as f64,
        }
    }
}

/// Counters for one step type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepTypeMetrics {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub skipped: u64,
    pub retries: u64,
    pub total_duration_ms: u64,
}

struct MetricsState {
    snapshot: MetricsSnapshot,
    order: VecDeque<ExecutionId>,
    records: HashMap<ExecutionId, Execution>,
    max_history: usize,
}

impl MetricsState {
    fn end(&mut self, status: ExecutionStatus, duration_ms: u64) {
        let s = &mut self.snapshot;
        s.in_flight = s.in_flight.saturating_sub(1);
        match status {
            ExecutionStatus::Completed => s.completed += 1,
            ExecutionStatus::Failed => s.failed += 1,
            ExecutionStatus::Timeout => s.timed_out += 1,
            ExecutionStatus::Cancelled => s.cancelled += 1,
            ExecutionStatus::Queued | ExecutionStatus::Running => {
                tracing::warn!(%status, "Ignoring non-terminal status in metrics");
                return;
            }
        }
        s.total_duration_ms = s.total_duration_ms.saturating_add(duration_ms);
        s.max_duration_ms = s.max_duration_ms.max(duration_ms);
        let finished = s.finished();
        s.average_duration_ms = s.total_duration_ms as f64 / finished as f64;
        s.last_execution_at = Some(Utc::now());
    }

    fn append(&mut self, execution: Execution) {
        let id = execution.id;
        if self.records.insert(id, execution).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.max_history {
            if let Some(oldest) = self.order.pop_front() {
                self.records.remove(&oldest);
            }
        }
        self.snapshot.history_len = self.order.len();
    }
}

/// Thread-safe metrics and history store.
pub struct MetricsStore {
    state: Mutex<MetricsState>,
}

impl MetricsStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            state: Mutex::new(MetricsState {
                snapshot: MetricsSnapshot::default(),
                order: VecDeque::new(),
                records: HashMap::new(),
                max_history: max_history.max(1),
            }),
        }
    }

    /// An execution was accepted.
    pub fn record_execution_start(&self) {
        let mut state = self.state.lock();
        state.snapshot.total_executions += 1;
        state.snapshot.in_flight += 1;
    }

    pub fn record_execution_end(&self, status: ExecutionStatus, duration_ms: u64) {
        self.state.lock().end(status, duration_ms);
    }

    /// One step reached a terminal state after `attempts` invocations.
    pub fn record_step(&self, step_type: &str, status: StepStatus, attempts: u32, duration_ms: u64) {
        let mut state = self.state.lock();
        let entry = state.snapshot.steps.entry(step_type.to_string()).or_default();
        match status {
            StepStatus::Completed => entry.successes += 1,
            StepStatus::Failed => entry.failures += 1,
            StepStatus::Skipped => {
                entry.skipped += 1;
                return;
            }
            StepStatus::Pending | StepStatus::Running => return,
        }
        entry.runs += 1;
        entry.retries += u64::from(attempts.saturating_sub(1));
        entry.total_duration_ms = entry.total_duration_ms.saturating_add(duration_ms);
    }

    /// Append a terminal execution, evicting the oldest past the bound.
    pub fn append_history(&self, execution: Execution) {
        self.state.lock().append(execution);
    }

    /// Count a terminal execution and move it into history atomically.
    pub fn record_completion(&self, execution: Execution) {
        let duration = execution.duration_ms().unwrap_or(0);
        let mut state = self.state.lock();
        state.end(execution.status, duration);
        state.append(execution);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.lock().snapshot.clone()
    }

    /// Up to `limit` terminal executions, newest first.
    pub fn recent_history(&self, limit: usize) -> Vec<ExecutionSummary> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| state.records.get(id).map(Execution::summary))
            .collect()
    }

    pub fn find(&self, id: &ExecutionId) -> Option<Execution> {
        self.state.lock().records.get(id).cloned()
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{Map, Value};
    use std::sync::Arc;
    use stepcore::{StepDefinition, WorkflowDefinition};

    fn finished(status: ExecutionStatus) -> Execution {
        let def = Arc::new(WorkflowDefinition::new("wf").with_step(StepDefinition::new("a", "debug.log")));
        let mut exec = Execution::new(def, Value::Null, Map::new());
        exec.mark_running();
        exec.finish(status, None);
        exec
    }

    #[test]
    fn counts_by_terminal_status() {
        let store = MetricsStore::new(10);
        for status in [
            ExecutionStatus::Completed,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Timeout,
        ] {
            store.record_execution_start();
            store.record_completion(finished(status));
        }

        let snap = store.snapshot();
        assert_eq!(snap.total_executions, 4);
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.timed_out, 1);
        assert_eq!(snap.history_len, 4);
        assert_eq!(snap.success_rate(), 0.5);
        assert!(snap.last_execution_at.is_some());
    }

    #[test]
    fn step_counters_track_retries() {
        let store = MetricsStore::new(10);
        store.record_step("http.webhook", StepStatus::Completed, 3, 120);
        store.record_step("http.webhook", StepStatus::Failed, 1, 30);
        store.record_step("http.webhook", StepStatus::Skipped, 0, 0);

        let snap = store.snapshot();
        let webhook = &snap.steps["http.webhook"];
        assert_eq!(webhook.runs, 2);
        assert_eq!(webhook.successes, 1);
        assert_eq!(webhook.failures, 1);
        assert_eq!(webhook.skipped, 1);
        assert_eq!(webhook.retries, 2);
        assert_eq!(webhook.total_duration_ms, 150);
    }

    #[test]
    fn history_is_newest_first_and_evicts_oldest() {
        let store = MetricsStore::new(2);
        let first = finished(ExecutionStatus::Completed);
        let second = finished(ExecutionStatus::Failed);
        let third = finished(ExecutionStatus::Cancelled);
        let (first_id, second_id, third_id) = (first.id, second.id, third.id);

        store.append_history(first);
        store.append_history(second);
        store.append_history(third);

        let recent: Vec<_> = store.recent_history(10).into_iter().map(|s| s.id).collect();
        assert_eq!(recent, vec![third_id, second_id]);
        assert!(store.find(&first_id).is_none());
        assert_eq!(store.recent_history(1).len(), 1);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let store = Arc::new(MetricsStore::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store.record_execution_start();
                        store.record_completion(finished(ExecutionStatus::Completed));
                        store.record_step("debug.log", StepStatus::Completed, 1, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = store.snapshot();
        assert_eq!(snap.total_executions, 400);
        assert_eq!(snap.completed, 400);
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.steps["debug.log"].runs, 400);
        assert_eq!(snap.history_len, 400);
    }

    proptest! {
        #[test]
        fn history_never_exceeds_bound(n in 0usize..40, bound in 1usize..10) {
            let store = MetricsStore::new(bound);
            for _ in 0..n {
                store.append_history(finished(ExecutionStatus::Completed));
            }
            prop_assert_eq!(store.history_len(), n.min(bound));
            prop_assert_eq!(store.recent_history(usize::MAX).len(), n.min(bound));
        }
    }
}

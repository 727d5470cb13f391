use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::executor::RunStatus;

/// Point-in-time copy of the executor's counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlowSnapshot {
    pub runs_completed: u64,
    pub runs_rejected: u64,
    pub runs_failed: u64,
    pub runs_incomplete: u64,
    /// Executions by task name.
    pub tasks_executed: HashMap<String, u64>,
    /// Rolling average duration by task name.
    pub avg_task_duration: HashMap<String, Duration>,
    pub joins_fired: u64,
    /// Duplicate or post-fire join arrivals that were dropped.
    pub late_arrivals: u64,
    pub join_timeouts: u64,
    pub deputy_calls: u64,
    pub deputy_failures: u64,
}

impl FlowSnapshot {
    pub fn total_runs(&self) -> u64 {
        self.runs_completed + self.runs_rejected + self.runs_failed + self.runs_incomplete
    }
}

/// Shared run counters, updated by the executor, join handling and the
/// deputy dispatcher.
#[derive(Debug, Default)]
pub struct FlowMetrics {
    inner: Mutex<FlowSnapshot>,
}

impl FlowMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<F: FnOnce(&mut FlowSnapshot)>(&self, f: F) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner);
    }

    pub fn record_run(&self, status: &RunStatus) {
        self.with(|m| match status {
            RunStatus::Completed => m.runs_completed += 1,
            RunStatus::Rejected(_) => m.runs_rejected += 1,
            RunStatus::Failed(_) => m.runs_failed += 1,
            RunStatus::Incomplete { .. } => m.runs_incomplete += 1,
        });
    }

    /// Record a task execution.
    pub fn record_task(&self, task_name: &str, duration: Duration) {
        self.with(|m| {
            let count = {
                let c = m.tasks_executed.entry(task_name.to_string()).or_default();
                *c += 1;
                *c
            };
            let prev_avg = m
                .avg_task_duration
                .get(task_name)
                .copied()
                .unwrap_or_default();

            // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
            let new_avg = if count == 1 {
                duration
            } else {
                let prev_nanos = prev_avg.as_nanos() as f64;
                let cur_nanos = duration.as_nanos() as f64;
                let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
                Duration::from_nanos(avg_nanos as u64)
            };
            m.avg_task_duration.insert(task_name.to_string(), new_avg);
        });
    }

    pub fn record_join_fired(&self) {
        self.with(|m| m.joins_fired += 1);
    }

    pub fn record_late_arrival(&self) {
        self.with(|m| m.late_arrivals += 1);
    }

    pub fn record_join_timeout(&self) {
        self.with(|m| m.join_timeouts += 1);
    }

    pub fn record_deputy(&self, ok: bool) {
        self.with(|m| {
            m.deputy_calls += 1;
            if !ok {
                m.deputy_failures += 1;
            }
        });
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_average_per_task() {
        let m = FlowMetrics::new();
        m.record_task("check", Duration::from_millis(100));
        m.record_task("check", Duration::from_millis(200));
        m.record_task("check", Duration::from_millis(300));
        let s = m.snapshot();
        assert_eq!(s.tasks_executed["check"], 3);
        let avg = s.avg_task_duration["check"].as_millis();
        assert!((199..=201).contains(&avg), "avg was {avg}");
    }

    #[test]
    fn runs_counted_by_status() {
        let m = FlowMetrics::new();
        m.record_run(&RunStatus::Completed);
        m.record_run(&RunStatus::Rejected("bad".into()));
        m.record_run(&RunStatus::Incomplete { pending_joins: vec!["j".into()] });
        m.record_deputy(true);
        m.record_deputy(false);
        let s = m.snapshot();
        assert_eq!(s.total_runs(), 3);
        assert_eq!(s.runs_failed, 0);
        assert_eq!((s.deputy_calls, s.deputy_failures), (2, 1));
    }
}

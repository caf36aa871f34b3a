//! Two-level bounded concurrency.
//!
//! [`BoundedPool`] runs a batch of futures with at most `limit` in flight,
//! on the caller's task, returning outputs in input order. [`Scheduler`]
//! nests two of them: an outer pool over scenario files and, inside each
//! file, an inner pool over that file's scenarios. The two limits are
//! independent.
//!
//! Each pool reports progress through a [`ProgressTracker`]: throttled
//! snapshots are logged and, if a sink is attached, offered to a flume
//! channel without ever waiting on it.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use probe_core::config::SchedulerConfig;
use probe_core::types::{ScenarioDescriptor, ScenarioReport, ScenarioResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::harness::ScenarioHarness;

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub pool: String,
    pub completed: usize,
    pub total: usize,
    pub active: usize,
    pub elapsed: Duration,
    /// `None` until at least one item finished.
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn is_done(&self) -> bool {
        self.completed >= self.total
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    completed: usize,
    active: usize,
    busy_time: Duration,
    last_emit: Option<Instant>,
}

pub struct ProgressTracker {
    pool: String,
    total: usize,
    concurrency: usize,
    interval: Duration,
    started: Instant,
    sink: Option<flume::Sender<ProgressSnapshot>>,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub fn new(pool: impl Into<String>, total: usize, concurrency: usize, interval: Duration) -> Self {
        Self {
            pool: pool.into(),
            total,
            concurrency: concurrency.max(1),
            interval,
            started: Instant::now(),
            sink: None,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn with_sink(mut self, sink: Option<flume::Sender<ProgressSnapshot>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn item_started(&self) {
        self.lock().active += 1;
    }

    /// Record a finished item; returns the snapshot if one was emitted.
    pub fn item_finished(&self, took: Duration) -> Option<ProgressSnapshot> {
        let snapshot = {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            state.completed += 1;
            state.busy_time += took;

            let now = Instant::now();
            let due = state
                .last_emit
                .is_none_or(|last| now.duration_since(last) >= self.interval);
            if !due && state.completed < self.total {
                return None;
            }
            state.last_emit = Some(now);
            self.build(&state)
        };
        self.emit(&snapshot);
        Some(snapshot)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.build(&self.lock())
    }

    fn build(&self, state: &TrackerState) -> ProgressSnapshot {
        ProgressSnapshot {
            pool: self.pool.clone(),
            completed: state.completed,
            total: self.total,
            active: state.active,
            elapsed: self.started.elapsed(),
            eta: estimate_remaining(state.busy_time, state.completed, self.total, self.concurrency),
        }
    }

    fn emit(&self, snapshot: &ProgressSnapshot) {
        info!(
            pool = %snapshot.pool,
            completed = snapshot.completed,
            total = snapshot.total,
            active = snapshot.active,
            eta_secs = snapshot.eta.map(|d| d.as_secs()),
            "progress"
        );
        if let Some(sink) = &self.sink {
            // Full or closed sinks are the consumer's problem.
            let _ = sink.try_send(snapshot.clone());
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Average item time times the remaining items, spread over the workers
/// that can still be busy.
pub fn estimate_remaining(
    busy_time: Duration,
    completed: usize,
    total: usize,
    concurrency: usize,
) -> Option<Duration> {
    if completed == 0 {
        return None;
    }
    let remaining = total.saturating_sub(completed);
    if remaining == 0 {
        return Some(Duration::ZERO);
    }
    let average = busy_time.as_secs_f64() / completed as f64;
    let lanes = concurrency.clamp(1, remaining);
    Some(Duration::from_secs_f64(average * remaining as f64 / lanes as f64))
}

// ---------------------------------------------------------------------------
// BoundedPool
// ---------------------------------------------------------------------------

/// Runs futures with at most `limit` in flight.
pub struct BoundedPool {
    label: String,
    limit: usize,
    interval: Duration,
    sink: Option<flume::Sender<ProgressSnapshot>>,
}

impl BoundedPool {
    pub fn new(label: impl Into<String>, limit: usize) -> Self {
        Self {
            label: label.into(),
            limit: limit.max(1),
            interval: Duration::from_secs(5),
            sink: None,
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_sink(mut self, sink: Option<flume::Sender<ProgressSnapshot>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Apply `task` to every item; outputs keep the input order.
    pub async fn run<T, F, Fut>(&self, items: Vec<T>, task: F) -> Vec<Fut::Output>
    where
        F: Fn(T) -> Fut,
        Fut: Future,
    {
        let gate = Semaphore::new(self.limit);
        let tracker = ProgressTracker::new(&self.label, items.len(), self.limit, self.interval)
            .with_sink(self.sink.clone());
        debug!(pool = %self.label, items = items.len(), limit = self.limit, "pool started");

        let gate = &gate;
        let tracker = &tracker;
        let task = &task;
        let runs = items.into_iter().map(|item| async move {
            // The semaphore is never closed, so acquire cannot fail.
            let _permit = gate.acquire().await.ok();
            tracker.item_started();
            let started = Instant::now();
            let out = task(item).await;
            tracker.item_finished(started.elapsed());
            out
        });
        join_all(runs).await
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// One scenario file: the unit of the outer pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioFile {
    pub name: String,
    pub scenarios: Vec<ScenarioDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    pub name: String,
    pub reports: Vec<ScenarioReport>,
}

pub struct Scheduler {
    file_concurrency: usize,
    scenario_concurrency: usize,
    progress_interval: Duration,
    sink: Option<flume::Sender<ProgressSnapshot>>,
}

impl Scheduler {
    pub fn new(file_concurrency: usize, scenario_concurrency: usize) -> Self {
        Self {
            file_concurrency: file_concurrency.max(1),
            scenario_concurrency: scenario_concurrency.max(1),
            progress_interval: Duration::from_secs(5),
            sink: None,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.file_concurrency, config.scenario_concurrency())
            .with_progress_interval(config.progress_interval())
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_progress_sink(mut self, sink: flume::Sender<ProgressSnapshot>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Run every scenario of every file through `run_scenario`.
    pub async fn run<F, Fut>(&self, files: Vec<ScenarioFile>, run_scenario: F) -> Vec<FileOutcome>
    where
        F: Fn(ScenarioDescriptor) -> Fut,
        Fut: Future<Output = ScenarioResult>,
    {
        let total: usize = files.iter().map(|f| f.scenarios.len()).sum();
        info!(
            files = files.len(),
            scenarios = total,
            file_concurrency = self.file_concurrency,
            scenario_concurrency = self.scenario_concurrency,
            "scheduling run"
        );

        let outer = BoundedPool::new("files", self.file_concurrency)
            .with_progress_interval(self.progress_interval)
            .with_sink(self.sink.clone());
        let run_scenario = &run_scenario;

        outer
            .run(files, |file: ScenarioFile| async move {
                let inner = BoundedPool::new(file.name.clone(), self.scenario_concurrency)
                    .with_progress_interval(self.progress_interval)
                    .with_sink(self.sink.clone());
                let reports = inner
                    .run(file.scenarios, |descriptor: ScenarioDescriptor| async move {
                        let result = run_scenario(descriptor.clone()).await;
                        ScenarioReport::new(&descriptor, result)
                    })
                    .await;
                FileOutcome {
                    name: file.name,
                    reports,
                }
            })
            .await
    }

    /// [`Scheduler::run`] with a scenario harness.
    pub async fn run_harness(&self, harness: &ScenarioHarness, files: Vec<ScenarioFile>) -> Vec<FileOutcome> {
        self.run(files, |descriptor| async move { harness.run(&descriptor).await })
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn eta_uses_average_and_concurrency() {
        assert_eq!(estimate_remaining(Duration::ZERO, 0, 10, 2), None);
        // 4 done in 8s total -> 2s each; 6 left over 3 lanes -> 4s.
        assert_eq!(
            estimate_remaining(Duration::from_secs(8), 4, 10, 3),
            Some(Duration::from_secs(4))
        );
        // Fewer items left than lanes.
        assert_eq!(
            estimate_remaining(Duration::from_secs(2), 1, 2, 8),
            Some(Duration::from_secs(2))
        );
        assert_eq!(estimate_remaining(Duration::from_secs(2), 2, 2, 8), Some(Duration::ZERO));
    }

    #[test]
    fn tracker_throttles_but_always_reports_the_end() {
        let (tx, rx) = flume::bounded(16);
        let tracker = ProgressTracker::new("t", 3, 1, Duration::from_secs(3600)).with_sink(Some(tx));
        for _ in 0..3 {
            tracker.item_started();
        }
        assert!(tracker.item_finished(Duration::from_millis(1)).is_some());
        assert!(tracker.item_finished(Duration::from_millis(1)).is_none());
        let last = tracker.item_finished(Duration::from_millis(1)).unwrap();
        assert!(last.is_done());
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn full_sink_does_not_block() {
        let (tx, _rx) = flume::bounded(0);
        let tracker = ProgressTracker::new("t", 1, 1, Duration::ZERO).with_sink(Some(tx));
        tracker.item_started();
        assert!(tracker.item_finished(Duration::ZERO).is_some());
    }

    #[tokio::test]
    async fn pool_bounds_concurrency_and_keeps_order() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let pool = BoundedPool::new("p", 2);
        let out = pool
            .run((0..6).collect(), |i: u64| {
                let active = &active;
                let peak = &peak;
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10 * (6 - i))).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    i * 10
                }
            })
            .await;
        assert_eq!(out, vec![0, 10, 20, 30, 40, 50]);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}

//! Scheduler entries, their statistics and the per-process Scheduler
//! Registry.
//!
//! A scheduler is a carrier thread running user policy. It alternates
//! between `Idle` (its own policy code runs) and `Dispatching` (one worker
//! holds the carrier). Each scheduler keeps a fixed array of worker summaries
//! built from the id list it registered with; the array is never grown.

use core::fmt;
use core::time::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;

use parking_lot::Mutex;

use crate::diag::{SchedulerSnapshot, WorkerSummarySnapshot};
use crate::error::{Result, UmsError};
use crate::park::Parker;
use crate::worker::WorkerId;

/// Scheduler identifier, assigned sequentially per process starting at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SchedulerId(pub u64);

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduler execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum SchedulerState {
    /// Policy code is running; no worker holds the carrier.
    Idle,
    /// A dispatched worker holds the carrier.
    Dispatching,
}

/// Per-scheduler view of one worker it may dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub index: usize,
    pub worker: WorkerId,
    pub running: bool,
    pub switches: u64,
}

impl WorkerSummary {
    fn new(index: usize, worker: WorkerId) -> Self {
        Self {
            index,
            worker,
            running: false,
            switches: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct SchedulerStats {
    state: SchedulerState,
    running: Option<WorkerId>,
    switches: u64,
    last_switch: Duration,
    total_switch: Duration,
    timed_switches: u64,
    dispatched_at: Option<Instant>,
    summaries: Box<[WorkerSummary]>,
}

impl SchedulerStats {
    fn new(workers: &[WorkerId]) -> Self {
        let summaries = workers
            .iter()
            .enumerate()
            .map(|(index, worker)| WorkerSummary::new(index, *worker))
            .collect();
        Self {
            state: SchedulerState::Idle,
            running: None,
            switches: 0,
            last_switch: Duration::ZERO,
            total_switch: Duration::ZERO,
            timed_switches: 0,
            dispatched_at: None,
            summaries,
        }
    }

    fn summary_mut(&mut self, worker: WorkerId) -> Option<&mut WorkerSummary> {
        self.summaries.iter_mut().find(|s| s.worker == worker)
    }

    fn begin_dispatch(&mut self, worker: WorkerId, now: Instant) {
        self.switches += 1;
        self.state = SchedulerState::Dispatching;
        self.running = Some(worker);
        self.dispatched_at = Some(now);
        if let Some(summary) = self.summary_mut(worker) {
            summary.running = true;
            summary.switches += 1;
        }
    }

    fn finish_dispatch(&mut self) {
        if let Some(worker) = self.running.take() {
            if let Some(summary) = self.summary_mut(worker) {
                summary.running = false;
            }
        }
        self.state = SchedulerState::Idle;
    }

    fn record_switch(&mut self, now: Instant) -> Option<Duration> {
        let started = self.dispatched_at?;
        let elapsed = now.saturating_duration_since(started);
        self.last_switch = elapsed;
        self.total_switch += elapsed;
        self.timed_switches += 1;
        Some(elapsed)
    }

    fn average_switch(&self) -> Duration {
        match u32::try_from(self.timed_switches) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.total_switch / count,
            Err(_) => Duration::from_nanos(
                (self.total_switch.as_nanos() / u128::from(self.timed_switches)) as u64,
            ),
        }
    }
}

/// One registered scheduler thread.
#[derive(Debug)]
pub struct Scheduler {
    id: SchedulerId,
    thread: ThreadId,
    parker: Parker,
    stats: Mutex<SchedulerStats>,
}

impl Scheduler {
    pub(crate) fn new(id: SchedulerId, thread: ThreadId, workers: &[WorkerId]) -> Self {
        Self {
            id,
            thread,
            parker: Parker::new(),
            stats: Mutex::new(SchedulerStats::new(workers)),
        }
    }

    pub fn id(&self) -> SchedulerId {
        self.id
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn state(&self) -> SchedulerState {
        self.stats.lock().state
    }

    /// Worker currently holding this scheduler's carrier.
    pub fn running(&self) -> Option<WorkerId> {
        self.stats.lock().running
    }

    /// Total number of dispatches performed.
    pub fn switches(&self) -> u64 {
        self.stats.lock().switches
    }

    pub fn summaries(&self) -> Vec<WorkerSummary> {
        self.stats.lock().summaries.to_vec()
    }

    pub(crate) fn parker(&self) -> &Parker {
        &self.parker
    }

    /// Bookkeeping for a successful dispatch of `worker`.
    pub(crate) fn begin_dispatch(&self, worker: WorkerId) {
        self.stats.lock().begin_dispatch(worker, Instant::now());
    }

    /// Bookkeeping once the scheduler regains control.
    pub(crate) fn finish_dispatch(&self) {
        self.stats.lock().finish_dispatch();
    }

    /// Folds the time since the last dispatch started into the totals.
    pub(crate) fn record_switch(&self) -> Option<Duration> {
        self.stats.lock().record_switch(Instant::now())
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let stats = self.stats.lock();
        SchedulerSnapshot {
            id: self.id,
            state: stats.state,
            running: stats.running,
            switches: stats.switches,
            last_switch_ns: stats.last_switch.as_nanos() as u64,
            avg_switch_ns: stats.average_switch().as_nanos() as u64,
            workers: stats
                .summaries
                .iter()
                .map(|s| WorkerSummarySnapshot {
                    index: s.index,
                    worker: s.worker,
                    running: s.running,
                    switches: s.switches,
                })
                .collect(),
        }
    }
}

/// Schedulers of one process, keyed by id with a reverse index by OS thread.
#[derive(Debug, Default)]
pub struct SchedulerRegistry {
    by_id: HashMap<SchedulerId, Arc<Scheduler>>,
    by_thread: HashMap<ThreadId, SchedulerId>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, scheduler: Arc<Scheduler>) -> Result<()> {
        if self.by_thread.contains_key(&scheduler.thread) {
            return Err(UmsError::DuplicateScheduler);
        }
        self.by_thread.insert(scheduler.thread, scheduler.id);
        self.by_id.insert(scheduler.id, scheduler);
        Ok(())
    }

    pub fn get(&self, id: SchedulerId) -> Option<Arc<Scheduler>> {
        self.by_id.get(&id).cloned()
    }

    pub fn by_thread(&self, thread: ThreadId) -> Option<Arc<Scheduler>> {
        self.by_thread
            .get(&thread)
            .and_then(|id| self.by_id.get(id))
            .cloned()
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<Scheduler>> {
        self.by_thread.clear();
        self.by_id.drain().map(|(_, scheduler)| scheduler).collect()
    }

    /// Schedulers ordered by id.
    pub fn sorted(&self) -> Vec<Arc<Scheduler>> {
        let mut schedulers: Vec<_> = self.by_id.values().cloned().collect();
        schedulers.sort_by_key(|s| s.id);
        schedulers
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ids(raw: &[u64]) -> Vec<WorkerId> {
        raw.iter().copied().map(WorkerId).collect()
    }

    #[test]
    fn summaries_follow_list_positions() {
        let scheduler = Scheduler::new(SchedulerId(0), thread::current().id(), &ids(&[7, 9]));
        let summaries = scheduler.summaries();

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].index, 0);
        assert_eq!(summaries[0].worker, WorkerId(7));
        assert_eq!(summaries[1].index, 1);
        assert_eq!(summaries[1].worker, WorkerId(9));
        assert!(summaries.iter().all(|s| !s.running && s.switches == 0));
    }

    #[test]
    fn dispatch_bookkeeping_round_trip() {
        let mut stats = SchedulerStats::new(&ids(&[7, 9]));
        let start = Instant::now();

        stats.begin_dispatch(WorkerId(9), start);
        assert_eq!(stats.state, SchedulerState::Dispatching);
        assert_eq!(stats.running, Some(WorkerId(9)));
        assert_eq!(stats.switches, 1);
        assert!(stats.summaries[1].running);
        assert_eq!(stats.summaries[1].switches, 1);

        let elapsed = stats.record_switch(start + Duration::from_nanos(300));
        assert_eq!(elapsed, Some(Duration::from_nanos(300)));

        stats.finish_dispatch();
        assert_eq!(stats.state, SchedulerState::Idle);
        assert_eq!(stats.running, None);
        assert!(!stats.summaries[1].running);
        assert_eq!(stats.average_switch(), Duration::from_nanos(300));
    }

    #[test]
    fn dispatch_of_unlisted_worker_only_touches_totals() {
        let mut stats = SchedulerStats::new(&ids(&[1]));
        stats.begin_dispatch(WorkerId(5), Instant::now());
        stats.finish_dispatch();

        assert_eq!(stats.switches, 1);
        assert_eq!(stats.summaries[0].switches, 0);
    }

    #[test]
    fn average_is_zero_without_samples() {
        let stats = SchedulerStats::new(&ids(&[1]));
        assert_eq!(stats.average_switch(), Duration::ZERO);
    }

    #[test]
    fn average_over_several_samples() {
        let mut stats = SchedulerStats::new(&ids(&[1]));
        let base = Instant::now();
        for ns in [100, 300] {
            stats.begin_dispatch(WorkerId(1), base);
            stats.record_switch(base + Duration::from_nanos(ns));
            stats.finish_dispatch();
        }
        assert_eq!(stats.last_switch, Duration::from_nanos(300));
        assert_eq!(stats.average_switch(), Duration::from_nanos(200));
    }

    #[test]
    fn registry_rejects_second_scheduler_on_same_thread() {
        let here = thread::current().id();
        let mut registry = SchedulerRegistry::new();
        registry
            .insert(Arc::new(Scheduler::new(SchedulerId(0), here, &ids(&[1]))))
            .unwrap();
        let err = registry
            .insert(Arc::new(Scheduler::new(SchedulerId(1), here, &ids(&[2]))))
            .unwrap_err();
        assert_eq!(err, UmsError::DuplicateScheduler);
        assert_eq!(registry.by_thread(here).map(|s| s.id()), Some(SchedulerId(0)));
    }
}

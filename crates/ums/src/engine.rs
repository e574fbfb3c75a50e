//! Context-switch engine.
//!
//! [`Ums`] owns the Process Registry and implements the handoff protocol
//! between scheduler and worker threads:
//!
//! - [`Ums::dispatch`] moves a parked worker to `Running` under the choice
//!   lock, wakes it, and parks the calling scheduler until the worker yields
//!   or exits.
//! - [`Ums::yield_now`] hands the carrier back to the controlling scheduler
//!   and parks the worker.
//! - [`Ums::worker_exit`] removes the worker and wakes its scheduler without
//!   parking.
//!
//! Exactly one worker runs per scheduler: a scheduler is only ever woken by
//! the worker it dispatched, which finds it through its controlling
//! scheduler id. Wakeups are retried until delivered.
//!
//! There is no cancellation: a worker that never yields or exits keeps its
//! scheduler parked forever. That is cooperative scheduling, not a fault.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use crate::completion::CompletionList;
use crate::config::UmsConfig;
use crate::diag::{ProcessSnapshot, WorkerSnapshot};
use crate::error::{Result, UmsError};
use crate::park::{self, Backoff};
use crate::process::{Process, ProcessId, ProcessRegistry, Teardown};
use crate::scheduler::{Scheduler, SchedulerId};
use crate::trace::{records, Payload, TraceHook};
use crate::worker::{Worker, WorkerId, WorkerState};

/// Result of a [`Ums::dispatch`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The worker ran and has since yielded or exited.
    Completed,
    /// The worker was unknown or not parked; nothing changed.
    Skipped,
}

/// How a readiness pass classified one id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    /// Marked parked in the registry but its thread has not blocked yet.
    Settling,
    Busy,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Yield,
    Exit,
}

/// Builder for a [`Ums`] instance.
#[derive(Default)]
pub struct UmsBuilder {
    config: UmsConfig,
    trace: Option<TraceHook>,
}

impl UmsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the configuration.
    pub fn config(mut self, config: UmsConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the trace hook for protocol events.
    pub fn with_trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    pub fn build(self) -> Ums {
        Ums {
            config: self.config,
            processes: ProcessRegistry::new(),
            trace: self.trace,
        }
    }
}

/// User-mode scheduling service.
pub struct Ums {
    config: UmsConfig,
    processes: ProcessRegistry,
    trace: Option<TraceHook>,
}

impl Ums {
    pub fn builder() -> UmsBuilder {
        UmsBuilder::new()
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn config(&self) -> &UmsConfig {
        &self.config
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    /// Registers `pid` with UMS.
    pub fn attach(&self, pid: ProcessId) -> Result<()> {
        self.processes.attach(pid)?;
        log::info!("process {pid} attached to {}", self.config.name);
        self.emit(records::ATTACH, Payload::new().u32(pid.0));
        Ok(())
    }

    /// Drops `pid` with all of its schedulers and workers. Threads still
    /// parked inside the engine are not woken.
    pub fn detach(&self, pid: ProcessId) -> Result<Teardown> {
        let teardown = self.processes.detach(pid)?;
        self.log_detach(pid, teardown);
        Ok(teardown)
    }

    /// Drops every attached process. Returns how many were removed.
    pub fn detach_all(&self) -> usize {
        let released = self.processes.detach_all();
        for (pid, teardown) in &released {
            self.log_detach(*pid, *teardown);
        }
        released.len()
    }

    /// Registers the calling thread as worker `id` and blocks it until a
    /// scheduler dispatches it for the first time.
    pub fn register_worker(&self, pid: ProcessId, id: WorkerId) -> Result<()> {
        if id.get() == 0 {
            return Err(UmsError::InvalidArgument("worker id 0 is reserved"));
        }
        let process = self.processes.find(pid)?;
        let current = thread::current().id();
        if process.scheduler_for(current).is_some() {
            return Err(UmsError::ProtocolViolation(
                "a scheduler thread cannot register as a worker",
            ));
        }

        let worker = Arc::new(Worker::new(id, current));
        process.workers().write().insert(Arc::clone(&worker))?;
        log::debug!("process {pid}: worker {id} registered, waiting for first dispatch");
        self.emit(records::WORKER_REGISTER, Payload::new().u32(pid.0).u64(id.get()));

        worker.parker().park();
        self.record_resume(&process, &worker);
        Ok(())
    }

    /// Registers the calling thread as a scheduler allowed to dispatch
    /// `workers`. Ids are assigned sequentially per process.
    pub fn register_scheduler(&self, pid: ProcessId, workers: &[WorkerId]) -> Result<SchedulerId> {
        if workers.is_empty() {
            return Err(UmsError::BadLength {
                declared: 0,
                available: 0,
            });
        }
        let mut seen = HashSet::with_capacity(workers.len());
        if !workers.iter().all(|id| seen.insert(*id)) {
            return Err(UmsError::InvalidArgument("duplicate worker id in scheduler list"));
        }
        let process = self.processes.find(pid)?;
        let current = thread::current().id();
        if process.worker_for(current).is_some() {
            return Err(UmsError::ProtocolViolation(
                "a worker thread cannot register as a scheduler",
            ));
        }
        if process.scheduler_for(current).is_some() {
            return Err(UmsError::DuplicateScheduler);
        }

        let id = process.allocate_scheduler_id();
        let scheduler = Arc::new(Scheduler::new(id, current, workers));
        process.schedulers().write().insert(scheduler)?;
        log::info!(
            "process {pid}: scheduler {id} registered with {} workers",
            workers.len()
        );
        self.emit(
            records::SCHEDULER_REGISTER,
            Payload::new().u32(pid.0).u64(id.0).u64(workers.len() as u64),
        );
        Ok(id)
    }

    /// Same as [`register_scheduler`](Self::register_scheduler), taking the ids
    /// from a completion list snapshot.
    pub fn register_scheduler_list(
        &self,
        pid: ProcessId,
        list: &CompletionList,
    ) -> Result<SchedulerId> {
        self.register_scheduler(pid, &list.ids())
    }

    /// Hands the calling scheduler's carrier to worker `id`.
    ///
    /// Blocks until the worker yields or exits. Returns
    /// [`DispatchOutcome::Skipped`] without blocking when the worker is
    /// unknown or not parked.
    pub fn dispatch(&self, pid: ProcessId, id: WorkerId) -> Result<DispatchOutcome> {
        let process = self.processes.find(pid)?;
        let scheduler = process.scheduler_for(thread::current().id()).ok_or_else(|| {
            log::error!("process {pid}: dispatch of worker {id} from a non-scheduler thread");
            UmsError::ProtocolViolation("dispatch issued from a thread that is not a scheduler")
        })?;

        let Some(worker) = process.workers().read().get(id) else {
            self.skip_dispatch(pid, &scheduler, id);
            return Ok(DispatchOutcome::Skipped);
        };

        let claimed = {
            let _choice = process.choice();
            let claimed = worker.control().begin_run(scheduler.id());
            if claimed {
                scheduler.begin_dispatch(id);
            }
            claimed
        };
        if !claimed {
            self.skip_dispatch(pid, &scheduler, id);
            return Ok(DispatchOutcome::Skipped);
        }

        let attempts = park::deliver_wakeup(worker.parker(), &self.config);
        log::trace!(
            "process {pid}: scheduler {} dispatched worker {id} ({attempts} attempts)",
            scheduler.id()
        );
        self.emit(
            records::DISPATCH,
            Payload::new().u32(pid.0).u64(scheduler.id().0).u64(id.get()),
        );

        scheduler.parker().park();

        scheduler.finish_dispatch();
        self.emit(
            records::RESUME,
            Payload::new().u32(pid.0).u64(scheduler.id().0),
        );
        Ok(DispatchOutcome::Completed)
    }

    /// Returns the carrier to the calling worker's scheduler and blocks the
    /// worker until it is dispatched again.
    pub fn yield_now(&self, pid: ProcessId) -> Result<()> {
        let process = self.processes.find(pid)?;
        let worker = process.worker_for(thread::current().id()).ok_or_else(|| {
            log::error!("process {pid}: yield from a thread that is not a worker");
            UmsError::ProtocolViolation("yield issued from a thread that is not a worker")
        })?;

        let scheduler = self.release_carrier(&process, &worker, Release::Yield)?;

        park::deliver_wakeup(scheduler.parker(), &self.config);
        self.emit(
            records::YIELD,
            Payload::new()
                .u32(pid.0)
                .u64(worker.id().get())
                .u64(scheduler.id().0),
        );

        worker.parker().park();
        self.record_resume(&process, &worker);
        Ok(())
    }

    /// Removes the calling worker and wakes its scheduler. The caller is not
    /// parked and its thread may terminate.
    pub fn worker_exit(&self, pid: ProcessId) -> Result<()> {
        let process = self.processes.find(pid)?;
        let removed = process
            .workers()
            .write()
            .remove_by_thread(thread::current().id());
        let worker = removed.ok_or_else(|| {
            log::error!("process {pid}: worker exit with no matching registry entry");
            UmsError::ProtocolViolation("exiting thread is not a registered worker")
        })?;

        let scheduler = self.release_carrier(&process, &worker, Release::Exit)?;

        park::deliver_wakeup(scheduler.parker(), &self.config);
        log::debug!("process {pid}: worker {} exited", worker.id());
        self.emit(
            records::EXIT,
            Payload::new()
                .u32(pid.0)
                .u64(worker.id().get())
                .u64(scheduler.id().0),
        );
        Ok(())
    }

    /// Returns a new list holding the entries of `list` whose workers are
    /// registered and parked, with their priorities preserved.
    pub fn query_readiness(&self, pid: ProcessId, list: &CompletionList) -> Result<CompletionList> {
        let items = list.items();
        let ids: Vec<WorkerId> = items.iter().map(|item| item.worker).collect();
        let mask = self.readiness_mask(pid, &ids)?;
        Ok(CompletionList::from_items(
            items
                .into_iter()
                .zip(mask)
                .filter_map(|(item, ready)| ready.then_some(item)),
        ))
    }

    /// Readiness of each id in `ids`, in order.
    ///
    /// Passes repeat while some worker is marked parked but is still on its
    /// way into `park`, so a worker that just yielded is reported alongside
    /// the ones already blocked. The loop ends at the fixed point where
    /// nothing is settling, or at `max_readiness_passes` when configured.
    /// Unbounded, it can spin under adversarial churn.
    pub(crate) fn readiness_mask(&self, pid: ProcessId, ids: &[WorkerId]) -> Result<Vec<bool>> {
        if ids.is_empty() {
            return Err(UmsError::BadLength {
                declared: 0,
                available: 0,
            });
        }
        let process = self.processes.find(pid)?;
        let mut backoff = Backoff::new(&self.config);
        let mut passes: u32 = 0;

        loop {
            passes += 1;
            let mut mask = Vec::with_capacity(ids.len());
            let mut settling = 0usize;
            {
                let workers = process.workers().read();
                for id in ids {
                    let readiness = match workers.get(*id) {
                        Some(worker) => classify(&worker),
                        None => Readiness::Unknown,
                    };
                    if readiness == Readiness::Settling {
                        settling += 1;
                    }
                    mask.push(readiness == Readiness::Ready);
                }
            }

            let ready = mask.iter().filter(|ready| **ready).count();
            let capped = self
                .config
                .max_readiness_passes
                .is_some_and(|max| passes >= max);
            if settling == 0 || capped {
                self.emit(
                    records::DEQUEUE,
                    Payload::new()
                        .u32(pid.0)
                        .u64(ready as u64)
                        .u64(u64::from(passes)),
                );
                return Ok(mask);
            }
            backoff.snooze();
        }
    }

    /// Registry state of worker `id`, or `None` once it has exited or if it
    /// never registered.
    pub fn worker_state(&self, pid: ProcessId, id: WorkerId) -> Result<Option<WorkerState>> {
        let process = self.processes.find(pid)?;
        let worker = process.workers().read().get(id);
        Ok(worker.map(|worker| worker.state()))
    }

    /// Diagnostics data for one process.
    pub fn snapshot(&self, pid: ProcessId) -> Result<ProcessSnapshot> {
        let process = self.processes.find(pid)?;
        Ok(snapshot_of(&process))
    }

    /// Diagnostics data for every attached process, ordered by pid.
    pub fn snapshot_all(&self) -> Vec<ProcessSnapshot> {
        self.processes
            .ids()
            .into_iter()
            .filter_map(|pid| self.processes.find(pid).ok())
            .map(|process| snapshot_of(&process))
            .collect()
    }

    /// Gives a running worker's carrier back to its scheduler.
    ///
    /// The worker transition and the scheduler's bookkeeping change together
    /// under the choice lock, so no snapshot or dispatch sees the worker
    /// owned by two schedulers.
    fn release_carrier(
        &self,
        process: &Process,
        worker: &Worker,
        release: Release,
    ) -> Result<Arc<Scheduler>> {
        let pid = process.id();
        let Some(scheduler_id) = worker.controlling_scheduler() else {
            if release == Release::Exit {
                worker.control().exit();
            }
            log::error!(
                "process {pid}: worker {} gave up a carrier it does not hold",
                worker.id()
            );
            return Err(UmsError::ProtocolViolation(
                "worker has no controlling scheduler",
            ));
        };
        let scheduler = self.resolve_scheduler(process, scheduler_id, worker.id())?;

        let _choice = process.choice();
        let mut control = worker.control();
        let released = match release {
            Release::Yield => control.yield_control(),
            Release::Exit => control.exit(),
        };
        if released.is_some() {
            scheduler.finish_dispatch();
        }
        Ok(scheduler)
    }

    fn resolve_scheduler(
        &self,
        process: &Process,
        id: SchedulerId,
        worker: WorkerId,
    ) -> Result<Arc<Scheduler>> {
        process.scheduler(id).ok_or_else(|| {
            log::error!(
                "process {}: scheduler {id} of worker {worker} is gone",
                process.id()
            );
            UmsError::ProtocolViolation("controlling scheduler is no longer registered")
        })
    }

    /// Charges the switch latency of a resumed worker to the scheduler that
    /// dispatched it.
    fn record_resume(&self, process: &Process, worker: &Worker) {
        let scheduler = worker
            .controlling_scheduler()
            .and_then(|id| process.scheduler(id));
        match scheduler.and_then(|scheduler| scheduler.record_switch()) {
            Some(elapsed) => log::trace!(
                "process {}: worker {} resumed after {} ns",
                process.id(),
                worker.id(),
                elapsed.as_nanos()
            ),
            None => log::warn!(
                "process {}: worker {} resumed without a dispatching scheduler; switch time not recorded",
                process.id(),
                worker.id()
            ),
        }
    }

    fn skip_dispatch(&self, pid: ProcessId, scheduler: &Scheduler, id: WorkerId) {
        log::debug!(
            "process {pid}: scheduler {} skipped worker {id}, not parked",
            scheduler.id()
        );
        self.emit(
            records::DISPATCH_SKIPPED,
            Payload::new().u32(pid.0).u64(scheduler.id().0).u64(id.get()),
        );
    }

    fn log_detach(&self, pid: ProcessId, teardown: Teardown) {
        log::info!(
            "process {pid} detached: {} workers, {} schedulers released",
            teardown.workers,
            teardown.schedulers
        );
        self.emit(
            records::DETACH,
            Payload::new()
                .u32(pid.0)
                .u64(teardown.workers as u64)
                .u64(teardown.schedulers as u64),
        );
    }

    fn emit(&self, record: u8, payload: Payload) {
        if let Some(trace) = &self.trace {
            if let Err(err) = trace(record, payload.as_bytes(), true) {
                log::warn!("trace record {record} dropped: {err}");
            }
        }
    }
}

impl Default for Ums {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(worker: &Worker) -> Readiness {
    if !worker.state().is_parked() {
        Readiness::Busy
    } else if worker.parker().is_parked() {
        Readiness::Ready
    } else {
        Readiness::Settling
    }
}

/// Copies the process state out under the choice lock, so the scheduler
/// summaries and worker entries all describe the same instant.
fn snapshot_of(process: &Process) -> ProcessSnapshot {
    let scheduler_registry = process.schedulers().read();
    let worker_registry = process.workers().read();
    let _choice = process.choice();

    let schedulers = scheduler_registry
        .sorted()
        .iter()
        .map(|scheduler| scheduler.snapshot())
        .collect();
    let mut workers: Vec<WorkerSnapshot> = worker_registry
        .iter()
        .map(|worker| WorkerSnapshot {
            id: worker.id(),
            state: worker.state(),
            scheduler: worker.controlling_scheduler(),
        })
        .collect();
    workers.sort_by_key(|worker| worker.id);
    ProcessSnapshot {
        pid: process.id(),
        schedulers,
        workers,
    }
}

//! Process records and the Process Registry.
//!
//! Every process that attaches owns one Worker Registry, one Scheduler
//! Registry, a scheduler-id counter and the choice lock that serializes
//! dispatch decisions across all of its schedulers. Lock order inside a
//! process is always registry lock, then choice lock, then per-entry locks.

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::{Result, UmsError};
use crate::scheduler::{Scheduler, SchedulerId, SchedulerRegistry};
use crate::worker::{Worker, WorkerRegistry};

/// Identity of an owning OS process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// Identity of the process this code runs in.
    pub fn current() -> Self {
        Self(std::process::id())
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a detach released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Teardown {
    pub workers: usize,
    pub schedulers: usize,
}

/// UMS state owned by one process.
#[derive(Debug)]
pub struct Process {
    id: ProcessId,
    workers: RwLock<WorkerRegistry>,
    schedulers: RwLock<SchedulerRegistry>,
    next_scheduler: Mutex<u64>,
    choice: Mutex<()>,
}

impl Process {
    fn new(id: ProcessId) -> Self {
        Self {
            id,
            workers: RwLock::new(WorkerRegistry::new()),
            schedulers: RwLock::new(SchedulerRegistry::new()),
            next_scheduler: Mutex::new(0),
            choice: Mutex::new(()),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn workers(&self) -> &RwLock<WorkerRegistry> {
        &self.workers
    }

    pub fn schedulers(&self) -> &RwLock<SchedulerRegistry> {
        &self.schedulers
    }

    /// Next sequential scheduler id.
    pub(crate) fn allocate_scheduler_id(&self) -> SchedulerId {
        let mut next = self.next_scheduler.lock();
        let id = SchedulerId(*next);
        *next += 1;
        id
    }

    /// Acquires the per-process choice lock.
    pub(crate) fn choice(&self) -> MutexGuard<'_, ()> {
        self.choice.lock()
    }

    pub(crate) fn worker_for(&self, thread: ThreadId) -> Option<Arc<Worker>> {
        self.workers.read().by_thread(thread)
    }

    pub(crate) fn scheduler_for(&self, thread: ThreadId) -> Option<Arc<Scheduler>> {
        self.schedulers.read().by_thread(thread)
    }

    pub(crate) fn scheduler(&self, id: SchedulerId) -> Option<Arc<Scheduler>> {
        self.schedulers.read().get(id)
    }

    /// Drops every scheduler (with its summaries) and every worker.
    ///
    /// Parked threads are not woken; their OS-level cleanup belongs to the
    /// caller.
    fn teardown(&self) -> Teardown {
        let schedulers = self.schedulers.write().drain();
        let workers = self.workers.write().drain();
        for worker in &workers {
            worker.control().exit();
        }
        Teardown {
            workers: workers.len(),
            schedulers: schedulers.len(),
        }
    }
}

/// All attached processes.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: RwLock<HashMap<ProcessId, Arc<Process>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the record for `pid`. Re-attaching a live process is rejected.
    pub fn attach(&self, pid: ProcessId) -> Result<Arc<Process>> {
        let mut processes = self.processes.write();
        if processes.contains_key(&pid) {
            return Err(UmsError::AlreadyAttached(pid));
        }
        let process = Arc::new(Process::new(pid));
        processes.insert(pid, Arc::clone(&process));
        Ok(process)
    }

    /// Removes `pid` and everything it owns.
    pub fn detach(&self, pid: ProcessId) -> Result<Teardown> {
        let process = self
            .processes
            .write()
            .remove(&pid)
            .ok_or(UmsError::ProcessNotRegistered(pid))?;
        Ok(process.teardown())
    }

    /// Removes every process.
    pub fn detach_all(&self) -> Vec<(ProcessId, Teardown)> {
        let drained: Vec<_> = self.processes.write().drain().collect();
        drained
            .into_iter()
            .map(|(pid, process)| (pid, process.teardown()))
            .collect()
    }

    /// Resolves the process record for `pid`.
    pub fn find(&self, pid: ProcessId) -> Result<Arc<Process>> {
        self.processes
            .read()
            .get(&pid)
            .cloned()
            .ok_or(UmsError::ProcessNotRegistered(pid))
    }

    /// Attached process ids, ascending.
    pub fn ids(&self) -> Vec<ProcessId> {
        let mut ids: Vec<_> = self.processes.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.processes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.read().is_empty()
    }
}

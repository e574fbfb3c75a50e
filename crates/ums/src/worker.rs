//! Worker entries and the per-process Worker Registry.
//!
//! A worker is one OS thread running user work. Its lifecycle is
//! `WaitingFirstDispatch -> Running -> (Yielded -> Running)* -> Exited`. The
//! controlling scheduler is recorded by id and is only set while the worker
//! is `Running`.

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Result, UmsError};
use crate::park::Parker;
use crate::scheduler::SchedulerId;

/// Caller-assigned worker identifier. `0` is reserved as the "absent" marker
/// of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct WorkerId(pub u64);

impl WorkerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum WorkerState {
    /// Registered and blocked until its first dispatch.
    WaitingFirstDispatch,
    /// Holding a scheduler's carrier.
    Running,
    /// Handed control back and blocked until dispatched again.
    Yielded,
    /// Left the registry.
    Exited,
}

impl WorkerState {
    /// True for the two states a scheduler may dispatch from.
    pub fn is_parked(self) -> bool {
        matches!(self, Self::WaitingFirstDispatch | Self::Yielded)
    }
}

/// Mutable part of a worker, guarded by the worker's own lock.
#[derive(Debug)]
pub(crate) struct WorkerControl {
    state: WorkerState,
    scheduler: Option<SchedulerId>,
}

impl WorkerControl {
    fn new() -> Self {
        Self {
            state: WorkerState::WaitingFirstDispatch,
            scheduler: None,
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.state
    }

    pub(crate) fn scheduler(&self) -> Option<SchedulerId> {
        self.scheduler
    }

    /// Moves a parked worker to `Running` under `scheduler`.
    ///
    /// Returns false, leaving the worker untouched, if it is not parked.
    pub(crate) fn begin_run(&mut self, scheduler: SchedulerId) -> bool {
        if !self.state.is_parked() {
            return false;
        }
        self.state = WorkerState::Running;
        self.scheduler = Some(scheduler);
        true
    }

    /// Moves a running worker to `Yielded` and releases its scheduler.
    pub(crate) fn yield_control(&mut self) -> Option<SchedulerId> {
        if self.state != WorkerState::Running {
            return None;
        }
        self.state = WorkerState::Yielded;
        self.scheduler.take()
    }

    /// Marks the worker exited and releases its scheduler, if any.
    pub(crate) fn exit(&mut self) -> Option<SchedulerId> {
        self.state = WorkerState::Exited;
        self.scheduler.take()
    }
}

/// One registered worker thread.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    thread: ThreadId,
    parker: Parker,
    control: Mutex<WorkerControl>,
}

impl Worker {
    pub(crate) fn new(id: WorkerId, thread: ThreadId) -> Self {
        Self {
            id,
            thread,
            parker: Parker::new(),
            control: Mutex::new(WorkerControl::new()),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn state(&self) -> WorkerState {
        self.control.lock().state
    }

    /// Scheduler currently running this worker, if any.
    pub fn controlling_scheduler(&self) -> Option<SchedulerId> {
        self.control.lock().scheduler
    }

    pub(crate) fn parker(&self) -> &Parker {
        &self.parker
    }

    pub(crate) fn control(&self) -> MutexGuard<'_, WorkerControl> {
        self.control.lock()
    }
}

/// Live workers of one process, keyed by worker id with a reverse index by
/// OS thread.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    by_id: HashMap<WorkerId, Arc<Worker>>,
    by_thread: HashMap<ThreadId, WorkerId>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a worker. Duplicate ids and threads that are already workers
    /// are rejected.
    pub(crate) fn insert(&mut self, worker: Arc<Worker>) -> Result<()> {
        if self.by_id.contains_key(&worker.id) {
            return Err(UmsError::DuplicateWorker(worker.id));
        }
        if self.by_thread.contains_key(&worker.thread) {
            return Err(UmsError::ProtocolViolation(
                "calling thread is already a registered worker",
            ));
        }
        self.by_thread.insert(worker.thread, worker.id);
        self.by_id.insert(worker.id, worker);
        Ok(())
    }

    pub fn get(&self, id: WorkerId) -> Option<Arc<Worker>> {
        self.by_id.get(&id).cloned()
    }

    pub fn by_thread(&self, thread: ThreadId) -> Option<Arc<Worker>> {
        self.by_thread
            .get(&thread)
            .and_then(|id| self.by_id.get(id))
            .cloned()
    }

    /// Removes the worker owned by `thread`.
    pub(crate) fn remove_by_thread(&mut self, thread: ThreadId) -> Option<Arc<Worker>> {
        let id = self.by_thread.remove(&thread)?;
        self.by_id.remove(&id)
    }

    /// Removes every worker, returning them for teardown.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Worker>> {
        self.by_thread.clear();
        self.by_id.drain().map(|(_, worker)| worker).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Worker>> + '_ {
        self.by_id.values()
    }
}
